//! RPU interrupt servicing and watchdog handling.

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::digital::Wait;

use crate::error::Error;
use crate::regs::*;
use crate::{Bus, RpuPsState, Runner};

/// What one interrupt produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IrqOutcome {
    /// Events completed and queued for dispatch.
    pub events: u32,
    /// The watchdog fired while the RPU was not known to be awake.
    pub recovery_requested: bool,
    /// First event that was consumed but not delivered.
    pub rejected_event: Option<Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WatchdogAction {
    /// Reload the watchdog timer and carry on.
    Rearm,
    /// Ask the owner to reset the device.
    Recover,
}

/// Decides how to answer a watchdog interrupt. `ps_state` is `None` when
/// power-save tracking is not built in, in which case the RPU is never
/// assumed to be healthy.
pub fn watchdog_action(ps_state: Option<RpuPsState>) -> WatchdogAction {
    match ps_state {
        Some(RpuPsState::Awake) => WatchdogAction::Rearm,
        _ => WatchdogAction::Recover,
    }
}

impl<'a, BUS: Bus, IN: InputPin + Wait, OUT: OutputPin, D: DelayNs> Runner<'a, BUS, IN, OUT, D> {
    /// Services one host interrupt: drains all pending events, answers the
    /// watchdog if it fired, then acknowledges the interrupt.
    ///
    /// A rejected event is reported in the outcome so the interrupt is still
    /// acknowledged.
    pub(crate) async fn handle_irq(&mut self) -> Result<IrqOutcome, Error> {
        let (events, rejected_event) = self.service_events().await?;
        let mut outcome = IrqOutcome {
            events,
            recovery_requested: false,
            rejected_event,
        };

        if self.rpu_irq_watchdog_check().await? {
            match watchdog_action(self.rpu_ps_state()) {
                WatchdogAction::Rearm => {
                    debug!("watchdog: rearm");
                    self.rpu_irq_watchdog_rearm().await?;
                }
                WatchdogAction::Recover => {
                    warn!("watchdog fired, recovery needed");
                    outcome.recovery_requested = true;
                }
            }
            self.rpu_irq_watchdog_ack().await?;
        }

        self.rpu_irq_ack().await?;
        Ok(outcome)
    }

    pub(crate) async fn rpu_irq_enable(&mut self) -> Result<(), Error> {
        // First enable the blockwise interrupt for the relevant block in the master register
        let mut val = self.read32(RPU_REG_INT_FROM_RPU_CTRL, None).await?;
        val |= 1 << RPU_REG_BIT_INT_FROM_RPU_CTRL;
        self.write32(RPU_REG_INT_FROM_RPU_CTRL, None, val).await?;

        // Now enable the relevant MCU interrupt line
        self.write32(RPU_REG_INT_FROM_MCU_CTRL, None, 1 << RPU_REG_BIT_INT_FROM_MCU_CTRL)
            .await
    }

    pub(crate) async fn rpu_irq_disable(&mut self) -> Result<(), Error> {
        let mut val = self.read32(RPU_REG_INT_FROM_RPU_CTRL, None).await?;
        val &= !(1 << RPU_REG_BIT_INT_FROM_RPU_CTRL);
        self.write32(RPU_REG_INT_FROM_RPU_CTRL, None, val).await?;

        self.write32(RPU_REG_INT_FROM_MCU_CTRL, None, !(1 << RPU_REG_BIT_INT_FROM_MCU_CTRL))
            .await
    }

    async fn rpu_irq_ack(&mut self) -> Result<(), Error> {
        self.write32(RPU_REG_INT_FROM_MCU_ACK, None, 1 << RPU_REG_BIT_INT_FROM_MCU_ACK)
            .await
    }

    /// Checks if the watchdog was the source of the interrupt
    async fn rpu_irq_watchdog_check(&mut self) -> Result<bool, Error> {
        let val = self.read32(RPU_REG_MIPS_MCU_UCCP_INT_STATUS, None).await?;
        Ok(val & (1 << RPU_REG_BIT_MIPS_WATCHDOG_INT_STATUS) != 0)
    }

    async fn rpu_irq_watchdog_rearm(&mut self) -> Result<(), Error> {
        self.write32(RPU_REG_MIPS_MCU_TIMER, None, RPU_REG_MIPS_MCU_TIMER_RESET_VAL)
            .await
    }

    async fn rpu_irq_watchdog_ack(&mut self) -> Result<(), Error> {
        self.write32(RPU_REG_MIPS_MCU_UCCP_INT_CLEAR, None, 1 << RPU_REG_BIT_MIPS_WATCHDOG_INT_CLEAR)
            .await
    }
}
