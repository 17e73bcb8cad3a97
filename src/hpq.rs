//! Hostport queues.
//!
//! A hostport queue is a hardware FIFO of 32-bit values, exposed to the host as
//! an enqueue and a dequeue register. The host and the RPU exchange buffer
//! addresses through them.

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::digital::Wait;

use crate::error::Error;
use crate::regs::*;
use crate::{Bus, Runner};

/// Value the dequeue register returns while the RPU is switching power state.
pub(crate) const HPQ_INVALID_VALUE: u32 = 0xAAAA_AAAA;

/// This structure encapsulates the information which represents a HPQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct HostRpuHPQ {
    /// HPQ address where the host can post the address of a
    /// message intended for the RPU.
    pub enqueue_addr: u32,
    /// HPQ address where the host can get the address of a
    /// message intended for the host.
    pub dequeue_addr: u32,
}

/// Hostport queue information passed by the RPU to the host, which the host can
/// use, to communicate with the RPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct HostRpuHPQMInfo {
    /// Queue which the RPU uses to inform the host about events.
    pub event_busy_queue: HostRpuHPQ,
    /// Queue on which the consumed events are pushed so that RPU can reuse them.
    pub event_avl_queue: HostRpuHPQ,
    /// Queue used by the host to push commands to the RPU.
    pub cmd_busy_queue: HostRpuHPQ,
    /// Queue which RPU uses to inform host about command buffers which can be used to push commands to the RPU.
    pub cmd_avl_queue: HostRpuHPQ,
    pub rx_buf_busy_queue: [HostRpuHPQ; MAX_NUM_OF_RX_QUEUES],
}

impl HostRpuHPQMInfo {
    /// Size of the info block in RPU memory, in words.
    pub const WORDS: usize = 2 * (4 + MAX_NUM_OF_RX_QUEUES);

    pub fn from_words(words: &[u32; Self::WORDS]) -> Self {
        let hpq = |i: usize| HostRpuHPQ {
            enqueue_addr: words[2 * i],
            dequeue_addr: words[2 * i + 1],
        };
        Self {
            event_busy_queue: hpq(0),
            event_avl_queue: hpq(1),
            cmd_busy_queue: hpq(2),
            cmd_avl_queue: hpq(3),
            rx_buf_busy_queue: [hpq(4), hpq(5), hpq(6)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct RpuInfo {
    pub hpqm_info: HostRpuHPQMInfo,
    /// The base address for posting RX commands.
    pub rx_cmd_base: u32,
}

/// Interprets a raw dequeue register value.
pub(crate) fn hpq_value(raw: u32) -> Option<u32> {
    match raw {
        // Empty queue, or the RPU is mid power transition and the register
        // reads back garbage. Either way there is nothing to take.
        0 | HPQ_INVALID_VALUE => None,
        value => Some(value),
    }
}

impl<'a, BUS: Bus, IN: InputPin + Wait, OUT: OutputPin, D: DelayNs> Runner<'a, BUS, IN, OUT, D> {
    pub(crate) async fn rpu_hpq_enqueue(&mut self, hpq: HostRpuHPQ, value: u32) -> Result<(), Error> {
        self.write32(hpq.enqueue_addr, None, value).await
    }

    pub(crate) async fn rpu_hpq_dequeue(&mut self, hpq: HostRpuHPQ) -> Result<Option<u32>, Error> {
        let raw = self.read32(hpq.dequeue_addr, None).await?;

        // Pop element only if it is valid
        let value = hpq_value(raw);
        if let Some(value) = value {
            self.write32(hpq.dequeue_addr, None, value).await?;
        }
        Ok(value)
    }

    /// Queue layout, available once the RPU has booted.
    pub(crate) fn hpqm_info(&self) -> Result<HostRpuHPQMInfo, Error> {
        self.rpu_info.map(|info| info.hpqm_info).ok_or(Error::InvalidState)
    }

    pub(crate) async fn init_rpu_info(&mut self) -> Result<(), Error> {
        let mut words = [0u32; HostRpuHPQMInfo::WORDS];
        self.read(RPU_MEM_HPQ_INFO, None, &mut words).await?;
        let hpqm_info = HostRpuHPQMInfo::from_words(&words);
        debug!("hpqm info: {:?}", hpqm_info);

        let rx_cmd_base = self.read32(RPU_MEM_RX_CMD_BASE, None).await?;

        self.rpu_info = Some(RpuInfo { hpqm_info, rx_cmd_base });
        Ok(())
    }
}
