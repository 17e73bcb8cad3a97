//! Firmware patch loading and processor boot.

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::digital::Wait;

use crate::config::Poll;
use crate::error::{Error, FwCause, FwError, TimeoutKind};
use crate::firmware::{self, FirmwareImageSet};
use crate::regs::*;
use crate::{Bus, PerProcessor, Processor, Runner};

/// Progress of the firmware loader. Moves forward one step at a time and
/// starts over on every boot attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LoadState {
    Unvalidated,
    HeaderValidated,
    ImagesExtracted,
    ProcessorsReset,
    PrimaryBooted,
    PatchesLoaded,
    Booted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProcessorState {
    pub boot_done: bool,
    pub patch_present: bool,
}

/// Whether each processor got its patch pair.
pub type PatchPresence = PerProcessor<bool>;

struct ProcessorRegs {
    control: u32,
    status: u32,
    boot_sig: u32,
    boot_excp_instr: [u32; 4],
    /// Sleep controller word the boot vector jumps through.
    boot_entry_reg: u32,
    boot_entry: u32,
}

impl Processor {
    fn regs(self) -> ProcessorRegs {
        match self {
            Processor::Lmac => ProcessorRegs {
                control: RPU_REG_MIPS_MCU_CONTROL,
                status: RPU_REG_MIPS_MCU_STATUS,
                boot_sig: RPU_MEM_LMAC_BOOT_SIG,
                boot_excp_instr: [
                    RPU_REG_MIPS_MCU_BOOT_EXCP_INSTR_0,
                    RPU_REG_MIPS_MCU_BOOT_EXCP_INSTR_1,
                    RPU_REG_MIPS_MCU_BOOT_EXCP_INSTR_2,
                    RPU_REG_MIPS_MCU_BOOT_EXCP_INSTR_3,
                ],
                boot_entry_reg: RPU_REG_UCC_SLEEP_CTRL_DATA_0,
                boot_entry: RPU_LMAC_BOOT_ENTRY,
            },
            Processor::Umac => ProcessorRegs {
                control: RPU_REG_MIPS_MCU2_CONTROL,
                status: RPU_REG_MIPS_MCU2_STATUS,
                boot_sig: RPU_MEM_UMAC_BOOT_SIG,
                boot_excp_instr: [
                    RPU_REG_MIPS_MCU2_BOOT_EXCP_INSTR_0,
                    RPU_REG_MIPS_MCU2_BOOT_EXCP_INSTR_1,
                    RPU_REG_MIPS_MCU2_BOOT_EXCP_INSTR_2,
                    RPU_REG_MIPS_MCU2_BOOT_EXCP_INSTR_3,
                ],
                boot_entry_reg: RPU_REG_UCC_SLEEP_CTRL_DATA_1,
                boot_entry: RPU_UMAC_BOOT_ENTRY,
            },
        }
    }
}

impl<'a, BUS: Bus, IN: InputPin + Wait, OUT: OutputPin, D: DelayNs> Runner<'a, BUS, IN, OUT, D> {
    /// Validates `blob`, loads its patches and boots both processors.
    pub(crate) async fn boot_firmware(&mut self, blob: &[u8]) -> Result<(), Error> {
        self.load_state = LoadState::Unvalidated;
        self.processors = PerProcessor::default();

        let header = firmware::validate_header(blob)?;
        info!(
            "firmware {}.{}.{}.{} flags={:08x}",
            header.family(),
            header.major(),
            header.minor(),
            header.patch(),
            header.feature_flags
        );
        self.load_state = LoadState::HeaderValidated;

        let images = firmware::extract_images(blob, &header)?;
        self.load_state = LoadState::ImagesExtracted;

        self.reset_processors().await?;
        let presence = self.load_images(&images).await?;
        self.boot_processors(presence).await?;

        info!("firmware booted");
        Ok(())
    }

    pub(crate) async fn reset_processors(&mut self) -> Result<(), Error> {
        for p in Processor::ALL {
            self.soft_reset(p)
                .await
                .map_err(|e| FwError::Reset(p, FwCause::from_error(e)))?;
        }
        self.load_state = LoadState::ProcessorsReset;

        for p in Processor::ALL {
            let regs = p.regs();
            self.wait_for(regs.status, self.config.reset_poll, TimeoutKind::Reset, |v| {
                v & (1 << RPU_REG_BIT_MIPS_MCU_STATUS_READY) != 0
            })
            .await
            .map_err(|e| FwError::Reset(p, FwCause::from_error(e)))?;
        }
        self.load_state = LoadState::PrimaryBooted;
        Ok(())
    }

    async fn soft_reset(&mut self, p: Processor) -> Result<(), Error> {
        debug!("{:?}: soft reset", p);
        let regs = p.regs();
        self.write32(regs.control, None, 1 << RPU_REG_BIT_MIPS_MCU_SOFT_RESET).await?;
        self.wait_for(regs.control, self.config.reset_poll, TimeoutKind::Reset, |v| {
            v & (1 << RPU_REG_BIT_MIPS_MCU_SOFT_RESET) == 0
        })
        .await
    }

    /// Transfers each processor's patch pair. A processor without a full pair
    /// boots from ROM alone.
    pub(crate) async fn load_images(&mut self, images: &FirmwareImageSet<'_>) -> Result<PatchPresence, Error> {
        let mut presence = PatchPresence::default();

        for p in Processor::ALL {
            if images.pair(p).is_none() {
                warn!("{:?}: no patch present", p);
                continue;
            }

            info!("{:?}: loading patches", p);
            for ty in firmware::patch_types(p) {
                for chunk in firmware::image_chunks(ty, images.image(ty)) {
                    trace!("chunk {} -> {:08x} ({} bytes)", chunk.id.as_str(), chunk.dest_addr, chunk.size());
                    self.write_bytes(chunk.dest_addr, Some(p), chunk.data)
                        .await
                        .map_err(|e| FwError::Load(p, FwCause::from_error(e)))?;
                }
            }

            presence[p] = true;
            self.processors[p].patch_present = true;
        }

        self.load_state = LoadState::PatchesLoaded;
        Ok(presence)
    }

    pub(crate) async fn boot_processors(&mut self, presence: PatchPresence) -> Result<(), Error> {
        for p in Processor::ALL {
            info!("{:?}: booting", p);
            self.boot_processor(p, presence[p])
                .await
                .map_err(|e| FwError::Boot(p, FwCause::from_error(e)))?;
            self.processors[p].boot_done = true;
        }
        self.load_state = LoadState::Booted;
        Ok(())
    }

    async fn boot_processor(&mut self, p: Processor, patched: bool) -> Result<(), Error> {
        let regs = p.regs();

        self.write32(regs.boot_sig, None, 0).await?;

        for (reg, instr) in regs.boot_excp_instr.into_iter().zip(BOOT_EXCP_VECT) {
            self.write32(reg, None, instr).await?;
        }
        if patched {
            self.write32(regs.boot_entry_reg, None, regs.boot_entry).await?;
        }

        self.write32(regs.control, None, 1 << RPU_REG_BIT_MIPS_MCU_SOFT_RESET).await?;
        self.wait_for(regs.boot_sig, self.config.boot_poll, TimeoutKind::Boot, |v| v == BOOT_SIGNATURE)
            .await
    }

    /// Reads `addr` until `done` holds, sleeping between attempts.
    async fn wait_for(
        &mut self,
        addr: u32,
        poll: Poll,
        kind: TimeoutKind,
        done: impl Fn(u32) -> bool,
    ) -> Result<(), Error> {
        for _ in 0..poll.count {
            if done(self.read32(addr, None).await?) {
                return Ok(());
            }
            self.sleep(poll.interval).await;
        }
        warn!("{:08x} never became ready", addr);
        Err(Error::Timeout(kind))
    }
}
