//! RX buffer pools.
//!
//! RX buffers live in packet RAM after the TX area. Each one starts with a
//! header word holding its descriptor id. The host posts a descriptor per
//! buffer into LMAC core memory and announces it on the buffer's RX queue.

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::digital::Wait;

use crate::error::Error;
use crate::regs::*;
use crate::{Bus, Processor, Runner};

impl<'a, BUS: Bus, IN: InputPin + Wait, OUT: OutputPin, D: DelayNs> Runner<'a, BUS, IN, OUT, D> {
    pub(crate) async fn init_rx(&mut self) -> Result<(), Error> {
        let bufs_per_queue = self.config.rx_bufs_per_queue;
        for queue_id in 0..MAX_NUM_OF_RX_QUEUES {
            for buf_id in 0..bufs_per_queue {
                let desc_id = queue_id * bufs_per_queue + buf_id;
                let rpu_addr = self.rx_buf_addr(desc_id);

                // write rx buffer header
                self.write32(rpu_addr, None, desc_id as u32).await?;

                // The descriptor is just the address of the data past the header.
                let command = [rpu_addr + RX_BUF_HEADROOM];
                self.rpu_rx_cmd_send(&command, desc_id as u32, queue_id).await?;
            }
        }
        debug!("posted {} rx buffers", MAX_NUM_OF_RX_QUEUES * bufs_per_queue);
        Ok(())
    }

    fn rx_buf_addr(&self, desc_id: usize) -> u32 {
        RPU_MEM_PKT_BASE + (self.config.tx_area_size + self.config.rx_buf_size() * desc_id) as u32
    }

    async fn rpu_rx_cmd_send(&mut self, command: &[u32], desc_id: u32, pool_id: usize) -> Result<(), Error> {
        let rpu_info = self.rpu_info.ok_or(Error::InvalidState)?;

        let addr = rpu_info.rx_cmd_base + RPU_DATA_CMD_SIZE_MAX_RX * desc_id;
        let host_addr = addr & RPU_ADDR_MASK_OFFSET | RPU_MCU_CORE_INDIRECT_BASE;

        self.rpu_write_core(host_addr, command, Processor::Lmac).await?;

        // Post the updated information to the RPU
        self.rpu_hpq_enqueue(rpu_info.hpqm_info.rx_buf_busy_queue[pool_id], addr)
            .await
    }

    /// Writes `buf` to core memory through the processor's indirect access
    /// registers.
    async fn rpu_write_core(&mut self, core_address: u32, buf: &[u32], processor: Processor) -> Result<(), Error> {
        // We receive the address as a byte address, while we need to write it as a word address
        let addr = (core_address & RPU_ADDR_MASK_OFFSET) / 4;

        let (addr_reg, data_reg) = match processor {
            Processor::Lmac => (RPU_REG_MIPS_MCU_SYS_CORE_MEM_CTRL, RPU_REG_MIPS_MCU_SYS_CORE_MEM_WDATA),
            Processor::Umac => (RPU_REG_MIPS_MCU2_SYS_CORE_MEM_CTRL, RPU_REG_MIPS_MCU2_SYS_CORE_MEM_WDATA),
        };

        self.write32(addr_reg, Some(processor), addr).await?;
        for &data in buf {
            self.write32(data_reg, Some(processor), data).await?;
        }
        Ok(())
    }
}
