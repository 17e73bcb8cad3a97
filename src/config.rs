use embassy_time::Duration;

use crate::regs::{MAX_NUM_OF_RX_QUEUES, RPU_PKTRAM_SIZE, RX_BUF_HEADROOM};

/// Largest command fragment the host will ever post in one buffer.
pub const MAX_CMD_FRAGMENT_SIZE: usize = 1024;

pub(crate) const TX_BUF_HEADROOM: usize = 52;

/// A bounded poll: up to `count` attempts with `interval` of sleep between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Poll {
    pub(crate) count: u32,
    pub(crate) interval: Duration,
}

impl Poll {
    pub const fn new(count: u32, interval: Duration) -> Self {
        core::assert!(count >= 1, "A poll needs at least one attempt");
        Self { count, interval }
    }

    /// Upper bound on the time spent sleeping before giving up.
    pub fn budget(&self) -> Duration {
        self.interval * self.count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    pub(crate) max_cmd_size: usize,
    pub(crate) cmd_slot_poll: Poll,
    pub(crate) reset_poll: Poll,
    pub(crate) boot_poll: Poll,
    pub(crate) wakeup_poll: Poll,

    pub(crate) rx_bufs_per_queue: usize,
    pub(crate) rx_max_data_size: usize,
    /// Bytes of packet RAM reserved for TX buffers ahead of the RX pools.
    pub(crate) tx_area_size: usize,
}

impl Config {
    /// No TX buffers, minimal RX pools. Enough for scanning.
    pub const fn new_only_scan() -> Self {
        Self::new_with_tx(0, 1, 0, 8, 1600)
    }

    pub const fn new_with_tx(
        max_tx_tokens: usize,
        max_tx_aggregation: usize,
        tx_max_data_size: usize,
        rx_bufs_per_queue: usize,
        rx_max_data_size: usize,
    ) -> Self {
        core::assert!(max_tx_aggregation >= 1 && max_tx_aggregation <= 16, "Max TX aggregation is 16");
        core::assert!(rx_bufs_per_queue >= 1, "At least one RX buffer per queue is required");

        let tx_bufs = max_tx_tokens * max_tx_aggregation;
        let tx_area_size = tx_bufs * (TX_BUF_HEADROOM + tx_max_data_size);
        let rx_total_size = rx_bufs_per_queue * MAX_NUM_OF_RX_QUEUES * (RX_BUF_HEADROOM as usize + rx_max_data_size);

        core::assert!(
            tx_area_size + rx_total_size <= RPU_PKTRAM_SIZE as usize,
            "Packet RAM overflow"
        );

        Self {
            max_cmd_size: 400,
            cmd_slot_poll: Poll::new(1000, Duration::from_micros(100)),
            reset_poll: Poll::new(100, Duration::from_micros(100)),
            boot_poll: Poll::new(1000, Duration::from_micros(100)),
            wakeup_poll: Poll::new(10, Duration::from_millis(1)),
            rx_bufs_per_queue,
            rx_max_data_size,
            tx_area_size,
        }
    }

    /// Commands longer than `size` bytes are split into fragments of `size` bytes.
    pub const fn with_max_cmd_size(mut self, size: usize) -> Self {
        core::assert!(size >= 16 && size <= MAX_CMD_FRAGMENT_SIZE, "Command fragment size out of range");
        core::assert!(size % 4 == 0, "Command fragment size must be a multiple of 4");
        self.max_cmd_size = size;
        self
    }

    pub const fn with_cmd_slot_poll(mut self, poll: Poll) -> Self {
        self.cmd_slot_poll = poll;
        self
    }

    pub const fn with_reset_poll(mut self, poll: Poll) -> Self {
        self.reset_poll = poll;
        self
    }

    pub const fn with_boot_poll(mut self, poll: Poll) -> Self {
        self.boot_poll = poll;
        self
    }

    pub const fn with_wakeup_poll(mut self, poll: Poll) -> Self {
        self.wakeup_poll = poll;
        self
    }

    pub(crate) const fn rx_buf_size(&self) -> usize {
        RX_BUF_HEADROOM as usize + self.rx_max_data_size
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new_only_scan()
    }
}
