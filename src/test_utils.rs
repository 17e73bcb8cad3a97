//! Simulated RPU and friends for the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::rc::Rc;

use embassy_time::Duration;
use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::digital::Wait;

use crate::config::{Config, Poll};
use crate::error::Error;
use crate::firmware::{self, FirmwareHeader};
use crate::hpq::{HostRpuHPQ, HostRpuHPQMInfo, RpuInfo};
use crate::messages::{MessageHeader, RpuMessageType};
use crate::regions;
use crate::regs::*;
use crate::{split, Bus, Control, LoadState, Processor, Runner, State};

pub(crate) type TestRunner<'a> = Runner<'a, MockBus, MockPin, MockPin, NoopDelay>;

/// Distance between the buffers [`MockBus::post_event`] spreads an event over.
pub(crate) const FRAGMENT_STRIDE: u32 = 0x400;
pub(crate) const TEST_RX_CMD_BASE: u32 = 0xB700_1000;
const HPQ_REG_BASE: u32 = 0xA400_3000;

pub(crate) fn bus_addr(rpu_addr: u32, processor: Option<Processor>) -> u32 {
    let (mem, offs) = regions::remap_global_addr_to_region_and_offset(rpu_addr, processor).unwrap();
    mem.start + offs
}

fn test_hpqm_words() -> [u32; HostRpuHPQMInfo::WORDS] {
    core::array::from_fn(|i| HPQ_REG_BASE + 4 * i as u32)
}

pub(crate) fn test_hpqm_info() -> HostRpuHPQMInfo {
    HostRpuHPQMInfo::from_words(&test_hpqm_words())
}

pub(crate) fn test_config() -> Config {
    let poll = Poll::new(10, Duration::from_micros(100));
    Config::new_only_scan()
        .with_cmd_slot_poll(poll)
        .with_reset_poll(poll)
        .with_boot_poll(poll)
        .with_wakeup_poll(poll)
}

pub(crate) fn fresh_runner(state: &mut State, dev: MockBus) -> (Control<'_>, TestRunner<'_>) {
    fresh_runner_with(state, dev, test_config())
}

fn fresh_runner_with(state: &mut State, dev: MockBus, config: Config) -> (Control<'_>, TestRunner<'_>) {
    split(
        state,
        dev,
        MockPin::default(),
        MockPin::default(),
        MockPin::default(),
        NoopDelay,
        config,
    )
    .unwrap()
}

/// A runner in the state `new` leaves it in, without going through boot.
pub(crate) fn booted_runner(state: &mut State, dev: MockBus) -> (Control<'_>, TestRunner<'_>) {
    booted_runner_with(state, dev, test_config())
}

pub(crate) fn booted_runner_with(state: &mut State, dev: MockBus, config: Config) -> (Control<'_>, TestRunner<'_>) {
    let (control, mut runner) = fresh_runner_with(state, dev, config);
    runner.rpu_info = Some(RpuInfo {
        hpqm_info: test_hpqm_info(),
        rx_cmd_base: TEST_RX_CMD_BASE,
    });
    runner.load_state = LoadState::Booted;
    (control, runner)
}

pub(crate) fn good_header() -> FirmwareHeader {
    FirmwareHeader {
        signature: firmware::FW_SIGNATURE,
        num_images: firmware::FW_NUM_IMAGES,
        version: FirmwareHeader::version(
            firmware::FW_VERSION_FAMILY,
            firmware::FW_VERSION_MAJOR,
            firmware::FW_VERSION_MINOR,
            firmware::FW_VERSION_PATCH,
        ),
        feature_flags: firmware::BUILD_FEATURE,
    }
}

/// A blob with a valid header and the given `(type, data)` images.
pub(crate) fn blob(images: &[(u32, &[u8])]) -> Vec<u8> {
    let mut out = good_header().to_bytes().to_vec();
    for (image_type, data) in images {
        out.extend_from_slice(&image_type.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
    }
    out
}

/// A UMAC event of `len` bytes with a recognizable body.
pub(crate) fn event_bytes(len: usize, resubmit: bool) -> Vec<u8> {
    let mut event: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
    let header = MessageHeader {
        len: len as u32,
        resubmit: resubmit as u32,
    };
    event[..MessageHeader::SIZE].copy_from_slice(&header.to_bytes());
    if len >= 12 {
        event[8..12].copy_from_slice(&(RpuMessageType::Umac as u32).to_le_bytes());
    }
    event
}

#[derive(Default)]
struct MockDevice {
    mem: HashMap<u32, u32>,
    /// Dequeue registers, by bus address.
    queues: HashMap<u32, VecDeque<u32>>,
    writes: Vec<(u32, u32)>,
    read_faults: HashSet<u32>,
    write_faults: HashSet<u32>,
    stuck_reset: bool,
    fail_boot: bool,
    sr2: u8,
}

impl MockDevice {
    fn load(&self, addr: u32) -> u32 {
        if let Some(queue) = self.queues.get(&addr) {
            return queue.front().copied().unwrap_or(0);
        }
        if addr == bus_addr(RPU_REG_MIPS_MCU_CONTROL, None) || addr == bus_addr(RPU_REG_MIPS_MCU2_CONTROL, None) {
            return self.stuck_reset as u32;
        }
        if addr == bus_addr(RPU_REG_MIPS_MCU_STATUS, None) || addr == bus_addr(RPU_REG_MIPS_MCU2_STATUS, None) {
            return 1;
        }
        self.mem.get(&addr).copied().unwrap_or(0)
    }

    fn store(&mut self, addr: u32, val: u32) {
        self.writes.push((addr, val));

        if let Some(queue) = self.queues.get_mut(&addr) {
            if queue.front() == Some(&val) {
                queue.pop_front();
            }
            return;
        }

        let boot_sig = if addr == bus_addr(RPU_REG_MIPS_MCU_CONTROL, None) {
            Some(bus_addr(RPU_MEM_LMAC_BOOT_SIG, None))
        } else if addr == bus_addr(RPU_REG_MIPS_MCU2_CONTROL, None) {
            Some(bus_addr(RPU_MEM_UMAC_BOOT_SIG, None))
        } else {
            None
        };
        if let Some(sig) = boot_sig {
            if val & 1 != 0 && !self.fail_boot {
                self.mem.insert(sig, BOOT_SIGNATURE);
            }
            return;
        }

        self.mem.insert(addr, val);
    }

    fn read(&mut self, addr: u32, buf: &mut [u32]) -> Result<(), Error> {
        if self.read_faults.contains(&addr) {
            return Err(Error::BusFault);
        }
        let lat = regions::region_of_bus_addr(addr).map_or(0, |r| r.latency as usize);
        for (i, word) in buf.iter_mut().enumerate() {
            *word = match i.checked_sub(lat) {
                Some(j) => self.load(addr + 4 * j as u32),
                None => 0xDEAD_BEEF,
            };
        }
        Ok(())
    }

    fn write(&mut self, addr: u32, buf: &[u32]) -> Result<(), Error> {
        if self.write_faults.contains(&addr) {
            return Err(Error::BusFault);
        }
        for (i, &val) in buf.iter().enumerate() {
            self.store(addr + 4 * i as u32, val);
        }
        Ok(())
    }
}

/// Simulated RPU behind the host bus. Clones share the same device.
///
/// Addresses taken by the helpers are bus addresses, see [`bus_addr`].
#[derive(Clone, Default)]
pub(crate) struct MockBus(Rc<RefCell<MockDevice>>);

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn word(&self, addr: u32) -> u32 {
        self.0.borrow().load(addr)
    }

    pub fn set_word(&self, addr: u32, val: u32) {
        self.0.borrow_mut().mem.insert(addr, val);
    }

    pub fn bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        let dev = self.0.borrow();
        let mut out: Vec<u8> = (0..len.div_ceil(4) as u32)
            .flat_map(|i| dev.load(addr + 4 * i).to_ne_bytes())
            .collect();
        out.truncate(len);
        out
    }

    fn set_bytes(&self, addr: u32, bytes: &[u8]) {
        let mut dev = self.0.borrow_mut();
        for (i, chunk) in bytes.chunks(4).enumerate() {
            let mut b = [0u8; 4];
            b[..chunk.len()].copy_from_slice(chunk);
            dev.mem.insert(addr + 4 * i as u32, u32::from_ne_bytes(b));
        }
    }

    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.0.borrow().writes.clone()
    }

    pub fn push_queue(&self, hpq: HostRpuHPQ, val: u32) {
        let addr = bus_addr(hpq.dequeue_addr, None);
        self.0.borrow_mut().queues.entry(addr).or_default().push_back(val);
    }

    pub fn pop_queue(&self, hpq: HostRpuHPQ) {
        let addr = bus_addr(hpq.dequeue_addr, None);
        if let Some(queue) = self.0.borrow_mut().queues.get_mut(&addr) {
            queue.pop_front();
        }
    }

    /// Values the host wrote to the queue's enqueue register, in order.
    pub fn enqueued(&self, hpq: HostRpuHPQ) -> Vec<u32> {
        let addr = bus_addr(hpq.enqueue_addr, None);
        self.writes().into_iter().filter(|&(a, _)| a == addr).map(|(_, v)| v).collect()
    }

    /// Places one event buffer at `rpu_addr` and announces it.
    pub fn post_fragment(&self, rpu_addr: u32, bytes: &[u8]) {
        self.set_bytes(bus_addr(rpu_addr, None), bytes);
        self.push_queue(test_hpqm_info().event_busy_queue, rpu_addr);
    }

    /// Spreads `event` over event buffers starting at `rpu_addr`. Returns the
    /// number of buffers used.
    pub fn post_event(&self, rpu_addr: u32, event: &[u8]) -> usize {
        let fragments = event.chunks(MAX_EVENT_POOL_LEN);
        let count = fragments.len();
        for (i, fragment) in fragments.enumerate() {
            self.post_fragment(rpu_addr + i as u32 * FRAGMENT_STRIDE, fragment);
        }
        count
    }

    /// Writes the queue layout and RX command base the way booted firmware does.
    pub fn install_rpu_info(&self) {
        for (i, word) in test_hpqm_words().into_iter().enumerate() {
            self.set_word(bus_addr(RPU_MEM_HPQ_INFO + 4 * i as u32, None), word);
        }
        self.set_word(bus_addr(RPU_MEM_RX_CMD_BASE, None), TEST_RX_CMD_BASE);
    }

    pub fn set_watchdog(&self, fired: bool) {
        let status = bus_addr(RPU_REG_MIPS_MCU_UCCP_INT_STATUS, None);
        self.set_word(status, (fired as u32) << RPU_REG_BIT_MIPS_WATCHDOG_INT_STATUS);
    }

    pub fn set_stuck_reset(&self, stuck: bool) {
        self.0.borrow_mut().stuck_reset = stuck;
    }

    pub fn set_fail_boot(&self, fail: bool) {
        self.0.borrow_mut().fail_boot = fail;
    }

    pub fn fail_reads_at(&self, addr: u32) {
        self.0.borrow_mut().read_faults.insert(addr);
    }

    pub fn fail_writes_at(&self, addr: u32) {
        self.0.borrow_mut().write_faults.insert(addr);
    }
}

impl Bus for MockBus {
    async fn read(&mut self, addr: u32, buf: &mut [u32]) -> Result<(), Error> {
        self.0.borrow_mut().read(addr, buf)
    }

    async fn write(&mut self, addr: u32, buf: &[u32]) -> Result<(), Error> {
        self.0.borrow_mut().write(addr, buf)
    }

    async fn read_sr1(&mut self) -> Result<u8, Error> {
        let woken = self.0.borrow().sr2 & SR2_RPU_WAKEUP_REQ != 0;
        Ok(if woken { SR1_RPU_AWAKE | SR1_RPU_READY } else { 0 })
    }

    async fn read_sr2(&mut self) -> Result<u8, Error> {
        Ok(self.0.borrow().sr2)
    }

    async fn write_sr2(&mut self, val: u8) -> Result<(), Error> {
        self.0.borrow_mut().sr2 = val;
        Ok(())
    }
}

/// A pin whose level is shared between clones.
#[derive(Clone, Default)]
pub(crate) struct MockPin(Rc<Cell<bool>>);

impl MockPin {
    pub fn level(&self) -> bool {
        self.0.get()
    }
}

impl ErrorType for MockPin {
    type Error = Infallible;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.0.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.0.set(true);
        Ok(())
    }
}

impl InputPin for MockPin {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.0.get())
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(!self.0.get())
    }
}

impl Wait for MockPin {
    async fn wait_for_high(&mut self) -> Result<(), Infallible> {
        if !self.0.get() {
            core::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn wait_for_low(&mut self) -> Result<(), Infallible> {
        if self.0.get() {
            core::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn wait_for_rising_edge(&mut self) -> Result<(), Infallible> {
        core::future::pending().await
    }

    async fn wait_for_falling_edge(&mut self) -> Result<(), Infallible> {
        core::future::pending().await
    }

    async fn wait_for_any_edge(&mut self) -> Result<(), Infallible> {
        core::future::pending().await
    }
}

pub(crate) struct NoopDelay;

impl DelayNs for NoopDelay {
    async fn delay_ns(&mut self, _ns: u32) {}
}
