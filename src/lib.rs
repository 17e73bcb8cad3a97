//! Host interface for the nRF70 series Wi-Fi companion chip.
//!
//! Loads the LMAC/UMAC firmware patches, exchanges commands and events with the
//! RPU over the hostport queues and handles RPU interrupts, including watchdog
//! recovery requests.

#![cfg_attr(not(test), no_std)]
#![deny(unused_must_use)]
#![allow(async_fn_in_trait)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod boot;
pub mod config;
pub mod error;
pub mod firmware;
mod hpq;
mod irq;
pub mod messages;
mod regions;
mod regs;
mod rx;
mod transport;

#[cfg(test)]
mod test_utils;

#[cfg(feature = "low-power")]
use core::cell::Cell;
use core::ops::{Index, IndexMut};
use core::pin::pin;
use core::slice;

use bbqueue::framed::{FrameConsumer, FrameProducer};
use bbqueue::BBBuffer;
#[cfg(feature = "low-power")]
use embassy_sync::blocking_mutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::Duration;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::Operation;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::digital::Wait;
use embedded_hal_async::spi::SpiDevice;
use futures::future::{select, Either};

pub use boot::{LoadState, PatchPresence, ProcessorState};
pub use config::Config;
pub use error::Error;
use error::TimeoutKind;
use fmt::Bytes;
pub use irq::{watchdog_action, IrqOutcome, WatchdogAction};
use messages::CommandMessage;
use regions::{check_span, MemoryRegion};
use regs::*;
use transport::{PendingEvent, MAX_EVENT_LEN};

#[cfg(not(feature = "critical-section"))]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(feature = "critical-section")]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

/// Size of the ring that holds completed events until they are dispatched.
const EVENT_QUEUE_SIZE: usize = 16 * 1024;

/// The two firmware-loadable processors of the RPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Processor {
    Lmac,
    Umac,
}

impl Processor {
    /// Fixed order for reset, load and boot.
    pub const ALL: [Processor; 2] = [Processor::Lmac, Processor::Umac];

    const fn idx(self) -> usize {
        match self {
            Processor::Lmac => 0,
            Processor::Umac => 1,
        }
    }
}

/// One value per processor, owned by the device context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PerProcessor<T>([T; 2]);

impl<T> PerProcessor<T> {
    pub const fn new(lmac: T, umac: T) -> Self {
        Self([lmac, umac])
    }
}

impl<T> Index<Processor> for PerProcessor<T> {
    type Output = T;
    fn index(&self, p: Processor) -> &T {
        &self.0[p.idx()]
    }
}

impl<T> IndexMut<Processor> for PerProcessor<T> {
    fn index_mut(&mut self, p: Processor) -> &mut T {
        &mut self.0[p.idx()]
    }
}

/// Power-save state of the RPU as last driven by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RpuPsState {
    Asleep,
    AwakePending,
    Awake,
}

/// Receives what the RPU sends up.
pub trait EventHandler {
    /// A fully reassembled event, message header included.
    fn event(&mut self, event: &[u8]);

    /// The RPU missed a watchdog deadline while not awake. The device must be
    /// reset and the firmware reloaded, see [`Runner::reload`].
    fn recovery_requested(&mut self);
}

struct Shared {
    #[cfg(feature = "low-power")]
    ps_state: blocking_mutex::Mutex<DefaultRawMutex, Cell<RpuPsState>>,
    cmd: Channel<DefaultRawMutex, CommandMessage, 1>,
    cmd_done: Signal<DefaultRawMutex, Result<(), Error>>,
}

pub struct State {
    shared: Shared,
    events: BBBuffer<EVENT_QUEUE_SIZE>,
    event_buf: heapless::Vec<u8, MAX_EVENT_LEN>,
}

impl State {
    pub fn new() -> Self {
        Self {
            shared: Shared {
                #[cfg(feature = "low-power")]
                ps_state: blocking_mutex::Mutex::new(Cell::new(RpuPsState::Asleep)),
                cmd: Channel::new(),
                cmd_done: Signal::new(),
            },
            events: BBBuffer::new(),
            event_buf: heapless::Vec::new(),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Powers up the chip, loads `firmware` and brings up the host interface.
pub async fn new<'a, BUS, IN, OUT, D>(
    state: &'a mut State,
    bus: BUS,
    bucken: OUT,
    iovdd_ctl: OUT,
    host_irq: IN,
    delay: D,
    config: Config,
    firmware: &[u8],
) -> Result<(Control<'a>, Runner<'a, BUS, IN, OUT, D>), Error>
where
    BUS: Bus,
    IN: InputPin + Wait,
    OUT: OutputPin,
    D: DelayNs,
{
    let (control, mut runner) = split(state, bus, bucken, iovdd_ctl, host_irq, delay, config)?;
    runner.init(firmware).await?;
    Ok((control, runner))
}

pub(crate) fn split<'a, BUS, IN, OUT, D>(
    state: &'a mut State,
    bus: BUS,
    bucken: OUT,
    iovdd_ctl: OUT,
    host_irq: IN,
    delay: D,
    config: Config,
) -> Result<(Control<'a>, Runner<'a, BUS, IN, OUT, D>), Error>
where
    BUS: Bus,
    IN: InputPin + Wait,
    OUT: OutputPin,
    D: DelayNs,
{
    let State {
        shared,
        events,
        event_buf,
    } = state;
    let shared: &'a Shared = shared;
    let events: &'a BBBuffer<EVENT_QUEUE_SIZE> = events;
    let (events_tx, events_rx) = events.try_split_framed().map_err(|_| Error::InvalidState)?;
    event_buf.clear();

    let runner = Runner {
        shared,
        events_tx,
        events_rx,
        event_buf,
        bus,
        bucken,
        iovdd_ctl,
        host_irq,
        delay,
        config,
        rpu_info: None,
        load_state: LoadState::Unvalidated,
        processors: PerProcessor::default(),
        pending_event: None,
        num_commands: RPU_CMD_START_MAGIC,
    };

    Ok((Control { shared }, runner))
}

/// Handle for tasks other than the one driving the [`Runner`].
pub struct Control<'a> {
    shared: &'a Shared,
}

impl<'a> Control<'a> {
    /// Hands `cmd` to the runner and waits until it has been posted to the RPU.
    pub async fn send_command(&mut self, cmd: CommandMessage) -> Result<(), Error> {
        self.shared.cmd_done.reset();
        self.shared.cmd.send(cmd).await;
        self.shared.cmd_done.wait().await
    }

    #[cfg(feature = "low-power")]
    pub fn rpu_ps_state(&self) -> RpuPsState {
        self.shared.ps_state.lock(|s| s.get())
    }
}

enum Wake {
    Irq,
    Command(CommandMessage),
}

pub struct Runner<'a, BUS: Bus, IN: InputPin + Wait, OUT: OutputPin, D: DelayNs> {
    shared: &'a Shared,
    events_tx: FrameProducer<'a, EVENT_QUEUE_SIZE>,
    events_rx: FrameConsumer<'a, EVENT_QUEUE_SIZE>,
    event_buf: &'a mut heapless::Vec<u8, MAX_EVENT_LEN>,

    bus: BUS,
    bucken: OUT,
    iovdd_ctl: OUT,
    host_irq: IN,
    delay: D,

    config: Config,
    rpu_info: Option<hpq::RpuInfo>,
    load_state: LoadState,
    processors: PerProcessor<ProcessorState>,
    pending_event: Option<PendingEvent>,

    num_commands: u32,
}

impl<'a, BUS: Bus, IN: InputPin + Wait, OUT: OutputPin, D: DelayNs> Runner<'a, BUS, IN, OUT, D> {
    async fn init(&mut self, firmware: &[u8]) -> Result<(), Error> {
        info!("power on...");
        self.sleep(Duration::from_millis(10)).await;
        self.bucken.set_high().map_err(|_| Error::BusFault)?;
        self.sleep(Duration::from_millis(10)).await;
        self.iovdd_ctl.set_high().map_err(|_| Error::BusFault)?;
        self.sleep(Duration::from_millis(10)).await;

        self.reload(firmware).await
    }

    /// Brings the RPU from power-on (or a wedged state) to a booted host
    /// interface: wake, clocks, firmware, queue discovery, interrupts, RX pools.
    ///
    /// This is the recovery action expected after
    /// [`EventHandler::recovery_requested`].
    pub async fn reload(&mut self, firmware: &[u8]) -> Result<(), Error> {
        self.rpu_info = None;
        self.reset_pending_event();

        info!("wakeup...");
        self.rpu_wakeup().await?;

        info!("enable clocks...");
        self.write32(PBUS_REG_CLK_CTRL, None, PBUS_CLK_ENABLE).await?;

        self.rpu_irq_disable().await?;

        self.boot_firmware(firmware).await?;

        info!("Initializing rpu info...");
        self.init_rpu_info().await?;

        info!("Enabling interrupts...");
        self.rpu_irq_enable().await?;

        info!("Initializing RX...");
        self.init_rx().await?;

        Ok(())
    }

    /// Services interrupts and queued commands forever.
    pub async fn run<H: EventHandler>(&mut self, handler: &mut H) -> ! {
        info!("running...");
        loop {
            if let Err(e) = self.step(handler).await {
                error!("interrupt handling failed: {:?}", e);
            }
        }
    }

    /// Waits for one interrupt or one command from [`Control`] and services it.
    ///
    /// Use this instead of [`Runner::run`] to act on
    /// [`EventHandler::recovery_requested`] and on errors between steps.
    /// Events completed before an error are dispatched first. Command errors
    /// go to the [`Control`] that sent the command, not here.
    pub async fn step<H: EventHandler>(&mut self, handler: &mut H) -> Result<(), Error> {
        let wake = {
            let irq = pin!(self.host_irq.wait_for_high());
            let cmd = pin!(self.shared.cmd.receive());
            match select(irq, cmd).await {
                Either::Left((res, _)) => {
                    res.map_err(|_| Error::BusFault)?;
                    Wake::Irq
                }
                Either::Right((cmd, _)) => Wake::Command(cmd),
            }
        };

        match wake {
            Wake::Irq => {
                let res = self.handle_irq().await;
                self.dispatch_events(handler);
                let outcome = res?;
                if outcome.recovery_requested {
                    handler.recovery_requested();
                }
                match outcome.rejected_event {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            Wake::Command(cmd) => {
                let res = self.send_command(&cmd).await;
                if let Err(e) = res {
                    warn!("command send failed: {:?}", e);
                }
                self.shared.cmd_done.signal(res);
                Ok(())
            }
        }
    }

    fn dispatch_events<H: EventHandler>(&mut self, handler: &mut H) {
        while let Some(frame) = self.events_rx.read() {
            match messages::event_message_type(&frame) {
                Some(t) => debug!("event type={:?} len={}", t, frame.len()),
                None => warn!("unknown event type, len={}", frame.len()),
            }
            handler.event(&frame);
            frame.release();
        }
    }

    pub fn load_state(&self) -> LoadState {
        self.load_state
    }

    pub fn processor_state(&self, processor: Processor) -> ProcessorState {
        self.processors[processor]
    }

    async fn sleep(&mut self, duration: Duration) {
        self.delay.delay_us(delay_micros(duration)).await
    }

    async fn rpu_wait_until_awake(&mut self) -> Result<(), Error> {
        for _ in 0..self.config.wakeup_poll.count {
            if self.bus.read_sr1().await? & SR1_RPU_AWAKE != 0 {
                return Ok(());
            }
            self.sleep(self.config.wakeup_poll.interval).await;
        }
        error!("awakening never came");
        Err(Error::Timeout(TimeoutKind::Wakeup))
    }

    async fn rpu_wait_until_ready(&mut self) -> Result<(), Error> {
        for _ in 0..self.config.wakeup_poll.count {
            if self.bus.read_sr1().await? == SR1_RPU_AWAKE | SR1_RPU_READY {
                return Ok(());
            }
            self.sleep(self.config.wakeup_poll.interval).await;
        }
        error!("readiness never came");
        Err(Error::Timeout(TimeoutKind::Wakeup))
    }

    async fn rpu_wait_until_wakeup_req(&mut self) -> Result<(), Error> {
        for _ in 0..self.config.wakeup_poll.count {
            if self.bus.read_sr2().await? == SR2_RPU_WAKEUP_REQ {
                return Ok(());
            }
            self.sleep(self.config.wakeup_poll.interval).await;
        }
        error!("wakeup_req never came");
        Err(Error::Timeout(TimeoutKind::Wakeup))
    }

    async fn rpu_wakeup(&mut self) -> Result<(), Error> {
        self.set_ps_state(RpuPsState::AwakePending);
        self.bus.write_sr2(SR2_RPU_WAKEUP_REQ).await?;
        self.rpu_wait_until_wakeup_req().await?;
        self.rpu_wait_until_awake().await?;
        self.rpu_wait_until_ready().await?;
        self.set_ps_state(RpuPsState::Awake);
        Ok(())
    }

    /// Lets the RPU drop into low power. A watchdog interrupt that arrives
    /// while asleep is treated as a wedged device.
    #[cfg(feature = "low-power")]
    pub async fn rpu_sleep(&mut self) -> Result<(), Error> {
        self.bus.write_sr2(0).await?;
        self.set_ps_state(RpuPsState::Asleep);
        Ok(())
    }

    #[cfg(feature = "low-power")]
    fn set_ps_state(&self, ps_state: RpuPsState) {
        self.shared.ps_state.lock(|s| s.set(ps_state));
    }

    #[cfg(not(feature = "low-power"))]
    fn set_ps_state(&self, _ps_state: RpuPsState) {}

    /// Power-save state, or `None` when power-save tracking is not built in.
    fn rpu_ps_state(&self) -> Option<RpuPsState> {
        #[cfg(feature = "low-power")]
        let ps_state = Some(self.shared.ps_state.lock(|s| s.get()));
        #[cfg(not(feature = "low-power"))]
        let ps_state = None;
        ps_state
    }

    async fn raw_read32_inner(&mut self, mem: &MemoryRegion, offs: u32) -> Result<u32, Error> {
        check_span(mem, offs, 4)?;
        let lat = mem.latency as usize;

        let mut buf = [0u32; 3];
        self.bus.read(mem.start + offs, &mut buf[..lat + 1]).await?;
        Ok(buf[lat])
    }

    async fn raw_read32(&mut self, mem: &MemoryRegion, offs: u32) -> Result<u32, Error> {
        let res = self.raw_read32_inner(mem, offs).await?;
        trace!("read32 {:08x} {:08x}", mem.start + offs, res);
        Ok(res)
    }

    async fn raw_read(&mut self, mem: &MemoryRegion, offs: u32, buf: &mut [u32]) -> Result<(), Error> {
        check_span(mem, offs, buf.len() * 4)?;

        // latency=0 bulk reads return the first word repeatedly, so read word by word.
        for (i, val) in buf.iter_mut().enumerate() {
            *val = self.raw_read32_inner(mem, offs + i as u32 * 4).await?;
        }
        trace!(
            "read addr={:08x} len={:08x} buf={:?}",
            mem.start + offs,
            buf.len() * 4,
            Bytes(slice8(buf))
        );
        Ok(())
    }

    async fn raw_write(&mut self, mem: &MemoryRegion, offs: u32, buf: &[u32]) -> Result<(), Error> {
        check_span(mem, offs, buf.len() * 4)?;
        trace!(
            "write addr={:08x} len={:08x} buf={:?}",
            mem.start + offs,
            buf.len() * 4,
            Bytes(slice8(buf))
        );
        self.bus.write(mem.start + offs, buf).await
    }

    async fn read32(&mut self, rpu_addr: u32, processor: Option<Processor>) -> Result<u32, Error> {
        let (mem, offs) = regions::remap_global_addr_to_region_and_offset(rpu_addr, processor)?;
        self.raw_read32(mem, offs).await
    }

    async fn read(&mut self, rpu_addr: u32, processor: Option<Processor>, buf: &mut [u32]) -> Result<(), Error> {
        let (mem, offs) = regions::remap_global_addr_to_region_and_offset(rpu_addr, processor)?;
        self.raw_read(mem, offs, buf).await
    }

    async fn write32(&mut self, rpu_addr: u32, processor: Option<Processor>, val: u32) -> Result<(), Error> {
        let (mem, offs) = regions::remap_global_addr_to_region_and_offset(rpu_addr, processor)?;
        self.raw_write(mem, offs, &[val]).await
    }

    async fn write(&mut self, rpu_addr: u32, processor: Option<Processor>, buf: &[u32]) -> Result<(), Error> {
        let (mem, offs) = regions::remap_global_addr_to_region_and_offset(rpu_addr, processor)?;
        self.raw_write(mem, offs, buf).await
    }

    /// Writes `data` starting at `rpu_addr`, zero padding the last word.
    async fn write_bytes(&mut self, rpu_addr: u32, processor: Option<Processor>, data: &[u8]) -> Result<(), Error> {
        const CHUNK_WORDS: usize = 256;
        let mut words = [0u32; CHUNK_WORDS];
        for (i, chunk) in data.chunks(CHUNK_WORDS * 4).enumerate() {
            let n = pack_words(chunk, &mut words);
            let addr = rpu_addr + (i * CHUNK_WORDS * 4) as u32;
            self.write(addr, processor, &words[..n]).await?;
        }
        Ok(())
    }

    /// Reads `len` bytes starting at `rpu_addr` and appends them to the event buffer.
    async fn read_event_bytes(&mut self, rpu_addr: u32, len: usize) -> Result<(), Error> {
        const CHUNK_WORDS: usize = MAX_EVENT_POOL_LEN.div_ceil(4);
        let mut words = [0u32; CHUNK_WORDS];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(CHUNK_WORDS * 4);
            let nw = n.div_ceil(4);
            self.read(rpu_addr + done as u32, None, &mut words[..nw]).await?;
            self.event_buf
                .extend_from_slice(&slice8(&words[..nw])[..n])
                .map_err(|_| Error::ResourceExhaustion)?;
            done += n;
        }
        Ok(())
    }
}

fn pack_words(bytes: &[u8], words: &mut [u32]) -> usize {
    let n = bytes.len().div_ceil(4);
    for (w, c) in words.iter_mut().zip(bytes.chunks(4)) {
        let mut b = [0u8; 4];
        b[..c.len()].copy_from_slice(c);
        *w = u32::from_ne_bytes(b);
    }
    n
}

fn slice8(x: &[u32]) -> &[u8] {
    let len = x.len() * 4;
    unsafe { slice::from_raw_parts(x.as_ptr() as _, len) }
}

fn slice8_mut(x: &mut [u32]) -> &mut [u8] {
    let len = x.len() * 4;
    unsafe { slice::from_raw_parts_mut(x.as_mut_ptr() as _, len) }
}

/// Sleeps longer than `u32::MAX` microseconds are clamped.
fn delay_micros(duration: Duration) -> u32 {
    u32::try_from(duration.as_micros()).unwrap_or(u32::MAX)
}

/// Transport to the RPU: word transfers on the 24-bit host bus plus the three
/// status registers used for wake-up handshaking.
pub trait Bus {
    async fn read(&mut self, addr: u32, buf: &mut [u32]) -> Result<(), Error>;
    async fn write(&mut self, addr: u32, buf: &[u32]) -> Result<(), Error>;
    async fn read_sr1(&mut self) -> Result<u8, Error>;
    async fn read_sr2(&mut self) -> Result<u8, Error>;
    async fn write_sr2(&mut self, val: u8) -> Result<(), Error>;
}

/// [`Bus`] over an SPI device.
pub struct SpiBus<T> {
    spi: T,
}

impl<T: SpiDevice> SpiBus<T> {
    pub fn new(spi: T) -> Self {
        Self { spi }
    }

    async fn read_sr(&mut self, opcode: u8) -> Result<u8, Error> {
        let mut buf = [0; 2];
        self.spi
            .transfer(&mut buf, &[opcode])
            .await
            .map_err(|_| Error::BusFault)?;
        Ok(buf[1])
    }
}

impl<T: SpiDevice> Bus for SpiBus<T> {
    async fn read(&mut self, addr: u32, buf: &mut [u32]) -> Result<(), Error> {
        self.spi
            .transaction(&mut [
                Operation::Write(&[0x0B, (addr >> 16) as u8, (addr >> 8) as u8, addr as u8, 0x00]),
                Operation::Read(slice8_mut(buf)),
            ])
            .await
            .map_err(|_| Error::BusFault)
    }

    async fn write(&mut self, addr: u32, buf: &[u32]) -> Result<(), Error> {
        self.spi
            .transaction(&mut [
                Operation::Write(&[0x02, (addr >> 16) as u8 | 0x80, (addr >> 8) as u8, addr as u8]),
                Operation::Write(slice8(buf)),
            ])
            .await
            .map_err(|_| Error::BusFault)
    }

    async fn read_sr1(&mut self) -> Result<u8, Error> {
        let val = self.read_sr(0x1f).await?;
        trace!("read sr1 = {:02x}", val);
        Ok(val)
    }

    async fn read_sr2(&mut self) -> Result<u8, Error> {
        let val = self.read_sr(0x2f).await?;
        trace!("read sr2 = {:02x}", val);
        Ok(val)
    }

    async fn write_sr2(&mut self, val: u8) -> Result<(), Error> {
        trace!("write sr2 = {:02x}", val);
        self.spi.write(&[0x3f, val]).await.map_err(|_| Error::BusFault)
    }
}
