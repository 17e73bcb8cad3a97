#![no_std]
#![no_main]
#![deny(unused_must_use)]

use defmt::*;
use defmt_rtt as _; // global logger
use embassy_executor::Spawner;
use embassy_nrf::gpio::{AnyPin, Input, Level, Output, OutputDrive, Pin, Pull};
use embassy_nrf::spim::Spim;
use embassy_nrf::{bind_interrupts, spim};
use embassy_time::{Delay, Duration, Timer};
use embedded_hal_bus::spi::ExclusiveDevice;
use nrf70_hci::messages::{self, CommandMessage, RpuMessageType};
use nrf70_hci::error::Error;
use nrf70_hci::{Config, EventHandler, SpiBus};
use {embassy_nrf as _, panic_probe as _};

bind_interrupts!(struct Irqs {
    SERIAL0 => spim::InterruptHandler<embassy_nrf::peripherals::SERIAL0>;
});

/// Firmware blob as produced by the vendor SDK build.
static FIRMWARE: &[u8] = include_bytes!("../fw/nrf70.bin");

#[derive(Default)]
struct Handler {
    needs_reset: bool,
}

impl EventHandler for Handler {
    fn event(&mut self, event: &[u8]) {
        info!(
            "event type={:?} payload={=[u8]:02x}",
            messages::event_message_type(event),
            messages::event_payload(event)
        );
    }

    fn recovery_requested(&mut self) {
        warn!("RPU watchdog expired");
        self.needs_reset = true;
    }
}

#[embassy_executor::task]
async fn blink_task(led: AnyPin) -> ! {
    let mut led = Output::new(led, Level::High, OutputDrive::Standard);
    loop {
        led.set_high();
        Timer::after(Duration::from_millis(100)).await;
        led.set_low();
        Timer::after(Duration::from_millis(100)).await;
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Hello World!");
    let config: embassy_nrf::config::Config = Default::default();
    let p = embassy_nrf::init(config);
    unwrap!(spawner.spawn(blink_task(p.P1_06.degrade())));

    let sck = p.P0_17;
    let csn = p.P0_18;
    let dio0 = p.P0_13;
    let dio1 = p.P0_14;
    let bucken = Output::new(p.P0_12.degrade(), Level::Low, OutputDrive::HighDrive);
    let iovdd_ctl = Output::new(p.P0_31.degrade(), Level::Low, OutputDrive::Standard);
    let host_irq = Input::new(p.P0_23.degrade(), Pull::None);

    let mut config = spim::Config::default();
    config.frequency = spim::Frequency::M8;
    let spim = Spim::new(p.SERIAL0, Irqs, sck, dio1, dio0, config);
    let csn = Output::new(csn, Level::High, OutputDrive::HighDrive);
    let spi = unwrap!(ExclusiveDevice::new(spim, csn, Delay));
    let bus = SpiBus::new(spi);

    let mut state = nrf70_hci::State::new();
    let (mut control, mut runner) = unwrap!(
        nrf70_hci::new(
            &mut state,
            bus,
            bucken,
            iovdd_ctl,
            host_irq,
            Delay,
            Config::new_only_scan(),
            FIRMWARE,
        )
        .await
    );

    let app = async {
        // Empty system message, the RPU answers with an error event.
        let cmd = unwrap!(CommandMessage::new(RpuMessageType::System, &[0; 4]));
        if let Err(e) = control.send_command(cmd).await {
            warn!("command failed: {}", e);
        }
    };

    let service = async {
        let mut handler = Handler::default();
        loop {
            match runner.step(&mut handler).await {
                Ok(()) => {}
                // A dropped event leaves the host interface usable.
                Err(Error::ResourceExhaustion | Error::Protocol(_)) => warn!("event dropped"),
                Err(e) => {
                    error!("interrupt handling failed: {}", e);
                    handler.needs_reset = true;
                }
            }
            if handler.needs_reset {
                handler.needs_reset = false;
                if let Err(e) = runner.reload(FIRMWARE).await {
                    error!("reload failed: {}", e);
                }
            }
        }
    };

    futures::future::join(service, app).await;
}
