use anyhow::Result;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gps_tracker::config::BootOptions;
use gps_tracker::context::{DeviceContext, ShutdownSignal};
use gps_tracker::hal::HostHal;
use gps_tracker::lifecycle::Tracker;
use gps_tracker::net::HttpTransport;
use gps_tracker::power::PowerController;
use gps_tracker::service::{run_service_mode, ServiceConsole};
use gps_tracker::simulate::SimulatedReceiver;

/// How long Ctrl-C holds the simulated button down.
const BUTTON_HOLD: Duration = Duration::from_millis(200);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let options = BootOptions::from_env();
    info!(?options, "Device starting");

    let shutdown = ShutdownSignal::new();
    let transport = HttpTransport::new(shutdown.clone());
    let receiver = SimulatedReceiver::new(options.sim_latitude, options.sim_longitude);
    let ctx = Arc::new(DeviceContext::boot(
        &options,
        shutdown,
        Box::new(transport),
        Box::new(receiver),
    )?);

    let hal = Arc::new(HostHal::new(true));
    let power = PowerController::new(ctx.clone(), hal.clone());
    power.power_on();
    power.spawn_button_task();

    // Ctrl-C stands in for the power button: a press shuts down when awake
    // and wakes the device when asleep.
    tokio::spawn({
        let hal = hal.clone();
        async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Button pressed");
                hal.press_for(BUTTON_HOLD).await;
            }
            warn!("Ctrl-C handler unavailable, button disabled");
        }
    });

    if options.service_mode {
        let console = ServiceConsole::new(ctx.clone());
        tokio::select! {
            _ = run_service_mode(&console, &power) => {}
            _ = power.wait_powered_off() => {}
        }
    } else {
        info!("GPS tracker mode activated");
        let mut tracker = Tracker::new(ctx.clone(), options.gps_timeout);
        tokio::select! {
            _ = tracker.run(&power) => {}
            _ = power.wait_powered_off() => {}
        }
    }

    power.wait_powered_off().await;
    info!("Device powered off");
    Ok(())
}
