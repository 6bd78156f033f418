use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::context::DeviceContext;
use crate::handshake::perform_handshake;
use crate::power::PowerController;
use crate::sync::SyncEngine;
use crate::types::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Registered and nothing else to do: sleep until the next fix.
    Sleep(Duration),
    /// Unregistered: wait for field intervention.
    Halt,
    /// The server's power-off instruction was acknowledged.
    PowerOff,
    /// A shutdown started while the cycle was running.
    Stopped,
}

/// One wake cycle after another. Fields other than `ctx` play the part of
/// RTC memory: they survive deep sleep but not a power-off.
pub struct Tracker {
    ctx: Arc<DeviceContext>,
    gps_timeout: Duration,
    cycle_counter: u32,
    last_fix: Option<Reading>,
    report_queued: bool,
}

impl Tracker {
    pub fn new(ctx: Arc<DeviceContext>, gps_timeout: Duration) -> Self {
        Tracker {
            ctx,
            gps_timeout,
            cycle_counter: 0,
            last_fix: None,
            report_queued: false,
        }
    }

    pub fn cycle_counter(&self) -> u32 {
        self.cycle_counter
    }

    pub async fn run(&mut self, power: &PowerController) {
        loop {
            match self.run_cycle().await {
                CycleOutcome::Sleep(duration) => {
                    power.deep_sleep(duration).await;
                }
                CycleOutcome::Halt => {
                    warn!("Device not registered, use service mode to register it");
                    power.halt().await;
                }
                CycleOutcome::PowerOff => {
                    info!("Executing server power-off instruction");
                    power.graceful_shutdown().await;
                    return;
                }
                CycleOutcome::Stopped => return,
            }
        }
    }

    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let ctx = self.ctx.clone();
        let config = ctx.config_store().load().clone();
        if !config.registered {
            return CycleOutcome::Halt;
        }

        ctx.locator.power_up().await;
        ctx.locator.open().await;
        let fix = ctx.locator.acquire(self.gps_timeout, config.min_satellites).await;
        ctx.locator.close().await;
        ctx.locator.power_down().await;
        if ctx.shutdown.is_requested() {
            return CycleOutcome::Stopped;
        }

        if let Some(mut reading) = fix {
            reading.name = Some(config.device_name.clone());
            match ctx.queue.append(&reading).await {
                Ok(()) => {
                    self.cycle_counter += 1;
                    info!(cycle = self.cycle_counter, batch_size = config.batch_size, "Reading queued");
                }
                Err(e) => error!(error = %e, "Failed to queue reading"),
            }
            self.last_fix = Some(reading);
        } else {
            warn!("No GPS fix this cycle");
        }

        if ctx.transport.bring_up(&config, ctx.network_wait).await {
            self.exchange().await;
            ctx.transport.disconnect().await;
        } else {
            warn!("Failed to connect, data remains queued");
        }
        ctx.transport.power_off().await;

        if ctx.shutdown.is_requested() {
            return CycleOutcome::Stopped;
        }
        if ctx.power.should_shutdown() {
            return CycleOutcome::PowerOff;
        }
        let config = ctx.config();
        if !config.registered {
            return CycleOutcome::Halt;
        }
        info!(seconds = config.sleep_seconds, "Device is registered, next update after sleep");
        CycleOutcome::Sleep(Duration::from_secs(config.sleep_seconds))
    }

    /// Handshake, then the power report if one is owed, then the drain.
    async fn exchange(&mut self) {
        let ctx = self.ctx.clone();
        let outcome = perform_handshake(&ctx).await;
        if !outcome.is_accepted() {
            warn!(?outcome, "Handshake failed, continuing with last known state");
        }
        if !ctx.is_registered() {
            return;
        }

        if !ctx.power.report_pending() {
            self.report_queued = false;
        } else if !self.report_queued {
            let report = Reading::status_report(&ctx.device_id, ctx.power.status(), self.last_fix.as_ref());
            match ctx.queue.append(&report).await {
                Ok(()) => {
                    self.report_queued = true;
                    info!(status = %ctx.power.status(), "Power status report queued");
                }
                Err(e) => error!(error = %e, "Failed to queue power status report"),
            }
        }

        let batch_size = ctx.config().batch_size as u32;
        let queued = ctx.queue.record_count().await as u32;
        let should_sync =
            self.cycle_counter >= batch_size || queued >= batch_size || ctx.power.report_pending();
        if !should_sync {
            info!(cycle = self.cycle_counter, queued, batch_size, "Not sending yet");
            return;
        }

        let report = SyncEngine::new(&ctx).drain().await;
        if report.all_sent {
            self.cycle_counter = 0;
        }
        if !ctx.power.report_pending() {
            self.report_queued = false;
        }
    }
}
