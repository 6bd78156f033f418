use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::context::ShutdownSignal;
use crate::types::Reading;

const POWER_SETTLE: Duration = Duration::from_secs(1);
const PROGRESS_EVERY: Duration = Duration::from_secs(5);
const ABORT_WAIT_STEP: Duration = Duration::from_millis(10);
const ABORT_WAIT_STEPS: u32 = 50;

/// Solution currently held by the sentence decoder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixSample {
    /// Latitude/longitude, `None` until the decoder has a valid position.
    pub location: Option<(f64, f64)>,
    /// True when the position changed since the previous poll.
    pub updated: bool,
    pub time: Option<DateTime<Utc>>,
    pub satellites: Option<u32>,
    pub speed_kmh: f64,
    pub altitude_m: f64,
    pub hdop: Option<f64>,
}

impl FixSample {
    pub fn is_fix(&self, min_satellites: u32) -> bool {
        self.updated
            && self.location.is_some()
            && self.time.is_some()
            && self.satellites.is_some_and(|sats| sats >= min_satellites)
    }

    fn to_reading(&self, device_id: &str) -> Option<Reading> {
        let (latitude, longitude) = self.location?;
        Some(Reading {
            device_id: device_id.to_string(),
            name: None,
            latitude,
            longitude,
            speed: self.speed_kmh,
            altitude: self.altitude_m,
            hdop: self.hdop.unwrap_or(-1.0),
            satellites: self.satellites.unwrap_or(0),
            timestamp: self.time,
            power_status: None,
        })
    }
}

/// GNSS module plus its sentence decoder.
pub trait GpsReceiver: Send {
    fn power_up(&mut self);
    fn power_down(&mut self);
    fn open(&mut self);
    fn close(&mut self);
    /// Feeds whatever the serial port has buffered to the decoder and returns
    /// the current solution if a sentence completed.
    fn poll(&mut self) -> Option<FixSample>;
}

/// Drives a receiver until it produces a usable fix, the timeout passes or
/// somebody asks it to stop.
pub struct Locator {
    device_id: String,
    receiver: Mutex<Box<dyn GpsReceiver>>,
    abort: AtomicBool,
    active: AtomicBool,
    poll_interval: Duration,
    shutdown: ShutdownSignal,
}

impl Locator {
    pub fn new(device_id: String, receiver: Box<dyn GpsReceiver>, shutdown: ShutdownSignal) -> Self {
        Locator {
            device_id,
            receiver: Mutex::new(receiver),
            abort: AtomicBool::new(false),
            active: AtomicBool::new(false),
            poll_interval: Duration::from_millis(10),
            shutdown,
        }
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval.max(Duration::from_millis(1));
    }

    pub async fn power_up(&self) {
        self.receiver.lock().await.power_up();
        info!("GPS module powered on");
        time::sleep(POWER_SETTLE).await;
    }

    pub async fn open(&self) {
        self.receiver.lock().await.open();
    }

    pub async fn close(&self) {
        self.receiver.lock().await.close();
    }

    pub async fn power_down(&self) {
        self.receiver.lock().await.power_down();
        info!("GPS module powered off");
    }

    /// Close and power down with a bounded lock wait, for the shutdown path.
    pub async fn release_within(&self, timeout: Duration) -> bool {
        match time::timeout(timeout, self.receiver.lock()).await {
            Ok(mut receiver) => {
                receiver.close();
                receiver.power_down();
                info!("GPS module closed and powered off");
                true
            }
            Err(_) => {
                warn!("GPS release skipped (receiver busy)");
                false
            }
        }
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Gives a running acquisition loop a short while to notice an abort.
    pub async fn wait_idle(&self) -> bool {
        for _ in 0..ABORT_WAIT_STEPS {
            if !self.is_active() {
                return true;
            }
            time::sleep(ABORT_WAIT_STEP).await;
        }
        !self.is_active()
    }

    fn should_stop(&self) -> bool {
        self.abort.load(Ordering::SeqCst) || self.shutdown.is_requested()
    }

    pub async fn acquire(&self, timeout: Duration, min_satellites: u32) -> Option<Reading> {
        self.abort.store(false, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        info!(timeout_secs = timeout.as_secs(), min_satellites, "Attempting to get GPS fix");

        let started = Instant::now();
        let mut last_progress = started;
        let mut latest = FixSample::default();
        let fix = loop {
            if self.should_stop() {
                info!("GPS fix attempt aborted");
                break None;
            }
            if started.elapsed() >= timeout {
                warn!(satellites = latest.satellites.unwrap_or(0), "GPS fix timeout");
                break None;
            }

            let sample = self.receiver.lock().await.poll();
            if let Some(sample) = sample {
                if sample.is_fix(min_satellites) {
                    break sample.to_reading(&self.device_id);
                }
                latest = sample;
            }

            if last_progress.elapsed() >= PROGRESS_EVERY {
                last_progress = Instant::now();
                debug!(
                    satellites = latest.satellites.unwrap_or(0),
                    position_valid = latest.location.is_some(),
                    time_valid = latest.time.is_some(),
                    "Waiting for GPS fix"
                );
            }
            time::sleep(self.poll_interval).await;
        };

        if let Some(reading) = &fix {
            info!(
                latitude = reading.latitude,
                longitude = reading.longitude,
                satellites = reading.satellites,
                hdop = reading.hdop,
                "GPS fix obtained"
            );
        }
        self.active.store(false, Ordering::SeqCst);
        fix
    }
}
