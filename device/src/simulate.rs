use chrono::Utc;
use rand::Rng;
use tracing::debug;

use crate::gps::{FixSample, GpsReceiver};

/// Stand-in for the GNSS module on hosts without one. Produces a few
/// sentences without a solution, then fixes that wander around a base
/// position.
pub struct SimulatedReceiver {
    latitude: f64,
    longitude: f64,
    powered: bool,
    open: bool,
    warm_up: u32,
}

impl SimulatedReceiver {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        SimulatedReceiver {
            latitude,
            longitude,
            powered: false,
            open: false,
            warm_up: 0,
        }
    }
}

impl GpsReceiver for SimulatedReceiver {
    fn power_up(&mut self) {
        self.powered = true;
        // Cold start: a handful of polls before the first solution.
        self.warm_up = rand::thread_rng().gen_range(5..50);
    }

    fn power_down(&mut self) {
        self.powered = false;
        self.open = false;
    }

    fn open(&mut self) {
        self.open = true;
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn poll(&mut self) -> Option<FixSample> {
        if !self.powered || !self.open {
            return None;
        }
        let mut rng = rand::thread_rng();
        if self.warm_up > 0 {
            self.warm_up -= 1;
            return Some(FixSample {
                satellites: Some(rng.gen_range(0..3)),
                ..FixSample::default()
            });
        }

        // Roughly 100 m of jitter.
        self.latitude += rng.gen_range(-0.001..0.001);
        self.longitude += rng.gen_range(-0.001..0.001);
        let sample = FixSample {
            location: Some((self.latitude, self.longitude)),
            updated: true,
            time: Some(Utc::now()),
            satellites: Some(rng.gen_range(4..=12)),
            speed_kmh: rng.gen_range(0.0..60.0),
            altitude_m: 200.0 + rng.gen_range(-15.0..15.0),
            hdop: Some(rng.gen_range(0.7..2.5)),
        };
        debug!(satellites = sample.satellites, "Simulated fix");
        Some(sample)
    }
}
