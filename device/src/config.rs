use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::storage::Preferences;
use crate::types::ServerConfig;

pub const DEFAULT_APN: &str = "internet.t-mobile.cz";
pub const DEFAULT_GPRS_USER: &str = "gprs";
pub const DEFAULT_GPRS_PASS: &str = "gprs";
pub const DEFAULT_SERVER_HOST: &str = "lotr-system.xyz";
pub const DEFAULT_SERVER_PORT: u16 = 443;
pub const DEFAULT_DEVICE_NAME: &str = "NEO-6M_A7670E";
pub const DEFAULT_SLEEP_SECONDS: u64 = 60;
pub const DEFAULT_BATCH_SIZE: u8 = 1;
pub const DEFAULT_MIN_SATELLITES: u32 = 1;
pub const DEFAULT_MODE: &str = "batch";
pub const DEFAULT_CONSOLE_SSID: &str = "lotrTrackerOTA";
pub const DEFAULT_CONSOLE_PASSWORD: &str = "password";
pub const MAX_BATCH_THRESHOLD: u8 = 50;

mod keys {
    pub const APN: &str = "apn";
    pub const GPRS_USER: &str = "gprsUser";
    pub const GPRS_PASS: &str = "gprsPass";
    pub const SERVER: &str = "server";
    pub const PORT: &str = "port";
    pub const DEVICE_NAME: &str = "deviceName";
    pub const SLEEP_TIME: &str = "sleepTime";
    pub const BATCH_SIZE: &str = "batch_size";
    pub const MIN_SATS: &str = "minSats";
    pub const REGISTERED: &str = "registered";
    pub const MODE: &str = "mode";
    pub const CONSOLE_SSID: &str = "ota_ssid";
    pub const CONSOLE_PASSWORD: &str = "ota_password";
    pub const DEVICE_ID: &str = "deviceId";
}

/// Device settings as loaded from the preferences store.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub apn: String,
    pub gprs_user: String,
    pub gprs_pass: String,
    pub server_host: String,
    pub server_port: u16,
    pub device_name: String,
    pub sleep_seconds: u64,
    /// Readings to collect before a sync, also the records per POST.
    pub batch_size: u8,
    pub min_satellites: u32,
    pub mode: String,
    pub registered: bool,
    pub console_ssid: String,
    pub console_password: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            apn: DEFAULT_APN.to_string(),
            gprs_user: DEFAULT_GPRS_USER.to_string(),
            gprs_pass: DEFAULT_GPRS_PASS.to_string(),
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            sleep_seconds: DEFAULT_SLEEP_SECONDS,
            batch_size: DEFAULT_BATCH_SIZE,
            min_satellites: DEFAULT_MIN_SATELLITES,
            mode: DEFAULT_MODE.to_string(),
            registered: true,
            console_ssid: DEFAULT_CONSOLE_SSID.to_string(),
            console_password: DEFAULT_CONSOLE_PASSWORD.to_string(),
        }
    }
}

/// Clamps a server-supplied batch threshold into 1..=50.
pub fn clamp_batch_size(value: i64) -> u8 {
    value.clamp(1, MAX_BATCH_THRESHOLD as i64) as u8
}

/// Settings written from the service console. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub apn: Option<String>,
    pub gprs_user: Option<String>,
    pub gprs_pass: Option<String>,
    pub gprs_pass_confirm: Option<String>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub device_name: Option<String>,
    pub console_ssid: Option<String>,
    pub console_password: Option<String>,
    pub console_password_confirm: Option<String>,
}

pub struct ConfigStore {
    prefs: Preferences,
    current: Config,
}

impl ConfigStore {
    pub fn new(prefs: Preferences) -> Self {
        let mut store = ConfigStore {
            prefs,
            current: Config::default(),
        };
        store.load();
        store
    }

    pub fn config(&self) -> &Config {
        &self.current
    }

    /// Rebuilds every field from the store, each falling back to its default
    /// on its own.
    pub fn load(&mut self) -> &Config {
        let p = &self.prefs;
        let port = p.get_u64(keys::PORT, DEFAULT_SERVER_PORT as u64);
        let batch = p.get_u64(keys::BATCH_SIZE, DEFAULT_BATCH_SIZE as u64);
        let min_sats = p.get_u64(keys::MIN_SATS, DEFAULT_MIN_SATELLITES as u64);
        self.current = Config {
            apn: p.get_string(keys::APN, DEFAULT_APN),
            gprs_user: p.get_string(keys::GPRS_USER, DEFAULT_GPRS_USER),
            gprs_pass: p.get_string(keys::GPRS_PASS, DEFAULT_GPRS_PASS),
            server_host: p.get_string(keys::SERVER, DEFAULT_SERVER_HOST),
            server_port: u16::try_from(port).unwrap_or(DEFAULT_SERVER_PORT),
            device_name: p.get_string(keys::DEVICE_NAME, DEFAULT_DEVICE_NAME),
            sleep_seconds: p.get_u64(keys::SLEEP_TIME, DEFAULT_SLEEP_SECONDS).max(1),
            batch_size: clamp_batch_size(i64::try_from(batch).unwrap_or(i64::MAX)),
            min_satellites: u32::try_from(min_sats).unwrap_or(DEFAULT_MIN_SATELLITES),
            mode: p.get_string(keys::MODE, DEFAULT_MODE),
            registered: p.get_bool(keys::REGISTERED, true),
            console_ssid: p.get_string(keys::CONSOLE_SSID, DEFAULT_CONSOLE_SSID),
            console_password: p.get_string(keys::CONSOLE_PASSWORD, DEFAULT_CONSOLE_PASSWORD),
        };
        info!(
            server = %self.current.server_host,
            port = self.current.server_port,
            sleep_seconds = self.current.sleep_seconds,
            batch_size = self.current.batch_size,
            min_satellites = self.current.min_satellites,
            registered = self.current.registered,
            "Configuration loaded"
        );
        &self.current
    }

    /// Merges a server-pushed config. Absent fields are untouched; each
    /// present field is validated, persisted and applied on its own.
    pub fn apply_server_config(&mut self, patch: &ServerConfig) {
        if let Some(interval_gps) = patch.interval_gps {
            if interval_gps > 0 {
                let seconds = interval_gps as u64;
                match self.prefs.put_u64(keys::SLEEP_TIME, seconds) {
                    Ok(()) => info!(seconds, "Server updated sleep interval"),
                    Err(e) => warn!(error = %e, "Failed to persist sleep interval"),
                }
                self.current.sleep_seconds = seconds;
            } else {
                warn!(interval_gps, "Ignoring non-positive sleep interval from server");
            }
        }
        if let Some(interval_send) = patch.interval_send {
            let batch_size = clamp_batch_size(interval_send);
            match self.prefs.put_u64(keys::BATCH_SIZE, batch_size as u64) {
                Ok(()) => info!(batch_size, "Server updated batch size"),
                Err(e) => warn!(error = %e, "Failed to persist batch size"),
            }
            self.current.batch_size = batch_size;
        }
        if let Some(satellites) = patch.satellites {
            if satellites >= 0 {
                let satellites = satellites.min(u32::MAX as i64) as u32;
                match self.prefs.put_u64(keys::MIN_SATS, satellites as u64) {
                    Ok(()) => info!(satellites, "Server updated minimum satellites for fix"),
                    Err(e) => warn!(error = %e, "Failed to persist minimum satellites"),
                }
                self.current.min_satellites = satellites;
            } else {
                warn!(satellites, "Ignoring negative satellite threshold from server");
            }
        }
        if let Some(mode) = patch.mode.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            match self.prefs.put_string(keys::MODE, mode) {
                Ok(()) => info!(mode, "Server updated operation mode"),
                Err(e) => warn!(error = %e, "Failed to persist operation mode"),
            }
            self.current.mode = mode.to_string();
        }
    }

    /// Persists the registration flag before updating memory.
    pub fn set_registered(&mut self, registered: bool) {
        if let Err(e) = self.prefs.put_bool(keys::REGISTERED, registered) {
            warn!(error = %e, registered, "Failed to persist registration flag");
        }
        if self.current.registered != registered {
            info!(registered, "Registration state changed");
        }
        self.current.registered = registered;
    }

    pub fn save_settings(&mut self, update: &SettingsUpdate) -> Result<(), StoreError> {
        let p = &self.prefs;
        if let Some(apn) = &update.apn {
            p.put_string(keys::APN, apn)?;
        }
        if let Some(user) = &update.gprs_user {
            p.put_string(keys::GPRS_USER, user)?;
        }
        if let Some(pass) = &update.gprs_pass {
            if update.gprs_pass_confirm.as_ref() == Some(pass) {
                p.put_string(keys::GPRS_PASS, pass)?;
            } else {
                warn!("GPRS password confirmation does not match, keeping the old one");
            }
        }
        if let Some(host) = &update.server_host {
            p.put_string(keys::SERVER, host)?;
        }
        if let Some(port) = update.server_port {
            p.put_u64(keys::PORT, port as u64)?;
        }
        if let Some(name) = &update.device_name {
            p.put_string(keys::DEVICE_NAME, name)?;
        }
        if let Some(ssid) = &update.console_ssid {
            p.put_string(keys::CONSOLE_SSID, ssid)?;
        }
        if let Some(password) = &update.console_password {
            if update.console_password_confirm.as_ref() == Some(password) {
                p.put_string(keys::CONSOLE_PASSWORD, password)?;
            } else {
                warn!("Console password confirmation does not match, keeping the old one");
            }
        }
        self.load();
        Ok(())
    }

    /// Returns the persisted device id, creating one on first boot.
    pub fn device_id(&mut self, provisioned: Option<&str>) -> String {
        if let Some(id) = provisioned.map(str::trim).filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        let stored = self.prefs.get_string(keys::DEVICE_ID, "");
        if !stored.is_empty() {
            return stored;
        }
        let hex = Uuid::new_v4().simple().to_string().to_uppercase();
        let id = hex[hex.len() - 10..].to_string();
        if let Err(e) = self.prefs.put_string(keys::DEVICE_ID, &id) {
            warn!(error = %e, "Failed to persist generated device id");
        }
        info!(device_id = %id, "Generated device id");
        id
    }
}

/// Process-level options, the host stand-in for board straps.
#[derive(Debug, Clone)]
pub struct BootOptions {
    pub data_dir: PathBuf,
    pub device_id: Option<String>,
    pub service_mode: bool,
    pub gps_timeout: Duration,
    pub gps_poll_interval: Duration,
    pub network_wait: Duration,
    pub sim_latitude: f64,
    pub sim_longitude: f64,
}

impl BootOptions {
    /// Defaults for everything but the storage location.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        BootOptions {
            data_dir: data_dir.into(),
            device_id: None,
            service_mode: false,
            gps_timeout: Duration::from_secs(300),
            gps_poll_interval: Duration::from_millis(10),
            network_wait: Duration::from_secs(240),
            sim_latitude: 50.0755,
            sim_longitude: 14.4378,
        }
    }

    pub fn from_env() -> Self {
        let data_dir = env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        let device_id = env::var("DEVICE_ID").ok();
        let service_mode = env::var("SERVICE_MODE")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        BootOptions {
            data_dir: PathBuf::from(data_dir),
            device_id,
            service_mode,
            gps_timeout: Duration::from_secs(get_env_var_u64("GPS_TIMEOUT_SECS", 300)),
            gps_poll_interval: Duration::from_millis(get_env_var_u64("GPS_POLL_MS", 10)),
            network_wait: Duration::from_secs(get_env_var_u64("NETWORK_WAIT_SECS", 240)),
            sim_latitude: get_env_var_f64("SIM_GPS_LAT", 50.0755),
            sim_longitude: get_env_var_f64("SIM_GPS_LON", 14.4378),
        }
    }
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

fn get_env_var_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}
