use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};

use crate::config::{Config, SettingsUpdate, DEFAULT_CONSOLE_SSID};
use crate::context::DeviceContext;
use crate::error::{QueueError, StoreError};
use crate::net::RESOURCE_REGISTER;
use crate::power::{LifecycleState, PowerController};
use crate::queue::QueueStatus;
use crate::types::{RegistrationRequest, RegistrationResponse, CLIENT_TYPE};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);
const TEST_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const TEST_SETTLE: Duration = Duration::from_secs(1);
const LED_BLINK: Duration = Duration::from_millis(250);

/// The default access point name gets the device id appended so two
/// devices in service mode can be told apart.
pub fn console_ssid(config: &Config, device_id: &str) -> String {
    if config.console_ssid == DEFAULT_CONSOLE_SSID {
        format!("{}_{}", DEFAULT_CONSOLE_SSID, device_id)
    } else {
        config.console_ssid.clone()
    }
}

#[derive(Debug, Clone)]
pub struct SettingsView {
    pub device_id: String,
    pub console_ssid: String,
    pub link_up: bool,
    pub config: Config,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered,
    Rejected { reason: Option<String> },
    NotConnected,
}

/// Operations behind the field-configuration console.
pub struct ServiceConsole {
    ctx: Arc<DeviceContext>,
    link_up: AtomicBool,
}

impl ServiceConsole {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        ServiceConsole {
            ctx,
            link_up: AtomicBool::new(false),
        }
    }

    /// Brings the data link up with the saved credentials.
    pub async fn connect(&self) -> bool {
        let config = self.ctx.config();
        let up = self.ctx.transport.bring_up(&config, CONNECT_TIMEOUT).await;
        self.link_up.store(up, Ordering::SeqCst);
        if up {
            info!("Service mode link connected");
        } else {
            warn!("Service mode link not available");
        }
        up
    }

    pub fn link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> SettingsView {
        let config = self.ctx.config();
        SettingsView {
            device_id: self.ctx.device_id.clone(),
            console_ssid: console_ssid(&config, &self.ctx.device_id),
            link_up: self.link_up(),
            config,
        }
    }

    pub fn save_settings(&self, update: &SettingsUpdate) -> Result<Config, StoreError> {
        let mut store = self.ctx.config_store();
        store.save_settings(update)?;
        info!("Settings saved");
        Ok(store.config().clone())
    }

    /// Tries the given credentials, then reconnects with the saved ones.
    pub async fn test_connection(&self, apn: &str, user: &str, pass: &str) -> bool {
        info!(apn, user, "Testing data link");
        self.ctx.transport.disconnect().await;
        time::sleep(TEST_SETTLE).await;

        let success = self
            .ctx
            .transport
            .connect_with(apn, user, pass, TEST_CONNECT_TIMEOUT)
            .await;
        if success {
            info!("Test connection successful");
            self.ctx.transport.disconnect().await;
        } else {
            warn!("Test connection failed");
        }

        let config = self.ctx.config();
        let reconnected = self
            .ctx
            .transport
            .connect_with(&config.apn, &config.gprs_user, &config.gprs_pass, CONNECT_TIMEOUT)
            .await;
        self.link_up.store(reconnected, Ordering::SeqCst);
        if !reconnected {
            warn!("Failed to reconnect with saved settings");
        }
        success
    }

    pub async fn test_server(&self, host: &str, port: u16) -> bool {
        if !self.link_up() {
            info!("Server test skipped (link not connected)");
            return false;
        }
        self.ctx.transport.test_tcp(host, port).await
    }

    pub async fn queue_status(&self) -> QueueStatus {
        self.ctx.queue.status().await
    }

    pub async fn clear_queue(&self) -> Result<(), QueueError> {
        self.ctx.queue.clear().await
    }

    /// Claims the device for `username`. Success clears an earlier
    /// revocation.
    pub async fn register(&self, username: &str, password: &str) -> RegistrationOutcome {
        if !self.link_up() {
            return RegistrationOutcome::NotConnected;
        }
        let config = self.ctx.config();
        let request = RegistrationRequest {
            client_type: CLIENT_TYPE,
            username,
            password,
            device_id: &self.ctx.device_id,
            name: &config.device_name,
        };
        let payload = match serde_json::to_string(&request) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode registration");
                return RegistrationOutcome::Rejected { reason: None };
            }
        };

        info!(username, "Registering device");
        let response = self
            .ctx
            .transport
            .post(&self.ctx.endpoint(), RESOURCE_REGISTER, &payload)
            .await;
        match serde_json::from_str::<RegistrationResponse>(&response.body) {
            Ok(parsed) if parsed.success => {
                self.ctx.config_store().set_registered(true);
                info!("Device registered successfully");
                RegistrationOutcome::Registered
            }
            Ok(parsed) => {
                warn!(status = response.status, reason = ?parsed.error, "Registration failed");
                RegistrationOutcome::Rejected { reason: parsed.error }
            }
            Err(_) => {
                warn!(status = response.status, "Registration failed");
                RegistrationOutcome::Rejected { reason: None }
            }
        }
    }
}

/// Service mode: link up, then blink the status LED until powered off.
pub async fn run_service_mode(console: &ServiceConsole, power: &PowerController) {
    let settings = console.settings();
    info!(ssid = %settings.console_ssid, device_id = %settings.device_id, "Service mode activated");
    console.connect().await;

    let mut led = true;
    let mut blink = time::interval(LED_BLINK);
    while power.state() != LifecycleState::PoweredOff && !console.ctx.shutdown.is_requested() {
        blink.tick().await;
        led = !led;
        power.hal().set_status_led(led);
    }
    info!("Service mode ended");
}
