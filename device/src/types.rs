use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub const CLIENT_TYPE: &str = "HW";

/// One location sample as stored in the queue and sent to the collector.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Reading {
    #[serde(rename = "device")]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub altitude: f64,
    /// Horizontal dilution of precision, -1.0 when the receiver had none.
    #[serde(rename = "accuracy")]
    pub hdop: f64,
    pub satellites: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_status: Option<PowerStatus>,
}

impl Reading {
    /// Status-only record reporting the device power state, positioned at the
    /// last known fix when there is one.
    pub fn status_report(device_id: &str, status: PowerStatus, last_fix: Option<&Reading>) -> Self {
        let (latitude, longitude, altitude) = last_fix
            .map(|fix| (fix.latitude, fix.longitude, fix.altitude))
            .unwrap_or((0.0, 0.0, 0.0));
        Reading {
            device_id: device_id.to_string(),
            name: None,
            latitude,
            longitude,
            speed: 0.0,
            altitude,
            hdop: -1.0,
            satellites: 0,
            timestamp: Some(Utc::now()),
            power_status: Some(status),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerStatus {
    #[default]
    On,
    Off,
    Unknown,
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PowerStatus::On => "ON",
            PowerStatus::Off => "OFF",
            PowerStatus::Unknown => "UNKNOWN",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerInstruction {
    #[default]
    None,
    TurnOff,
}

/// Raw result of one POST: status 0 means no HTTP response was received.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PostResponse {
    pub status: u16,
    pub body: String,
}

impl PostResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn no_response() -> Self {
        Self::default()
    }
}

/// Config fields the server may push. Every field is optional; absent fields
/// leave the stored value untouched.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ServerConfig {
    #[serde(default, deserialize_with = "lenient_int")]
    pub interval_gps: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub interval_send: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub satellites: Option<i64>,
    #[serde(default)]
    pub mode: Option<String>,
}

impl ServerConfig {
    pub fn is_empty(&self) -> bool {
        self.interval_gps.is_none()
            && self.interval_send.is_none()
            && self.satellites.is_none()
            && self.mode.is_none()
    }

    /// Fields present in `other` replace the ones in `self`.
    pub fn overlay(mut self, other: ServerConfig) -> Self {
        if other.interval_gps.is_some() {
            self.interval_gps = other.interval_gps;
        }
        if other.interval_send.is_some() {
            self.interval_send = other.interval_send;
        }
        if other.satellites.is_some() {
            self.satellites = other.satellites;
        }
        if other.mode.is_some() {
            self.mode = other.mode;
        }
        self
    }
}

// The collector sometimes serialises numeric settings as strings.
fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct UploadResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub registered: Option<bool>,
    #[serde(default)]
    pub config: Option<ServerConfig>,
    #[serde(flatten)]
    pub legacy: ServerConfig,
}

impl UploadResponse {
    pub fn config_patch(&self) -> ServerConfig {
        let legacy = self.legacy.clone();
        match &self.config {
            Some(config) => legacy.overlay(config.clone()),
            None => legacy,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct HandshakeRequest<'a> {
    pub device_id: &'a str,
    pub client_type: &'a str,
    pub power_status: PowerStatus,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub registered: Option<bool>,
    #[serde(default)]
    pub config: Option<ServerConfig>,
    #[serde(default)]
    pub power_instruction: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct RegistrationRequest<'a> {
    pub client_type: &'a str,
    pub username: &'a str,
    pub password: &'a str,
    pub device_id: &'a str,
    pub name: &'a str,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct RegistrationResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}
