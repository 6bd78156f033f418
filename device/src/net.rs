use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::ShutdownSignal;
use crate::types::PostResponse;

pub const RESOURCE_POST: &str = "/api/devices/input";
pub const RESOURCE_REGISTER: &str = "/api/devices/register";
pub const RESOURCE_HANDSHAKE: &str = "/api/devices/handshake";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_RETRY: Duration = Duration::from_secs(1);
const TCP_TEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Lock timeout for teardown steps; they are skipped rather than waited on.
pub const TEARDOWN_LOCK_TIMEOUT: Duration = Duration::from_secs(3);
const TEST_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Endpoint::new(config.server_host.clone(), config.server_port)
    }

    /// Port 80 is plain HTTP, anything else HTTPS; default ports are omitted.
    pub fn url(&self, path: &str) -> String {
        let scheme = if self.port == 80 { "http" } else { "https" };
        let default_port = if self.port == 80 { 80 } else { 443 };
        if self.port == default_port {
            format!("{}://{}{}", scheme, self.host, path)
        } else {
            format!("{}://{}:{}{}", scheme, self.host, self.port, path)
        }
    }
}

/// Data link to the collector: a cellular modem on the device, plain
/// sockets on a host.
#[async_trait]
pub trait Transport: Send {
    async fn initialize(&mut self) -> bool;

    async fn connect(&mut self, apn: &str, user: &str, pass: &str, timeout: Duration) -> bool;

    async fn post(&mut self, url: &str, body: &str) -> PostResponse;

    async fn disconnect(&mut self);

    async fn power_off(&mut self);

    async fn test_tcp(&mut self, host: &str, port: u16) -> bool;

    /// Target used to decide the network is up.
    fn set_server(&mut self, _endpoint: &Endpoint) {}
}

/// Host transport over reqwest. `connect` waits until the collector is
/// reachable, which is as close to "registered on the network" as a host gets.
pub struct HttpTransport {
    client: Option<Client>,
    connected: bool,
    server: Option<Endpoint>,
    shutdown: ShutdownSignal,
}

impl HttpTransport {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        HttpTransport {
            client: None,
            connected: false,
            server: None,
            shutdown,
        }
    }

    async fn wait_for_network(&self, timeout: Duration) -> bool {
        let Some(server) = &self.server else {
            // Nothing to probe; treat the OS link as up.
            return true;
        };
        let deadline = Instant::now() + timeout;
        loop {
            if self.shutdown.is_requested() {
                debug!("Network wait interrupted by shutdown");
                return false;
            }
            let attempt = time::timeout(PROBE_TIMEOUT, TcpStream::connect((server.host.as_str(), server.port))).await;
            if let Ok(Ok(_)) = attempt {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(PROBE_RETRY).await;
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn initialize(&mut self) -> bool {
        if self.shutdown.is_requested() {
            info!("Transport initialization skipped due to shutdown request");
            return false;
        }
        if self.client.is_some() {
            debug!("Transport already initialized");
            return true;
        }
        match Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(PROBE_TIMEOUT)
            .build()
        {
            Ok(client) => {
                self.client = Some(client);
                info!("Transport initialized");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to initialize transport");
                false
            }
        }
    }

    async fn connect(&mut self, apn: &str, user: &str, _pass: &str, timeout: Duration) -> bool {
        if self.shutdown.is_requested() {
            info!("Connect skipped due to shutdown request");
            return false;
        }
        if self.client.is_none() {
            warn!("Cannot connect: transport not initialized");
            return false;
        }
        info!(apn, user, timeout_secs = timeout.as_secs(), "Waiting for network");
        self.connected = self.wait_for_network(timeout).await;
        if self.connected {
            info!("Network connected");
        } else {
            warn!("Network not available");
        }
        self.connected
    }

    async fn post(&mut self, url: &str, body: &str) -> PostResponse {
        if self.shutdown.is_requested() {
            info!("POST skipped due to shutdown request");
            return PostResponse::no_response();
        }
        let Some(client) = &self.client else {
            warn!("Cannot POST: transport not initialized");
            return PostResponse::no_response();
        };
        debug!(url, bytes = body.len(), "Performing POST");
        let response = match client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(url, error = %e, "POST failed");
                return PostResponse::no_response();
            }
        };
        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(status, error = %e, "Failed to read response body");
                String::new()
            }
        };
        debug!(status, body = %body, "POST response");
        PostResponse { status, body }
    }

    async fn disconnect(&mut self) {
        if !self.connected {
            debug!("Disconnect skipped (not connected)");
            return;
        }
        self.connected = false;
        info!("Network disconnected");
    }

    async fn power_off(&mut self) {
        if self.client.is_none() {
            debug!("Power-off skipped (not initialized)");
            return;
        }
        self.client = None;
        self.connected = false;
        info!("Transport powered off");
    }

    async fn test_tcp(&mut self, host: &str, port: u16) -> bool {
        if !self.connected {
            info!("Server test skipped (not connected)");
            return false;
        }
        if host.is_empty() || port == 0 {
            info!("Server test skipped (invalid host/port)");
            return false;
        }
        match time::timeout(TCP_TEST_TIMEOUT, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => {
                info!(host, port, "TCP connection established");
                true
            }
            Ok(Err(e)) => {
                warn!(host, port, error = %e, "TCP connection failed");
                false
            }
            Err(_) => {
                warn!(host, port, "TCP connection timed out");
                false
            }
        }
    }

    fn set_server(&mut self, endpoint: &Endpoint) {
        self.server = Some(endpoint.clone());
    }
}

/// The transport behind its lock. Shutdown-path calls use bounded lock
/// waits and skip the step when the link is busy.
pub struct TransportSession {
    inner: Mutex<Box<dyn Transport>>,
    shutdown: ShutdownSignal,
}

impl TransportSession {
    pub fn new(transport: Box<dyn Transport>, shutdown: ShutdownSignal) -> Self {
        TransportSession {
            inner: Mutex::new(transport),
            shutdown,
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn Transport>> {
        self.inner.lock().await
    }

    /// Initializes the link and connects with the stored credentials.
    pub async fn bring_up(&self, config: &Config, timeout: Duration) -> bool {
        if self.shutdown.is_requested() {
            return false;
        }
        let mut transport = self.lock().await;
        transport.set_server(&Endpoint::from_config(config));
        if !transport.initialize().await {
            return false;
        }
        transport
            .connect(&config.apn, &config.gprs_user, &config.gprs_pass, timeout)
            .await
    }

    pub async fn connect_with(&self, apn: &str, user: &str, pass: &str, timeout: Duration) -> bool {
        if self.shutdown.is_requested() {
            return false;
        }
        let mut transport = self.lock().await;
        if !transport.initialize().await {
            return false;
        }
        transport.connect(apn, user, pass, timeout).await
    }

    pub async fn post(&self, endpoint: &Endpoint, path: &str, body: &str) -> PostResponse {
        if self.shutdown.is_requested() {
            return PostResponse::no_response();
        }
        let url = endpoint.url(path);
        self.lock().await.post(&url, body).await
    }

    pub async fn disconnect(&self) -> bool {
        match time::timeout(TEARDOWN_LOCK_TIMEOUT, self.inner.lock()).await {
            Ok(mut transport) => {
                transport.disconnect().await;
                true
            }
            Err(_) => {
                warn!("Disconnect skipped (transport busy)");
                false
            }
        }
    }

    pub async fn power_off(&self) -> bool {
        match time::timeout(TEARDOWN_LOCK_TIMEOUT, self.inner.lock()).await {
            Ok(mut transport) => {
                transport.power_off().await;
                true
            }
            Err(_) => {
                warn!("Power-off skipped (transport busy)");
                false
            }
        }
    }

    pub async fn test_tcp(&self, host: &str, port: u16) -> bool {
        match time::timeout(TEST_LOCK_TIMEOUT, self.inner.lock()).await {
            Ok(mut transport) => transport.test_tcp(host, port).await,
            Err(_) => {
                warn!("Server test skipped (transport busy)");
                false
            }
        }
    }
}
