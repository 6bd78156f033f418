//! Scripted collaborators for tests and offline runs.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::BootOptions;
use crate::context::{DeviceContext, ShutdownSignal};
use crate::error::StoreError;
use crate::gps::{FixSample, GpsReceiver};
use crate::net::Transport;
use crate::types::PostResponse;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered record of side effects across collaborators.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: impl Into<String>) {
        lock(&self.0).push(event.into());
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        lock(&self.0).iter().position(|e| e == event)
    }

    pub fn contains(&self, event: &str) -> bool {
        self.position(event).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecord {
    pub url: String,
    pub body: String,
}

#[derive(Debug)]
struct ScriptState {
    responses: HashMap<String, VecDeque<PostResponse>>,
    fallback: PostResponse,
    posts: Vec<PostRecord>,
    link_available: bool,
    tcp_reachable: bool,
    connects: Vec<String>,
    post_delay: Duration,
}

/// Handle for scripting a `ScriptedTransport` after it has been boxed into a
/// device context.
#[derive(Debug, Clone)]
pub struct TransportScript(Arc<Mutex<ScriptState>>);

impl TransportScript {
    /// Queues a response for the next POST whose URL ends with `path`.
    pub fn respond(&self, path: &str, status: u16, body: &str) {
        lock(&self.0)
            .responses
            .entry(path.to_string())
            .or_default()
            .push_back(PostResponse::new(status, body));
    }

    /// Response used once a path's queue runs dry.
    pub fn set_fallback(&self, status: u16, body: &str) {
        lock(&self.0).fallback = PostResponse::new(status, body);
    }

    pub fn set_link_available(&self, available: bool) {
        lock(&self.0).link_available = available;
    }

    pub fn set_tcp_reachable(&self, reachable: bool) {
        lock(&self.0).tcp_reachable = reachable;
    }

    pub fn set_post_delay(&self, delay: Duration) {
        lock(&self.0).post_delay = delay;
    }

    pub fn posts(&self) -> Vec<PostRecord> {
        lock(&self.0).posts.clone()
    }

    pub fn posts_to(&self, path: &str) -> Vec<PostRecord> {
        lock(&self.0)
            .posts
            .iter()
            .filter(|post| post.url.ends_with(path))
            .cloned()
            .collect()
    }

    /// APNs passed to successful and failed `connect` calls, in order.
    pub fn connects(&self) -> Vec<String> {
        lock(&self.0).connects.clone()
    }

    fn next_response(&self, url: &str, body: &str) -> (PostResponse, Duration) {
        let mut state = lock(&self.0);
        state.posts.push(PostRecord {
            url: url.to_string(),
            body: body.to_string(),
        });
        let scripted = state
            .responses
            .iter_mut()
            .find(|(path, queue)| url.ends_with(path.as_str()) && !queue.is_empty())
            .and_then(|(_, queue)| queue.pop_front());
        let response = scripted.unwrap_or_else(|| state.fallback.clone());
        (response, state.post_delay)
    }
}

/// In-memory transport answering POSTs from a script.
pub struct ScriptedTransport {
    script: TransportScript,
    log: EventLog,
    initialized: bool,
    connected: bool,
}

impl ScriptedTransport {
    pub fn new(log: EventLog) -> (Self, TransportScript) {
        let script = TransportScript(Arc::new(Mutex::new(ScriptState {
            responses: HashMap::new(),
            fallback: PostResponse::no_response(),
            posts: Vec::new(),
            link_available: true,
            tcp_reachable: true,
            connects: Vec::new(),
            post_delay: Duration::ZERO,
        })));
        let transport = ScriptedTransport {
            script: script.clone(),
            log,
            initialized: false,
            connected: false,
        };
        (transport, script)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn initialize(&mut self) -> bool {
        self.initialized = true;
        self.log.record("transport.initialize");
        true
    }

    async fn connect(&mut self, apn: &str, _user: &str, _pass: &str, _timeout: Duration) -> bool {
        let available = {
            let mut state = lock(&self.script.0);
            state.connects.push(apn.to_string());
            state.link_available
        };
        self.connected = self.initialized && available;
        self.log.record("transport.connect");
        self.connected
    }

    async fn post(&mut self, url: &str, body: &str) -> PostResponse {
        if !self.initialized {
            return PostResponse::no_response();
        }
        let (response, delay) = self.script.next_response(url, body);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        response
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.log.record("transport.disconnect");
        }
    }

    async fn power_off(&mut self) {
        if self.initialized {
            self.initialized = false;
            self.connected = false;
            self.log.record("transport.power_off");
        }
    }

    async fn test_tcp(&mut self, _host: &str, _port: u16) -> bool {
        self.connected && lock(&self.script.0).tcp_reachable
    }
}

/// Receiver replaying a fixed sequence of poll results, then silence.
pub struct ScriptedReceiver {
    samples: VecDeque<Option<FixSample>>,
    log: EventLog,
}

impl ScriptedReceiver {
    pub fn new(samples: Vec<Option<FixSample>>) -> Self {
        Self::with_log(samples, EventLog::new())
    }

    pub fn with_log(samples: Vec<Option<FixSample>>, log: EventLog) -> Self {
        ScriptedReceiver {
            samples: samples.into(),
            log,
        }
    }
}

impl GpsReceiver for ScriptedReceiver {
    fn power_up(&mut self) {
        self.log.record("gps.power_up");
    }

    fn power_down(&mut self) {
        self.log.record("gps.power_down");
    }

    fn open(&mut self) {
        self.log.record("gps.open");
    }

    fn close(&mut self) {
        self.log.record("gps.close");
    }

    fn poll(&mut self) -> Option<FixSample> {
        self.samples.pop_front().flatten()
    }
}

/// A device booted from `data_dir` with scripted collaborators.
pub struct MockDevice {
    pub ctx: Arc<DeviceContext>,
    pub script: TransportScript,
    pub log: EventLog,
}

impl MockDevice {
    pub fn boot(data_dir: &Path, samples: Vec<Option<FixSample>>) -> Result<Self, StoreError> {
        let mut options = BootOptions::new(data_dir);
        options.device_id = Some("TESTDEV001".to_string());
        options.gps_poll_interval = Duration::from_millis(1);
        Self::boot_with(&options, samples)
    }

    pub fn boot_with(options: &BootOptions, samples: Vec<Option<FixSample>>) -> Result<Self, StoreError> {
        let log = EventLog::new();
        let (transport, script) = ScriptedTransport::new(log.clone());
        let receiver = ScriptedReceiver::with_log(samples, log.clone());
        let ctx = DeviceContext::boot(options, ShutdownSignal::new(), Box::new(transport), Box::new(receiver))?;
        Ok(MockDevice {
            ctx: Arc::new(ctx),
            script,
            log,
        })
    }

    /// Powers the scripted modem and attaches it with the saved APN.
    pub async fn connect(&self) -> bool {
        self.ctx.transport.bring_up(&self.ctx.config(), Duration::from_secs(1)).await
    }
}
