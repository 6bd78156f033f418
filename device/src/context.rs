use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{error, info};

use crate::config::{BootOptions, Config, ConfigStore};
use crate::error::StoreError;
use crate::gps::{GpsReceiver, Locator};
use crate::net::{Endpoint, Transport, TransportSession};
use crate::power::PowerInstructions;
use crate::queue::{PersistentQueue, QueueFile, QUEUE_FILE_NAME};
use crate::storage::{Preferences, PREFERENCES_NAMESPACE};

const PREFERENCES_FILE: &str = "preferences.db";

/// Global "shutdown requested" flag, checked by every bounded wait.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Everything a wake cycle, the button task and the service console share.
pub struct DeviceContext {
    pub device_id: String,
    config: Mutex<ConfigStore>,
    pub queue: PersistentQueue,
    pub transport: TransportSession,
    pub locator: Locator,
    pub power: PowerInstructions,
    pub shutdown: ShutdownSignal,
    pub network_wait: Duration,
}

impl DeviceContext {
    pub fn new(
        device_id: String,
        config: ConfigStore,
        queue: QueueFile,
        transport: Box<dyn Transport>,
        receiver: Box<dyn GpsReceiver>,
        shutdown: ShutdownSignal,
    ) -> Self {
        DeviceContext {
            locator: Locator::new(device_id.clone(), receiver, shutdown.clone()),
            device_id,
            config: Mutex::new(config),
            queue: PersistentQueue::new(queue),
            transport: TransportSession::new(transport, shutdown.clone()),
            power: PowerInstructions::new(),
            shutdown,
            network_wait: Duration::from_secs(240),
        }
    }

    /// Mounts storage under `options.data_dir`. A mount failure leaves the
    /// device on in-memory defaults with queueing disabled.
    pub fn boot(
        options: &BootOptions,
        shutdown: ShutdownSignal,
        transport: Box<dyn Transport>,
        receiver: Box<dyn GpsReceiver>,
    ) -> Result<Self, StoreError> {
        let queue_path = options.data_dir.join(QUEUE_FILE_NAME);
        let mounted = match fs::create_dir_all(&options.data_dir) {
            Ok(()) => true,
            Err(e) => {
                error!(path = %options.data_dir.display(), error = %e, "Failed to mount data directory");
                false
            }
        };

        let prefs = if mounted {
            Preferences::open(&options.data_dir.join(PREFERENCES_FILE), PREFERENCES_NAMESPACE)
        } else {
            Preferences::in_memory(PREFERENCES_NAMESPACE)
        };
        let prefs = match prefs {
            Ok(prefs) => prefs,
            Err(e) => {
                error!(error = %e, "Preferences unavailable, falling back to memory");
                Preferences::in_memory(PREFERENCES_NAMESPACE)?
            }
        };
        let mut config = ConfigStore::new(prefs);
        let device_id = config.device_id(options.device_id.as_deref());
        info!(device_id = %device_id, "Device identity");

        let queue = if mounted {
            QueueFile::open(queue_path)
        } else {
            QueueFile::unmounted(queue_path)
        };

        let mut ctx = DeviceContext::new(device_id, config, queue, transport, receiver, shutdown);
        ctx.network_wait = options.network_wait;
        ctx.locator.set_poll_interval(options.gps_poll_interval);
        Ok(ctx)
    }

    pub fn config_store(&self) -> MutexGuard<'_, ConfigStore> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current settings.
    pub fn config(&self) -> Config {
        self.config_store().config().clone()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from_config(self.config_store().config())
    }

    pub fn is_registered(&self) -> bool {
        self.config_store().config().registered
    }
}
