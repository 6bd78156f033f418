use tracing::{debug, error, info, warn};

use crate::context::DeviceContext;
use crate::queue::{Batch, QueueFile, MAX_BATCH_SIZE};
use crate::net::RESOURCE_POST;
use crate::types::{PostResponse, UploadResponse};

/// Coarse meaning of an HTTP status, checked before the body is looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// No HTTP response at all (link down, timeout, refused).
    NoResponse,
    /// The server does not know this device.
    NotFound,
    /// The device id is claimed by another account.
    Conflict,
    ServerError,
    ClientError,
    Success,
}

pub fn classify(status: u16) -> StatusClass {
    match status {
        0 => StatusClass::NoResponse,
        404 => StatusClass::NotFound,
        409 => StatusClass::Conflict,
        500.. => StatusClass::ServerError,
        400..=499 => StatusClass::ClientError,
        _ => StatusClass::Success,
    }
}

/// Applies an authoritative rejection. Returns true when `class` was one.
pub(crate) fn revoke_if_rejected(ctx: &DeviceContext, class: StatusClass) -> bool {
    match class {
        StatusClass::NotFound => {
            warn!(device_id = %ctx.device_id, "Server does not know this device, marking unregistered");
            ctx.config_store().set_registered(false);
            true
        }
        StatusClass::Conflict => {
            warn!(device_id = %ctx.device_id, "Device claimed by another account, marking unregistered");
            ctx.config_store().set_registered(false);
            ctx.power.clear();
            true
        }
        _ => false,
    }
}

/// Why a drain stopped before the queue was empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncHalt {
    NotFound,
    Conflict,
    ServerError(u16),
    NoResponse,
    /// Any other non-success answer, including `success != true`.
    Rejected(u16),
    Malformed(u16),
    Storage,
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub all_sent: bool,
    pub batches: usize,
    pub records: usize,
    pub halt: Option<SyncHalt>,
}

/// Sends the queue in batches until it is empty or one batch fails.
pub struct SyncEngine<'a> {
    ctx: &'a DeviceContext,
}

impl<'a> SyncEngine<'a> {
    pub fn new(ctx: &'a DeviceContext) -> Self {
        SyncEngine { ctx }
    }

    /// Holds the queue lock for the whole drain, so appends wait for it.
    pub async fn drain(&self) -> SyncReport {
        let mut queue = self.ctx.queue.lock().await;
        self.drain_locked(&mut queue).await
    }

    pub async fn drain_locked(&self, queue: &mut QueueFile) -> SyncReport {
        let endpoint = self.ctx.endpoint();
        let mut report = SyncReport::default();

        loop {
            if self.ctx.shutdown.is_requested() {
                info!("Sync interrupted by shutdown request");
                report.halt = Some(SyncHalt::Shutdown);
                break;
            }

            let max = (self.ctx.config().batch_size as usize).min(MAX_BATCH_SIZE);
            let batch = match queue.drain_batch(max) {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    report.all_sent = true;
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read queue");
                    report.halt = Some(SyncHalt::Storage);
                    break;
                }
            };

            info!(records = batch.len(), "Sending batch");
            let response = self
                .ctx
                .transport
                .post(&endpoint, RESOURCE_POST, &batch.payload())
                .await;

            if let Err(halt) = self.handle_response(queue, &batch, response) {
                report.halt = Some(halt);
                break;
            }
            report.batches += 1;
            report.records += batch.len();
        }

        if report.all_sent {
            info!(batches = report.batches, records = report.records, "All queued data sent");
        } else {
            warn!(batches = report.batches, halt = ?report.halt, "Sync halted, remaining data kept for next cycle");
        }
        report
    }

    fn handle_response(&self, queue: &mut QueueFile, batch: &Batch, response: PostResponse) -> Result<(), SyncHalt> {
        let status = response.status;
        let class = classify(status);
        if revoke_if_rejected(self.ctx, class) {
            return Err(match class {
                StatusClass::Conflict => SyncHalt::Conflict,
                _ => SyncHalt::NotFound,
            });
        }
        match class {
            StatusClass::ServerError => {
                warn!(status, "Server error, keeping queue");
                return Err(SyncHalt::ServerError(status));
            }
            StatusClass::NoResponse => {
                warn!("No response from server, keeping queue");
                return Err(SyncHalt::NoResponse);
            }
            _ => {}
        }

        let parsed = serde_json::from_str::<UploadResponse>(&response.body);
        if class == StatusClass::ClientError {
            warn!(status, body = %response.body, "Upload rejected");
            if let Ok(UploadResponse { registered: Some(false), .. }) = parsed {
                self.ctx.config_store().set_registered(false);
            }
            return Err(SyncHalt::Rejected(status));
        }

        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(status, error = %e, "Unparseable upload response, keeping queue");
                return Err(SyncHalt::Malformed(status));
            }
        };
        if parsed.success != Some(true) {
            warn!(status, body = %response.body, "Server did not confirm upload");
            if parsed.registered == Some(false) {
                self.ctx.config_store().set_registered(false);
            }
            return Err(SyncHalt::Rejected(status));
        }

        if let Err(e) = queue.commit(batch) {
            // Accepted by the server but still queued: resent next cycle.
            error!(error = %e, "Failed to commit sent batch");
            return Err(SyncHalt::Storage);
        }
        debug!(records = batch.len(), "Batch committed");

        let patch = parsed.config_patch();
        let mut store = self.ctx.config_store();
        if !patch.is_empty() {
            store.apply_server_config(&patch);
        }
        if let Some(registered) = parsed.registered {
            store.set_registered(registered);
        }
        drop(store);

        if batch.carries_power_status() {
            self.ctx.power.acknowledge();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use crate::types::{PowerInstruction, Reading};
    use tempfile::TempDir;

    fn reading(n: u32) -> Reading {
        Reading {
            device_id: "TESTDEV001".into(),
            name: None,
            latitude: 50.0 + n as f64 / 1000.0,
            longitude: 14.0,
            speed: 0.0,
            altitude: 200.0,
            hdop: 1.0,
            satellites: 6,
            timestamp: None,
            power_status: None,
        }
    }

    async fn device_with(records: u32) -> (TempDir, MockDevice) {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::boot(dir.path(), vec![]).unwrap();
        for n in 0..records {
            device.ctx.queue.append(&reading(n)).await.unwrap();
        }
        assert!(device.connect().await);
        (dir, device)
    }

    #[test]
    fn status_classes() {
        assert_eq!(classify(0), StatusClass::NoResponse);
        assert_eq!(classify(200), StatusClass::Success);
        assert_eq!(classify(302), StatusClass::Success);
        assert_eq!(classify(400), StatusClass::ClientError);
        assert_eq!(classify(404), StatusClass::NotFound);
        assert_eq!(classify(409), StatusClass::Conflict);
        assert_eq!(classify(503), StatusClass::ServerError);
    }

    #[tokio::test]
    async fn drains_in_batches_until_empty() {
        let (_dir, device) = device_with(5).await;
        device.ctx.config_store().apply_server_config(&crate::types::ServerConfig {
            interval_send: Some(2),
            ..Default::default()
        });
        device.script.set_fallback(200, r#"{"success":true}"#);

        let report = SyncEngine::new(&device.ctx).drain().await;
        assert!(report.all_sent);
        assert_eq!(report.batches, 3);
        assert_eq!(report.records, 5);
        assert!(device.ctx.queue.is_empty().await);

        let posts = device.script.posts_to(RESOURCE_POST);
        let sizes: Vec<usize> = posts
            .iter()
            .map(|p| serde_json::from_str::<Vec<serde_json::Value>>(&p.body).unwrap().len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn not_found_revokes_registration_and_keeps_queue() {
        let (_dir, device) = device_with(3).await;
        device.script.respond(RESOURCE_POST, 404, r#"{"success":true}"#);

        let report = SyncEngine::new(&device.ctx).drain().await;
        assert_eq!(report.halt, Some(SyncHalt::NotFound));
        assert!(!report.all_sent);
        assert!(!device.ctx.is_registered());
        assert_eq!(device.ctx.queue.record_count().await, 3);
        assert_eq!(device.script.posts().len(), 1);
    }

    #[tokio::test]
    async fn conflict_revokes_registration_and_clears_instruction() {
        let (_dir, device) = device_with(1).await;
        device.ctx.power.apply(PowerInstruction::TurnOff);
        device.script.respond(RESOURCE_POST, 409, "");

        let report = SyncEngine::new(&device.ctx).drain().await;
        assert_eq!(report.halt, Some(SyncHalt::Conflict));
        assert!(!device.ctx.is_registered());
        assert_eq!(device.ctx.power.instruction(), PowerInstruction::None);
        assert_eq!(device.ctx.queue.record_count().await, 1);
    }

    #[tokio::test]
    async fn server_error_keeps_queue_and_registration() {
        let (_dir, device) = device_with(2).await;
        device.script.respond(RESOURCE_POST, 500, "oops");

        let report = SyncEngine::new(&device.ctx).drain().await;
        assert_eq!(report.halt, Some(SyncHalt::ServerError(500)));
        assert!(device.ctx.is_registered());
        assert_eq!(device.ctx.queue.record_count().await, 2);
    }

    #[tokio::test]
    async fn failed_batch_stops_the_drain() {
        let (_dir, device) = device_with(3).await;
        device.script.respond(RESOURCE_POST, 200, r#"{"success":true}"#);
        device.script.respond(RESOURCE_POST, 200, "not json");

        let report = SyncEngine::new(&device.ctx).drain().await;
        assert_eq!(report.batches, 1);
        assert_eq!(report.halt, Some(SyncHalt::Malformed(200)));
        assert_eq!(device.script.posts().len(), 2);
        assert_eq!(device.ctx.queue.record_count().await, 2);
    }

    #[tokio::test]
    async fn unconfirmed_upload_with_registered_false_revokes() {
        let (_dir, device) = device_with(1).await;
        device.script.respond(RESOURCE_POST, 200, r#"{"success":false,"registered":false}"#);

        let report = SyncEngine::new(&device.ctx).drain().await;
        assert_eq!(report.halt, Some(SyncHalt::Rejected(200)));
        assert!(!device.ctx.is_registered());
        assert_eq!(device.ctx.queue.record_count().await, 1);
    }

    #[tokio::test]
    async fn success_applies_config_and_registration() {
        let (_dir, device) = device_with(1).await;
        device.script.respond(
            RESOURCE_POST,
            201,
            r#"{"success":true,"registered":true,"satellites":3,"config":{"interval_gps":120,"interval_send":"4"}}"#,
        );

        let report = SyncEngine::new(&device.ctx).drain().await;
        assert!(report.all_sent);
        let config = device.ctx.config();
        assert_eq!(config.sleep_seconds, 120);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.min_satellites, 3);
    }

    #[tokio::test]
    async fn power_report_acknowledges_instruction() {
        let (_dir, device) = device_with(0).await;
        device.ctx.power.apply(PowerInstruction::TurnOff);
        let report = Reading::status_report("TESTDEV001", crate::types::PowerStatus::Off, None);
        device.ctx.queue.append(&report).await.unwrap();
        assert!(!device.ctx.power.should_shutdown());

        device.script.respond(RESOURCE_POST, 200, r#"{"success":true}"#);
        SyncEngine::new(&device.ctx).drain().await;
        assert!(device.ctx.power.should_shutdown());
        assert!(!device.ctx.power.report_pending());
    }

    #[tokio::test]
    async fn plain_batch_does_not_acknowledge() {
        let (_dir, device) = device_with(1).await;
        device.ctx.power.apply(PowerInstruction::TurnOff);
        device.script.respond(RESOURCE_POST, 200, r#"{"success":true}"#);

        SyncEngine::new(&device.ctx).drain().await;
        assert!(!device.ctx.power.should_shutdown());
    }

    #[tokio::test]
    async fn powered_down_link_reports_no_response() {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::boot(dir.path(), vec![]).unwrap();
        device.ctx.queue.append(&reading(0)).await.unwrap();
        device.script.respond(RESOURCE_POST, 404, "");

        let report = SyncEngine::new(&device.ctx).drain().await;
        assert_eq!(report.halt, Some(SyncHalt::NoResponse));
        assert!(device.ctx.is_registered());
        assert!(device.script.posts().is_empty());
        assert_eq!(device.ctx.queue.record_count().await, 1);
    }

    #[tokio::test]
    async fn shutdown_request_stops_before_posting() {
        let (_dir, device) = device_with(2).await;
        device.ctx.shutdown.request();

        let report = SyncEngine::new(&device.ctx).drain().await;
        assert_eq!(report.halt, Some(SyncHalt::Shutdown));
        assert!(device.script.posts().is_empty());
    }
}
