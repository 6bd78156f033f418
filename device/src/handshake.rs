use tracing::{info, warn};

use crate::context::DeviceContext;
use crate::net::RESOURCE_HANDSHAKE;
use crate::sync::{classify, revoke_if_rejected, StatusClass};
use crate::types::{HandshakeRequest, HandshakeResponse, PowerInstruction, CLIENT_TYPE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Accepted,
    NotRegistered,
    Conflict,
    ServerError(u16),
    HttpError(u16),
    NoResponse,
    Malformed,
}

impl HandshakeOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, HandshakeOutcome::Accepted)
    }
}

/// Announces the device and its power state, then applies whatever the
/// server sends back. Failures leave the last known state in place.
pub async fn perform_handshake(ctx: &DeviceContext) -> HandshakeOutcome {
    let request = HandshakeRequest {
        device_id: &ctx.device_id,
        client_type: CLIENT_TYPE,
        power_status: ctx.power.status(),
    };
    let payload = match serde_json::to_string(&request) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Failed to encode handshake");
            return HandshakeOutcome::Malformed;
        }
    };

    info!(power_status = %request.power_status, "Performing device handshake");
    let response = ctx
        .transport
        .post(&ctx.endpoint(), RESOURCE_HANDSHAKE, &payload)
        .await;
    let status = response.status;
    let class = classify(status);

    if revoke_if_rejected(ctx, class) {
        return match class {
            StatusClass::Conflict => HandshakeOutcome::Conflict,
            _ => HandshakeOutcome::NotRegistered,
        };
    }
    match class {
        StatusClass::ServerError => {
            warn!(status, "Handshake server error");
            return HandshakeOutcome::ServerError(status);
        }
        StatusClass::NoResponse => {
            warn!("Handshake failed: no response from server");
            return HandshakeOutcome::NoResponse;
        }
        StatusClass::ClientError => {
            warn!(status, "Handshake HTTP error");
            return HandshakeOutcome::HttpError(status);
        }
        _ => {}
    }

    let parsed: HandshakeResponse = match serde_json::from_str(&response.body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Failed to parse handshake response");
            return HandshakeOutcome::Malformed;
        }
    };

    {
        let mut store = ctx.config_store();
        if let Some(registered) = parsed.registered {
            store.set_registered(registered);
            if !registered {
                warn!("Handshake indicates device is not registered");
            }
        }
        if let Some(config) = &parsed.config {
            store.apply_server_config(config);
        }
    }

    if let Some(instruction) = &parsed.power_instruction {
        match instruction.trim().to_ascii_uppercase().as_str() {
            "TURN_OFF" => ctx.power.apply(PowerInstruction::TurnOff),
            "NONE" | "" => ctx.power.clear(),
            other => warn!(instruction = other, "Unknown power instruction"),
        }
    }

    HandshakeOutcome::Accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use crate::types::PowerStatus;
    use tempfile::TempDir;

    async fn device() -> (TempDir, MockDevice) {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::boot(dir.path(), vec![]).unwrap();
        assert!(device.connect().await);
        (dir, device)
    }

    #[tokio::test]
    async fn sends_identity_and_power_status() {
        let (_dir, device) = device().await;
        device.script.respond(RESOURCE_HANDSHAKE, 200, "{}");

        assert_eq!(perform_handshake(&device.ctx).await, HandshakeOutcome::Accepted);
        let posts = device.script.posts_to(RESOURCE_HANDSHAKE);
        let body: serde_json::Value = serde_json::from_str(&posts[0].body).unwrap();
        assert_eq!(body["device_id"], "TESTDEV001");
        assert_eq!(body["client_type"], "HW");
        assert_eq!(body["power_status"], "ON");
    }

    #[tokio::test]
    async fn turn_off_arms_instruction_case_insensitively() {
        let (_dir, device) = device().await;
        device
            .script
            .respond(RESOURCE_HANDSHAKE, 200, r#"{"registered":true,"power_instruction":"  turn_off "}"#);

        assert!(perform_handshake(&device.ctx).await.is_accepted());
        assert_eq!(device.ctx.power.instruction(), PowerInstruction::TurnOff);
        assert_eq!(device.ctx.power.status(), PowerStatus::Off);
        assert!(device.ctx.power.report_pending());
        assert!(!device.ctx.power.should_shutdown());
    }

    #[tokio::test]
    async fn none_clears_and_unknown_is_ignored() {
        let (_dir, device) = device().await;
        device.ctx.power.apply(PowerInstruction::TurnOff);
        device
            .script
            .respond(RESOURCE_HANDSHAKE, 200, r#"{"power_instruction":"REBOOT"}"#);
        device.script.respond(RESOURCE_HANDSHAKE, 200, r#"{"power_instruction":"none"}"#);

        perform_handshake(&device.ctx).await;
        assert_eq!(device.ctx.power.instruction(), PowerInstruction::TurnOff);
        perform_handshake(&device.ctx).await;
        assert_eq!(device.ctx.power.instruction(), PowerInstruction::None);
    }

    #[tokio::test]
    async fn applies_registration_and_config() {
        let (_dir, device) = device().await;
        device.script.respond(
            RESOURCE_HANDSHAKE,
            200,
            r#"{"registered":false,"config":{"interval_gps":90,"interval_send":0,"mode":"simple"}}"#,
        );

        assert!(perform_handshake(&device.ctx).await.is_accepted());
        let config = device.ctx.config();
        assert!(!config.registered);
        assert_eq!(config.sleep_seconds, 90);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.mode, "simple");
    }

    #[tokio::test]
    async fn status_codes_win_over_body() {
        let (_dir, device) = device().await;
        device.ctx.power.apply(PowerInstruction::TurnOff);
        device
            .script
            .respond(RESOURCE_HANDSHAKE, 409, r#"{"registered":true,"power_instruction":"TURN_OFF"}"#);

        assert_eq!(perform_handshake(&device.ctx).await, HandshakeOutcome::Conflict);
        assert!(!device.ctx.is_registered());
        assert_eq!(device.ctx.power.instruction(), PowerInstruction::None);
    }

    #[tokio::test]
    async fn failures_keep_last_known_state() {
        let (_dir, device) = device().await;
        device.script.respond(RESOURCE_HANDSHAKE, 503, "");
        device.script.respond(RESOURCE_HANDSHAKE, 200, "<html>");

        assert_eq!(perform_handshake(&device.ctx).await, HandshakeOutcome::ServerError(503));
        assert_eq!(perform_handshake(&device.ctx).await, HandshakeOutcome::Malformed);
        assert_eq!(perform_handshake(&device.ctx).await, HandshakeOutcome::NoResponse);
        assert!(device.ctx.is_registered());
    }

    #[tokio::test]
    async fn not_found_revokes_registration() {
        let (_dir, device) = device().await;
        device.script.respond(RESOURCE_HANDSHAKE, 404, "");
        assert_eq!(perform_handshake(&device.ctx).await, HandshakeOutcome::NotRegistered);
        assert!(!device.ctx.is_registered());
    }
}
