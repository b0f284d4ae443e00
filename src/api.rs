//! Request context, privileged-trigger authentication and response envelopes.
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::events::{self, EventOutcome, EventRequest};
use crate::job::{self, JobRequest};
use crate::recalc::{self, RecalcRequest};
use crate::stats::RunStats;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Staff,
    Viewer,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim() {
            "admin" => Some(Role::Admin),
            "staff" => Some(Role::Staff),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

/// Authenticated caller as resolved by the surrounding application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub tenant_id: String,
    pub user_id: String,
    pub role: Role,
}

impl RequestContext {
    pub fn can_write(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Staff)
    }

    pub fn require_write(&self) -> EngineResult<()> {
        if self.can_write() {
            Ok(())
        } else {
            Err(EngineError::Unauthorized(format!(
                "role {:?} may not modify tasks",
                self.role
            )))
        }
    }
}

/// Constant-time comparison of the privileged credential.
pub fn verify_secret(expected: &str, provided: Option<&str>) -> EngineResult<()> {
    if expected.is_empty() {
        return Err(EngineError::Unauthorized("trigger secret is not configured".into()));
    }
    let Some(provided) = provided else {
        return Err(EngineError::Unauthorized("missing trigger secret".into()));
    };
    let (a, b) = (expected.as_bytes(), provided.as_bytes());
    let mut diff = u8::from(a.len() != b.len());
    for (i, byte) in a.iter().enumerate() {
        diff |= byte ^ b.get(i).copied().unwrap_or(0);
    }
    if diff == 0 {
        Ok(())
    } else {
        warn!("rejected trigger with invalid secret");
        Err(EngineError::Unauthorized("invalid trigger secret".into()))
    }
}

pub async fn trigger_job(
    engine: &Engine,
    expected_secret: &str,
    provided_secret: Option<&str>,
    tenant_id: &str,
    request: &JobRequest,
) -> EngineResult<RunStats> {
    verify_secret(expected_secret, provided_secret)?;
    job::run(engine, tenant_id, request).await
}

pub async fn trigger_recalculate(
    engine: &Engine,
    expected_secret: &str,
    provided_secret: Option<&str>,
    tenant_id: &str,
    request: &RecalcRequest,
) -> EngineResult<RunStats> {
    verify_secret(expected_secret, provided_secret)?;
    recalc::recalculate(engine, tenant_id, request).await
}

pub async fn trigger_event(
    engine: &Engine,
    expected_secret: &str,
    provided_secret: Option<&str>,
    tenant_id: &str,
    request: &EventRequest,
) -> EngineResult<EventOutcome> {
    verify_secret(expected_secret, provided_secret)?;
    events::trigger_event(engine, tenant_id, request).await
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub status: u16,
    pub message: String,
}

/// Uniform response shape so callers can tell "ran with errors" apart from
/// "did not run".
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T: Serialize> Envelope<T> {
    pub fn from_result(result: EngineResult<T>) -> Self {
        match result {
            Ok(data) => Self {
                ok: true,
                data: Some(data),
                error: None,
            },
            Err(err) => Self {
                ok: false,
                data: None,
                error: Some(ErrorBody {
                    kind: err.kind(),
                    status: err.status_code(),
                    message: err.to_string(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_comparison() {
        assert!(verify_secret("s3cret", Some("s3cret")).is_ok());
        assert!(verify_secret("s3cret", Some("s3cre")).is_err());
        assert!(verify_secret("s3cret", Some("s3cret!")).is_err());
        assert!(verify_secret("s3cret", Some("S3cret")).is_err());
        assert!(verify_secret("s3cret", None).is_err());
        let err = verify_secret("", Some("")).unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn viewers_cannot_write() {
        let ctx = RequestContext {
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            role: Role::Viewer,
        };
        assert_eq!(ctx.require_write().unwrap_err().kind(), "unauthorized");
        assert_eq!(Role::parse("staff"), Some(Role::Staff));
        assert_eq!(Role::parse("root"), None);
    }

    #[test]
    fn envelope_carries_error_kind() {
        let env: Envelope<()> = Envelope::from_result(Err(EngineError::LockHeld { age_secs: 3 }));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["kind"], "lock_held");
        assert_eq!(value["error"]["status"], 409);
        assert!(value.get("data").is_none());
    }
}
