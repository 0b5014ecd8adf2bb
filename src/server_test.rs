use axum::http::StatusCode;
use serde_json::json;

use crate::error::{ActionFailed, UpgradeError};
use crate::server::action_response;

#[test]
fn action_success_is_reported_with_message() {
    let (status, body) = action_response(Ok("Upgrade will resume on unit postgresql-k8s/1".into()));
    assert!(status == StatusCode::OK, "unexpected status, got {}", status);
    let expected = json!({"message": "Upgrade will resume on unit postgresql-k8s/1"});
    assert!(body.0 == expected, "unexpected body, got {} expected {}", body.0, expected);
}

#[test]
fn action_failure_carries_hint_only_when_present() {
    let (status, body) = action_response(Err(UpgradeError::not_ready("invalid number of sync nodes", "wait and retry").into()));
    assert!(status == StatusCode::BAD_REQUEST, "unexpected status, got {}", status);
    let expected = json!({"error": "invalid number of sync nodes", "hint": "wait and retry"});
    assert!(body.0 == expected, "unexpected body, got {} expected {}", body.0, expected);

    let (status, body) = action_response(Err(ActionFailed::new("Nothing to resume, upgrade stack unset")));
    assert!(status == StatusCode::BAD_REQUEST, "unexpected status, got {}", status);
    let expected = json!({"error": "Nothing to resume, upgrade stack unset"});
    assert!(body.0 == expected, "unexpected body, got {} expected {}", body.0, expected);
}
