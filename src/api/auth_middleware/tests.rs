use super::*;
use crate::audit::TracingAuditSink;
use crate::gate::permissions::TierTable;
use crate::gate::store::ApiKeyStore;
use crate::gate::{Caller, NewKey};
use axum::http::HeaderValue;
use std::sync::Arc;

fn create_test_gate() -> AccessGate {
    AccessGate::new(
        Arc::new(ApiKeyStore::new(":memory:").unwrap()),
        TierTable::load().unwrap(),
        Arc::new(TracingAuditSink),
    )
}

fn create_key(gate: &AccessGate, name: &str, tier: &str) -> String {
    gate.create_key(
        Caller::Operator,
        NewKey {
            name: name.to_string(),
            tier: Some(tier.to_string()),
            permissions: None,
        },
    )
    .unwrap()
    .raw_key
}

fn create_auth_headers(raw_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", raw_key)).unwrap(),
    );
    headers
}

#[test]
fn test_missing_header_unauthorized() {
    let gate = create_test_gate();
    let result = authenticate_request(&HeaderMap::new(), &gate);
    assert!(matches!(result, Err(ApiError::Unauthorized(_))));
}

#[test]
fn test_unknown_key_unauthorized() {
    let gate = create_test_gate();
    let result = authenticate_request(&create_auth_headers("not-a-real-key"), &gate);
    assert!(matches!(result, Err(ApiError::Unauthorized(_))));
}

#[test]
fn test_valid_key_authenticates() {
    let gate = create_test_gate();
    let raw = create_key(&gate, "reader", "readonly");

    let key = authenticate_request(&create_auth_headers(&raw), &gate).unwrap();
    assert_eq!(key.name, "reader");
}

#[test]
fn test_missing_permission_forbidden() {
    let gate = create_test_gate();
    let raw = create_key(&gate, "reader", "readonly");

    match require_permission(&create_auth_headers(&raw), &gate, Permission::WriteMail) {
        Err(ApiError::Forbidden(msg)) => assert!(msg.contains("write:mail")),
        other => panic!("expected Forbidden, got {:?}", other),
    }
}

#[test]
fn test_held_permission_allowed() {
    let gate = create_test_gate();
    let raw = create_key(&gate, "writer", "full");

    assert!(require_permission(&create_auth_headers(&raw), &gate, Permission::WriteMail).is_ok());
}
