// Copyright 2025 Pgsignals Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Tests for decoding records in the shape the capture routine emits.

use pgsignals_core::decode::{decode, decode_value, DecodeError};
use pgsignals_core::event::OperationKind;
use serde_json::json;

#[test]
fn test_update_record_from_trigger() {
    // row_to_json renders timestamps and numerics as strings or numbers
    let event = decode(
        r#"{
            "txid": 771203,
            "operation": "UPDATE",
            "table": "accounts",
            "row_before": {"id": 5, "balance": 10.50, "updated_at": "2025-01-02T10:00:00+00:00", "tags": ["a"]},
            "row_after":  {"id": 5, "balance": 12.00, "updated_at": "2025-01-02T10:05:00+00:00", "tags": ["a"]}
        }"#,
    )
    .unwrap();

    assert_eq!(event.txid, 771_203);
    assert_eq!(event.operation, OperationKind::Update);
    assert_eq!(event.changed_columns(), vec!["balance", "updated_at"]);
    assert_eq!(event.get("id"), Some(&json!(5)));
}

#[test]
fn test_jsonb_payload_decodes_like_text() {
    let payload = json!({
        "txid": 3,
        "operation": "INSERT",
        "table": "users",
        "row_before": null,
        "row_after": {"id": 1, "email": "a@example.com"}
    });

    let from_value = decode_value(payload.clone()).unwrap();
    let from_text = decode(&payload.to_string()).unwrap();

    assert_eq!(from_value, from_text);
    assert!(from_value.row_before.is_none());
}

#[test]
fn test_lowercase_operation_rejected() {
    let err = decode(
        r#"{"txid": 1, "operation": "insert", "table": "users", "row_after": {"id": 1}}"#,
    )
    .unwrap_err();

    assert!(matches!(err, DecodeError::UnknownOperation(_)));
    assert_eq!(err.category(), "unknown_operation");
}

#[test]
fn test_delete_with_after_image_rejected() {
    let err = decode(
        r#"{"txid": 1, "operation": "DELETE", "table": "users",
            "row_before": {"id": 1}, "row_after": {"id": 1}}"#,
    )
    .unwrap_err();

    assert!(matches!(err, DecodeError::ShapeMismatch { .. }));
}

#[test]
fn test_empty_notification_payload_is_malformed() {
    let err = decode("").unwrap_err();
    assert_eq!(err.category(), "malformed");
}
