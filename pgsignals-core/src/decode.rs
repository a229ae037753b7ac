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

//! Change record decoding.
//!
//! Turns the JSON written by the capture routine into an [`Event`]:
//!
//! ```text
//! {"txid": 123, "operation": "UPDATE", "table": "users",
//!  "row_before": {...} | null, "row_after": {...} | null}
//! ```
//!
//! Decoding checks that `txid`, `operation` and `table` are present and well
//! typed, maps `operation` case-sensitively onto [`OperationKind`], and checks
//! that the row image the operation requires is there: `row_after` for
//! inserts, `row_before` for deletes, both for updates.

use crate::event::{Event, OperationKind, Row, UnknownOperation};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors produced while decoding a change record.
///
/// The listener logs these and skips the record; they never stop a listener.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload is not valid JSON
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Payload is valid JSON but not an object
    #[error("Change record is not a JSON object")]
    NotAnObject,

    /// A required field is absent or null
    #[error("Missing required field `{0}`")]
    MissingField(&'static str),

    /// A field has the wrong type or an invalid value
    #[error("Invalid field `{field}`: {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// Operation string is not INSERT, UPDATE or DELETE
    #[error(transparent)]
    UnknownOperation(#[from] UnknownOperation),

    /// Row images do not match the operation
    #[error("{operation} record {reason}")]
    ShapeMismatch {
        /// Operation of the record
        operation: OperationKind,
        /// Which image is missing or unexpected
        reason: &'static str,
    },
}

impl DecodeError {
    /// Returns the error category for metrics/logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::NotAnObject => "not_object",
            Self::MissingField(_) => "missing_field",
            Self::InvalidField { .. } => "invalid_field",
            Self::UnknownOperation(_) => "unknown_operation",
            Self::ShapeMismatch { .. } => "shape_mismatch",
        }
    }
}

/// Decodes a change record from its JSON text.
///
/// # Errors
///
/// Returns [`DecodeError`] if the text is not JSON or the record is invalid.
///
/// # Examples
///
/// ```rust
/// use pgsignals_core::decode::decode;
/// use pgsignals_core::event::OperationKind;
///
/// let event = decode(
///     r#"{"txid": 9, "operation": "DELETE", "table": "users",
///         "row_before": {"id": 1}, "row_after": null}"#,
/// ).unwrap();
/// assert_eq!(event.operation, OperationKind::Delete);
///
/// assert!(decode(r#"{"txid": 9, "operation": "FOO", "table": "users"}"#).is_err());
/// ```
pub fn decode(raw: &str) -> Result<Event, DecodeError> {
    let value: Value = serde_json::from_str(raw)?;
    decode_value(value)
}

/// Decodes a change record that was already parsed, e.g. a `JSONB` column.
///
/// # Errors
///
/// Returns [`DecodeError`] if the record is invalid.
pub fn decode_value(value: Value) -> Result<Event, DecodeError> {
    let Value::Object(mut record) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let txid = match take(&mut record, "txid")? {
        Value::Number(n) => n.as_i64().ok_or_else(|| DecodeError::InvalidField {
            field: "txid",
            reason: format!("{n} is not a 64-bit integer"),
        })?,
        other => return Err(invalid_type("txid", "an integer", &other)),
    };

    let operation = match take(&mut record, "operation")? {
        Value::String(op) => op.parse::<OperationKind>()?,
        other => return Err(invalid_type("operation", "a string", &other)),
    };

    let table = match take(&mut record, "table")? {
        Value::String(table) if !table.is_empty() => table,
        Value::String(_) => {
            return Err(DecodeError::InvalidField {
                field: "table",
                reason: "table name is empty".to_string(),
            })
        }
        other => return Err(invalid_type("table", "a string", &other)),
    };

    let row_before = take_row(&mut record, "row_before")?;
    let row_after = take_row(&mut record, "row_after")?;

    check_shape(operation, row_before.as_ref(), row_after.as_ref())?;

    Ok(Event {
        txid,
        operation,
        table,
        row_before,
        row_after,
    })
}

fn take(record: &mut Map<String, Value>, field: &'static str) -> Result<Value, DecodeError> {
    match record.remove(field) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(field)),
        Some(value) => Ok(value),
    }
}

fn take_row(record: &mut Map<String, Value>, field: &'static str) -> Result<Option<Row>, DecodeError> {
    match record.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(row)) => Ok(Some(row)),
        Some(other) => Err(invalid_type(field, "an object or null", &other)),
    }
}

fn invalid_type(field: &'static str, expected: &str, got: &Value) -> DecodeError {
    let kind = match got {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };
    DecodeError::InvalidField {
        field,
        reason: format!("expected {expected}, got {kind}"),
    }
}

fn check_shape(
    operation: OperationKind,
    before: Option<&Row>,
    after: Option<&Row>,
) -> Result<(), DecodeError> {
    let reason = match (operation, before.is_some(), after.is_some()) {
        (OperationKind::Create, _, false) => "is missing row_after",
        (OperationKind::Create, true, true) => "must not carry row_before",
        (OperationKind::Update, false, _) => "is missing row_before",
        (OperationKind::Update, true, false) => "is missing row_after",
        (OperationKind::Delete, false, _) => "is missing row_before",
        (OperationKind::Delete, true, true) => "must not carry row_after",
        _ => return Ok(()),
    };
    Err(DecodeError::ShapeMismatch { operation, reason })
}
