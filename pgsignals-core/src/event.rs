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

//! Captured row change events.
//!
//! An [`Event`] is the typed form of one change record written by the capture
//! routine into the staging log. Events are immutable once decoded and flow
//! from the listener into the dispatcher.
//!
//! # Examples
//!
//! ```rust
//! use pgsignals_core::event::{Event, OperationKind};
//! use serde_json::json;
//!
//! let after = json!({ "id": 1, "name": "Alice" });
//! let event = Event {
//!     txid: 4242,
//!     operation: OperationKind::Create,
//!     table: "users".to_string(),
//!     row_before: None,
//!     row_after: after.as_object().cloned(),
//! };
//!
//! assert!(event.operation.is_create());
//! assert!(event.operation.is_save());
//! assert_eq!(event.row().and_then(|r| r.get("name")), Some(&json!("Alice")));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// A row image: column name to JSON value, as produced by `row_to_json`.
pub type Row = Map<String, Value>;

/// Kind of row mutation that fired the capture trigger.
///
/// Serialized with the trigger operation names PostgreSQL reports in `TG_OP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// A row was inserted.
    #[serde(rename = "INSERT")]
    Create,

    /// A row was updated in place.
    #[serde(rename = "UPDATE")]
    Update,

    /// A row was deleted.
    #[serde(rename = "DELETE")]
    Delete,
}

impl OperationKind {
    /// Every operation kind, in trigger declaration order.
    pub const ALL: [OperationKind; 3] = [Self::Create, Self::Update, Self::Delete];

    /// Returns true for inserts.
    #[inline]
    #[must_use]
    pub const fn is_create(self) -> bool {
        matches!(self, Self::Create)
    }

    /// Returns true for updates.
    #[inline]
    #[must_use]
    pub const fn is_update(self) -> bool {
        matches!(self, Self::Update)
    }

    /// Returns true for inserts and updates.
    #[inline]
    #[must_use]
    pub const fn is_save(self) -> bool {
        self.is_create() || self.is_update()
    }

    /// Returns true for deletes.
    #[inline]
    #[must_use]
    pub const fn is_delete(self) -> bool {
        matches!(self, Self::Delete)
    }

    /// The SQL keyword used in trigger definitions and in `TG_OP`.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Create => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Lowercase label used for metrics and log fields.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Error returned when a string is not one of `INSERT`, `UPDATE` or `DELETE`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown operation: {0:?}")]
pub struct UnknownOperation(pub String);

impl FromStr for OperationKind {
    type Err = UnknownOperation;

    /// Matching is case-sensitive: `insert` is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(UnknownOperation(other.to_string())),
        }
    }
}

/// A decoded change record.
///
/// `row_before` is present for updates and deletes, `row_after` for inserts
/// and updates. The decoder enforces this shape, so handlers can rely on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Transaction id (`txid_current()`) of the writing transaction.
    ///
    /// Monotonic within one database instance, not unique across databases.
    pub txid: i64,

    /// Mutation kind
    pub operation: OperationKind,

    /// Name of the table the trigger fired on
    pub table: String,

    /// Row image before the change
    #[serde(default)]
    pub row_before: Option<Row>,

    /// Row image after the change
    #[serde(default)]
    pub row_after: Option<Row>,
}

impl Event {
    /// Returns the most recent row image: `row_after` if present, else `row_before`.
    ///
    /// For deletes this is the removed row.
    #[must_use]
    pub fn row(&self) -> Option<&Row> {
        self.row_after.as_ref().or(self.row_before.as_ref())
    }

    /// Returns a column value from the most recent row image.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.row()?.get(column)
    }

    /// Returns the names of columns whose value differs between the two images.
    ///
    /// Empty for inserts and deletes. Columns present in only one image count
    /// as changed. Names are returned in `row_after` order followed by any
    /// columns only found in `row_before`.
    #[must_use]
    pub fn changed_columns(&self) -> Vec<&str> {
        let (Some(before), Some(after)) = (&self.row_before, &self.row_after) else {
            return Vec::new();
        };

        let mut changed: Vec<&str> = after
            .iter()
            .filter(|(column, value)| before.get(*column) != Some(*value))
            .map(|(column, _)| column.as_str())
            .collect();

        changed.extend(
            before
                .keys()
                .filter(|column| !after.contains_key(*column))
                .map(String::as_str),
        );

        changed
    }
}
