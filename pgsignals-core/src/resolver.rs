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

//! Table name to sender resolution.
//!
//! The dispatcher addresses every event to a *sender*: the logical entity
//! (model, aggregate, resource type) the embedding application associates
//! with the captured table. Resolution is owned by the application and
//! plugged in through [`SenderResolver`].
//!
//! [`MemoryResolver`] is a map-backed implementation for applications whose
//! table-to-entity mapping is known up front, and for tests.
//!
//! ```rust
//! use pgsignals_core::resolver::{MemoryResolver, Sender, SenderResolver};
//!
//! let resolver = MemoryResolver::new();
//! resolver.register("auth_user", "User");
//!
//! assert_eq!(resolver.resolve("auth_user"), Some(Sender::new("User")));
//! assert_eq!(resolver.resolve("unknown"), None);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Logical entity an event is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sender(Arc<str>);

impl Sender {
    /// Creates a sender from its name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Returns the sender name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves a table name to the sender its events are addressed to.
///
/// Returning `None` is not an error: the event is still dispatched, with no
/// sender.
pub trait SenderResolver: Send + Sync {
    /// Looks up the sender for `table`.
    fn resolve(&self, table: &str) -> Option<Sender>;
}

impl<R: SenderResolver + ?Sized> SenderResolver for Arc<R> {
    fn resolve(&self, table: &str) -> Option<Sender> {
        (**self).resolve(table)
    }
}

/// Resolver that never finds a sender.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResolver;

impl SenderResolver for NoResolver {
    fn resolve(&self, _table: &str) -> Option<Sender> {
        None
    }
}

/// Thread-safe, map-backed resolver.
#[derive(Debug, Clone, Default)]
pub struct MemoryResolver {
    senders: Arc<RwLock<HashMap<String, Sender>>>,
}

impl MemoryResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `table` to the sender named `sender`, replacing any previous mapping.
    pub fn register(&self, table: impl Into<String>, sender: impl AsRef<str>) {
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.into(), Sender::new(sender));
    }

    /// Removes the mapping for `table`. Returns the previous sender, if any.
    pub fn unregister(&self, table: &str) -> Option<Sender> {
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(table)
    }

    /// Number of mapped tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if no table is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> FromIterator<(K, V)> for MemoryResolver
where
    K: Into<String>,
    V: AsRef<str>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let resolver = Self::new();
        for (table, sender) in iter {
            resolver.register(table, sender);
        }
        resolver
    }
}

impl SenderResolver for MemoryResolver {
    fn resolve(&self, table: &str) -> Option<Sender> {
        self.senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
    }
}
