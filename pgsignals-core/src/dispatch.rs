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

//! Routing decoded events to handler groups.
//!
//! Handlers are connected to one of five [`SignalGroup`]s. For every event the
//! [`Dispatcher`] resolves the sender once, then visits the groups in a fixed
//! order and invokes each handler of every group whose predicate matches:
//!
//! | Order | Group            | Fires for        |
//! |-------|------------------|------------------|
//! | 1     | `Any`            | every event      |
//! | 2     | `Insert`         | CREATE           |
//! | 3     | `InsertOrUpdate` | CREATE, UPDATE   |
//! | 4     | `Update`         | UPDATE           |
//! | 5     | `Delete`         | DELETE           |
//!
//! An UPDATE therefore reaches `Any`, `InsertOrUpdate` and `Update`, never
//! `Insert`.
//!
//! Handler errors are not swallowed. The first failing handler aborts the
//! remaining handlers for that event and the error is returned to the caller.
//!
//! # Example
//!
//! ```rust
//! use pgsignals_core::dispatch::{handler_fn, Dispatcher, SignalGroup};
//! use pgsignals_core::event::{Event, OperationKind};
//! use pgsignals_core::resolver::MemoryResolver;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver: MemoryResolver = [("users", "User")].into_iter().collect();
//! let mut dispatcher = Dispatcher::new(resolver);
//!
//! dispatcher.connect(
//!     SignalGroup::InsertOrUpdate,
//!     handler_fn(|sender, event| {
//!         println!("{:?} saved in {}", sender.map(|s| s.name()), event.table);
//!         Ok(())
//!     }),
//! );
//!
//! let event = Event {
//!     txid: 1,
//!     operation: OperationKind::Create,
//!     table: "users".to_string(),
//!     row_before: None,
//!     row_after: json!({ "id": 1 }).as_object().cloned(),
//! };
//! dispatcher.dispatch(&event).await?;
//! # Ok(())
//! # }
//! ```

use crate::event::{Event, OperationKind};
use crate::metrics;
use crate::resolver::{NoResolver, Sender, SenderResolver};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error};

/// Handler groups, each selected by a predicate over the operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalGroup {
    /// Every event
    Any,
    /// Inserts only
    Insert,
    /// Inserts and updates
    InsertOrUpdate,
    /// Updates only
    Update,
    /// Deletes only
    Delete,
}

impl SignalGroup {
    /// Groups in dispatch order.
    pub const ORDER: [SignalGroup; 5] = [
        Self::Any,
        Self::Insert,
        Self::InsertOrUpdate,
        Self::Update,
        Self::Delete,
    ];

    /// Returns true if this group receives events of kind `operation`.
    #[must_use]
    pub const fn matches(self, operation: OperationKind) -> bool {
        match self {
            Self::Any => true,
            Self::Insert => operation.is_create(),
            Self::InsertOrUpdate => operation.is_save(),
            Self::Update => operation.is_update(),
            Self::Delete => operation.is_delete(),
        }
    }

    /// Snake-case name used in logs and metric labels.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Insert => "insert",
            Self::InsertOrUpdate => "insert_or_update",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Any => 0,
            Self::Insert => 1,
            Self::InsertOrUpdate => 2,
            Self::Update => 3,
            Self::Delete => 4,
        }
    }
}

impl fmt::Display for SignalGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned by a handler.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    /// Creates an error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps any error.
    #[must_use]
    pub fn from_error(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A handler failure, tagged with where it happened.
#[derive(Debug, Error)]
#[error("{group} handler failed for table {table}: {source}")]
pub struct DispatchError {
    /// Group of the failing handler
    pub group: SignalGroup,
    /// Table of the event being dispatched
    pub table: String,
    /// Error returned by the handler
    #[source]
    pub source: HandlerError,
}

/// Receives dispatched events.
///
/// # Example
///
/// ```rust
/// use pgsignals_core::dispatch::{EventHandler, HandlerError};
/// use pgsignals_core::event::Event;
/// use pgsignals_core::resolver::Sender;
/// use async_trait::async_trait;
///
/// struct SearchIndexer;
///
/// #[async_trait]
/// impl EventHandler for SearchIndexer {
///     async fn handle(&self, _sender: Option<&Sender>, event: &Event) -> Result<(), HandlerError> {
///         if event.row().is_none() {
///             return Err(HandlerError::new("nothing to index"));
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event. `sender` is `None` when the table did not resolve.
    ///
    /// # Errors
    ///
    /// An error aborts dispatch of this event and is propagated to the listener.
    async fn handle(&self, sender: Option<&Sender>, event: &Event) -> Result<(), HandlerError>;
}

/// Adapts a synchronous closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Wraps a closure as an [`EventHandler`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(Option<&Sender>, &Event) -> Result<(), HandlerError> + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(Option<&Sender>, &Event) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, sender: Option<&Sender>, event: &Event) -> Result<(), HandlerError> {
        (self.0)(sender, event)
    }
}

/// Routes events to connected handlers in fixed group order.
pub struct Dispatcher<R = NoResolver> {
    resolver: R,
    groups: [Vec<Arc<dyn EventHandler>>; 5],
    senders: RwLock<HashMap<String, Option<Sender>>>,
}

impl<R> fmt::Debug for Dispatcher<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<_> = SignalGroup::ORDER
            .iter()
            .map(|g| (g.name(), self.groups[g.index()].len()))
            .collect();
        f.debug_struct("Dispatcher")
            .field("handlers", &counts)
            .finish_non_exhaustive()
    }
}

impl Default for Dispatcher<NoResolver> {
    fn default() -> Self {
        Self::new(NoResolver)
    }
}

impl<R: SenderResolver> Dispatcher<R> {
    /// Creates a dispatcher with no handlers.
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            groups: Default::default(),
            senders: RwLock::new(HashMap::new()),
        }
    }

    /// Connects a handler to a group. Handlers in a group run in connection order.
    pub fn connect(&mut self, group: SignalGroup, handler: impl EventHandler + 'static) -> &mut Self {
        self.connect_shared(group, Arc::new(handler))
    }

    /// Connects a shared handler to a group.
    pub fn connect_shared(&mut self, group: SignalGroup, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.groups[group.index()].push(handler);
        self
    }

    /// Number of handlers connected to `group`.
    #[must_use]
    pub fn handler_count(&self, group: SignalGroup) -> usize {
        self.groups[group.index()].len()
    }

    /// Resolves and caches the sender of `table`.
    ///
    /// Misses are cached too and logged once at error level.
    pub fn resolve_sender(&self, table: &str) -> Option<Sender> {
        if let Some(cached) = self
            .senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
        {
            return cached.clone();
        }

        let sender = self.resolver.resolve(table);
        if sender.is_none() {
            error!(table, "Cannot find sender for table");
        }

        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string(), sender.clone());
        sender
    }

    /// Forgets cached resolutions, e.g. after the application registered new entities.
    pub fn clear_sender_cache(&self) {
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Dispatches one event to every matching group.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] for the first handler that fails; handlers
    /// after it are not invoked for this event.
    pub async fn dispatch(&self, event: &Event) -> Result<(), DispatchError> {
        let started = Instant::now();
        let sender = self.resolve_sender(&event.table);
        if sender.is_none() {
            metrics::increment_unresolved_senders(&event.table);
        }

        for group in SignalGroup::ORDER {
            if !group.matches(event.operation) {
                continue;
            }
            for handler in &self.groups[group.index()] {
                if let Err(source) = handler.handle(sender.as_ref(), event).await {
                    metrics::increment_handler_failures(group.name());
                    error!(
                        table = %event.table,
                        txid = event.txid,
                        group = group.name(),
                        error = %source,
                        "Handler failed"
                    );
                    return Err(DispatchError {
                        group,
                        table: event.table.clone(),
                        source,
                    });
                }
            }
        }

        metrics::increment_events_dispatched(&event.table, event.operation.label());
        metrics::record_dispatch_duration(started.elapsed());
        debug!(
            table = %event.table,
            operation = %event.operation,
            txid = event.txid,
            sender = ?sender.as_ref().map(Sender::name),
            "Dispatched event"
        );
        Ok(())
    }
}
