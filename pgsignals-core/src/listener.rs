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

//! Notification listener.
//!
//! A [`Listener`] owns one [`ChangeFeed`] and runs a single cooperative loop:
//!
//! ```text
//! INIT -> LISTENING -> { POLLING <-> DISPATCHING } -> STOPPED
//! ```
//!
//! Each poll waits for a channel signal for at most `poll_timeout` (clipped to
//! the remaining `listen_timeout`). On wake-up every pending signal is drained
//! in one go, the referenced change records are decoded and dispatched in drain
//! order. Records that fail to decode are logged and skipped.
//!
//! The loop stops when
//! - `listen_timeout` has elapsed (checked on every wake-up and before each
//!   record, so a large batch cannot overrun it by more than one dispatch),
//! - `events_limit` events have been dispatched (checked after each dispatch),
//! - a [`ShutdownHandle`] fires (observed at the wait only), or
//! - the connection is lost or a handler fails, which returns an error.
//!
//! There are no retries and no replay. Records that were drained but not yet
//! dispatched when the loop stops are not delivered.
//!
//! # Ordering
//!
//! Events from one listener are dispatched in drain order. Staged records are
//! read in `(txid, id)` order, which is transaction start order and not
//! necessarily commit order. A record is only read once every transaction
//! with a lower txid has finished, so a transaction that commits late is
//! delivered late rather than skipped. The price is latency: while any
//! older transaction in the cluster stays open, newer records wait for it.

use crate::config::{ConfigError, ListenConfig, SignalsConfig};
use crate::capture::qualified;
use crate::decode::{decode, decode_value, DecodeError};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::event::Event;
use crate::metrics::{self, ListenerStatus};
use crate::resolver::SenderResolver;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgListener, PgNotification, PgPool};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Errors that end a listener run.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Could not connect, subscribe or talk to the database
    #[error("Listener connection error: {0}")]
    Connection(#[source] sqlx::Error),

    /// The notification connection dropped
    #[error("Listener connection lost")]
    ConnectionLost,

    /// Reading change records from the staging log failed
    #[error("Failed to read staging log: {0}")]
    StagingRead(#[source] sqlx::Error),

    /// A handler failed while dispatching
    #[error(transparent)]
    Handler(#[from] DispatchError),

    /// Invalid listener configuration
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl ListenerError {
    /// Returns the error category for metrics/logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::ConnectionLost => "connection_lost",
            Self::StagingRead(_) => "staging_read",
            Self::Handler(_) => "handler",
            Self::Configuration(_) => "configuration",
        }
    }
}

/// A change record as received, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    /// Record carried in the notification payload itself
    Inline(String),

    /// Record read from the staging log
    Staged {
        /// Staging-log row id
        id: i64,
        /// `payload` column
        payload: Value,
    },
}

impl RawRecord {
    /// Decodes the record.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the record is invalid.
    pub fn decode(self) -> Result<Event, DecodeError> {
        match self {
            Self::Inline(raw) => decode(&raw),
            Self::Staged { payload, .. } => decode_value(payload),
        }
    }
}

/// Source of change records for a [`Listener`].
///
/// Implemented by [`PgChangeFeed`]; tests substitute an in-memory feed.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Waits up to `timeout` for at least one signal.
    ///
    /// Returns `false` if the timeout elapsed without a signal.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError`] if the connection failed or was lost.
    async fn wait(&mut self, timeout: Duration) -> Result<bool, ListenerError>;

    /// Drains every pending signal and returns the records they point at, in
    /// drain order. Never blocks waiting for new signals.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError`] if the records could not be read.
    async fn drain(&mut self) -> Result<Vec<RawRecord>, ListenerError>;

    /// Releases the underlying connection.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError`] if unsubscribing failed.
    async fn close(&mut self) -> Result<(), ListenerError>;
}

/// How often a feed with held-back records re-reads the staging log when no
/// signal arrives.
const HELD_BACK_RECHECK: Duration = Duration::from_millis(250);

/// Read position in the staging log, ordered by `(txid, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StagingCursor {
    /// Transaction of the last record read
    pub txid: i64,
    /// Staging-log id of the last record read
    pub id: i64,
}

impl StagingCursor {
    /// Cursor positioned after every transaction older than `horizon`.
    #[must_use]
    pub const fn before_horizon(horizon: i64) -> Self {
        Self {
            txid: horizon - 1,
            id: i64::MAX,
        }
    }
}

/// One staging-log row, as read past the cursor.
#[derive(Debug, Clone, PartialEq)]
struct StagedRow {
    id: i64,
    txid: i64,
    payload: Value,
}

/// Splits rows sorted by `(txid, id)` at `horizon`, the oldest transaction
/// that may still be running. Rows below it are final and returned; the rest
/// may still have older, uncommitted neighbours and are held back.
///
/// Returns the rows to deliver, the advanced cursor and whether any row was
/// held back.
fn settle(
    cursor: StagingCursor,
    rows: Vec<StagedRow>,
    horizon: i64,
) -> (Vec<StagedRow>, StagingCursor, bool) {
    let total = rows.len();
    let ready: Vec<StagedRow> = rows.into_iter().take_while(|row| row.txid < horizon).collect();
    let held_back = ready.len() < total;
    let cursor = ready.last().map_or(cursor, |row| StagingCursor {
        txid: row.txid,
        id: row.id,
    });
    (ready, cursor, held_back)
}

/// [`ChangeFeed`] over a PostgreSQL `LISTEN` connection.
///
/// Signals on `<prefix>__events` carry an empty payload; the records are read
/// from `<schema>.<prefix>__events` past a [`StagingCursor`]. Only records of
/// transactions older than the current snapshot's `xmin` are read, so no
/// record can appear behind the cursor later. Records that are visible but
/// not yet below `xmin` are re-read every 250 ms until they are. A signal
/// with a non-empty payload is taken as an inline record.
///
/// The cursor starts just below the oldest transaction running at connect
/// time, so records of transactions still open then are delivered.
pub struct PgChangeFeed {
    listener: PgListener,
    channel: String,
    staging_table: String,
    cursor: StagingCursor,
    held_back: bool,
    pending: Vec<PgNotification>,
}

impl std::fmt::Debug for PgChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgChangeFeed")
            .field("channel", &self.channel)
            .field("staging_table", &self.staging_table)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl PgChangeFeed {
    /// Opens a dedicated connection to `database_url` and subscribes.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Connection`] if connecting or `LISTEN` fails.
    pub async fn connect(
        database_url: &str,
        config: &SignalsConfig,
        schema: &str,
    ) -> Result<Self, ListenerError> {
        let listener = PgListener::connect(database_url)
            .await
            .map_err(ListenerError::Connection)?;
        Self::subscribe(listener, config, schema).await
    }

    /// Takes a dedicated connection from `pool` and subscribes.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Connection`] if connecting or `LISTEN` fails.
    pub async fn connect_with(
        pool: &PgPool,
        config: &SignalsConfig,
        schema: &str,
    ) -> Result<Self, ListenerError> {
        let listener = PgListener::connect_with(pool)
            .await
            .map_err(ListenerError::Connection)?;
        Self::subscribe(listener, config, schema).await
    }

    async fn subscribe(
        mut listener: PgListener,
        config: &SignalsConfig,
        schema: &str,
    ) -> Result<Self, ListenerError> {
        config.validate()?;
        let channel = config.channel_name();
        let staging_table = qualified(schema, &config.staging_table());

        listener
            .listen(&channel)
            .await
            .map_err(ListenerError::Connection)?;

        let horizon: i64 =
            sqlx::query_scalar("SELECT txid_snapshot_xmin(txid_current_snapshot())")
                .fetch_one(&mut listener)
                .await
                .map_err(ListenerError::StagingRead)?;
        let cursor = StagingCursor::before_horizon(horizon);

        info!(
            channel = %channel,
            staging_table = %staging_table,
            horizon,
            "Subscribed to change channel"
        );

        Ok(Self {
            listener,
            channel,
            staging_table,
            cursor,
            held_back: false,
            pending: Vec::new(),
        })
    }

    /// Position of the last staged record read.
    #[must_use]
    pub fn cursor(&self) -> StagingCursor {
        self.cursor
    }

    async fn read_staged(&mut self) -> Result<Vec<RawRecord>, ListenerError> {
        // One statement, one snapshot: the horizon matches the rows' visibility.
        let rows: Vec<(i64, i64, Value, i64)> = sqlx::query_as(&format!(
            "SELECT id, txid, payload, txid_snapshot_xmin(txid_current_snapshot()) \
             FROM {} WHERE (txid, id) > ($1, $2) ORDER BY txid, id",
            self.staging_table
        ))
        .bind(self.cursor.txid)
        .bind(self.cursor.id)
        .fetch_all(&mut self.listener)
        .await
        .map_err(ListenerError::StagingRead)?;

        let Some(horizon) = rows.first().map(|row| row.3) else {
            self.held_back = false;
            return Ok(Vec::new());
        };
        let rows = rows
            .into_iter()
            .map(|(id, txid, payload, _)| StagedRow { id, txid, payload })
            .collect();

        let (ready, cursor, held_back) = settle(self.cursor, rows, horizon);
        if held_back {
            debug!(horizon, ready = ready.len(), "Holding back records of open transactions");
        }
        self.cursor = cursor;
        self.held_back = held_back;

        Ok(ready
            .into_iter()
            .map(|row| RawRecord::Staged {
                id: row.id,
                payload: row.payload,
            })
            .collect())
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn wait(&mut self, timeout: Duration) -> Result<bool, ListenerError> {
        let timeout = if self.held_back {
            timeout.min(HELD_BACK_RECHECK)
        } else {
            timeout
        };
        match tokio::time::timeout(timeout, self.listener.try_recv()).await {
            // Held-back records need a re-read even without a new signal.
            Err(_) => Ok(self.held_back),
            Ok(Ok(Some(notification))) => {
                self.pending.push(notification);
                Ok(true)
            }
            Ok(Ok(None)) => Err(ListenerError::ConnectionLost),
            Ok(Err(e)) => Err(ListenerError::Connection(e)),
        }
    }

    async fn drain(&mut self) -> Result<Vec<RawRecord>, ListenerError> {
        let mut signals = std::mem::take(&mut self.pending);
        while let Some(notification) = self.listener.next_buffered() {
            signals.push(notification);
        }

        let recheck = self.held_back;
        let mut records = Vec::with_capacity(signals.len());
        let mut staged_read = false;
        for signal in signals {
            if !signal.payload().is_empty() {
                records.push(RawRecord::Inline(signal.payload().to_string()));
            } else if !staged_read {
                // One read covers every empty signal drained in this batch.
                records.extend(self.read_staged().await?);
                staged_read = true;
            }
        }
        if recheck && !staged_read {
            records.extend(self.read_staged().await?);
        }
        Ok(records)
    }

    async fn close(&mut self) -> Result<(), ListenerError> {
        self.listener
            .unlisten_all()
            .await
            .map_err(ListenerError::Connection)
    }
}

/// Why a listener run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `listen_timeout` elapsed
    ListenTimeout,
    /// `events_limit` events were dispatched
    EventsLimit,
    /// A [`ShutdownHandle`] fired
    Cancelled,
}

/// Outcome of a listener run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSummary {
    /// Events dispatched to handlers
    pub events_dispatched: u64,
    /// Records skipped because they failed to decode
    pub decode_failures: u64,
    /// Wake-ups that drained the feed
    pub wakeups: u64,
    /// Why the run ended
    pub stop_reason: StopReason,
}

/// Requests a cooperative stop of a running [`Listener`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Asks the listener to stop at its next wait.
    pub fn shutdown(&self) {
        // No receiver left means the listener already finished.
        let _ = self.tx.send(());
    }
}

/// Drives a [`ChangeFeed`] into a [`Dispatcher`].
pub struct Listener<F, R> {
    feed: F,
    dispatcher: Arc<Dispatcher<R>>,
    config: ListenConfig,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<F, R> std::fmt::Debug for Listener<F, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<F: ChangeFeed, R: SenderResolver> Listener<F, R> {
    /// Creates a listener.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Configuration`] if `config` is invalid.
    pub fn new(
        feed: F,
        dispatcher: Arc<Dispatcher<R>>,
        config: ListenConfig,
    ) -> Result<Self, ListenerError> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Ok(Self {
            feed,
            dispatcher,
            config,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Returns a handle that stops this listener.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Runs until a stop condition is met.
    ///
    /// The feed is closed on every exit path.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError`] on connection loss, staging-log read failure
    /// or handler failure.
    #[instrument(skip(self), fields(
        poll_timeout = ?self.config.poll_timeout,
        listen_timeout = ?self.config.listen_timeout,
        events_limit = ?self.config.events_limit
    ))]
    pub async fn run(mut self) -> Result<ListenSummary, ListenerError> {
        info!("Listener started");
        metrics::set_listener_status(ListenerStatus::Listening);

        let mut counts = Counts::default();
        let outcome = self.poll_loop(&mut counts).await;

        if let Err(e) = self.feed.close().await {
            warn!(error = %e, "Failed to close change feed");
        }

        match outcome {
            Ok(stop_reason) => {
                metrics::set_listener_status(ListenerStatus::Stopped);
                info!(
                    ?stop_reason,
                    events_dispatched = counts.events_dispatched,
                    decode_failures = counts.decode_failures,
                    wakeups = counts.wakeups,
                    "Listener stopped"
                );
                Ok(ListenSummary {
                    events_dispatched: counts.events_dispatched,
                    decode_failures: counts.decode_failures,
                    wakeups: counts.wakeups,
                    stop_reason,
                })
            }
            Err(e) => {
                metrics::set_listener_status(ListenerStatus::Error);
                error!(error = %e, category = e.category(), "Listener failed");
                Err(e)
            }
        }
    }

    async fn poll_loop(&mut self, counts: &mut Counts) -> Result<StopReason, ListenerError> {
        let deadline = self.config.listen_timeout.map(|limit| Instant::now() + limit);
        let expired = |deadline: Option<Instant>| deadline.is_some_and(|d| Instant::now() >= d);

        loop {
            let wait_for = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(StopReason::ListenTimeout);
                    }
                    self.config.poll_timeout.min(deadline - now)
                }
                None => self.config.poll_timeout,
            };

            let signalled = tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    return Ok(StopReason::Cancelled);
                }
                result = self.feed.wait(wait_for) => result?,
            };
            if !signalled {
                continue;
            }

            counts.wakeups += 1;
            metrics::increment_listener_wakeups();

            let records = self.feed.drain().await?;
            debug!(records = records.len(), "Drained change records");

            for record in records {
                // Slow handlers must not carry the run past its deadline.
                if expired(deadline) {
                    return Ok(StopReason::ListenTimeout);
                }

                let event = match record.decode() {
                    Ok(event) => event,
                    Err(e) => {
                        counts.decode_failures += 1;
                        metrics::increment_decode_failures(e.category());
                        warn!(error = %e, "Skipping undecodable change record");
                        continue;
                    }
                };

                self.dispatcher.dispatch(&event).await?;
                counts.events_dispatched += 1;

                if self
                    .config
                    .events_limit
                    .is_some_and(|limit| counts.events_dispatched >= limit)
                {
                    return Ok(StopReason::EventsLimit);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Counts {
    events_dispatched: u64,
    decode_failures: u64,
    wakeups: u64,
}

/// Connects a [`PgChangeFeed`] and runs a [`Listener`] on it until it stops.
///
/// # Errors
///
/// Returns [`ListenerError`] if connecting fails or the run ends with an error.
pub async fn listen<R: SenderResolver>(
    database_url: &str,
    config: &SignalsConfig,
    schema: &str,
    dispatcher: Arc<Dispatcher<R>>,
    listen_config: ListenConfig,
) -> Result<ListenSummary, ListenerError> {
    let feed = PgChangeFeed::connect(database_url, config, schema).await?;
    Listener::new(feed, dispatcher, listen_config)?.run().await
}
