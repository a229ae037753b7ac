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

//! Metrics instrumentation for capture and dispatch.
//!
//! Built on the `metrics` crate, so any exporter (Prometheus, StatsD, ...)
//! installed by the embedding application receives these values. Without an
//! installed recorder every call is a no-op.
//!
//! # Naming Conventions
//!
//! - Prefix `pgsignals_`
//! - Counters end with `_total`, durations with `_seconds`
//!
//! # Labels
//!
//! - **table**: captured table name (bounded by the number of bindings)
//! - **operation**: `create`, `update` or `delete`
//! - **reason**: decode error category (fixed set)
//! - **group**: handler group name (fixed set)
//! - **action**: `bind` or `unbind`
//!
//! ```rust
//! use pgsignals_core::metrics;
//!
//! metrics::init_metrics();
//! metrics::increment_events_dispatched("users", "create");
//! metrics::increment_decode_failures("unknown_operation");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric name prefix for all pgsignals metrics.
#[doc(hidden)]
pub const METRIC_PREFIX: &str = "pgsignals";

/// Events handed to the dispatcher.
///
/// Type: Counter
/// Labels: table, operation
#[doc(hidden)]
pub const EVENTS_DISPATCHED_TOTAL: &str = "pgsignals_events_dispatched_total";

/// Change records skipped because they could not be decoded.
///
/// Type: Counter
/// Labels: reason
#[doc(hidden)]
pub const DECODE_FAILURES_TOTAL: &str = "pgsignals_decode_failures_total";

/// Events dispatched without a resolved sender.
///
/// Type: Counter
/// Labels: table
const UNRESOLVED_SENDERS_TOTAL: &str = "pgsignals_unresolved_senders_total";

/// Handler invocations that returned an error.
///
/// Type: Counter
/// Labels: group
const HANDLER_FAILURES_TOTAL: &str = "pgsignals_handler_failures_total";

/// Listener wake-ups that drained the change feed. Idle poll timeouts are not counted.
///
/// Type: Counter
const LISTENER_WAKEUPS_TOTAL: &str = "pgsignals_listener_wakeups_total";

/// Time spent dispatching one event to all matching groups.
///
/// Type: Histogram
/// Unit: seconds
#[doc(hidden)]
pub const DISPATCH_DURATION_SECONDS: &str = "pgsignals_dispatch_duration_seconds";

/// Current listener status (0=stopped, 1=listening, 2=error).
///
/// Type: Gauge
const LISTENER_STATUS: &str = "pgsignals_listener_status";

/// Trigger bind/unbind operations.
///
/// Type: Counter
/// Labels: action
const BINDINGS_CHANGED_TOTAL: &str = "pgsignals_bindings_changed_total";

/// Registers metric descriptions with the installed recorder.
///
/// Call once at startup, after installing an exporter.
pub fn init_metrics() {
    describe_counter!(
        EVENTS_DISPATCHED_TOTAL,
        "Total number of captured change events dispatched to handlers"
    );
    describe_counter!(
        DECODE_FAILURES_TOTAL,
        "Total number of change records skipped because they could not be decoded"
    );
    describe_counter!(
        UNRESOLVED_SENDERS_TOTAL,
        "Total number of events dispatched without a resolved sender"
    );
    describe_counter!(
        HANDLER_FAILURES_TOTAL,
        "Total number of handler invocations that returned an error"
    );
    describe_counter!(
        LISTENER_WAKEUPS_TOTAL,
        "Total number of listener wake-ups that drained the change feed (idle poll timeouts excluded)"
    );
    describe_counter!(
        BINDINGS_CHANGED_TOTAL,
        "Total number of trigger bind and unbind operations"
    );
    describe_histogram!(
        DISPATCH_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time taken to dispatch one event to every matching handler group"
    );
    describe_gauge!(
        LISTENER_STATUS,
        "Current listener status: 0=stopped, 1=listening, 2=error"
    );
}

/// Increments the dispatched events counter.
pub fn increment_events_dispatched(table: &str, operation: &str) {
    counter!(EVENTS_DISPATCHED_TOTAL, "table" => table.to_string(), "operation" => operation.to_string())
        .increment(1);
}

/// Increments the decode failure counter. `reason` should be a
/// [`DecodeError::category`](crate::decode::DecodeError::category) value.
pub fn increment_decode_failures(reason: &'static str) {
    counter!(DECODE_FAILURES_TOTAL, "reason" => reason).increment(1);
}

/// Increments the unresolved sender counter.
pub fn increment_unresolved_senders(table: &str) {
    counter!(UNRESOLVED_SENDERS_TOTAL, "table" => table.to_string()).increment(1);
}

/// Increments the handler failure counter.
pub fn increment_handler_failures(group: &'static str) {
    counter!(HANDLER_FAILURES_TOTAL, "group" => group).increment(1);
}

/// Increments the listener wake-up counter.
pub fn increment_listener_wakeups() {
    counter!(LISTENER_WAKEUPS_TOTAL).increment(1);
}

/// Increments the binding change counter.
pub fn increment_bindings_changed(action: &'static str) {
    counter!(BINDINGS_CHANGED_TOTAL, "action" => action).increment(1);
}

/// Records how long one dispatch took.
pub fn record_dispatch_duration(duration: Duration) {
    histogram!(DISPATCH_DURATION_SECONDS).record(duration.as_secs_f64());
}

/// Sets the listener status gauge.
pub fn set_listener_status(status: ListenerStatus) {
    gauge!(LISTENER_STATUS).set(f64::from(status as u8));
}

/// Listener status for the `listener_status` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerStatus {
    /// Listener is stopped.
    Stopped = 0,
    /// Listener is waiting for or dispatching events.
    Listening = 1,
    /// Listener ended with an error.
    Error = 2,
}
