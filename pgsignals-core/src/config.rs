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

//! Configuration for capture setup and listening.
//!
//! [`SignalsConfig`] names the database-side objects (staging log, capture
//! routine, triggers, channel) and the default database/schema. [`ListenConfig`]
//! bounds a listener run.
//!
//! ```rust
//! use pgsignals_core::config::{ListenConfig, SignalsConfig};
//! use std::time::Duration;
//!
//! let config = SignalsConfig::builder()
//!     .prefix("audit")
//!     .default_schema("app")
//!     .build()
//!     .unwrap();
//! assert_eq!(config.channel_name(), "audit__events");
//! assert_eq!(config.trigger_name("users"), "audit__users");
//!
//! let listen = ListenConfig::builder()
//!     .poll_timeout(Duration::from_secs(1))
//!     .events_limit(100)
//!     .build()
//!     .unwrap();
//! assert_eq!(listen.events_limit, Some(100));
//! ```

use std::time::Duration;
use thiserror::Error;

/// Default object-name prefix.
pub const DEFAULT_PREFIX: &str = "pgsignals";

/// Default database label.
pub const DEFAULT_DATABASE: &str = "default";

/// Default schema.
pub const DEFAULT_SCHEMA: &str = "public";

/// Default bounded wait for a channel signal.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest prefix accepted. PostgreSQL truncates identifiers at 63 bytes and
/// trigger names are `<prefix>__<table>`.
pub const MAX_PREFIX_LEN: usize = 40;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Prefix is empty, too long, or has characters outside `[A-Za-z0-9_]`
    #[error("Invalid prefix {prefix:?}: {reason}")]
    InvalidPrefix {
        /// Rejected prefix
        prefix: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Schema name is empty
    #[error("Default schema must not be empty")]
    EmptySchema,

    /// Database label is empty
    #[error("Default database must not be empty")]
    EmptyDatabase,

    /// Poll timeout is zero
    #[error("poll_timeout must be greater than zero")]
    InvalidPollTimeout,

    /// Events limit is zero
    #[error("events_limit must be greater than zero when set")]
    InvalidEventsLimit,
}

/// Naming and defaults shared by the capture schema manager and the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalsConfig {
    /// Prefix for the staging log, capture routine, triggers and channel
    pub prefix: String,

    /// Label of the database used when none is given
    pub default_database: String,

    /// Schema used when none is given
    pub default_schema: String,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            default_database: DEFAULT_DATABASE.to_string(),
            default_schema: DEFAULT_SCHEMA.to_string(),
        }
    }
}

impl SignalsConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> SignalsConfigBuilder {
        SignalsConfigBuilder::default()
    }

    /// Reads `PGSIGNALS_PREFIX`, `PGSIGNALS_DEFAULT_DATABASE` and
    /// `PGSIGNALS_DEFAULT_SCHEMA`, using defaults for unset variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable holds an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        if let Ok(prefix) = std::env::var("PGSIGNALS_PREFIX") {
            builder = builder.prefix(prefix);
        }
        if let Ok(database) = std::env::var("PGSIGNALS_DEFAULT_DATABASE") {
            builder = builder.default_database(database);
        }
        if let Ok(schema) = std::env::var("PGSIGNALS_DEFAULT_SCHEMA") {
            builder = builder.default_schema(schema);
        }
        builder.build()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_prefix(&self.prefix)?;
        if self.default_database.is_empty() {
            return Err(ConfigError::EmptyDatabase);
        }
        if self.default_schema.is_empty() {
            return Err(ConfigError::EmptySchema);
        }
        Ok(())
    }

    /// Notification channel name, `<prefix>__events`.
    #[must_use]
    pub fn channel_name(&self) -> String {
        format!("{}__events", self.prefix)
    }

    /// Staging log table name, `<prefix>__events` (unqualified).
    #[must_use]
    pub fn staging_table(&self) -> String {
        format!("{}__events", self.prefix)
    }

    /// Capture routine name, `<prefix>__emit_event` (unqualified).
    #[must_use]
    pub fn capture_function(&self) -> String {
        format!("{}__emit_event", self.prefix)
    }

    /// Trigger name for a table, `<prefix>__<table>`.
    #[must_use]
    pub fn trigger_name(&self, table: &str) -> String {
        format!("{}__{}", self.prefix, table)
    }
}

fn validate_prefix(prefix: &str) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidPrefix {
        prefix: prefix.to_string(),
        reason,
    };

    let Some(first) = prefix.chars().next() else {
        return Err(invalid("prefix must not be empty"));
    };
    if prefix.len() > MAX_PREFIX_LEN {
        return Err(invalid("prefix is longer than 40 bytes"));
    }
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(invalid("prefix must start with a letter or underscore"));
    }
    if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid("prefix may only contain ASCII letters, digits and underscores"));
    }
    Ok(())
}

/// Builder for [`SignalsConfig`].
#[derive(Debug, Default)]
pub struct SignalsConfigBuilder {
    prefix: Option<String>,
    default_database: Option<String>,
    default_schema: Option<String>,
}

impl SignalsConfigBuilder {
    /// Sets the object-name prefix.
    ///
    /// Default: `pgsignals`
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Sets the default database label.
    ///
    /// Default: `default`
    #[must_use]
    pub fn default_database(mut self, database: impl Into<String>) -> Self {
        self.default_database = Some(database.into());
        self
    }

    /// Sets the default schema.
    ///
    /// Default: `public`
    #[must_use]
    pub fn default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = Some(schema.into());
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if validation fails.
    pub fn build(self) -> Result<SignalsConfig, ConfigError> {
        let config = SignalsConfig {
            prefix: self.prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            default_database: self
                .default_database
                .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            default_schema: self
                .default_schema
                .unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Limits for one listener run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenConfig {
    /// Longest single wait for a channel signal
    pub poll_timeout: Duration,

    /// Stop once this much time has passed since the listener started
    pub listen_timeout: Option<Duration>,

    /// Stop once this many events have been dispatched
    pub events_limit: Option<u64>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            listen_timeout: None,
            events_limit: None,
        }
    }
}

impl ListenConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> ListenConfigBuilder {
        ListenConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a zero poll timeout or a zero events limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::InvalidPollTimeout);
        }
        if self.events_limit == Some(0) {
            return Err(ConfigError::InvalidEventsLimit);
        }
        Ok(())
    }
}

/// Builder for [`ListenConfig`].
#[derive(Debug, Default)]
pub struct ListenConfigBuilder {
    poll_timeout: Option<Duration>,
    listen_timeout: Option<Duration>,
    events_limit: Option<u64>,
}

impl ListenConfigBuilder {
    /// Sets the bounded wait per poll.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    /// Stops the listener after this much time.
    #[must_use]
    pub fn listen_timeout(mut self, timeout: Duration) -> Self {
        self.listen_timeout = Some(timeout);
        self
    }

    /// Stops the listener after this many dispatched events.
    #[must_use]
    pub fn events_limit(mut self, limit: u64) -> Self {
        self.events_limit = Some(limit);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if validation fails.
    pub fn build(self) -> Result<ListenConfig, ConfigError> {
        let config = ListenConfig {
            poll_timeout: self.poll_timeout.unwrap_or(DEFAULT_POLL_TIMEOUT),
            listen_timeout: self.listen_timeout,
            events_limit: self.events_limit,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SignalsConfig::default();
        assert_eq!(config.prefix, "pgsignals");
        assert_eq!(config.default_database, "default");
        assert_eq!(config.default_schema, "public");
        assert_eq!(config.channel_name(), "pgsignals__events");
        assert_eq!(config.capture_function(), "pgsignals__emit_event");
        assert!(config.validate().is_ok());

        let listen = ListenConfig::default();
        assert_eq!(listen.poll_timeout, Duration::from_secs(5));
        assert_eq!(listen.listen_timeout, None);
        assert_eq!(listen.events_limit, None);
    }

    #[test]
    fn test_prefix_validation() {
        for bad in ["", "9lives", "has-dash", "quote\"d", "dollar$"] {
            let result = SignalsConfig::builder().prefix(bad).build();
            assert!(
                matches!(result, Err(ConfigError::InvalidPrefix { .. })),
                "prefix {bad:?} should be rejected"
            );
        }

        let long = "p".repeat(MAX_PREFIX_LEN + 1);
        assert!(SignalsConfig::builder().prefix(long).build().is_err());

        assert!(SignalsConfig::builder().prefix("_audit_2").build().is_ok());
    }

    #[test]
    fn test_empty_schema_rejected() {
        let result = SignalsConfig::builder().default_schema("").build();
        assert_eq!(result, Err(ConfigError::EmptySchema));
    }

    #[test]
    fn test_listen_config_validation() {
        let result = ListenConfig::builder().poll_timeout(Duration::ZERO).build();
        assert_eq!(result, Err(ConfigError::InvalidPollTimeout));

        let result = ListenConfig::builder().events_limit(0).build();
        assert_eq!(result, Err(ConfigError::InvalidEventsLimit));

        let config = ListenConfig::builder()
            .poll_timeout(Duration::from_millis(250))
            .listen_timeout(Duration::from_secs(60))
            .build()
            .unwrap();
        assert_eq!(config.poll_timeout, Duration::from_millis(250));
        assert_eq!(config.listen_timeout, Some(Duration::from_secs(60)));
    }
}
