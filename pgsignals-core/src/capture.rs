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

//! Database-side capture objects and per-table bindings.
//!
//! A [`CaptureSchema`] owns the DDL for one database:
//!
//! - the **staging log** `<schema>.<prefix>__events (id, txid, ts, payload)`
//! - the **capture routine** `<schema>.<prefix>__emit_event()`, a PL/pgSQL
//!   trigger function that serializes `OLD`/`NEW`, appends the change record
//!   to the staging log and calls `pg_notify('<prefix>__events', '')`
//! - one **trigger** per bound table, `<prefix>__<table>`
//!
//! Every statement is idempotent (`IF NOT EXISTS`, `OR REPLACE`,
//! `DROP ... IF EXISTS`), so a failed setup can simply be re-run.
//!
//! # Example
//!
//! ```rust,no_run
//! use pgsignals_core::capture::CaptureSchema;
//! use pgsignals_core::config::SignalsConfig;
//! use pgsignals_core::event::OperationKind;
//! use sqlx::PgPool;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = PgPool::connect("postgres://localhost/app").await?;
//! let capture = CaptureSchema::new("default", pool, SignalsConfig::default());
//!
//! // Capture inserts and deletes on public.users
//! capture
//!     .bind("users", &[OperationKind::Create, OperationKind::Delete], "public")
//!     .await?;
//!
//! // Stop capturing
//! capture.unbind("users", "public").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Install Cache
//!
//! `bind` installs the capture routine only the first time it is needed for a
//! (database, schema) pair in this process. The record of that lives in an
//! [`InstallRegistry`]; it is a cache, not a source of truth. Two concurrent
//! binds may both install, which is harmless.

use crate::config::{ConfigError, SignalsConfig};
use crate::event::OperationKind;
use crate::metrics;
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// PostgreSQL truncates longer identifiers.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Errors raised while installing capture objects or changing bindings.
///
/// Setup errors are fatal to the calling operation and are never retried.
#[derive(Debug, Error)]
pub enum SetupError {
    /// A DDL statement failed (permissions, connectivity, missing table, ...)
    #[error("Failed to {action} for {target}: {source}")]
    Ddl {
        /// What was being done
        action: &'static str,
        /// Object the statement targeted
        target: String,
        /// Underlying database error
        #[source]
        source: sqlx::Error,
    },

    /// A table, schema or derived trigger name cannot be used as an identifier
    #[error("Invalid identifier {name:?}: {reason}")]
    InvalidIdentifier {
        /// Offending name
        name: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// The naming configuration is invalid
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl SetupError {
    /// Returns the error category for metrics/logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Ddl { .. } => "ddl",
            Self::InvalidIdentifier { .. } => "invalid_identifier",
            Self::Configuration(_) => "configuration",
        }
    }
}

/// Runs DDL statements.
///
/// Implemented for [`PgPool`], where each call acquires a pooled connection,
/// runs the statement and releases the connection straight away.
#[async_trait]
pub trait DdlExecutor: Send + Sync {
    /// Executes one statement.
    ///
    /// # Errors
    ///
    /// Returns the database error unchanged.
    async fn execute_ddl(&self, sql: &str) -> Result<(), sqlx::Error>;
}

#[async_trait]
impl DdlExecutor for PgPool {
    async fn execute_ddl(&self, sql: &str) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(sql).execute(self).await?;
        Ok(())
    }
}

#[async_trait]
impl<E: DdlExecutor + ?Sized> DdlExecutor for Arc<E> {
    async fn execute_ddl(&self, sql: &str) -> Result<(), sqlx::Error> {
        (**self).execute_ddl(sql).await
    }
}

/// Process-wide record of which (database, schema) pairs already have the
/// capture routine installed.
#[derive(Debug, Default)]
pub struct InstallRegistry {
    installed: Mutex<HashSet<(String, String)>>,
}

impl InstallRegistry {
    /// Creates an empty registry, independent of the global one.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the registry shared by the whole process.
    #[must_use]
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<InstallRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(InstallRegistry::new())))
    }

    /// Returns true if the routine was installed for this pair.
    #[must_use]
    pub fn is_installed(&self, database: &str, schema: &str) -> bool {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(database.to_string(), schema.to_string()))
    }

    /// Records that the routine is installed for this pair.
    pub fn mark_installed(&self, database: &str, schema: &str) {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((database.to_string(), schema.to_string()));
    }
}

/// Manages the staging log, capture routine and triggers of one database.
#[derive(Debug)]
pub struct CaptureSchema<E> {
    database: String,
    executor: E,
    config: SignalsConfig,
    registry: Arc<InstallRegistry>,
}

impl<E: DdlExecutor> CaptureSchema<E> {
    /// Creates a manager for the database labelled `database`, using the
    /// process-wide install registry.
    pub fn new(database: impl Into<String>, executor: E, config: SignalsConfig) -> Self {
        Self {
            database: database.into(),
            executor,
            config,
            registry: InstallRegistry::global(),
        }
    }

    /// Replaces the install registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<InstallRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Database label used as the install cache key.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Naming configuration.
    #[must_use]
    pub fn config(&self) -> &SignalsConfig {
        &self.config
    }

    /// Creates the staging log if absent and (re)creates the capture routine.
    ///
    /// Always issues the DDL; use [`ensure_capture_routine`](Self::ensure_capture_routine)
    /// to skip it when this process already installed the routine.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if a statement fails.
    #[instrument(skip(self), fields(database = %self.database))]
    pub async fn install_capture_routine(&self, schema: &str) -> Result<(), SetupError> {
        self.config.validate()?;
        check_identifier(schema)?;

        let staging = qualified(schema, &self.config.staging_table());
        self.run(
            "create staging log",
            &staging,
            &create_staging_table_sql(&self.config, schema),
        )
        .await?;
        self.run(
            "create staging index",
            &staging,
            &create_staging_index_sql(&self.config, schema),
        )
        .await?;

        let function = qualified(schema, &self.config.capture_function());
        self.run(
            "create capture routine",
            &function,
            &create_capture_function_sql(&self.config, schema),
        )
        .await?;

        self.registry.mark_installed(&self.database, schema);
        info!(%function, %staging, "Installed capture routine");
        Ok(())
    }

    /// Installs the capture routine unless the registry says it already is.
    ///
    /// Returns true when DDL was issued.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if installation fails.
    pub async fn ensure_capture_routine(&self, schema: &str) -> Result<bool, SetupError> {
        if self.registry.is_installed(&self.database, schema) {
            debug!(database = %self.database, schema, "Capture routine already installed");
            return Ok(false);
        }
        self.install_capture_routine(schema).await?;
        Ok(true)
    }

    /// Binds `table` to `operations`, replacing any previous binding.
    ///
    /// The existing trigger is always dropped first. With an empty
    /// `operations` the table is left unbound. Duplicate operations are
    /// collapsed.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if a name is invalid or a statement fails.
    #[instrument(skip(self), fields(database = %self.database))]
    pub async fn bind(
        &self,
        table: &str,
        operations: &[OperationKind],
        schema: &str,
    ) -> Result<(), SetupError> {
        self.unbind(table, schema).await?;

        let operations = dedup(operations);
        if operations.is_empty() {
            return Ok(());
        }

        self.ensure_capture_routine(schema).await?;

        let trigger = self.config.trigger_name(table);
        self.run(
            "create trigger",
            &qualified(schema, table),
            &create_trigger_sql(&self.config, schema, table, &operations),
        )
        .await?;

        metrics::increment_bindings_changed("bind");
        info!(
            table,
            schema,
            %trigger,
            operations = ?operations,
            "Bound table"
        );
        Ok(())
    }

    /// Binds `table` to every operation kind.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if a name is invalid or a statement fails.
    pub async fn bind_all(&self, table: &str, schema: &str) -> Result<(), SetupError> {
        self.bind(table, &OperationKind::ALL, schema).await
    }

    /// Drops the trigger of `table` if there is one.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if a name is invalid or the statement fails.
    #[instrument(skip(self), fields(database = %self.database))]
    pub async fn unbind(&self, table: &str, schema: &str) -> Result<(), SetupError> {
        self.config.validate()?;
        check_identifier(schema)?;
        check_identifier(table)?;
        check_identifier(&self.config.trigger_name(table))?;

        self.run(
            "drop trigger",
            &qualified(schema, table),
            &drop_trigger_sql(&self.config, schema, table),
        )
        .await?;

        metrics::increment_bindings_changed("unbind");
        info!(table, schema, "Unbound table");
        Ok(())
    }

    async fn run(&self, action: &'static str, target: &str, sql: &str) -> Result<(), SetupError> {
        debug!(action, target, "Executing DDL");
        self.executor
            .execute_ddl(sql)
            .await
            .map_err(|source| SetupError::Ddl {
                action,
                target: target.to_string(),
                source,
            })
    }
}

fn dedup(operations: &[OperationKind]) -> Vec<OperationKind> {
    let mut unique = Vec::with_capacity(operations.len());
    for op in operations {
        if !unique.contains(op) {
            unique.push(*op);
        }
    }
    unique
}

fn check_identifier(name: &str) -> Result<(), SetupError> {
    let reason = if name.is_empty() {
        "identifier is empty"
    } else if name.len() > MAX_IDENTIFIER_LEN {
        "identifier is longer than 63 bytes"
    } else if name.contains('\0') {
        "identifier contains a NUL byte"
    } else {
        return Ok(());
    };
    Err(SetupError::InvalidIdentifier {
        name: name.to_string(),
        reason,
    })
}

/// Quotes an identifier, doubling embedded quotes.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a string literal, doubling embedded quotes.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(crate) fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// `CREATE TABLE IF NOT EXISTS` for the staging log.
#[must_use]
pub fn create_staging_table_sql(config: &SignalsConfig, schema: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    \
             id BIGSERIAL PRIMARY KEY,\n    \
             txid BIGINT NOT NULL DEFAULT txid_current(),\n    \
             ts TIMESTAMPTZ NOT NULL DEFAULT now(),\n    \
             payload JSONB NOT NULL\n\
         )",
        table = qualified(schema, &config.staging_table()),
    )
}

/// Index backing the listener's `(txid, id)` reads of the staging log.
#[must_use]
pub fn create_staging_index_sql(config: &SignalsConfig, schema: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {index} ON {table} (txid, id)",
        index = quote_ident(&format!("{}_txid_idx", config.staging_table())),
        table = qualified(schema, &config.staging_table()),
    )
}

/// `CREATE OR REPLACE FUNCTION` for the capture routine.
///
/// `OR REPLACE` keeps triggers that already reference the function.
#[must_use]
pub fn create_capture_function_sql(config: &SignalsConfig, schema: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION {function}()
RETURNS trigger AS $pgsignals$
DECLARE
    payload jsonb;
BEGIN
    payload := jsonb_build_object(
        'txid', txid_current(),
        'operation', TG_OP,
        'table', TG_TABLE_NAME,
        'row_before', CASE WHEN TG_OP = 'INSERT' THEN NULL ELSE row_to_json(OLD) END,
        'row_after', CASE WHEN TG_OP = 'DELETE' THEN NULL ELSE row_to_json(NEW) END);
    INSERT INTO {staging} (txid, ts, payload) VALUES (txid_current(), now(), payload);
    PERFORM pg_notify({channel}, '');
    RETURN NEW;
END;
$pgsignals$ LANGUAGE plpgsql"#,
        function = qualified(schema, &config.capture_function()),
        staging = qualified(schema, &config.staging_table()),
        channel = quote_literal(&config.channel_name()),
    )
}

/// `CREATE TRIGGER` firing after any of `operations`.
#[must_use]
pub fn create_trigger_sql(
    config: &SignalsConfig,
    schema: &str,
    table: &str,
    operations: &[OperationKind],
) -> String {
    let events = operations
        .iter()
        .map(|op| op.as_sql())
        .collect::<Vec<_>>()
        .join(" OR ");
    format!(
        "CREATE TRIGGER {trigger} AFTER {events} ON {table} FOR EACH ROW EXECUTE PROCEDURE {function}()",
        trigger = quote_ident(&config.trigger_name(table)),
        table = qualified(schema, table),
        function = qualified(schema, &config.capture_function()),
    )
}

/// `DROP TRIGGER IF EXISTS` for a table's trigger.
#[must_use]
pub fn drop_trigger_sql(config: &SignalsConfig, schema: &str, table: &str) -> String {
    format!(
        "DROP TRIGGER IF EXISTS {trigger} ON {table}",
        trigger = quote_ident(&config.trigger_name(table)),
        table = qualified(schema, table),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), r#""users""#);
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn test_trigger_sql_joins_operations() {
        let config = SignalsConfig::default();
        let sql = create_trigger_sql(
            &config,
            "public",
            "users",
            &[OperationKind::Create, OperationKind::Delete],
        );
        assert_eq!(
            sql,
            r#"CREATE TRIGGER "pgsignals__users" AFTER INSERT OR DELETE ON "public"."users" FOR EACH ROW EXECUTE PROCEDURE "public"."pgsignals__emit_event"()"#
        );
    }

    #[test]
    fn test_drop_trigger_sql() {
        let config = SignalsConfig::default();
        assert_eq!(
            drop_trigger_sql(&config, "app", "orders"),
            r#"DROP TRIGGER IF EXISTS "pgsignals__orders" ON "app"."orders""#
        );
    }

    #[test]
    fn test_capture_function_notifies_channel() {
        let config = SignalsConfig::builder().prefix("audit").build().unwrap();
        let sql = create_capture_function_sql(&config, "public");
        assert!(sql.starts_with(r#"CREATE OR REPLACE FUNCTION "public"."audit__emit_event"()"#));
        assert!(sql.contains("PERFORM pg_notify('audit__events', '');"));
        assert!(sql.contains(r#"INSERT INTO "public"."audit__events" (txid, ts, payload)"#));
        assert!(sql.contains("RETURN NEW;"));
    }

    #[test]
    fn test_staging_sql_is_idempotent() {
        let sql = create_staging_table_sql(&SignalsConfig::default(), "public");
        assert!(sql.starts_with(r#"CREATE TABLE IF NOT EXISTS "public"."pgsignals__events""#));
        assert!(sql.contains("payload JSONB NOT NULL"));
        assert!(sql.contains("txid BIGINT NOT NULL"));

        let index = create_staging_index_sql(&SignalsConfig::default(), "public");
        assert_eq!(
            index,
            r#"CREATE INDEX IF NOT EXISTS "pgsignals__events_txid_idx" ON "public"."pgsignals__events" (txid, id)"#
        );
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("audit__events"), "'audit__events'");
        assert_eq!(quote_literal("x', ''); --"), "'x'', ''''); --'");
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        assert_eq!(
            dedup(&[
                OperationKind::Update,
                OperationKind::Create,
                OperationKind::Update
            ]),
            vec![OperationKind::Update, OperationKind::Create]
        );
    }

    #[test]
    fn test_check_identifier() {
        assert!(check_identifier("users").is_ok());
        assert!(check_identifier("").is_err());
        assert!(check_identifier("a\0b").is_err());
        assert!(check_identifier(&"t".repeat(64)).is_err());
    }

    #[test]
    fn test_registry_is_keyed_by_database_and_schema() {
        let registry = InstallRegistry::new();
        registry.mark_installed("default", "public");
        assert!(registry.is_installed("default", "public"));
        assert!(!registry.is_installed("default", "app"));
        assert!(!registry.is_installed("replica", "public"));
    }
}
