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

//! Tests for capture setup against a recording DDL executor.

use async_trait::async_trait;
use pgsignals_core::capture::{CaptureSchema, DdlExecutor, InstallRegistry, SetupError};
use pgsignals_core::config::SignalsConfig;
use pgsignals_core::event::OperationKind;
use std::sync::{Arc, Mutex};

/// Records every statement; optionally fails statements containing a marker.
#[derive(Debug, Default)]
struct RecordingExecutor {
    statements: Mutex<Vec<String>>,
    fail_on: Option<&'static str>,
}

impl RecordingExecutor {
    fn failing_on(marker: &'static str) -> Self {
        Self {
            statements: Mutex::default(),
            fail_on: Some(marker),
        }
    }

    fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.statements()
            .iter()
            .filter(|sql| sql.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl DdlExecutor for RecordingExecutor {
    async fn execute_ddl(&self, sql: &str) -> Result<(), sqlx::Error> {
        if self.fail_on.is_some_and(|marker| sql.contains(marker)) {
            return Err(sqlx::Error::PoolTimedOut);
        }
        self.statements.lock().unwrap().push(sql.to_string());
        Ok(())
    }
}

fn schema_with(executor: Arc<RecordingExecutor>) -> CaptureSchema<Arc<RecordingExecutor>> {
    CaptureSchema::new("default", executor, SignalsConfig::default())
        .with_registry(Arc::new(InstallRegistry::new()))
}

#[tokio::test]
async fn test_bind_installs_once_and_rebinds() {
    let executor = Arc::new(RecordingExecutor::default());
    let capture = schema_with(Arc::clone(&executor));

    capture
        .bind("users", &[OperationKind::Create], "public")
        .await
        .unwrap();
    capture
        .bind("users", &[OperationKind::Update, OperationKind::Delete], "public")
        .await
        .unwrap();

    assert_eq!(executor.count("CREATE TABLE IF NOT EXISTS"), 1);
    assert_eq!(executor.count("CREATE OR REPLACE FUNCTION"), 1);
    assert_eq!(executor.count("DROP TRIGGER IF EXISTS"), 2);
    assert_eq!(executor.count("CREATE TRIGGER"), 2);

    let last = executor.statements().pop().unwrap();
    assert!(last.contains(r#"CREATE TRIGGER "pgsignals__users" AFTER UPDATE OR DELETE ON "public"."users""#));
    assert!(last.ends_with(r#"EXECUTE PROCEDURE "public"."pgsignals__emit_event"()"#));
}

#[tokio::test]
async fn test_bind_drops_before_create() {
    let executor = Arc::new(RecordingExecutor::default());
    let capture = schema_with(Arc::clone(&executor));

    capture.bind_all("orders", "public").await.unwrap();

    let statements = executor.statements();
    assert!(statements[0].starts_with("DROP TRIGGER IF EXISTS"));
    assert!(statements
        .last()
        .unwrap()
        .contains("AFTER INSERT OR UPDATE OR DELETE"));
}

#[tokio::test]
async fn test_bind_empty_operations_unbinds() {
    let executor = Arc::new(RecordingExecutor::default());
    let capture = schema_with(Arc::clone(&executor));

    capture.bind("users", &[], "public").await.unwrap();

    let statements = executor.statements();
    assert_eq!(statements.len(), 1);
    assert!(statements[0].starts_with("DROP TRIGGER IF EXISTS"));
}

#[tokio::test]
async fn test_duplicate_operations_collapse() {
    let executor = Arc::new(RecordingExecutor::default());
    let capture = schema_with(Arc::clone(&executor));

    capture
        .bind(
            "users",
            &[OperationKind::Delete, OperationKind::Delete],
            "public",
        )
        .await
        .unwrap();

    let last = executor.statements().pop().unwrap();
    assert!(last.contains("AFTER DELETE ON"));
}

#[tokio::test]
async fn test_unbind_never_bound_table() {
    let executor = Arc::new(RecordingExecutor::default());
    let capture = schema_with(Arc::clone(&executor));

    capture.unbind("ghosts", "public").await.unwrap();

    assert_eq!(
        executor.statements(),
        vec![r#"DROP TRIGGER IF EXISTS "pgsignals__ghosts" ON "public"."ghosts""#.to_string()]
    );
}

#[tokio::test]
async fn test_install_per_schema() {
    let executor = Arc::new(RecordingExecutor::default());
    let capture = schema_with(Arc::clone(&executor));

    capture.bind_all("users", "public").await.unwrap();
    capture.bind_all("users", "audit").await.unwrap();
    assert!(!capture.ensure_capture_routine("audit").await.unwrap());

    assert_eq!(executor.count("CREATE OR REPLACE FUNCTION"), 2);
}

#[tokio::test]
async fn test_shared_registry_skips_install() {
    let registry = Arc::new(InstallRegistry::new());
    let first = Arc::new(RecordingExecutor::default());
    let second = Arc::new(RecordingExecutor::default());

    CaptureSchema::new("default", Arc::clone(&first), SignalsConfig::default())
        .with_registry(Arc::clone(&registry))
        .bind_all("users", "public")
        .await
        .unwrap();
    CaptureSchema::new("default", Arc::clone(&second), SignalsConfig::default())
        .with_registry(Arc::clone(&registry))
        .bind_all("orders", "public")
        .await
        .unwrap();

    assert_eq!(first.count("CREATE OR REPLACE FUNCTION"), 1);
    assert_eq!(second.count("CREATE OR REPLACE FUNCTION"), 0);
    assert!(registry.is_installed("default", "public"));
    assert!(!registry.is_installed("replica", "public"));
}

#[tokio::test]
async fn test_install_always_issues_ddl() {
    let executor = Arc::new(RecordingExecutor::default());
    let capture = schema_with(Arc::clone(&executor));

    capture.install_capture_routine("public").await.unwrap();
    capture.install_capture_routine("public").await.unwrap();

    assert_eq!(executor.count("CREATE OR REPLACE FUNCTION"), 2);
}

#[tokio::test]
async fn test_ddl_failure_is_setup_error() {
    let executor = Arc::new(RecordingExecutor::failing_on("CREATE TRIGGER"));
    let registry = Arc::new(InstallRegistry::new());
    let capture = CaptureSchema::new("default", Arc::clone(&executor), SignalsConfig::default())
        .with_registry(Arc::clone(&registry));

    let err = capture.bind_all("users", "public").await.unwrap_err();

    match &err {
        SetupError::Ddl { action, target, .. } => {
            assert_eq!(*action, "create trigger");
            assert_eq!(target, r#""public"."users""#);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.category(), "ddl");
    // The routine itself was installed before the failure.
    assert!(registry.is_installed("default", "public"));
}

#[tokio::test]
async fn test_failed_install_is_not_cached() {
    let executor = Arc::new(RecordingExecutor::failing_on("CREATE OR REPLACE FUNCTION"));
    let registry = Arc::new(InstallRegistry::new());
    let capture = CaptureSchema::new("default", Arc::clone(&executor), SignalsConfig::default())
        .with_registry(Arc::clone(&registry));

    assert!(capture.bind_all("users", "public").await.is_err());
    assert!(!registry.is_installed("default", "public"));
}

#[tokio::test]
async fn test_overlong_trigger_name_rejected() {
    let executor = Arc::new(RecordingExecutor::default());
    let capture = schema_with(Arc::clone(&executor));
    let table = "t".repeat(60);

    let err = capture.unbind(&table, "public").await.unwrap_err();

    assert!(matches!(err, SetupError::InvalidIdentifier { .. }));
    assert!(executor.statements().is_empty());
}

#[tokio::test]
async fn test_invalid_prefix_rejected_before_ddl() {
    let executor = Arc::new(RecordingExecutor::default());
    let config = SignalsConfig {
        prefix: "x', ''); DROP TABLE users; --".to_string(),
        ..SignalsConfig::default()
    };
    let capture = CaptureSchema::new("default", Arc::clone(&executor), config)
        .with_registry(Arc::new(InstallRegistry::new()));

    let err = capture.install_capture_routine("public").await.unwrap_err();
    assert!(matches!(err, SetupError::Configuration(_)));
    assert_eq!(err.category(), "configuration");

    assert!(matches!(
        capture.bind_all("users", "public").await,
        Err(SetupError::Configuration(_))
    ));
    assert!(matches!(
        capture.unbind("users", "public").await,
        Err(SetupError::Configuration(_))
    ));
    assert!(executor.statements().is_empty());
}

#[tokio::test]
async fn test_install_creates_staging_index() {
    let executor = Arc::new(RecordingExecutor::default());
    let capture = schema_with(Arc::clone(&executor));

    capture.install_capture_routine("public").await.unwrap();

    let statements = executor.statements();
    assert_eq!(statements.len(), 3);
    assert!(statements[1].starts_with("CREATE INDEX IF NOT EXISTS"));
    assert!(statements[2].contains("PERFORM pg_notify('pgsignals__events', '');"));
}
