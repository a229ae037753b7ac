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

//! Pgsignals Core - PostgreSQL Change Capture and Dispatch
//!
//! Row-level changes are captured inside PostgreSQL by a trigger-driven
//! capture routine, signalled over a notification channel, and republished
//! in-process as typed [`event::Event`]s to registered handlers.
//!
//! # Key Components
//!
//! - **Capture setup**: [`capture`] installs the staging log and capture routine and manages per-table triggers
//! - **Events**: [`event`] and [`decode`] define and validate change records
//! - **Listening**: [`listener`] drains the notification channel
//! - **Dispatch**: [`dispatch`] routes events to handler groups, with senders from [`resolver`]
//!
//! # Example
//!
//! ```rust,no_run
//! use pgsignals_core::capture::CaptureSchema;
//! use pgsignals_core::config::{ListenConfig, SignalsConfig};
//! use pgsignals_core::dispatch::{handler_fn, Dispatcher, SignalGroup};
//! use pgsignals_core::event::OperationKind;
//! use pgsignals_core::listener::listen;
//! use pgsignals_core::resolver::MemoryResolver;
//! use sqlx::PgPool;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let url = "postgres://localhost/app";
//! let config = SignalsConfig::default();
//!
//! let pool = PgPool::connect(url).await?;
//! let capture = CaptureSchema::new("default", pool, config.clone());
//! capture.bind("users", &[OperationKind::Create, OperationKind::Update], "public").await?;
//!
//! let resolver: MemoryResolver = [("users", "User")].into_iter().collect();
//! let mut dispatcher = Dispatcher::new(resolver);
//! dispatcher.connect(
//!     SignalGroup::Any,
//!     handler_fn(|sender, event| {
//!         println!("{:?}: {} on {}", sender, event.operation, event.table);
//!         Ok(())
//!     }),
//! );
//!
//! let summary = listen(
//!     url,
//!     &config,
//!     "public",
//!     Arc::new(dispatcher),
//!     ListenConfig::builder().events_limit(10).build()?,
//! )
//! .await?;
//! println!("{} events", summary.events_dispatched);
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod decode;
pub mod dispatch;
pub mod event;
pub mod listener;
pub mod metrics;
pub mod resolver;
