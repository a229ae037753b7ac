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

//! Decode and Dispatch Benchmarks
//!
//! These benchmarks measure the in-process half of the pipeline:
//! - Decoding change records from text and from JSONB values
//! - Dispatching through all handler groups
//! - A full listener run over an in-memory feed
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench --package pgsignals-benches --bench dispatch_throughput
//! ```

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pgsignals_core::config::ListenConfig;
use pgsignals_core::decode::{decode, decode_value};
use pgsignals_core::dispatch::{Dispatcher, EventHandler, HandlerError, SignalGroup};
use pgsignals_core::event::{Event, OperationKind};
use pgsignals_core::listener::{ChangeFeed, Listener, ListenerError, RawRecord};
use pgsignals_core::resolver::{MemoryResolver, Sender};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sample records cycling through INSERT, UPDATE and DELETE
fn sample_records(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| {
            let row = json!({
                "id": i,
                "email": format!("user_{}@example.com", i % 1000),
                "balance": i as f64 * 1.5,
                "tags": ["bench", "pgsignals"],
            });
            match i % 3 {
                0 => json!({"txid": i, "operation": "INSERT", "table": "users",
                            "row_before": null, "row_after": row}),
                1 => json!({"txid": i, "operation": "UPDATE", "table": "users",
                            "row_before": row, "row_after": row}),
                _ => json!({"txid": i, "operation": "DELETE", "table": "users",
                            "row_before": row, "row_after": null}),
            }
        })
        .collect()
}

struct CountingHandler(AtomicU64);

#[async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, _sender: Option<&Sender>, event: &Event) -> Result<(), HandlerError> {
        black_box(event.row());
        self.0.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn counting_dispatcher() -> Dispatcher<MemoryResolver> {
    let resolver: MemoryResolver = [("users", "User")].into_iter().collect();
    let mut dispatcher = Dispatcher::new(resolver);
    let handler = Arc::new(CountingHandler(AtomicU64::new(0)));
    for group in SignalGroup::ORDER {
        dispatcher.connect_shared(group, handler.clone());
    }
    dispatcher
}

/// Feed that hands out one prepared batch per wake-up.
struct PreparedFeed {
    batches: Vec<Vec<RawRecord>>,
}

#[async_trait]
impl ChangeFeed for PreparedFeed {
    async fn wait(&mut self, _timeout: Duration) -> Result<bool, ListenerError> {
        Ok(!self.batches.is_empty())
    }

    async fn drain(&mut self) -> Result<Vec<RawRecord>, ListenerError> {
        Ok(self.batches.pop().unwrap_or_default())
    }

    async fn close(&mut self) -> Result<(), ListenerError> {
        Ok(())
    }
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let records = sample_records(300);
    let texts: Vec<String> = records.iter().map(Value::to_string).collect();

    group.throughput(Throughput::Elements(records.len() as u64));
    group.bench_function("text", |b| {
        b.iter(|| {
            for text in &texts {
                black_box(decode(text).unwrap());
            }
        });
    });
    group.bench_function("jsonb_value", |b| {
        b.iter(|| {
            for record in &records {
                black_box(decode_value(record.clone()).unwrap());
            }
        });
    });
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dispatcher = counting_dispatcher();

    for count in &[100usize, 1000, 10000] {
        let events: Vec<Event> = sample_records(*count)
            .into_iter()
            .map(|r| decode_value(r).unwrap())
            .collect();

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &events, |b, events| {
            b.to_async(&runtime).iter(|| async {
                for event in events {
                    dispatcher.dispatch(event).await.unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_listener_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("listener_loop");
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dispatcher = Arc::new(counting_dispatcher());

    for batch_size in &[1usize, 50, 500] {
        let total = 1000;
        let batches: Vec<Vec<RawRecord>> = sample_records(total)
            .chunks(*batch_size)
            .map(|chunk| {
                chunk
                    .iter()
                    .map(|r| RawRecord::Inline(r.to_string()))
                    .collect()
            })
            .collect();
        let config = ListenConfig::builder()
            .events_limit(total as u64)
            .build()
            .unwrap();

        group.throughput(Throughput::Elements(total as u64));
        group.bench_with_input(
            BenchmarkId::new("batch_size", batch_size),
            &batches,
            |b, batches| {
                b.to_async(&runtime).iter(|| async {
                    let feed = PreparedFeed {
                        batches: batches.clone(),
                    };
                    let summary = Listener::new(feed, Arc::clone(&dispatcher), config.clone())
                        .unwrap()
                        .run()
                        .await
                        .unwrap();
                    black_box(summary);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_decode, bench_dispatch, bench_listener_loop);
criterion_main!(benches);
