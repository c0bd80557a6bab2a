// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Benchmarks for the persistent queue.
//!
//! Measures:
//! - Single record append latency (async and sync flush)
//! - Append throughput at different record sizes
//! - Tailer read throughput
//! - Random access through `seek`

use std::{hint::black_box, sync::Arc, time::Duration};

use chronoq_queue::{
    Appender, FlushMode, Queue, QueueBuilder, QueueError, RollCycle, SetTimeProvider,
    TimeProvider,
};
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tempfile::TempDir;

/// Record sizes to benchmark (bytes)
const MESSAGE_SIZES: &[usize] = &[64, 256, 1024, 4096, 16384];

/// Number of records for throughput tests
const BATCH_SIZE: usize = 10_000;

const BLOCK_SIZE: u64 = 256 * 1024 * 1024;

const DAY: Duration = Duration::from_secs(86_400);

fn create_queue(temp_dir: &TempDir, flush_mode: FlushMode) -> (Queue, Arc<SetTimeProvider>) {
    let clock = Arc::new(SetTimeProvider::now());
    let queue = QueueBuilder::new(temp_dir.path())
        .roll_cycle(RollCycle::Daily)
        .block_size(BLOCK_SIZE)
        .flush_mode(flush_mode)
        .time_provider(Arc::clone(&clock) as Arc<dyn TimeProvider>)
        .build()
        .expect("Failed to create queue");
    (queue, clock)
}

/// Appends `msg`, moving the virtual clock to the next day whenever the
/// current cycle file is full.
fn append(appender: &mut Appender, clock: &SetTimeProvider, msg: &[u8]) -> u64 {
    loop {
        match appender.write_bytes(msg) {
            Ok(index) => return index,
            Err(QueueError::StoreFull { .. }) => clock.advance(DAY),
            Err(e) => panic!("append failed: {e}"),
        }
    }
}

fn generate_message(size: usize) -> Vec<u8> { vec![0x2Au8; size] }

// =============================================================================
// Single Record Append Latency
// =============================================================================

fn bench_append_latency_async(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_latency_async");

    for &size in MESSAGE_SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let (queue, clock) = create_queue(&temp_dir, FlushMode::Async);
            let mut appender = queue.acquire_appender().unwrap();
            let msg = generate_message(size);

            b.iter(|| append(&mut appender, &clock, black_box(&msg)));
        });
    }

    group.finish();
}

fn bench_append_latency_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_latency_sync");
    // every record flushes the whole mapping
    group.sample_size(10);

    for &size in &[64, 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let (queue, clock) = create_queue(&temp_dir, FlushMode::Sync);
            let mut appender = queue.acquire_appender().unwrap();
            let msg = generate_message(size);

            b.iter(|| append(&mut appender, &clock, black_box(&msg)));
        });
    }

    group.finish();
}

// =============================================================================
// Append Throughput
// =============================================================================

fn bench_throughput_async(c: &mut Criterion) {
    let mut group = c.benchmark_group("throughput_async");
    group.sample_size(20);

    for &size in MESSAGE_SIZES {
        group.throughput(Throughput::Bytes((size * BATCH_SIZE) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let msg = generate_message(size);
            b.iter_batched(
                || {
                    let temp_dir = TempDir::new().unwrap();
                    let (queue, clock) = create_queue(&temp_dir, FlushMode::Async);
                    (temp_dir, queue, clock)
                },
                |(temp_dir, queue, clock)| {
                    let mut appender = queue.acquire_appender().unwrap();
                    for _ in 0..BATCH_SIZE {
                        append(&mut appender, &clock, &msg);
                    }
                    drop(appender);
                    drop(queue);
                    drop(temp_dir);
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

// =============================================================================
// Read Throughput
// =============================================================================

fn filled_queue(size: usize) -> (TempDir, Queue, Vec<u64>) {
    let temp_dir = TempDir::new().unwrap();
    let (queue, clock) = create_queue(&temp_dir, FlushMode::Async);
    let msg = generate_message(size);
    let indices = {
        let mut appender = queue.acquire_appender().unwrap();
        (0..BATCH_SIZE)
            .map(|_| append(&mut appender, &clock, &msg))
            .collect()
    };
    (temp_dir, queue, indices)
}

fn bench_tailer_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("tailer_read");
    group.sample_size(20);

    for &size in &[256, 1024, 4096] {
        group.throughput(Throughput::Bytes((size * BATCH_SIZE) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (_temp_dir, queue, _) = filled_queue(size);

            b.iter(|| {
                let mut tailer = queue.create_tailer().unwrap();
                let mut count = 0;
                while let Some(msg) = tailer.read_next().unwrap() {
                    black_box(msg);
                    count += 1;
                }
                assert_eq!(count, BATCH_SIZE);
            });
        });
    }

    group.finish();
}

fn bench_seek(c: &mut Criterion) {
    let mut group = c.benchmark_group("tailer_seek");

    let (_temp_dir, queue, indices) = filled_queue(256);
    let mut tailer = queue.create_tailer().unwrap();
    let mut i = 0usize;

    group.bench_function("seek_and_read", |b| {
        b.iter(|| {
            i = (i + 7919) % indices.len();
            assert!(tailer.seek(indices[i]).unwrap());
            black_box(tailer.read_next().unwrap());
        });
    });

    group.finish();
}

// =============================================================================
// Criterion Configuration
// =============================================================================

criterion_group!(
    benches,
    bench_append_latency_async,
    bench_append_latency_sync,
    bench_throughput_async,
    bench_tailer_read,
    bench_seek,
);

criterion_main!(benches);
