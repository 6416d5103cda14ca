// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! End-to-end scenarios for the partitioned hash join build side.

use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{Int32Array, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use tempfile::TempDir;

use gritstone::common::ids::SlotId;
use gritstone::exec::chunk::{Chunk, field_with_slot_id};
use gritstone::exec::operators::hashjoin::join_hash_table::JoinHashTable;
use gritstone::exec::operators::hashjoin::key_context::{JoinKeyContext, hash_filter_column};
use gritstone::exec::operators::hashjoin::{
    EqJoinConjunct, JoinType, PARTITION_FANOUT, PartitionId, PartitionedJoinBuilder,
};
use gritstone::exec::spill::SpillCodec;
use gritstone::exec::spill::dir_manager::DirManager;
use gritstone::runtime::buffer_pool::BufferPoolClient;
use gritstone::runtime::filter_bank::{
    PublishedFilter, RuntimeFilterBank, RuntimeFilterDesc, RuntimeFilterKind,
};
use gritstone::runtime::runtime_state::{QueryOptions, RuntimeFilterMode, RuntimeState};

const PAGE: i64 = 4096;
const KEY_SLOT: SlotId = SlotId::new(1);
const VAL_SLOT: SlotId = SlotId::new(2);

fn build_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        field_with_slot_id(Field::new("k", DataType::Int32, true), KEY_SLOT),
        field_with_slot_id(Field::new("v", DataType::Int64, false), VAL_SLOT),
    ]))
}

fn chunk_with_keys(keys: &[Option<i32>]) -> Chunk {
    let values: Vec<i64> = (0..keys.len() as i64).collect();
    let batch = RecordBatch::try_new(
        build_schema(),
        vec![
            Arc::new(Int32Array::from(keys.to_vec())),
            Arc::new(Int64Array::from(values)),
        ],
    )
    .unwrap();
    Chunk::new(batch)
}

fn test_state(tmp: &TempDir, bank: Option<Arc<RuntimeFilterBank>>) -> RuntimeState {
    let dirs = Arc::new(DirManager::new(vec![PathBuf::from(tmp.path())]).unwrap());
    let state = RuntimeState::new(QueryOptions {
        spillable_buffer_size: PAGE,
        spill_codec: SpillCodec::None,
        ..QueryOptions::default()
    })
    .with_spill_dirs(dirs);
    match bank {
        Some(bank) => state.with_filter_bank(bank),
        None => state,
    }
}

fn opened_builder(
    join_type: JoinType,
    state: &RuntimeState,
    client: &Arc<BufferPoolClient>,
    filter_descs: &[RuntimeFilterDesc],
    filters_produced: &[i32],
) -> PartitionedJoinBuilder {
    let mut builder = PartitionedJoinBuilder::new(
        1,
        join_type,
        build_schema(),
        Arc::clone(client),
        PAGE,
        1 << 20,
    );
    let conjuncts = [EqJoinConjunct {
        build_key: KEY_SLOT,
        is_not_distinct_from: false,
    }];
    builder
        .init_exprs_and_filters(state, &conjuncts, filter_descs, filters_produced)
        .unwrap();
    builder.prepare(state, state.mem_tracker()).unwrap();
    builder.open(state).unwrap();
    builder
}

/// Per-partition sub-chunks exactly as the builder routes them, computed with
/// the public key context.
fn expected_routing(state: &RuntimeState, chunk: &Chunk) -> (Vec<Chunk>, Vec<u32>) {
    let ctx = JoinKeyContext::new(
        vec![KEY_SLOT],
        vec![false],
        false,
        state.fragment_hash_seed(),
    )
    .unwrap();
    let hashed = ctx.hash_chunk(chunk).unwrap();
    let mut fanout_rows: Vec<Vec<u32>> = vec![Vec::new(); PARTITION_FANOUT];
    let mut null_rows = Vec::new();
    for row in 0..chunk.len() {
        if hashed.forbidden_null[row] {
            null_rows.push(row as u32);
        } else {
            fanout_rows[JoinKeyContext::partition_index(hashed.hashes[row])].push(row as u32);
        }
    }
    let subs = fanout_rows
        .iter()
        .map(|rows| chunk.take(rows).unwrap())
        .collect();
    (subs, null_rows)
}

fn partition_states(
    builder: &PartitionedJoinBuilder,
) -> (Vec<PartitionId>, Vec<PartitionId>, Vec<PartitionId>) {
    let mut closed = Vec::new();
    let mut in_memory = Vec::new();
    let mut spilled = Vec::new();
    for pid in builder.hash_partitions().to_vec() {
        let partition = builder.partition(pid);
        if partition.is_closed() {
            closed.push(pid);
        } else if partition.is_spilled() {
            assert!(partition.hash_tbl().is_none());
            assert_eq!(partition.build_rows().bytes_pinned(), 0);
            spilled.push(pid);
        } else {
            assert!(partition.hash_tbl().is_some());
            assert!(partition.build_rows().is_pinned());
            in_memory.push(pid);
        }
    }
    (closed, in_memory, spilled)
}

#[test]
fn fits_in_memory_build() {
    let tmp = TempDir::new().unwrap();
    let bank = Arc::new(RuntimeFilterBank::new(RuntimeFilterMode::Global, 0.75));
    let state = test_state(&tmp, Some(Arc::clone(&bank)));
    let client = Arc::new(BufferPoolClient::new("join", 64 << 20));
    let filter = RuntimeFilterDesc {
        filter_id: 1,
        kind: RuntimeFilterKind::Bloom,
        src_key_idx: 0,
        filter_size_bytes: 1 << 20,
        is_broadcast_join: false,
        applied_on_partition_columns: true,
    };
    let mut builder = opened_builder(JoinType::Inner, &state, &client, &[filter], &[1]);

    let keys: Vec<Option<i32>> = (0..1000).map(|i| Some(i % 37)).collect();
    let chunk = chunk_with_keys(&keys);
    builder.send(&state, &chunk).unwrap();
    builder.flush_final(&state).unwrap();

    let hash_partitions = builder.begin_initial_probe(&client);
    assert_eq!(hash_partitions.level, 0);
    assert_eq!(hash_partitions.partitions.len(), PARTITION_FANOUT);
    assert!(hash_partitions.non_empty_build);

    // Every partition is in memory with a hash table; nothing spilled; every
    // row landed in the partition its key hash selects.
    let (closed, in_memory, spilled) = partition_states(&builder);
    assert!(spilled.is_empty());
    let (expected_subs, expected_nulls) = expected_routing(&state, &chunk);
    assert!(expected_nulls.is_empty());
    let mut total_rows = 0usize;
    for (idx, pid) in hash_partitions.partitions.iter().enumerate() {
        let expected_rows = expected_subs[idx].len();
        assert_eq!(builder.partition(*pid).num_rows(), expected_rows);
        total_rows += expected_rows;
        if expected_rows == 0 {
            assert!(closed.contains(pid));
        } else {
            assert!(in_memory.contains(pid));
        }
    }
    assert_eq!(total_rows, 1000);

    // One bloom filter published, and not as the always-true sentinel.
    assert_eq!(bank.num_published(), 1);
    let Some(PublishedFilter::Bloom(bloom)) = bank.published(1) else {
        panic!("expected a published bloom filter");
    };
    let key_array = chunk.column_by_slot_id(KEY_SLOT).unwrap();
    for hash in hash_filter_column(&key_array).unwrap() {
        assert!(bloom.might_contain_hash(hash));
    }

    builder.close(&state);
    assert_eq!(client.used(), 0);
}

#[test]
fn single_spill_under_memory_pressure() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp, None);

    // Compute the exact reservation the build would need to keep everything
    // in memory, then grant slightly less.
    let keys: Vec<Option<i32>> = (0..1000).map(|i| Some(i % 37)).collect();
    let chunk = chunk_with_keys(&keys);
    let (subs, _) = expected_routing(&state, &chunk);
    let mut full: i64 = 0;
    for sub in &subs {
        if sub.is_empty() {
            continue;
        }
        full += PAGE; // write buffer
        full += sub.estimated_bytes() as i64;
        full += JoinHashTable::estimate_size(sub.len());
    }
    let reservation = full - 2048;
    let client = Arc::new(BufferPoolClient::new("join", reservation));
    let mut builder = opened_builder(JoinType::Inner, &state, &client, &[], &[]);

    builder.send(&state, &chunk).unwrap();
    builder.flush_final(&state).unwrap();

    let (_closed, in_memory, spilled) = partition_states(&builder);
    assert!(
        (1..=3).contains(&spilled.len()),
        "expected 1..=3 spilled partitions, got {}",
        spilled.len()
    );
    assert!(!in_memory.is_empty());

    // The probe side gets one write buffer per spilled partition.
    assert_eq!(
        builder.probe_stream_reservation().get_reservation(),
        PAGE * spilled.len() as i64
    );

    builder.close(&state);
    assert_eq!(client.used(), 0);
}

#[test]
fn null_aware_rows_use_the_side_partition() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp, None);
    let client = Arc::new(BufferPoolClient::new("join", 64 << 20));
    let mut builder = opened_builder(JoinType::NullAwareLeftAnti, &state, &client, &[], &[]);

    let keys: Vec<Option<i32>> = (0..100)
        .map(|i| if i % 10 == 0 { None } else { Some(i) })
        .collect();
    let chunk = chunk_with_keys(&keys);
    builder.send(&state, &chunk).unwrap();

    let null_pid = builder.null_aware_partition().unwrap();
    assert_eq!(builder.partition(null_pid).num_rows(), 10);
    let fanout_rows: usize = builder
        .hash_partitions()
        .iter()
        .map(|pid| builder.partition(*pid).num_rows())
        .sum();
    assert_eq!(fanout_rows, 90);

    builder.flush_final(&state).unwrap();
    builder.close(&state);
}

#[test]
fn null_aware_partition_spills_first_under_pressure() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp, None);

    // Grant enough for the write buffers but not for all of the appended
    // pages, so an append mid-`send` has to pick a spill victim.
    let keys: Vec<Option<i32>> = (0..400)
        .map(|i| if i % 10 == 0 { None } else { Some(i) })
        .collect();
    let chunk = chunk_with_keys(&keys);
    let (subs, null_rows) = expected_routing(&state, &chunk);
    let mut reservation: i64 = 17 * PAGE; // 16 fanout + 1 null-aware write buffer
    reservation += chunk.take(&null_rows).unwrap().estimated_bytes() as i64;
    for sub in &subs {
        reservation += sub.estimated_bytes() as i64;
    }
    let client = Arc::new(BufferPoolClient::new("join", reservation - 1024));
    let mut builder = opened_builder(JoinType::NullAwareLeftAnti, &state, &client, &[], &[]);

    builder.send(&state, &chunk).unwrap();
    builder.flush_final(&state).unwrap();

    let null_pid = builder.null_aware_partition().unwrap();
    assert!(
        builder.partition(null_pid).is_spilled(),
        "the null-aware partition is the preferred spill victim"
    );
    assert_eq!(builder.partition(null_pid).num_rows(), 40);
    assert!(
        builder
            .profile()
            .counter("SpilledPartitions")
            .unwrap()
            .value()
            >= 1
    );
    builder.close(&state);
}

#[test]
fn right_outer_emits_partitions_for_unmatched_rows() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp, None);
    let client = Arc::new(BufferPoolClient::new("join", 64 << 20));
    let mut builder = opened_builder(JoinType::RightOuter, &state, &client, &[], &[]);

    let keys: Vec<Option<i32>> = (0..500).map(|i| Some(i % 13)).collect();
    builder.send(&state, &chunk_with_keys(&keys)).unwrap();
    builder.flush_final(&state).unwrap();

    let hash_partitions = builder.begin_initial_probe(&client);
    let non_empty: Vec<PartitionId> = hash_partitions
        .partitions
        .iter()
        .copied()
        .filter(|pid| !builder.partition(*pid).is_closed())
        .collect();

    // Probe side saw no rows; every non-empty partition must be handed back
    // for unmatched-build-row output rather than closed.
    let mut output = Vec::new();
    builder.done_probing_hash_partitions(&[false; PARTITION_FANOUT], &mut output);
    assert_eq!(output, non_empty);
    for pid in &output {
        assert!(!builder.partition(*pid).is_closed());
        assert!(builder.partition(*pid).num_rows() > 0);
    }
    builder.close(&state);
}

#[test]
fn inner_join_closes_partitions_after_probing() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp, None);
    let client = Arc::new(BufferPoolClient::new("join", 64 << 20));
    let mut builder = opened_builder(JoinType::Inner, &state, &client, &[], &[]);

    let keys: Vec<Option<i32>> = (0..500).map(|i| Some(i % 13)).collect();
    builder.send(&state, &chunk_with_keys(&keys)).unwrap();
    builder.flush_final(&state).unwrap();
    let hash_partitions = builder.begin_initial_probe(&client);

    let mut output = Vec::new();
    builder.done_probing_hash_partitions(&[false; PARTITION_FANOUT], &mut output);
    assert!(output.is_empty());
    for pid in hash_partitions.partitions {
        assert!(builder.partition(pid).is_closed());
    }
    builder.close(&state);
    assert_eq!(client.used(), 0);
}

#[test]
fn runtime_filter_suppressed_when_fp_rate_too_high() {
    let tmp = TempDir::new().unwrap();
    let bank = Arc::new(RuntimeFilterBank::new(RuntimeFilterMode::Global, 0.75));
    let state = test_state(&tmp, Some(Arc::clone(&bank)));
    let client = Arc::new(BufferPoolClient::new("join", 64 << 20));
    // A 64-byte filter drowns under 100k build rows.
    let filter = RuntimeFilterDesc {
        filter_id: 9,
        kind: RuntimeFilterKind::Bloom,
        src_key_idx: 0,
        filter_size_bytes: 64,
        is_broadcast_join: false,
        applied_on_partition_columns: true,
    };
    let mut builder = opened_builder(JoinType::Inner, &state, &client, &[filter], &[9]);

    for batch in 0..100 {
        let keys: Vec<Option<i32>> = (0..1000).map(|i| Some(batch * 1000 + i)).collect();
        builder.send(&state, &chunk_with_keys(&keys)).unwrap();
    }
    builder.flush_final(&state).unwrap();

    assert!(matches!(
        bank.published(9),
        Some(PublishedFilter::AlwaysTrue)
    ));
    assert_eq!(
        builder
            .profile()
            .get_info_string("Runtime filters")
            .as_deref(),
        Some("0 of 1 Runtime Filters Published, 1 Disabled")
    );
    builder.close(&state);
}

#[test]
fn filters_not_produced_by_this_instance_are_skipped() {
    let tmp = TempDir::new().unwrap();
    let bank = Arc::new(RuntimeFilterBank::new(RuntimeFilterMode::Global, 0.75));
    let state = test_state(&tmp, Some(Arc::clone(&bank)));
    let client = Arc::new(BufferPoolClient::new("join", 64 << 20));
    let filter = RuntimeFilterDesc {
        filter_id: 3,
        kind: RuntimeFilterKind::Bloom,
        src_key_idx: 0,
        filter_size_bytes: 1 << 20,
        is_broadcast_join: true,
        applied_on_partition_columns: true,
    };
    // Another instance was selected as the producer of filter 3.
    let mut builder = opened_builder(JoinType::Inner, &state, &client, &[filter], &[]);

    let keys: Vec<Option<i32>> = (0..100).map(Some).collect();
    builder.send(&state, &chunk_with_keys(&keys)).unwrap();
    builder.flush_final(&state).unwrap();

    assert_eq!(bank.num_published(), 0);
    builder.close(&state);
}

#[test]
fn min_max_filter_is_published_with_bounds() {
    let tmp = TempDir::new().unwrap();
    let bank = Arc::new(RuntimeFilterBank::new(RuntimeFilterMode::Global, 0.75));
    let state = test_state(&tmp, Some(Arc::clone(&bank)));
    let client = Arc::new(BufferPoolClient::new("join", 64 << 20));
    let filter = RuntimeFilterDesc {
        filter_id: 5,
        kind: RuntimeFilterKind::MinMax,
        src_key_idx: 0,
        filter_size_bytes: 0,
        is_broadcast_join: false,
        applied_on_partition_columns: true,
    };
    let mut builder = opened_builder(JoinType::Inner, &state, &client, &[filter], &[5]);

    let keys: Vec<Option<i32>> = vec![Some(17), Some(-4), None, Some(99)];
    builder.send(&state, &chunk_with_keys(&keys)).unwrap();
    builder.flush_final(&state).unwrap();

    let Some(PublishedFilter::MinMax(min_max)) = bank.published(5) else {
        panic!("expected a published min-max filter");
    };
    assert_eq!(min_max.int_bounds(), Some((-4, 99)));
    builder.close(&state);
}
