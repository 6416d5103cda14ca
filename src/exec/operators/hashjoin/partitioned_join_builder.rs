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
//! Build side of the partitioned, spill-capable hash join.
//!
//! Responsibilities:
//! - Routes build rows into a hash fanout of partitions, spilling the largest
//!   partition under memory pressure and retrying the append.
//! - Converts as many partitions as possible into in-memory hash tables while
//!   earmarking probe-side buffers, and recursively repartitions spilled
//!   partitions that still do not fit.
//! - Produces Bloom / min-max runtime filters from level-0 build rows.
//!
//! Key exported interfaces:
//! - Types: `PartitionedJoinBuilder`, `HashJoinState`, `HashPartitions`,
//!   `PartitionId`, `EqJoinConjunct`, `BeginSpilledProbeResult`.

use std::sync::Arc;

use arrow::datatypes::{DataType, SchemaRef};

use crate::common::ids::SlotId;
use crate::exec::chunk::{Chunk, field_slot_id};
use crate::exec::operators::hashjoin::key_context::{JoinKeyContext, hash_filter_column};
use crate::exec::operators::hashjoin::partition::Partition;
use crate::exec::operators::hashjoin::{
    JoinType, MAX_PARTITION_DEPTH, PARTITION_FANOUT, join_type_str,
    needs_to_process_unmatched_build_rows,
};
use crate::exec::runtime_filter::{RuntimeBloomFilter, RuntimeMinMaxFilter};
use crate::exec::spill::{BufferedChunkStream, UnpinMode};
use crate::gritstone_logging::{debug, warn};
use crate::metrics::TUnit;
use crate::runtime::buffer_pool::{BufferPoolClient, SubReservation};
use crate::runtime::filter_bank::{PublishedFilter, RuntimeFilterDesc, RuntimeFilterKind};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::RuntimeProfile;
use crate::runtime::runtime_state::{RuntimeFilterMode, RuntimeState};

/// Lifecycle of one build. `Reset` returns to `PartitioningBuild`; there is no
/// terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashJoinState {
    PartitioningBuild,
    PartitioningProbe,
    ProbingSpilledPartition,
    RepartitioningBuild,
    RepartitioningProbe,
}

/// Non-owning reference to a partition in `all_partitions`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionId(usize);

/// The active fanout handed to the probe side.
#[derive(Clone, Debug)]
pub struct HashPartitions {
    pub level: usize,
    pub partitions: Vec<PartitionId>,
    pub non_empty_build: bool,
}

/// One equality conjunct's build side. `is_not_distinct_from` selects
/// null-equals-null (`<=>`) semantics for the key.
#[derive(Clone, Debug)]
pub struct EqJoinConjunct {
    pub build_key: SlotId,
    pub is_not_distinct_from: bool,
}

#[derive(Debug)]
pub struct BeginSpilledProbeResult {
    pub repartitioned: bool,
    pub level: usize,
    pub new_partitions: Option<HashPartitions>,
}

struct FilterContext {
    desc: RuntimeFilterDesc,
    bloom: Option<RuntimeBloomFilter>,
    min_max: Option<RuntimeMinMaxFilter>,
}

pub struct PartitionedJoinBuilder {
    node_id: i32,
    label: String,
    join_type: JoinType,
    build_schema: SchemaRef,
    client: Arc<BufferPoolClient>,
    spillable_buffer_size: i64,
    max_row_buffer_size: i64,
    build_keys: Vec<SlotId>,
    null_safe_eq: Vec<bool>,
    filter_ctxs: Vec<FilterContext>,
    key_ctx: Option<JoinKeyContext>,
    state_: HashJoinState,
    all_partitions: Vec<Partition>,
    hash_partitions: Vec<PartitionId>,
    null_aware_partition: Option<PartitionId>,
    probe_stream_reservation: SubReservation,
    non_empty_build: bool,
    profile: RuntimeProfile,
    mem_tracker: Option<Arc<MemTracker>>,
    closed: bool,
}

impl PartitionedJoinBuilder {
    pub fn new(
        node_id: i32,
        join_type: JoinType,
        build_schema: SchemaRef,
        client: Arc<BufferPoolClient>,
        spillable_buffer_size: i64,
        max_row_buffer_size: i64,
    ) -> Self {
        let label = format!("Hash Join Builder (join_node_id={})", node_id);
        let profile = RuntimeProfile::new(label.clone());
        Self {
            node_id,
            label,
            join_type,
            build_schema,
            client,
            spillable_buffer_size,
            max_row_buffer_size,
            build_keys: Vec::new(),
            null_safe_eq: Vec::new(),
            filter_ctxs: Vec::new(),
            key_ctx: None,
            state_: HashJoinState::PartitioningBuild,
            all_partitions: Vec::new(),
            hash_partitions: Vec::new(),
            null_aware_partition: None,
            probe_stream_reservation: SubReservation::new("probe_stream_reservation"),
            non_empty_build: false,
            profile,
            mem_tracker: None,
            closed: false,
        }
    }

    /// Record the build-side equality keys and register the runtime filters
    /// this instance produces. Broadcast filters routed to another producer
    /// are skipped.
    pub fn init_exprs_and_filters(
        &mut self,
        state: &RuntimeState,
        eq_conjuncts: &[EqJoinConjunct],
        filter_descs: &[RuntimeFilterDesc],
        filters_produced: &[i32],
    ) -> Result<(), String> {
        for conjunct in eq_conjuncts {
            self.build_keys.push(conjunct.build_key);
            self.null_safe_eq.push(conjunct.is_not_distinct_from);
        }

        let mode = state.query_options().runtime_filter_mode;
        for desc in filter_descs {
            debug_assert!(
                mode == RuntimeFilterMode::Global || desc.is_broadcast_join,
                "partitioned-join filters require GLOBAL runtime filter mode"
            );
            debug_assert!(
                !state.query_options().disable_row_runtime_filtering
                    || desc.applied_on_partition_columns
            );
            if !filters_produced.contains(&desc.filter_id) {
                continue;
            }
            if desc.src_key_idx >= self.build_keys.len() {
                return Err(format!(
                    "runtime filter {} references build key {} but the join has {} keys",
                    desc.filter_id,
                    desc.src_key_idx,
                    self.build_keys.len()
                ));
            }
            let Some(bank) = state.filter_bank() else {
                warn!(
                    "runtime filter {} skipped: no filter bank in this fragment",
                    desc.filter_id
                );
                continue;
            };
            bank.register_filter(desc.clone());
            self.filter_ctxs.push(FilterContext {
                desc: desc.clone(),
                bloom: None,
                min_max: None,
            });
        }
        Ok(())
    }

    /// Create the key-hashing context and register profile counters.
    pub fn prepare(
        &mut self,
        state: &RuntimeState,
        parent_mem_tracker: &Arc<MemTracker>,
    ) -> Result<(), String> {
        let stores_nulls = self.hash_table_stores_nulls();
        self.key_ctx = Some(JoinKeyContext::new(
            self.build_keys.clone(),
            self.null_safe_eq.clone(),
            stores_nulls,
            state.fragment_hash_seed(),
        )?);
        self.mem_tracker = Some(MemTracker::new_child(self.label.clone(), parent_mem_tracker));

        self.profile.add_counter("PartitionsCreated", TUnit::UNIT);
        self.profile
            .add_counter("LargestPartitionPercent", TUnit::UNIT);
        self.profile.add_counter("MaxPartitionLevel", TUnit::UNIT);
        self.profile
            .add_counter("BuildRowsPartitioned", TUnit::UNIT);
        self.profile.add_counter("SpilledPartitions", TUnit::UNIT);
        self.profile.add_counter("NumRepartitions", TUnit::UNIT);
        self.profile
            .add_counter("NumHashTableBuildsSkipped", TUnit::UNIT);
        self.profile.add_counter("HashBuckets", TUnit::UNIT);
        self.profile.add_timer("BuildRowsPartitionTime");
        self.profile.add_timer("HashTablesBuildTime");
        self.profile.add_timer("RepartitionTime");
        self.profile
            .add_info_string("JoinType", join_type_str(self.join_type));
        Ok(())
    }

    /// Build the initial fanout at level 0 and allocate scratch filters.
    pub fn open(&mut self, state: &RuntimeState) -> Result<(), String> {
        debug_assert_eq!(self.state_, HashJoinState::PartitioningBuild);
        self.create_hash_partitions(state, 0)?;
        self.allocate_runtime_filters(state);
        if self.join_type == JoinType::NullAwareLeftAnti {
            let pid = self.create_and_prepare_partition(state, 0)?;
            self.null_aware_partition = Some(pid);
        }
        Ok(())
    }

    /// Route every row of `chunk` to its partition by key hash at the current
    /// level, updating runtime filters at level 0.
    pub fn send(&mut self, state: &RuntimeState, chunk: &Chunk) -> Result<(), String> {
        state.check_query_state()?;
        if chunk.is_empty() {
            return Ok(());
        }
        let _timer = self.profile.scoped_timer("BuildRowsPartitionTime");

        let ctx = self.key_ctx.as_ref().expect("builder is prepared");
        let level = ctx.level();
        let hashed = ctx.hash_chunk(chunk)?;
        if level == 0 && !self.filter_ctxs.is_empty() {
            self.insert_runtime_filters(chunk)?;
        }

        let null_aware = self.join_type == JoinType::NullAwareLeftAnti;
        let mut fanout_rows: Vec<Vec<u32>> = vec![Vec::new(); PARTITION_FANOUT];
        let mut null_rows: Vec<u32> = Vec::new();
        for row in 0..chunk.len() {
            if null_aware && hashed.forbidden_null[row] {
                null_rows.push(row as u32);
            } else {
                fanout_rows[JoinKeyContext::partition_index(hashed.hashes[row])]
                    .push(row as u32);
            }
        }

        for (idx, rows) in fanout_rows.iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            let sub = chunk.take(rows)?;
            let pid = self.hash_partitions[idx];
            self.append_with_spill_retry(state, pid, &sub)?;
        }
        if !null_rows.is_empty() {
            let pid = self
                .null_aware_partition
                .expect("null-aware partition exists for NULL_AWARE_LEFT_ANTI_JOIN");
            let sub = chunk.take(&null_rows)?;
            self.append_with_spill_retry(state, pid, &sub)?;
        }

        self.profile
            .counter_add("BuildRowsPartitioned", TUnit::UNIT, chunk.len() as i64);
        Ok(())
    }

    /// Finish the current build round: record partition stats, publish
    /// runtime filters at level 0, then run the partition planner.
    pub fn flush_final(&mut self, state: &RuntimeState) -> Result<(), String> {
        let num_build_rows: i64 = self
            .hash_partitions
            .iter()
            .map(|pid| self.all_partitions[pid.0].num_rows() as i64)
            .sum();

        if num_build_rows > 0 {
            let largest = self.largest_partition_rows();
            let percent = largest * 100 / num_build_rows;
            if let Some(counter) = self.profile.counter("LargestPartitionPercent") {
                counter.set_max(percent);
            }
        }
        self.log_partition_histogram(num_build_rows);

        let level = self.key_ctx.as_ref().expect("builder is prepared").level();
        if level == 0 {
            self.publish_runtime_filters(state, num_build_rows);
            self.non_empty_build |= num_build_rows > 0;
        }

        if let Some(pid) = self.null_aware_partition {
            if self.all_partitions[pid.0].is_spilled() {
                // Fully unpin to free memory for the other partitions' tables.
                self.all_partitions[pid.0].spill(state, UnpinMode::UnpinAll)?;
            }
        }

        self.build_hash_tables_and_reserve_probe_buffers(state)?;
        match self.state_ {
            HashJoinState::PartitioningBuild => {
                self.update_state(HashJoinState::PartitioningProbe);
            }
            _ => {
                debug_assert_eq!(self.state_, HashJoinState::RepartitioningBuild);
                self.update_state(HashJoinState::RepartitioningProbe);
            }
        }
        Ok(())
    }

    /// Hand the fanout and the probe-stream reservation to the probe side.
    pub fn begin_initial_probe(&mut self, probe_client: &Arc<BufferPoolClient>) -> HashPartitions {
        assert_eq!(
            self.state_,
            HashJoinState::PartitioningProbe,
            "begin_initial_probe in wrong state: {}",
            self.debug_string()
        );
        debug_assert_eq!(self.hash_partitions.len(), PARTITION_FANOUT);
        self.transfer_probe_stream_reservation(probe_client);
        HashPartitions {
            level: self.key_ctx.as_ref().expect("builder is prepared").level(),
            partitions: self.hash_partitions.clone(),
            non_empty_build: self.non_empty_build,
        }
    }

    /// Revisit a spilled partition: skip the hash table when the probe side
    /// is empty, build it if it now fits, or repartition one level deeper.
    pub fn begin_spilled_probe(
        &mut self,
        state: &RuntimeState,
        empty_probe: bool,
        pid: PartitionId,
        probe_client: &Arc<BufferPoolClient>,
    ) -> Result<BeginSpilledProbeResult, String> {
        debug_assert!(self.all_partitions[pid.0].is_spilled());
        debug_assert!(self.hash_partitions.is_empty());

        if empty_probe {
            // No probe rows: unmatched build rows are read out directly, so
            // there is no point paying for a hash table.
            debug_assert!(needs_to_process_unmatched_build_rows(self.join_type));
            let got = self.all_partitions[pid.0]
                .build_rows_mut()
                .prepare_for_read(true)?;
            if !got {
                return Err(self.mem_limit_exceeded(
                    "failed to acquire initial read buffer for spilled partition stream",
                ));
            }
            self.profile
                .counter_add("NumHashTableBuildsSkipped", TUnit::UNIT, 1);
            self.update_state(HashJoinState::ProbingSpilledPartition);
            return Ok(BeginSpilledProbeResult {
                repartitioned: false,
                level: self.all_partitions[pid.0].level(),
                new_partitions: None,
            });
        }

        // Set aside memory for reading the probe stream before committing
        // reservation to the hash table.
        self.client
            .save_reservation(&self.probe_stream_reservation, self.spillable_buffer_size)?;

        let built = {
            let ctx = self.key_ctx.as_mut().expect("builder is prepared");
            let _timer = self.profile.scoped_timer("HashTablesBuildTime");
            self.all_partitions[pid.0].build_hash_table(state, ctx, &self.client)?
        };
        if built {
            if let Some(table) = self.all_partitions[pid.0].hash_tbl() {
                self.profile
                    .counter_add("HashBuckets", TUnit::UNIT, table.num_buckets() as i64);
            }
            self.transfer_probe_stream_reservation(probe_client);
            self.update_state(HashJoinState::ProbingSpilledPartition);
            return Ok(BeginSpilledProbeResult {
                repartitioned: false,
                level: self.all_partitions[pid.0].level(),
                new_partitions: None,
            });
        }

        // The partition still does not fit; repartition one level deeper.
        self.update_state(HashJoinState::RepartitioningBuild);
        let next_level = self.all_partitions[pid.0].level() + 1;
        if next_level >= MAX_PARTITION_DEPTH {
            return Err(format!(
                "hash join max partition depth {} reached in node {}",
                MAX_PARTITION_DEPTH, self.node_id
            ));
        }

        // Free the hash-table and pinned-stream memory for the new fanout,
        // and temporarily hand back the probe reservation; repartitioning
        // re-reserves what the probe streams will need.
        self.all_partitions[pid.0].spill(state, UnpinMode::UnpinAll)?;
        self.client
            .restore_reservation(&self.probe_stream_reservation, self.spillable_buffer_size);
        debug_assert_eq!(self.all_partitions[pid.0].build_rows().bytes_pinned(), 0);

        let num_input_rows = self.all_partitions[pid.0].num_rows() as i64;
        self.repartition_build_input(state, pid)?;

        let largest_partition_rows = self.largest_partition_rows();
        debug_assert!(
            num_input_rows >= largest_partition_rows,
            "a partition cannot hold more rows than its input"
        );
        if num_input_rows == largest_partition_rows {
            return Err(format!(
                "hash join repartitioning produced no reduction in node {}: level={} rows={}; {}; {}",
                self.node_id,
                next_level,
                num_input_rows,
                self.debug_string(),
                self.client.debug_string()
            ));
        }
        self.transfer_probe_stream_reservation(probe_client);
        let level = self.key_ctx.as_ref().expect("builder is prepared").level();
        Ok(BeginSpilledProbeResult {
            repartitioned: true,
            level,
            new_partitions: Some(HashPartitions {
                level,
                partitions: self.hash_partitions.clone(),
                non_empty_build: self.non_empty_build,
            }),
        })
    }

    /// Release or hand off each partition of the fanout once the probe side
    /// has finished with it.
    pub fn done_probing_hash_partitions(
        &mut self,
        retain_partition: &[bool; PARTITION_FANOUT],
        output_partitions: &mut Vec<PartitionId>,
    ) {
        debug_assert!(output_partitions.is_empty());
        for (idx, pid) in self.hash_partitions.clone().into_iter().enumerate() {
            let partition = &mut self.all_partitions[pid.0];
            if partition.is_closed() {
                continue;
            }
            if partition.is_spilled() {
                debug_assert!(partition.hash_tbl().is_none());
                debug_assert_eq!(partition.build_rows().bytes_pinned(), 0);
                if !retain_partition[idx] {
                    partition.close();
                    self.profile
                        .counter_add("NumHashTableBuildsSkipped", TUnit::UNIT, 1);
                }
            } else if needs_to_process_unmatched_build_rows(self.join_type) {
                output_partitions.push(pid);
            } else {
                partition.close();
            }
        }
        self.hash_partitions.clear();
    }

    /// Same decision for a single spilled partition that was just probed.
    pub fn done_probing_single_partition(
        &mut self,
        pid: PartitionId,
        output_partitions: &mut Vec<PartitionId>,
    ) {
        if needs_to_process_unmatched_build_rows(self.join_type) {
            output_partitions.push(pid);
        } else {
            self.all_partitions[pid.0].close();
        }
    }

    pub fn reset(&mut self) {
        debug_assert_eq!(self.probe_stream_reservation.get_reservation(), 0);
        self.state_ = HashJoinState::PartitioningBuild;
        self.non_empty_build = false;
        self.close_and_delete_partitions();
    }

    pub fn close(&mut self, _state: &RuntimeState) {
        if self.closed {
            return;
        }
        self.close_and_delete_partitions();
        self.probe_stream_reservation.close(&self.client);
        self.closed = true;
    }

    pub fn state(&self) -> HashJoinState {
        self.state_
    }

    pub fn partition(&self, pid: PartitionId) -> &Partition {
        &self.all_partitions[pid.0]
    }

    pub fn partition_mut(&mut self, pid: PartitionId) -> &mut Partition {
        &mut self.all_partitions[pid.0]
    }

    pub fn hash_partitions(&self) -> &[PartitionId] {
        &self.hash_partitions
    }

    pub fn null_aware_partition(&self) -> Option<PartitionId> {
        self.null_aware_partition
    }

    pub fn probe_stream_reservation(&self) -> &SubReservation {
        &self.probe_stream_reservation
    }

    pub fn non_empty_build(&self) -> bool {
        self.non_empty_build
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    pub fn mem_tracker(&self) -> Option<&Arc<MemTracker>> {
        self.mem_tracker.as_ref()
    }

    pub fn num_spilled_partitions(&self) -> usize {
        self.hash_partitions
            .iter()
            .filter(|pid| {
                let p = &self.all_partitions[pid.0];
                !p.is_closed() && p.is_spilled()
            })
            .count()
    }

    /// The hash table keeps rows with NULL keys iff the join emits unmatched
    /// build rows or any conjunct uses null-equals-null semantics.
    fn hash_table_stores_nulls(&self) -> bool {
        needs_to_process_unmatched_build_rows(self.join_type)
            || self.null_safe_eq.iter().any(|v| *v)
    }

    fn mem_limit_exceeded(&self, detail: &str) -> String {
        format!(
            "memory limit exceeded in hash join build (node_id={}): {}; {}",
            self.node_id,
            detail,
            self.client.debug_string()
        )
    }

    fn create_hash_partitions(&mut self, state: &RuntimeState, level: usize) -> Result<(), String> {
        debug_assert!(self.hash_partitions.is_empty());
        // Select the hash function for partitioning input at this level.
        self.key_ctx
            .as_mut()
            .expect("builder is prepared")
            .set_level(level)?;
        for _ in 0..PARTITION_FANOUT {
            let pid = self.create_and_prepare_partition(state, level)?;
            self.hash_partitions.push(pid);
        }
        self.profile
            .counter_add("PartitionsCreated", TUnit::UNIT, PARTITION_FANOUT as i64);
        if let Some(counter) = self.profile.counter("MaxPartitionLevel") {
            counter.set_max(level as i64);
        }
        Ok(())
    }

    fn create_and_prepare_partition(
        &mut self,
        state: &RuntimeState,
        level: usize,
    ) -> Result<PartitionId, String> {
        let Some(dirs) = state.spill_dirs() else {
            return Err(format!(
                "no spill directories configured for hash join build (node_id={})",
                self.node_id
            ));
        };
        let mut stream = BufferedChunkStream::new(
            self.label.clone(),
            self.build_schema.clone(),
            Arc::clone(&self.client),
            Arc::clone(dirs),
            state.query_options().spill_codec,
            self.spillable_buffer_size,
            self.max_row_buffer_size,
        )?;
        if !stream.prepare_for_write()? {
            return Err(self.mem_limit_exceeded(
                "failed to acquire write buffer for a new build partition",
            ));
        }
        self.all_partitions.push(Partition::new(level, stream));
        Ok(PartitionId(self.all_partitions.len() - 1))
    }

    /// Append one sub-chunk, spilling partitions until it fits. Spilling one
    /// partition need not free enough for the append, so keep spilling.
    fn append_with_spill_retry(
        &mut self,
        state: &RuntimeState,
        pid: PartitionId,
        sub: &Chunk,
    ) -> Result<(), String> {
        loop {
            if self.all_partitions[pid.0].build_rows_mut().add_chunk(sub)? {
                return Ok(());
            }
            self.spill_partition(state, UnpinMode::UnpinAllExceptCurrent)?;
        }
    }

    /// Choose and spill a partition: the null-aware partition first when it
    /// can spill (it is processed last, so losing its in-memory state is
    /// cheapest), otherwise the partition with the most pinned bytes.
    fn spill_partition(
        &mut self,
        state: &RuntimeState,
        mode: UnpinMode,
    ) -> Result<PartitionId, String> {
        debug_assert_eq!(self.hash_partitions.len(), PARTITION_FANOUT);
        let mut best_candidate: Option<PartitionId> = None;
        if let Some(pid) = self.null_aware_partition {
            if self.all_partitions[pid.0].can_spill() {
                best_candidate = Some(pid);
            }
        }
        if best_candidate.is_none() {
            let mut max_freed_mem = 0i64;
            for pid in &self.hash_partitions {
                let candidate = &self.all_partitions[pid.0];
                if !candidate.can_spill() {
                    continue;
                }
                if let Some(table) = candidate.hash_tbl() {
                    // Losing recorded matches would produce wrong outer-join
                    // results; such a partition is never a victim.
                    if table.has_matches() {
                        continue;
                    }
                }
                let mem = candidate.spillable_bytes();
                if mem > max_freed_mem {
                    max_freed_mem = mem;
                    best_candidate = Some(*pid);
                }
            }
        }

        let Some(pid) = best_candidate else {
            return Err(format!(
                "no spillable partition in hash join {}: {}; {}",
                self.node_id,
                self.debug_string(),
                self.client.debug_string()
            ));
        };
        debug!(
            "spilling partition: {} of {}",
            self.all_partitions[pid.0].debug_string(),
            self.debug_string()
        );
        let newly_spilled = self.all_partitions[pid.0].spill(state, mode)?;
        self.record_spill(newly_spilled);
        Ok(pid)
    }

    fn record_spill(&mut self, newly_spilled: bool) {
        if !newly_spilled {
            return;
        }
        self.profile.counter_add("SpilledPartitions", TUnit::UNIT, 1);
        let spilled = self
            .profile
            .counter("SpilledPartitions")
            .map_or(0, |c| c.value());
        if spilled == 1 {
            self.profile.append_exec_option("Spilled");
        }
    }

    /// The end-of-round planner. Afterwards every partition either has a hash
    /// table (and is not spilled) or is spilled without one; empty partitions
    /// are closed. This maps to a 0-1 knapsack over (memory, IO savings); the
    /// greedy largest-first choice is used instead.
    fn build_hash_tables_and_reserve_probe_buffers(
        &mut self,
        state: &RuntimeState,
    ) -> Result<(), String> {
        debug_assert_eq!(self.hash_partitions.len(), PARTITION_FANOUT);

        for pid in self.hash_partitions.clone() {
            let partition = &mut self.all_partitions[pid.0];
            if partition.num_rows() == 0 {
                partition.close();
            } else if partition.is_spilled() {
                // The build side of a spilled partition is not needed in
                // memory again until it is revisited.
                partition.build_rows_mut().unpin_stream(UnpinMode::UnpinAll)?;
            }
        }

        // Reserve probe buffers before building hash tables: the reservation
        // may force more partitions to spill, and building a table for a
        // partition whose probe buffer will not fit is wasted work.
        let input_is_spilled = self.key_ctx.as_ref().expect("builder is prepared").level() > 0;
        self.reserve_probe_buffers(state, input_is_spilled)?;

        for pid in self.hash_partitions.clone() {
            let (built, num_buckets) = {
                let partition = &mut self.all_partitions[pid.0];
                if partition.is_closed() || partition.is_spilled() {
                    continue;
                }
                debug_assert!(partition.build_rows().is_pinned());
                let ctx = self.key_ctx.as_mut().expect("builder is prepared");
                let _timer = self.profile.scoped_timer("HashTablesBuildTime");
                let built = partition.build_hash_table(state, ctx, &self.client)?;
                let buckets = partition.hash_tbl().map_or(0, |t| t.num_buckets() as i64);
                (built, buckets)
            };
            if built {
                self.profile.counter_add("HashBuckets", TUnit::UNIT, num_buckets);
            } else {
                let newly = self.all_partitions[pid.0].spill(state, UnpinMode::UnpinAll)?;
                self.record_spill(newly);
            }
        }

        // Building hash tables may have spilled more partitions; their probe
        // buffers still need reservation.
        self.reserve_probe_buffers(state, input_is_spilled)?;
        Ok(())
    }

    /// Earmark one probe write buffer per spilled partition, plus a read
    /// buffer when the input itself is a spilled partition. Spills further
    /// partitions (largest first) until the reservation covers the deficit.
    fn reserve_probe_buffers(
        &mut self,
        state: &RuntimeState,
        input_is_spilled: bool,
    ) -> Result<(), String> {
        debug_assert_eq!(self.hash_partitions.len(), PARTITION_FANOUT);
        let per_stream = self.spillable_buffer_size;
        let num_probe_streams =
            self.num_spilled_partitions() as i64 + if input_is_spilled { 1 } else { 0 };
        let mut addtl_reservation =
            num_probe_streams * per_stream - self.probe_stream_reservation.get_reservation();

        while addtl_reservation > self.client.unused_reservation() {
            let spilled_pid = self.spill_partition(state, UnpinMode::UnpinAll)?;
            // The null-aware partition is probed from its stream directly and
            // needs no probe stream, so it does not shrink the deficit.
            if Some(spilled_pid) != self.null_aware_partition {
                addtl_reservation += per_stream;
            }
        }
        if addtl_reservation > 0 {
            self.client
                .save_reservation(&self.probe_stream_reservation, addtl_reservation)?;
        }
        Ok(())
    }

    /// Move the saved probe reservation onto the probe client. The probe side
    /// currently shares the build client.
    fn transfer_probe_stream_reservation(&mut self, probe_client: &Arc<BufferPoolClient>) {
        debug_assert!(
            Arc::ptr_eq(probe_client, &self.client),
            "probe side must share the build buffer-pool client"
        );
        let saved = self.probe_stream_reservation.get_reservation();
        probe_client.restore_reservation(&self.probe_stream_reservation, saved);
    }

    /// Read a spilled partition end-to-end and feed it back through
    /// `send`/`flush_final` at the next recursion level.
    fn repartition_build_input(
        &mut self,
        state: &RuntimeState,
        input_pid: PartitionId,
    ) -> Result<(), String> {
        let new_level = self.all_partitions[input_pid.0].level() + 1;
        debug_assert!(new_level >= 1);
        let _timer = self.profile.scoped_timer("RepartitionTime");
        self.profile.counter_add("NumRepartitions", TUnit::UNIT, 1);

        let mut build_rows = self.all_partitions[input_pid.0]
            .take_build_rows()
            .ok_or_else(|| "repartition input stream already taken".to_string())?;
        if !build_rows.prepare_for_read(true)? {
            return Err(self.mem_limit_exceeded(
                "failed to acquire initial read buffer for repartition input stream",
            ));
        }
        self.create_hash_partitions(state, new_level)?;

        loop {
            state.check_query_state()?;
            let Some(chunk) = build_rows.get_next()? else {
                break;
            };
            self.send(state, &chunk)?;
        }

        // Done reading the input; release its file and close the partition.
        build_rows.close();
        self.all_partitions[input_pid.0].close();
        self.flush_final(state)
    }

    fn largest_partition_rows(&self) -> i64 {
        self.hash_partitions
            .iter()
            .map(|pid| &self.all_partitions[pid.0])
            .filter(|p| !p.is_closed())
            .map(|p| p.num_rows() as i64)
            .max()
            .unwrap_or(0)
    }

    fn allocate_runtime_filters(&mut self, state: &RuntimeState) {
        debug_assert!(
            self.join_type != JoinType::NullAwareLeftAnti || self.filter_ctxs.is_empty(),
            "runtime filters are not supported with NULL_AWARE_LEFT_ANTI_JOIN"
        );
        let Some(bank) = state.filter_bank() else {
            return;
        };
        for ctx in self.filter_ctxs.iter_mut() {
            match ctx.desc.kind {
                RuntimeFilterKind::Bloom => {
                    ctx.bloom = bank.allocate_scratch_bloom_filter(ctx.desc.filter_id);
                }
                RuntimeFilterKind::MinMax => {
                    let slot = self.build_keys[ctx.desc.src_key_idx];
                    let data_type = schema_slot_type(&self.build_schema, slot)
                        .unwrap_or(DataType::Null);
                    ctx.min_max =
                        bank.allocate_scratch_min_max_filter(ctx.desc.filter_id, &data_type);
                }
            }
        }
    }

    fn insert_runtime_filters(&mut self, chunk: &Chunk) -> Result<(), String> {
        for ctx in self.filter_ctxs.iter_mut() {
            let slot = self.build_keys[ctx.desc.src_key_idx];
            let array = chunk.column_by_slot_id(slot)?;
            if let Some(bloom) = ctx.bloom.as_mut() {
                let hashes = hash_filter_column(&array)?;
                for (row, hash) in hashes.iter().enumerate() {
                    if !arrow::array::Array::is_null(array.as_ref(), row) {
                        bloom.insert_hash(*hash);
                    }
                }
            }
            if let Some(min_max) = ctx.min_max.as_mut() {
                min_max.update_array(&array)?;
            }
        }
        Ok(())
    }

    /// Publish each filter once: bloom filters whose expected FP rate is too
    /// high for the observed row count go out as the always-true sentinel,
    /// as do min-max filters that cannot prune anything.
    fn publish_runtime_filters(&mut self, state: &RuntimeState, num_build_rows: i64) {
        if self.filter_ctxs.is_empty() {
            return;
        }
        let Some(bank) = state.filter_bank() else {
            return;
        };
        let total = self.filter_ctxs.len();
        let mut num_enabled = 0usize;
        for ctx in self.filter_ctxs.iter_mut() {
            if let Some(bloom) = ctx.bloom.take() {
                if bank.fp_rate_too_high(ctx.desc.filter_size_bytes, num_build_rows) {
                    bank.update_filter_from_local(ctx.desc.filter_id, PublishedFilter::AlwaysTrue);
                } else {
                    num_enabled += 1;
                    bank.update_filter_from_local(
                        ctx.desc.filter_id,
                        PublishedFilter::Bloom(bloom),
                    );
                }
            } else if let Some(min_max) = ctx.min_max.take() {
                if min_max.is_always_true() {
                    bank.update_filter_from_local(ctx.desc.filter_id, PublishedFilter::AlwaysTrue);
                } else {
                    num_enabled += 1;
                    bank.update_filter_from_local(
                        ctx.desc.filter_id,
                        PublishedFilter::MinMax(min_max),
                    );
                }
            }
        }
        let info = if num_enabled == total {
            format!("{} of {} Runtime Filters Published", num_enabled, total)
        } else {
            format!(
                "{} of {} Runtime Filters Published, {} Disabled",
                num_enabled,
                total,
                total - num_enabled
            )
        };
        self.profile.add_info_string("Runtime filters", info);
    }

    fn close_and_delete_partitions(&mut self) {
        for partition in self.all_partitions.iter_mut() {
            partition.close();
        }
        self.all_partitions.clear();
        self.hash_partitions.clear();
        self.null_aware_partition = None;
    }

    fn update_state(&mut self, next_state: HashJoinState) {
        let legal = match self.state_ {
            HashJoinState::PartitioningBuild => {
                next_state == HashJoinState::PartitioningProbe
            }
            HashJoinState::PartitioningProbe
            | HashJoinState::RepartitioningProbe
            | HashJoinState::ProbingSpilledPartition => {
                next_state == HashJoinState::RepartitioningBuild
                    || next_state == HashJoinState::ProbingSpilledPartition
            }
            HashJoinState::RepartitioningBuild => {
                next_state == HashJoinState::RepartitioningProbe
            }
        };
        assert!(
            legal,
            "illegal hash join state transition {:?} -> {:?}: {}",
            self.state_,
            next_state,
            self.debug_string()
        );
        self.state_ = next_state;
        debug!("transitioned state: {}", self.debug_string());
    }

    fn print_state(&self) -> &'static str {
        match self.state_ {
            HashJoinState::PartitioningBuild => "PartitioningBuild",
            HashJoinState::PartitioningProbe => "PartitioningProbe",
            HashJoinState::ProbingSpilledPartition => "ProbingSpilledPartition",
            HashJoinState::RepartitioningBuild => "RepartitioningBuild",
            HashJoinState::RepartitioningProbe => "RepartitioningProbe",
        }
    }

    pub fn debug_string(&self) -> String {
        let mut out = format!(
            "PartitionedJoinBuilder(node_id={} state={} hash_partitions={})",
            self.node_id,
            self.print_state(),
            self.hash_partitions.len()
        );
        for (idx, pid) in self.hash_partitions.iter().enumerate() {
            out.push_str(&format!(
                "\n  hash partition {} {}",
                idx,
                self.all_partitions[pid.0].debug_string()
            ));
        }
        if let Some(pid) = self.null_aware_partition {
            out.push_str(&format!(
                "\n  null-aware partition: {}",
                self.all_partitions[pid.0].debug_string()
            ));
        }
        out
    }

    fn log_partition_histogram(&self, num_build_rows: i64) {
        let level = self.key_ctx.as_ref().expect("builder is prepared").level();
        debug!(
            "hash join build (node_id={}) partitioned {} rows at level={}",
            self.node_id, num_build_rows, level
        );
        for (idx, pid) in self.hash_partitions.iter().enumerate() {
            let partition = &self.all_partitions[pid.0];
            let rows = partition.num_rows() as i64;
            let percent = if num_build_rows == 0 {
                0
            } else {
                rows * 100 / num_build_rows
            };
            debug!(
                "  partition {}: rows={} ({}%) {}",
                idx,
                rows,
                percent,
                if partition.is_spilled() {
                    "spilled"
                } else {
                    "not spilled"
                }
            );
        }
    }
}

fn schema_slot_type(schema: &SchemaRef, slot: SlotId) -> Option<DataType> {
    schema.fields().iter().find_map(|field| {
        match field_slot_id(field.as_ref()) {
            Ok(Some(id)) if id == slot => Some(field.data_type().clone()),
            _ => None,
        }
    })
}
