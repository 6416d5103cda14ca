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
//! Per-fragment-instance execution context.
//!
//! Carries the query options, cancellation and sticky-error state, the
//! fragment hash seed, the memory tracker root and the spill directory
//! manager that execution components share.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::ipc_serde::SpillCodec;
use crate::runtime::filter_bank::RuntimeFilterBank;
use crate::runtime::mem_tracker::MemTracker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeFilterMode {
    Off,
    Local,
    Global,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrefetchMode {
    None,
    HtBucket,
}

#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub batch_size: usize,
    pub spillable_buffer_size: i64,
    pub max_row_buffer_size: i64,
    pub enable_spill: bool,
    pub runtime_filter_mode: RuntimeFilterMode,
    pub disable_row_runtime_filtering: bool,
    pub runtime_filter_max_fp_rate: f64,
    pub prefetch_mode: PrefetchMode,
    pub spill_codec: SpillCodec,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            spillable_buffer_size: 2 << 20,
            max_row_buffer_size: 512 << 20,
            enable_spill: true,
            runtime_filter_mode: RuntimeFilterMode::Global,
            disable_row_runtime_filtering: false,
            runtime_filter_max_fp_rate: 0.75,
            prefetch_mode: PrefetchMode::None,
            spill_codec: SpillCodec::Lz4,
        }
    }
}

#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: Mutex<Option<String>>,
}

impl RuntimeErrorState {
    pub fn set_error(&self, err: String) {
        let mut guard = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[derive(Debug)]
pub struct RuntimeState {
    query_options: QueryOptions,
    fragment_hash_seed: u64,
    cancelled: Arc<AtomicBool>,
    error_state: Arc<RuntimeErrorState>,
    mem_tracker: Arc<MemTracker>,
    spill_dirs: Option<Arc<DirManager>>,
    filter_bank: Option<Arc<RuntimeFilterBank>>,
}

impl RuntimeState {
    pub fn new(query_options: QueryOptions) -> Self {
        Self {
            query_options,
            fragment_hash_seed: 0x8445d61a4e774912,
            cancelled: Arc::new(AtomicBool::new(false)),
            error_state: Arc::new(RuntimeErrorState::default()),
            mem_tracker: MemTracker::new_root("fragment"),
            spill_dirs: None,
            filter_bank: None,
        }
    }

    pub fn with_spill_dirs(mut self, dirs: Arc<DirManager>) -> Self {
        self.spill_dirs = Some(dirs);
        self
    }

    pub fn with_filter_bank(mut self, bank: Arc<RuntimeFilterBank>) -> Self {
        self.filter_bank = Some(bank);
        self
    }

    pub fn with_fragment_hash_seed(mut self, seed: u64) -> Self {
        self.fragment_hash_seed = seed;
        self
    }

    pub fn query_options(&self) -> &QueryOptions {
        &self.query_options
    }

    pub fn batch_size(&self) -> usize {
        self.query_options.batch_size
    }

    pub fn fragment_hash_seed(&self) -> u64 {
        self.fragment_hash_seed
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn spill_dirs(&self) -> Option<&Arc<DirManager>> {
        self.spill_dirs.as_ref()
    }

    pub fn filter_bank(&self) -> Option<&Arc<RuntimeFilterBank>> {
        self.filter_bank.as_ref()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn check_cancelled(&self) -> Result<(), String> {
        if self.is_cancelled() {
            return Err("query cancelled".to_string());
        }
        Ok(())
    }

    pub fn set_error(&self, err: String) {
        self.error_state.set_error(err);
    }

    /// Return the sticky query error, if any was recorded by another component.
    pub fn check_query_state(&self) -> Result<(), String> {
        if let Some(err) = self.error_state.error() {
            return Err(err);
        }
        self.check_cancelled()
    }

    /// Gate on the first transition of an operator into a spilling mode.
    pub fn start_spilling(&self, label: &str) -> Result<(), String> {
        if !self.query_options.enable_spill {
            return Err(format!(
                "memory limit exceeded in hash join build: spilling is disabled and {} cannot free memory",
                label
            ));
        }
        if self.spill_dirs.is_none() {
            return Err(format!(
                "memory limit exceeded in hash join build: no spill directories configured for {}",
                label
            ));
        }
        Ok(())
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new(QueryOptions::default())
    }
}
