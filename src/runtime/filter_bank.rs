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
//! Runtime-filter bank.
//!
//! Responsibilities:
//! - Registers the filters a build operator produces and hands out scratch
//!   Bloom / min-max filters sized from the filter descriptors.
//! - Accepts one local update per filter and exposes the published result,
//!   with an always-true sentinel for filters suppressed by the FP-rate gate.

use std::collections::HashMap;
use std::sync::Mutex;

use arrow::datatypes::DataType;

use crate::exec::runtime_filter::{RuntimeBloomFilter, RuntimeMinMaxFilter};
use crate::gritstone_logging::{debug, warn};
use crate::runtime::runtime_state::RuntimeFilterMode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeFilterKind {
    Bloom,
    MinMax,
}

#[derive(Clone, Debug)]
pub struct RuntimeFilterDesc {
    pub filter_id: i32,
    pub kind: RuntimeFilterKind,
    /// Position of the source expression in the join's build-key list.
    pub src_key_idx: usize,
    pub filter_size_bytes: i64,
    pub is_broadcast_join: bool,
    pub applied_on_partition_columns: bool,
}

/// Final, published form of one runtime filter.
#[derive(Clone, Debug)]
pub enum PublishedFilter {
    /// Sentinel that prunes nothing; used when the expected FP rate is too
    /// high for the bloom filter to pay for itself.
    AlwaysTrue,
    Bloom(RuntimeBloomFilter),
    MinMax(RuntimeMinMaxFilter),
}

#[derive(Debug)]
pub struct RuntimeFilterBank {
    mode: RuntimeFilterMode,
    max_fp_rate: f64,
    registered: Mutex<HashMap<i32, RuntimeFilterDesc>>,
    published: Mutex<HashMap<i32, PublishedFilter>>,
}

impl RuntimeFilterBank {
    pub fn new(mode: RuntimeFilterMode, max_fp_rate: f64) -> Self {
        Self {
            mode,
            max_fp_rate,
            registered: Mutex::new(HashMap::new()),
            published: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> RuntimeFilterMode {
        self.mode
    }

    pub fn register_filter(&self, desc: RuntimeFilterDesc) {
        let mut guard = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        if guard.insert(desc.filter_id, desc.clone()).is_some() {
            warn!("runtime filter {} registered twice", desc.filter_id);
        }
    }

    pub fn filter_desc(&self, filter_id: i32) -> Option<RuntimeFilterDesc> {
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&filter_id)
            .cloned()
    }

    /// Allocate the build-local scratch bloom filter for `filter_id`; None
    /// when runtime filtering is off or the filter is unknown.
    pub fn allocate_scratch_bloom_filter(&self, filter_id: i32) -> Option<RuntimeBloomFilter> {
        if self.mode == RuntimeFilterMode::Off {
            return None;
        }
        let desc = self.filter_desc(filter_id)?;
        if desc.kind != RuntimeFilterKind::Bloom {
            return None;
        }
        Some(RuntimeBloomFilter::with_size_bytes(desc.filter_size_bytes))
    }

    pub fn allocate_scratch_min_max_filter(
        &self,
        filter_id: i32,
        data_type: &DataType,
    ) -> Option<RuntimeMinMaxFilter> {
        if self.mode == RuntimeFilterMode::Off {
            return None;
        }
        let desc = self.filter_desc(filter_id)?;
        if desc.kind != RuntimeFilterKind::MinMax {
            return None;
        }
        Some(RuntimeMinMaxFilter::new(data_type))
    }

    /// Whether a bloom filter of `filter_size_bytes` is expected to pass too
    /// many probe rows at `observed_rows` build rows to be worth publishing.
    pub fn fp_rate_too_high(&self, filter_size_bytes: i64, observed_rows: i64) -> bool {
        RuntimeBloomFilter::estimate_fp_rate(filter_size_bytes, observed_rows) > self.max_fp_rate
    }

    /// Publish the local result for `filter_id`. Filters are published at most
    /// once; later updates are ignored.
    pub fn update_filter_from_local(&self, filter_id: i32, update: PublishedFilter) {
        let mut guard = self.published.lock().unwrap_or_else(|e| e.into_inner());
        if guard.contains_key(&filter_id) {
            debug_assert!(false, "runtime filter {filter_id} published twice");
            warn!("ignoring duplicate publication of runtime filter {filter_id}");
            return;
        }
        debug!(
            "runtime filter {} published: kind={}",
            filter_id,
            match &update {
                PublishedFilter::AlwaysTrue => "always_true",
                PublishedFilter::Bloom(_) => "bloom",
                PublishedFilter::MinMax(_) => "min_max",
            }
        );
        guard.insert(filter_id, update);
    }

    pub fn published(&self, filter_id: i32) -> Option<PublishedFilter> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&filter_id)
            .cloned()
    }

    pub fn num_published(&self) -> usize {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bloom_desc(id: i32, size: i64) -> RuntimeFilterDesc {
        RuntimeFilterDesc {
            filter_id: id,
            kind: RuntimeFilterKind::Bloom,
            src_key_idx: 0,
            filter_size_bytes: size,
            is_broadcast_join: false,
            applied_on_partition_columns: true,
        }
    }

    #[test]
    fn scratch_allocation_respects_mode() {
        let bank = RuntimeFilterBank::new(RuntimeFilterMode::Off, 0.75);
        bank.register_filter(bloom_desc(1, 1024));
        assert!(bank.allocate_scratch_bloom_filter(1).is_none());

        let bank = RuntimeFilterBank::new(RuntimeFilterMode::Global, 0.75);
        bank.register_filter(bloom_desc(1, 1024));
        assert!(bank.allocate_scratch_bloom_filter(1).is_some());
        assert!(bank.allocate_scratch_bloom_filter(2).is_none());
    }

    #[test]
    fn fp_gate_flags_overfilled_filters() {
        let bank = RuntimeFilterBank::new(RuntimeFilterMode::Global, 0.75);
        assert!(!bank.fp_rate_too_high(1 << 20, 1000));
        assert!(bank.fp_rate_too_high(64, 1_000_000));
    }

    #[test]
    fn publish_is_once_only() {
        let bank = RuntimeFilterBank::new(RuntimeFilterMode::Global, 0.75);
        bank.register_filter(bloom_desc(7, 1024));
        bank.update_filter_from_local(7, PublishedFilter::AlwaysTrue);
        assert!(matches!(
            bank.published(7),
            Some(PublishedFilter::AlwaysTrue)
        ));
        assert_eq!(bank.num_published(), 1);
    }
}
