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
//! One shard of the build input.
//!
//! A partition owns its buffered row stream and, once built, a hash table
//! over those rows. At the end of a build round it is in exactly one of three
//! states: closed empty, in memory with a hash table, or spilled without one.

use std::sync::Arc;

use crate::exec::operators::hashjoin::MAX_HASH_BUCKETS;
use crate::exec::operators::hashjoin::join_hash_table::JoinHashTable;
use crate::exec::operators::hashjoin::key_context::JoinKeyContext;
use crate::exec::spill::{BufferedChunkStream, UnpinMode};
use crate::gritstone_logging::debug;
use crate::runtime::buffer_pool::BufferPoolClient;
use crate::runtime::runtime_state::RuntimeState;

#[derive(Debug)]
pub struct Partition {
    level: usize,
    build_rows: Option<BufferedChunkStream>,
    hash_tbl: Option<JoinHashTable>,
    is_spilled: bool,
    closed: bool,
}

impl Partition {
    pub fn new(level: usize, build_rows: BufferedChunkStream) -> Self {
        Self {
            level,
            build_rows: Some(build_rows),
            hash_tbl: None,
            is_spilled: false,
            closed: false,
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn is_spilled(&self) -> bool {
        self.is_spilled
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn build_rows(&self) -> &BufferedChunkStream {
        self.build_rows.as_ref().expect("partition stream is open")
    }

    pub fn build_rows_mut(&mut self) -> &mut BufferedChunkStream {
        self.build_rows.as_mut().expect("partition stream is open")
    }

    /// Detach the stream for a repartition read; the partition is closed once
    /// the read finishes.
    pub fn take_build_rows(&mut self) -> Option<BufferedChunkStream> {
        self.build_rows.take()
    }

    pub fn hash_tbl(&self) -> Option<&JoinHashTable> {
        self.hash_tbl.as_ref()
    }

    pub fn hash_tbl_mut(&mut self) -> Option<&mut JoinHashTable> {
        self.hash_tbl.as_mut()
    }

    pub fn num_rows(&self) -> usize {
        self.build_rows.as_ref().map_or(0, |s| s.num_rows())
    }

    /// Whether spilling this partition can free memory.
    pub fn can_spill(&self) -> bool {
        !self.closed && !self.is_spilled && self.build_rows.is_some()
    }

    /// Bytes freed if this partition is chosen as the spill victim.
    pub fn spillable_bytes(&self) -> i64 {
        let stream = self.build_rows.as_ref().map_or(0, |s| s.bytes_pinned());
        let table = self.hash_tbl.as_ref().map_or(0, |t| t.byte_size());
        stream + table
    }

    pub fn estimated_in_mem_size(&self) -> i64 {
        let stream = self.build_rows.as_ref().map_or(0, |s| s.byte_size());
        stream + JoinHashTable::estimate_size(self.num_rows())
    }

    /// Drop the hash table (if any) and unpin the stream so its pages may be
    /// evicted to disk. Returns true when the partition was not spilled before.
    pub fn spill(&mut self, state: &RuntimeState, mode: UnpinMode) -> Result<bool, String> {
        debug_assert!(!self.closed, "spilling a closed partition");
        state.start_spilling("hash join build partition")?;
        if let Some(mut table) = self.hash_tbl.take() {
            table.close();
        }
        self.build_rows_mut().unpin_stream(mode)?;
        let newly_spilled = !self.is_spilled;
        self.is_spilled = true;
        Ok(newly_spilled)
    }

    /// Pin the stream and build a hash table over its rows. Returns false when
    /// either step does not fit in memory; the partition is left for the
    /// caller to spill.
    pub fn build_hash_table(
        &mut self,
        state: &RuntimeState,
        ctx: &mut JoinKeyContext,
        client: &Arc<BufferPoolClient>,
    ) -> Result<bool, String> {
        debug_assert!(!self.closed, "building a hash table on a closed partition");
        let num_rows = self.num_rows();
        if !self.build_rows_mut().pin_stream()? {
            return Ok(false);
        }
        // Select the hash function this partition's rows were routed with.
        ctx.set_level(self.level)?;

        let estimated_buckets = JoinHashTable::estimate_num_buckets(num_rows);
        let Some(mut table) = JoinHashTable::create(
            Arc::clone(client),
            num_rows,
            MAX_HASH_BUCKETS,
            estimated_buckets,
        )?
        else {
            return Ok(false);
        };

        if !self.build_rows_mut().prepare_for_read(false)? {
            return Ok(false);
        }
        let mut page_idx: u32 = 0;
        loop {
            state.check_query_state()?;
            let Some(chunk) = self.build_rows_mut().get_next()? else {
                break;
            };
            let hashed = ctx.hash_chunk(&chunk)?;
            table.insert_page(ctx, page_idx, &chunk, &hashed)?;
            page_idx += 1;
        }
        debug!(
            "partition hash table built: level={} rows={} buckets={} bytes={}",
            self.level,
            table.len(),
            table.num_buckets(),
            table.byte_size()
        );
        self.hash_tbl = Some(table);
        self.is_spilled = false;
        Ok(true)
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Some(mut table) = self.hash_tbl.take() {
            table.close();
        }
        if let Some(mut stream) = self.build_rows.take() {
            stream.close();
        }
        self.closed = true;
    }

    pub fn debug_string(&self) -> String {
        if self.closed {
            return "<partition> closed".to_string();
        }
        let mut out = format!(
            "<partition> level={}{} rows={} bytes_pinned={}",
            self.level,
            if self.is_spilled { " spilled" } else { "" },
            self.num_rows(),
            self.build_rows.as_ref().map_or(0, |s| s.bytes_pinned()),
        );
        if let Some(table) = self.hash_tbl.as_ref() {
            out.push_str(&format!(" hash_tbl_rows={}", table.len()));
        }
        out
    }
}
