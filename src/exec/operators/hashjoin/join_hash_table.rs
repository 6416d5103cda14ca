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
//! Hash table over one partition's build rows.
//!
//! Responsibilities:
//! - Buckets row references by the low bits of the join-key hash, chaining
//!   duplicates through a per-row next link.
//! - Accounts its memory against the buffer-pool client so a table that does
//!   not fit makes the partition spill instead of overcommitting.

use std::sync::Arc;

use crate::exec::chunk::Chunk;
use crate::exec::operators::hashjoin::key_context::{HashedKeys, JoinKeyContext};
use crate::runtime::buffer_pool::BufferPoolClient;

const ROW_NONE: u32 = u32::MAX;
/// Bytes per row reference: next link + stored hash + page/row ref.
const ROW_REF_BYTES: i64 = 4 + 8 + 8;
const BUCKET_BYTES: i64 = 4;

/// Reference to one build row inside the partition's stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HtRowRef {
    pub page_idx: u32,
    pub row_idx: u32,
}

#[derive(Debug)]
pub struct JoinHashTable {
    client: Arc<BufferPoolClient>,
    buckets: Vec<u32>,
    bucket_mask: u64,
    next: Vec<u32>,
    row_hashes: Vec<u64>,
    row_refs: Vec<HtRowRef>,
    num_filled_buckets: usize,
    has_matches: bool,
    accounted_bytes: i64,
}

impl JoinHashTable {
    /// Allocate a table sized for `num_rows` build rows. Returns Ok(None) when
    /// the reservation cannot admit it; the caller then spills the partition.
    pub fn create(
        client: Arc<BufferPoolClient>,
        num_rows: usize,
        max_buckets: i64,
        estimated_buckets: i64,
    ) -> Result<Option<Self>, String> {
        let num_buckets = estimated_buckets.clamp(1, max_buckets) as usize;
        if !num_buckets.is_power_of_two() {
            return Err(format!(
                "hash table bucket count {} is not a power of two",
                num_buckets
            ));
        }
        let bytes = num_buckets as i64 * BUCKET_BYTES + num_rows as i64 * ROW_REF_BYTES;
        if !client.try_consume(bytes) {
            return Ok(None);
        }
        Ok(Some(Self {
            client,
            buckets: vec![ROW_NONE; num_buckets],
            bucket_mask: (num_buckets - 1) as u64,
            next: Vec::with_capacity(num_rows),
            row_hashes: Vec::with_capacity(num_rows),
            row_refs: Vec::with_capacity(num_rows),
            num_filled_buckets: 0,
            has_matches: false,
            accounted_bytes: bytes,
        }))
    }

    /// Insert every admissible row of one stream page. Rows whose keys carry a
    /// forbidden NULL can never match under plain `=` semantics and are
    /// dropped here unless the join stores them for unmatched-row output.
    pub fn insert_page(
        &mut self,
        ctx: &JoinKeyContext,
        page_idx: u32,
        chunk: &Chunk,
        hashed: &HashedKeys,
    ) -> Result<(), String> {
        if hashed.hashes.len() != chunk.len() {
            return Err(format!(
                "hash count {} does not match page rows {}",
                hashed.hashes.len(),
                chunk.len()
            ));
        }
        for row in 0..chunk.len() {
            if hashed.forbidden_null[row] && !ctx.stores_nulls() {
                continue;
            }
            self.insert_hash(
                hashed.hashes[row],
                HtRowRef {
                    page_idx,
                    row_idx: row as u32,
                },
            )?;
        }
        Ok(())
    }

    fn insert_hash(&mut self, hash: u64, row_ref: HtRowRef) -> Result<(), String> {
        let row_id = self.row_refs.len();
        if row_id >= ROW_NONE as usize {
            return Err("hash table row id overflow".to_string());
        }
        let bucket = (hash & self.bucket_mask) as usize;
        let head = self.buckets[bucket];
        if head == ROW_NONE {
            self.num_filled_buckets += 1;
        }
        // New row becomes the chain head; duplicates stay reachable.
        self.next.push(head);
        self.row_hashes.push(hash);
        self.row_refs.push(row_ref);
        self.buckets[bucket] = row_id as u32;
        Ok(())
    }

    /// Rows chained under the bucket for `hash`, most recent first. Rows with
    /// a different hash sharing the bucket are filtered out.
    pub fn chain(&self, hash: u64) -> impl Iterator<Item = &HtRowRef> {
        let bucket = (hash & self.bucket_mask) as usize;
        let mut current = self.buckets[bucket];
        std::iter::from_fn(move || {
            while current != ROW_NONE {
                let row_id = current as usize;
                current = self.next[row_id];
                if self.row_hashes[row_id] == hash {
                    return Some(&self.row_refs[row_id]);
                }
            }
            None
        })
    }

    pub fn len(&self) -> usize {
        self.row_refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_refs.is_empty()
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn empty_buckets(&self) -> usize {
        self.buckets.len() - self.num_filled_buckets
    }

    pub fn byte_size(&self) -> i64 {
        self.accounted_bytes
    }

    pub fn has_matches(&self) -> bool {
        self.has_matches
    }

    /// Recorded by the probe side once any build row in this table matched.
    pub fn set_has_matches(&mut self) {
        self.has_matches = true;
    }

    pub fn close(&mut self) {
        self.client.release(self.accounted_bytes);
        self.accounted_bytes = 0;
        self.buckets.clear();
        self.next.clear();
        self.row_hashes.clear();
        self.row_refs.clear();
        self.num_filled_buckets = 0;
    }

    /// Bucket count for `num_rows` build rows at a 3/4 fill factor, rounded up
    /// to a power of two.
    pub fn estimate_num_buckets(num_rows: usize) -> i64 {
        let target = (num_rows.max(1) * 4).div_ceil(3);
        (target.next_power_of_two() as i64).max(16)
    }

    /// Estimated total footprint of a table over `num_rows` rows.
    pub fn estimate_size(num_rows: usize) -> i64 {
        Self::estimate_num_buckets(num_rows) * BUCKET_BYTES + num_rows as i64 * ROW_REF_BYTES
    }
}

impl Drop for JoinHashTable {
    fn drop(&mut self) {
        self.client.release(self.accounted_bytes);
        self.accounted_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};

    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use crate::exec::operators::hashjoin::MAX_HASH_BUCKETS;

    fn key_chunk(values: Vec<Option<i32>>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("k", DataType::Int32, true),
            SlotId::new(1),
        )]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]).unwrap();
        Chunk::new(batch)
    }

    fn ctx(stores_nulls: bool) -> JoinKeyContext {
        JoinKeyContext::new(vec![SlotId::new(1)], vec![false], stores_nulls, 7).unwrap()
    }

    fn build_table(values: Vec<Option<i32>>, stores_nulls: bool) -> (JoinHashTable, Vec<u64>) {
        let client = Arc::new(BufferPoolClient::new("test", 1 << 20));
        let chunk = key_chunk(values);
        let ctx = ctx(stores_nulls);
        let hashed = ctx.hash_chunk(&chunk).unwrap();
        let mut table = JoinHashTable::create(
            client,
            chunk.len(),
            MAX_HASH_BUCKETS,
            JoinHashTable::estimate_num_buckets(chunk.len()),
        )
        .unwrap()
        .unwrap();
        table.insert_page(&ctx, 0, &chunk, &hashed).unwrap();
        (table, hashed.hashes)
    }

    #[test]
    fn duplicates_are_chained() {
        let (table, hashes) = build_table(vec![Some(1), Some(2), Some(1), Some(1)], false);
        assert_eq!(table.len(), 4);
        let dup_rows: Vec<u32> = table.chain(hashes[0]).map(|r| r.row_idx).collect();
        assert_eq!(dup_rows, vec![3, 2, 0]);
        let single: Vec<u32> = table.chain(hashes[1]).map(|r| r.row_idx).collect();
        assert_eq!(single, vec![1]);
        assert!(table.empty_buckets() < table.num_buckets());
    }

    #[test]
    fn forbidden_null_rows_are_dropped_unless_stored() {
        let (table, _) = build_table(vec![Some(1), None, Some(2)], false);
        assert_eq!(table.len(), 2);
        let (table, _) = build_table(vec![Some(1), None, Some(2)], true);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn estimates_are_powers_of_two_with_slack() {
        assert_eq!(JoinHashTable::estimate_num_buckets(0), 16);
        assert_eq!(JoinHashTable::estimate_num_buckets(1000), 2048);
        assert!(JoinHashTable::estimate_size(1000) > 1000 * ROW_REF_BYTES);
    }

    #[test]
    fn create_fails_cleanly_without_memory() {
        let client = Arc::new(BufferPoolClient::new("tiny", 64));
        let table = JoinHashTable::create(Arc::clone(&client), 1000, MAX_HASH_BUCKETS, 2048)
            .unwrap();
        assert!(table.is_none());
        assert_eq!(client.used(), 0);
    }

    #[test]
    fn close_releases_reservation() {
        let client = Arc::new(BufferPoolClient::new("test", 1 << 20));
        let mut table = JoinHashTable::create(Arc::clone(&client), 10, MAX_HASH_BUCKETS, 16)
            .unwrap()
            .unwrap();
        assert!(client.used() > 0);
        table.close();
        assert_eq!(client.used(), 0);
    }
}
