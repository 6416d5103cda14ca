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
//! Join-key hashing context.
//!
//! Responsibilities:
//! - Hashes build-key columns row-wise with a level-indexed seed, so each
//!   recursion level partitions with an independent hash function.
//! - Detects rows whose keys carry a NULL that plain `=` semantics can never
//!   match, honoring per-key null-safe (`<=>`) flags.

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Decimal128Array, Float32Array, Float64Array,
    Int8Array, Int16Array, Int32Array, Int64Array, StringArray, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray, TimestampSecondArray,
};
use arrow::datatypes::{DataType, TimeUnit};

use crate::common::ids::SlotId;
use crate::exec::chunk::Chunk;
use crate::exec::operators::hashjoin::{MAX_PARTITION_DEPTH, NUM_PARTITIONING_BITS};

/// One odd constant per recursion level; mixing the fragment seed with a
/// level constant yields an independent hash function per level.
const LEVEL_SEEDS: [u64; MAX_PARTITION_DEPTH] = [
    0x9b9773e9b7492d11,
    0x2b4f3d5e0a3a8c27,
    0xd6e8feb86659fd93,
    0x6c62272e07bb0143,
    0xaf63bd4c8601b7df,
    0x100000001b3a7f55,
    0xc2b2ae3d27d4eb4f,
    0x165667b19e3779f9,
    0x27d4eb2f165667c5,
    0x85ebca77c2b2ae63,
    0x4cf5ad432745937f,
    0x94d049bb133111eb,
    0xbf58476d1ce4e5b9,
    0xff51afd7ed558ccd,
    0xc4ceb9fe1a85ec53,
    0x2545f4914f6cdd1d,
];

/// Per-row hashing results for one chunk.
pub struct HashedKeys {
    pub hashes: Vec<u64>,
    /// Rows with a NULL on any key compared with plain `=` semantics.
    pub forbidden_null: Vec<bool>,
}

#[derive(Debug)]
pub struct JoinKeyContext {
    build_keys: Vec<SlotId>,
    null_safe_eq: Vec<bool>,
    stores_nulls: bool,
    fragment_seed: u64,
    level: usize,
}

impl JoinKeyContext {
    pub fn new(
        build_keys: Vec<SlotId>,
        null_safe_eq: Vec<bool>,
        stores_nulls: bool,
        fragment_seed: u64,
    ) -> Result<Self, String> {
        if build_keys.is_empty() {
            return Err("hash join requires at least one equality key".to_string());
        }
        if build_keys.len() != null_safe_eq.len() {
            return Err(format!(
                "hash join null-safe key count mismatch: keys={} flags={}",
                build_keys.len(),
                null_safe_eq.len()
            ));
        }
        Ok(Self {
            build_keys,
            null_safe_eq,
            stores_nulls,
            fragment_seed,
            level: 0,
        })
    }

    pub fn build_keys(&self) -> &[SlotId] {
        &self.build_keys
    }

    pub fn stores_nulls(&self) -> bool {
        self.stores_nulls
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn set_level(&mut self, level: usize) -> Result<(), String> {
        if level >= MAX_PARTITION_DEPTH {
            return Err(format!(
                "hash join max partition depth {} reached at level {}",
                MAX_PARTITION_DEPTH, level
            ));
        }
        self.level = level;
        Ok(())
    }

    /// Partition selected by the top hash bits; the hash table uses the rest.
    pub fn partition_index(hash: u64) -> usize {
        (hash >> (64 - NUM_PARTITIONING_BITS)) as usize
    }

    /// Hash every row's key columns at the current level.
    pub fn hash_chunk(&self, chunk: &Chunk) -> Result<HashedKeys, String> {
        let num_rows = chunk.len();
        let seed = mix_u64(self.fragment_seed ^ LEVEL_SEEDS[self.level]);
        let mut hashes = vec![seed; num_rows];
        let mut forbidden_null = vec![false; num_rows];
        for (key_idx, slot) in self.build_keys.iter().enumerate() {
            let array = chunk.column_by_slot_id(*slot)?;
            let column_hashes = hash_array(&array, seed)?;
            let null_safe = self.null_safe_eq[key_idx];
            for row in 0..num_rows {
                hashes[row] = combine_hash(hashes[row], column_hashes[row]);
                if !null_safe && array.is_null(row) {
                    forbidden_null[row] = true;
                }
            }
        }
        Ok(HashedKeys {
            hashes,
            forbidden_null,
        })
    }
}

/// Seed shared with probe-side filter application; runtime filters must hash
/// identically on both sides regardless of the join's partitioning level.
pub const RUNTIME_FILTER_HASH_SEED: u64 = 0x71ce7b8e2e9d3a4d;

/// Hash one runtime-filter source column row-wise.
pub fn hash_filter_column(array: &ArrayRef) -> Result<Vec<u64>, String> {
    hash_array(array, RUNTIME_FILTER_HASH_SEED)
}

fn hash_array(array: &ArrayRef, seed: u64) -> Result<Vec<u64>, String> {
    let num_rows = array.len();
    let mut hashes = vec![0u64; num_rows];
    match array.data_type() {
        DataType::Int8 => hash_int_values(&mut hashes, seed, downcast::<Int8Array>(array)?.iter().map(|v| v.map(i64::from))),
        DataType::Int16 => hash_int_values(&mut hashes, seed, downcast::<Int16Array>(array)?.iter().map(|v| v.map(i64::from))),
        DataType::Int32 => hash_int_values(&mut hashes, seed, downcast::<Int32Array>(array)?.iter().map(|v| v.map(i64::from))),
        DataType::Int64 => hash_int_values(&mut hashes, seed, downcast::<Int64Array>(array)?.iter()),
        DataType::Date32 => hash_int_values(&mut hashes, seed, downcast::<Date32Array>(array)?.iter().map(|v| v.map(i64::from))),
        DataType::Timestamp(TimeUnit::Second, _) => {
            hash_int_values(&mut hashes, seed, downcast::<TimestampSecondArray>(array)?.iter())
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            hash_int_values(&mut hashes, seed, downcast::<TimestampMillisecondArray>(array)?.iter())
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            hash_int_values(&mut hashes, seed, downcast::<TimestampMicrosecondArray>(array)?.iter())
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            hash_int_values(&mut hashes, seed, downcast::<TimestampNanosecondArray>(array)?.iter())
        }
        DataType::Boolean => {
            let array = downcast::<BooleanArray>(array)?;
            for (row, hash) in hashes.iter_mut().enumerate() {
                *hash = if array.is_null(row) {
                    hash_null_with_seed(seed)
                } else {
                    hash_u64_with_seed(seed, array.value(row) as u64)
                };
            }
        }
        DataType::Float32 => {
            let array = downcast::<Float32Array>(array)?;
            for (row, hash) in hashes.iter_mut().enumerate() {
                *hash = if array.is_null(row) {
                    hash_null_with_seed(seed)
                } else {
                    hash_u64_with_seed(seed, canonical_f64_bits(array.value(row) as f64))
                };
            }
        }
        DataType::Float64 => {
            let array = downcast::<Float64Array>(array)?;
            for (row, hash) in hashes.iter_mut().enumerate() {
                *hash = if array.is_null(row) {
                    hash_null_with_seed(seed)
                } else {
                    hash_u64_with_seed(seed, canonical_f64_bits(array.value(row)))
                };
            }
        }
        DataType::Utf8 => {
            let array = downcast::<StringArray>(array)?;
            for (row, hash) in hashes.iter_mut().enumerate() {
                *hash = if array.is_null(row) {
                    hash_null_with_seed(seed)
                } else {
                    hash_bytes_with_seed(seed, array.value(row).as_bytes())
                };
            }
        }
        DataType::Decimal128(_, _) => {
            let array = downcast::<Decimal128Array>(array)?;
            for (row, hash) in hashes.iter_mut().enumerate() {
                *hash = if array.is_null(row) {
                    hash_null_with_seed(seed)
                } else {
                    hash_i128_with_seed(seed, array.value(row))
                };
            }
        }
        other => {
            return Err(format!("unsupported hash join key type: {other:?}"));
        }
    }
    Ok(hashes)
}

fn hash_int_values(
    hashes: &mut [u64],
    seed: u64,
    values: impl Iterator<Item = Option<i64>>,
) {
    for (hash, value) in hashes.iter_mut().zip(values) {
        *hash = match value {
            Some(v) => hash_u64_with_seed(seed, v as u64),
            None => hash_null_with_seed(seed),
        };
    }
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef) -> Result<&'a T, String> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| "hash join key array downcast failed".to_string())
}

pub(crate) fn combine_hash(acc: u64, value_hash: u64) -> u64 {
    acc ^ value_hash
        .wrapping_add(0x9e3779b97f4a7c15)
        .wrapping_add(acc << 6)
        .wrapping_add(acc >> 2)
}

pub(crate) fn hash_u64_with_seed(seed: u64, value: u64) -> u64 {
    mix_u64(seed ^ value)
}

fn hash_i128_with_seed(seed: u64, value: i128) -> u64 {
    let value = value as u128;
    let low = hash_u64_with_seed(seed, value as u64);
    let high = hash_u64_with_seed(seed, (value >> 64) as u64);
    combine_hash(low, high)
}

fn hash_bytes_with_seed(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = seed ^ 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    mix_u64(hash)
}

fn hash_null_with_seed(seed: u64) -> u64 {
    hash_u64_with_seed(seed, 0x9e3779b97f4a7c15)
}

fn canonical_f64_bits(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

fn mix_u64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9e3779b97f4a7c15);
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d049bb133111eb);
    value ^ (value >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::RecordBatch;
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    use crate::exec::chunk::field_with_slot_id;
    use crate::exec::operators::hashjoin::PARTITION_FANOUT;

    fn key_chunk(values: Vec<Option<i32>>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("k", DataType::Int32, true),
            SlotId::new(1),
        )]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]).unwrap();
        Chunk::new(batch)
    }

    fn ctx(null_safe: bool) -> JoinKeyContext {
        JoinKeyContext::new(vec![SlotId::new(1)], vec![null_safe], false, 42).unwrap()
    }

    #[test]
    fn hashing_is_deterministic_per_level() {
        let chunk = key_chunk(vec![Some(1), Some(2), Some(1)]);
        let a = ctx(false).hash_chunk(&chunk).unwrap();
        let b = ctx(false).hash_chunk(&chunk).unwrap();
        assert_eq!(a.hashes, b.hashes);
        assert_eq!(a.hashes[0], a.hashes[2]);
        assert_ne!(a.hashes[0], a.hashes[1]);
    }

    #[test]
    fn levels_use_independent_hash_functions() {
        let chunk = key_chunk((0..64).map(Some).collect());
        let mut context = ctx(false);
        let level0 = context.hash_chunk(&chunk).unwrap();
        context.set_level(1).unwrap();
        let level1 = context.hash_chunk(&chunk).unwrap();
        assert_ne!(level0.hashes, level1.hashes);
        // Rows co-located at level 0 must not all stay together at level 1.
        let part0: Vec<usize> = level0.hashes.iter().map(|h| JoinKeyContext::partition_index(*h)).collect();
        let part1: Vec<usize> = level1.hashes.iter().map(|h| JoinKeyContext::partition_index(*h)).collect();
        assert_ne!(part0, part1);
    }

    #[test]
    fn partition_index_is_in_fanout_range() {
        let chunk = key_chunk((0..1000).map(Some).collect());
        let hashed = ctx(false).hash_chunk(&chunk).unwrap();
        for hash in hashed.hashes {
            assert!(JoinKeyContext::partition_index(hash) < PARTITION_FANOUT);
        }
    }

    #[test]
    fn forbidden_null_honors_null_safe_flag() {
        let chunk = key_chunk(vec![Some(1), None, Some(3)]);
        let plain = ctx(false).hash_chunk(&chunk).unwrap();
        assert_eq!(plain.forbidden_null, vec![false, true, false]);
        let null_safe = ctx(true).hash_chunk(&chunk).unwrap();
        assert_eq!(null_safe.forbidden_null, vec![false, false, false]);
    }

    #[test]
    fn level_cap_is_enforced() {
        let mut context = ctx(false);
        assert!(context.set_level(MAX_PARTITION_DEPTH - 1).is_ok());
        let err = context.set_level(MAX_PARTITION_DEPTH).unwrap_err();
        assert!(err.contains("max partition depth"), "err={}", err);
    }
}
