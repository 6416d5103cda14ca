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
//! Block bloom filter for build-side runtime filtering.
//!
//! 32-byte buckets of eight salted lanes; one bit is set per lane per key.
//! Probing a key touches a single bucket, which keeps the scan-side cost of
//! applying the filter to one cache line per row.

const SALT: [u32; 8] = [
    0x47b6137b, 0x44974d91, 0x8824ad5b, 0xa2b7289d, 0x705495c7, 0x2df1424b, 0x9efc4947, 0x5c6bfb31,
];

const LANES_PER_BUCKET: usize = 8;
const BUCKET_BYTES: i64 = 32;

#[derive(Clone, Debug)]
pub struct RuntimeBloomFilter {
    log_num_buckets: u32,
    directory_mask: u32,
    directory: Vec<u32>,
}

impl RuntimeBloomFilter {
    /// Size the filter from the declared filter size in bytes, rounded down to
    /// a power-of-two bucket count. A minimum of one bucket is always kept.
    pub fn with_size_bytes(size_bytes: i64) -> Self {
        let buckets = (size_bytes / BUCKET_BYTES).max(1) as u64;
        // Largest power-of-two bucket count that fits in the declared size.
        let log_num_buckets = 63 - buckets.leading_zeros();
        Self::with_log_num_buckets(log_num_buckets)
    }

    fn with_log_num_buckets(log_num_buckets: u32) -> Self {
        let bucket_count = 1usize << log_num_buckets;
        Self {
            log_num_buckets,
            directory_mask: (bucket_count - 1) as u32,
            directory: vec![0u32; bucket_count * LANES_PER_BUCKET],
        }
    }

    pub fn size_bytes(&self) -> i64 {
        (self.directory.len() * 4) as i64
    }

    pub fn insert_hash(&mut self, hash: u64) {
        let bucket_idx = (hash as u32) & self.directory_mask;
        let key = (hash >> self.log_num_buckets) as u32;
        let masks = make_mask(key);
        let base = bucket_idx as usize * LANES_PER_BUCKET;
        for (lane, mask) in masks.iter().enumerate() {
            self.directory[base + lane] |= mask;
        }
    }

    pub fn might_contain_hash(&self, hash: u64) -> bool {
        let bucket_idx = (hash as u32) & self.directory_mask;
        let key = (hash >> self.log_num_buckets) as u32;
        let masks = make_mask(key);
        let base = bucket_idx as usize * LANES_PER_BUCKET;
        masks
            .iter()
            .enumerate()
            .all(|(lane, mask)| self.directory[base + lane] & mask == *mask)
    }

    /// Estimated false-positive probability of a filter of `size_bytes` after
    /// `observed_rows` distinct insertions.
    pub fn estimate_fp_rate(size_bytes: i64, observed_rows: i64) -> f64 {
        if observed_rows <= 0 {
            return 0.0;
        }
        let bits = (size_bytes.max(BUCKET_BYTES) * 8) as f64;
        let lanes = LANES_PER_BUCKET as f64;
        let fill = 1.0 - (-lanes * observed_rows as f64 / bits).exp();
        fill.powf(lanes)
    }
}

fn make_mask(key: u32) -> [u32; LANES_PER_BUCKET] {
    let mut masks = [0u32; LANES_PER_BUCKET];
    for (i, salt) in SALT.iter().enumerate() {
        masks[i] = 1u32 << (key.wrapping_mul(*salt) >> 27);
    }
    masks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut filter = RuntimeBloomFilter::with_size_bytes(64 * 1024);
        let hashes: Vec<u64> = (0..1000u64).map(|i| i.wrapping_mul(0x9e3779b97f4a7c15)).collect();
        for h in &hashes {
            filter.insert_hash(*h);
        }
        for h in &hashes {
            assert!(filter.might_contain_hash(*h));
        }
    }

    #[test]
    fn rejects_most_absent_keys() {
        let mut filter = RuntimeBloomFilter::with_size_bytes(64 * 1024);
        for i in 0..1000u64 {
            filter.insert_hash(i.wrapping_mul(0x9e3779b97f4a7c15));
        }
        let mut hits = 0;
        for i in 1000..2000u64 {
            if filter.might_contain_hash(i.wrapping_mul(0xc2b2ae3d27d4eb4f)) {
                hits += 1;
            }
        }
        // Generously bounded; the expected rate at this fill factor is far below 5%.
        assert!(hits < 50, "too many false positives: {hits}");
    }

    #[test]
    fn sizing_rounds_to_power_of_two_buckets() {
        let filter = RuntimeBloomFilter::with_size_bytes(1000);
        assert_eq!(filter.size_bytes(), 16 * 32);
        let tiny = RuntimeBloomFilter::with_size_bytes(1);
        assert_eq!(tiny.size_bytes(), 32);
    }

    #[test]
    fn fp_rate_grows_with_rows() {
        let low = RuntimeBloomFilter::estimate_fp_rate(1024, 100);
        let high = RuntimeBloomFilter::estimate_fp_rate(1024, 100_000);
        assert!(low < high);
        assert!(high > 0.9);
    }
}
