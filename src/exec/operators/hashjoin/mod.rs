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
pub mod join_hash_table;
pub mod key_context;
pub mod partition;
pub mod partitioned_join_builder;

pub use partition::Partition;
pub use partitioned_join_builder::{
    EqJoinConjunct, HashJoinState, HashPartitions, PartitionId, PartitionedJoinBuilder,
};

/// Number of partitions one build round fans out into.
pub const PARTITION_FANOUT: usize = 16;
/// Bits of the row hash that select the partition.
pub const NUM_PARTITIONING_BITS: u32 = 4;
/// Recursion cap for repartitioning spilled input.
pub const MAX_PARTITION_DEPTH: usize = 16;
/// Bucket ceiling for a single partition's hash table; partitioning consumes
/// the top hash bits, so buckets may only address the rest.
pub const MAX_HASH_BUCKETS: i64 = 1 << (32 - NUM_PARTITIONING_BITS);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftSemi,
    RightSemi,
    LeftAnti,
    RightAnti,
    NullAwareLeftAnti,
}

/// Join types that emit build rows left unmatched after probing.
pub fn needs_to_process_unmatched_build_rows(join_type: JoinType) -> bool {
    matches!(
        join_type,
        JoinType::RightOuter | JoinType::RightAnti | JoinType::FullOuter
    )
}

pub fn join_type_str(join_type: JoinType) -> &'static str {
    match join_type {
        JoinType::Inner => "INNER",
        JoinType::LeftOuter => "LEFT_OUTER",
        JoinType::RightOuter => "RIGHT_OUTER",
        JoinType::FullOuter => "FULL_OUTER",
        JoinType::LeftSemi => "LEFT_SEMI",
        JoinType::RightSemi => "RIGHT_SEMI",
        JoinType::LeftAnti => "LEFT_ANTI",
        JoinType::RightAnti => "RIGHT_ANTI",
        JoinType::NullAwareLeftAnti => "NULL_AWARE_LEFT_ANTI",
    }
}
