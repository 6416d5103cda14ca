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
use std::fmt;
use std::io::Cursor;

use arrow::array::RecordBatch;
use arrow::datatypes::{Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::ipc::{CompressionType, MetadataVersion};

const IPC_ALIGNMENT: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillCodec {
    None,
    Lz4,
    Zstd,
}

impl SpillCodec {
    pub fn as_u8(self) -> u8 {
        match self {
            SpillCodec::None => 0,
            SpillCodec::Lz4 => 1,
            SpillCodec::Zstd => 2,
        }
    }

    pub fn from_str(value: &str) -> Result<Self, String> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "none" => Ok(SpillCodec::None),
            "lz4" => Ok(SpillCodec::Lz4),
            "zstd" => Ok(SpillCodec::Zstd),
            _ => Err(format!("unsupported spill ipc compression: {value}")),
        }
    }
}

impl TryFrom<u8> for SpillCodec {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SpillCodec::None),
            1 => Ok(SpillCodec::Lz4),
            2 => Ok(SpillCodec::Zstd),
            _ => Err(format!("unknown spill codec value: {value}")),
        }
    }
}

impl fmt::Display for SpillCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpillCodec::None => write!(f, "none"),
            SpillCodec::Lz4 => write!(f, "lz4"),
            SpillCodec::Zstd => write!(f, "zstd"),
        }
    }
}

/// Encodes one chunk payload as a self-contained arrow IPC stream.
#[derive(Debug, Clone)]
pub struct IpcSerde {
    codec: SpillCodec,
    write_options: IpcWriteOptions,
}

impl IpcSerde {
    pub fn new(codec: SpillCodec) -> Result<Self, String> {
        let write_options = build_ipc_write_options(codec)?;
        Ok(Self {
            codec,
            write_options,
        })
    }

    pub fn codec(&self) -> SpillCodec {
        self.codec
    }

    pub fn encode_record_batch(&self, batch: &RecordBatch) -> Result<Vec<u8>, String> {
        let mut buffer = Vec::new();
        let mut writer = StreamWriter::try_new_with_options(
            &mut buffer,
            batch.schema().as_ref(),
            self.write_options.clone(),
        )
        .map_err(map_arrow_err)?;
        writer.write(batch).map_err(map_arrow_err)?;
        writer.finish().map_err(map_arrow_err)?;
        drop(writer);
        Ok(buffer)
    }

    pub fn decode_record_batch(
        &self,
        schema: &SchemaRef,
        payload: &[u8],
    ) -> Result<RecordBatch, String> {
        let reader = StreamReader::try_new(Cursor::new(payload), None).map_err(map_arrow_err)?;
        if schema_hash(reader.schema().as_ref()) != schema_hash(schema.as_ref()) {
            return Err("spill page schema mismatch".to_string());
        }
        let mut batch = None;
        for message in reader {
            let decoded = message.map_err(map_arrow_err)?;
            if batch.is_some() {
                return Err("spill page contained more than one record batch".to_string());
            }
            batch = Some(decoded);
        }
        batch.ok_or_else(|| "spill page did not contain a record batch".to_string())
    }
}

pub fn schema_hash(schema: &Schema) -> u64 {
    fn fnv1a(bytes: &[u8]) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;
        let mut hash = FNV_OFFSET;
        for byte in bytes {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    let schema_str = schema.to_string();
    fnv1a(schema_str.as_bytes())
}

fn build_ipc_write_options(codec: SpillCodec) -> Result<IpcWriteOptions, String> {
    let options = IpcWriteOptions::try_new(IPC_ALIGNMENT, false, MetadataVersion::V5)
        .map_err(map_arrow_err)?;
    match codec {
        SpillCodec::None => Ok(options),
        SpillCodec::Lz4 => options
            .try_with_compression(Some(CompressionType::LZ4_FRAME))
            .map_err(map_arrow_err),
        SpillCodec::Zstd => options
            .try_with_compression(Some(CompressionType::ZSTD))
            .map_err(map_arrow_err),
    }
}

fn map_arrow_err(err: ArrowError) -> String {
    format!("arrow ipc error: {err}")
}
