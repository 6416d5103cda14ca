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
//! Per-stream spill page file.
//!
//! One file backs one buffered chunk stream. Pages (encoded chunks) are
//! appended as the stream unpins them and read back by the offsets the owning
//! stream remembers; the page index lives with the stream, not on disk. The
//! file starts with a fixed header so a foreign file can be rejected early.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::ipc_serde::SpillCodec;

const PAGE_FILE_MAGIC: [u8; 4] = *b"GSPL";
const PAGE_FILE_VERSION: u16 = 1;
const PAGE_FILE_HEADER_LEN: u16 = 24;

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(0);

/// Location of one page inside the file, kept by the owning stream.
#[derive(Debug, Clone)]
pub struct PageSlot {
    pub offset: u64,
    pub length: u64,
    pub checksum: u32,
    pub num_rows: u32,
}

#[derive(Debug)]
pub struct SpillPageFile {
    file: File,
    path: PathBuf,
    write_offset: u64,
}

impl SpillPageFile {
    pub fn create(
        dirs: &DirManager,
        codec: SpillCodec,
        schema_hash: u64,
    ) -> Result<Self, String> {
        let mut attempts = 0;
        let (path, mut file) = loop {
            let dir = dirs.next_dir();
            let id = NEXT_FILE_ID.fetch_add(1, Ordering::AcqRel);
            let filename = format!("spill_{:x}_{:x}.gspl", std::process::id(), id);
            let path = dir.join(filename);
            match OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path)
            {
                Ok(file) => break (path, file),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempts < 3 => {
                    attempts += 1;
                    continue;
                }
                Err(err) => {
                    return Err(format!(
                        "create spill file {} failed: {err}",
                        path.display()
                    ));
                }
            }
        };

        let header = encode_header(codec, schema_hash);
        file.write_all(&header)
            .map_err(|e| format!("write spill file header failed: {e}"))?;
        Ok(Self {
            file,
            path,
            write_offset: PAGE_FILE_HEADER_LEN as u64,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn append_page(&mut self, payload: &[u8], num_rows: u32) -> Result<PageSlot, String> {
        let offset = self.write_offset;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| format!("seek spill file {} failed: {e}", self.path.display()))?;
        self.file
            .write_all(payload)
            .map_err(|e| format!("write spill page to {} failed: {e}", self.path.display()))?;
        self.write_offset += payload.len() as u64;
        Ok(PageSlot {
            offset,
            length: payload.len() as u64,
            checksum: crc32c::crc32c(payload),
            num_rows,
        })
    }

    pub fn read_page(&mut self, slot: &PageSlot) -> Result<Vec<u8>, String> {
        let mut buf = vec![0u8; slot.length as usize];
        self.file
            .seek(SeekFrom::Start(slot.offset))
            .map_err(|e| format!("seek spill page in {} failed: {e}", self.path.display()))?;
        self.file
            .read_exact(&mut buf)
            .map_err(|e| format!("read spill page from {} failed: {e}", self.path.display()))?;
        let checksum = crc32c::crc32c(&buf);
        if checksum != slot.checksum {
            return Err(format!(
                "spill page checksum mismatch in {}: expected {:#x}, got {:#x}",
                self.path.display(),
                slot.checksum,
                checksum
            ));
        }
        Ok(buf)
    }
}

impl Drop for SpillPageFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn encode_header(codec: SpillCodec, schema_hash: u64) -> [u8; PAGE_FILE_HEADER_LEN as usize] {
    let mut buf = [0u8; PAGE_FILE_HEADER_LEN as usize];
    buf[..4].copy_from_slice(&PAGE_FILE_MAGIC);
    buf[4..6].copy_from_slice(&PAGE_FILE_VERSION.to_le_bytes());
    buf[6..8].copy_from_slice(&PAGE_FILE_HEADER_LEN.to_le_bytes());
    buf[8] = codec.as_u8();
    buf[16..24].copy_from_slice(&schema_hash.to_le_bytes());
    buf
}

/// Validate a page-file header, returning its codec and schema hash.
pub fn decode_header(buf: &[u8]) -> Result<(SpillCodec, u64), String> {
    if buf.len() < PAGE_FILE_HEADER_LEN as usize {
        return Err("spill file header is too small".to_string());
    }
    if buf[..4] != PAGE_FILE_MAGIC {
        return Err("spill file header magic mismatch".to_string());
    }
    let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
    if version != PAGE_FILE_VERSION {
        return Err(format!("unsupported spill file version: {version}"));
    }
    let header_len = u16::from_le_bytes(buf[6..8].try_into().unwrap());
    if header_len != PAGE_FILE_HEADER_LEN {
        return Err(format!("unsupported spill file header length: {header_len}"));
    }
    let codec = SpillCodec::try_from(buf[8])?;
    let schema_hash = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    Ok((codec, schema_hash))
}
