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
//! Buffered chunk stream with pin/unpin spill states.
//!
//! Responsibilities:
//! - Accumulates appended sub-chunks as pages charged against the buffer-pool
//!   client while pinned; flushes pages to a spill page file when unpinned.
//! - Supports re-pinning (read pages back into memory) and ordered reads with
//!   optional delete-on-read for one-pass consumption.
//!
//! Key exported interfaces:
//! - Types: `BufferedChunkStream`, `UnpinMode`.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;
use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::ipc_serde::{IpcSerde, SpillCodec, schema_hash};
use crate::exec::spill::page_file::{PageSlot, SpillPageFile};
use crate::gritstone_logging::debug;
use crate::runtime::buffer_pool::BufferPoolClient;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnpinMode {
    /// Flush every page and release the write buffer; no further appends are
    /// expected and zero bytes stay pinned.
    UnpinAll,
    /// Flush every page except the current write page; appends keep working
    /// with at most one resident page.
    UnpinAllExceptCurrent,
}

#[derive(Debug)]
struct Page {
    chunk: Option<Chunk>,
    slot: Option<PageSlot>,
    bytes: i64,
}

impl Page {
    fn is_resident(&self) -> bool {
        self.chunk.is_some()
    }
}

#[derive(Debug)]
pub struct BufferedChunkStream {
    label: String,
    schema: SchemaRef,
    schema_hash: u64,
    client: Arc<BufferPoolClient>,
    dirs: Arc<DirManager>,
    serde: IpcSerde,
    default_page_bytes: i64,
    max_page_bytes: i64,
    pages: Vec<Page>,
    spill_file: Option<SpillPageFile>,
    pinned: bool,
    write_buffer_reserved: bool,
    read_buffer_reserved: bool,
    read_pos: usize,
    delete_on_read: bool,
    num_rows: usize,
    byte_size: i64,
    bytes_pinned_pages: i64,
    closed: bool,
}

impl BufferedChunkStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        label: impl Into<String>,
        schema: SchemaRef,
        client: Arc<BufferPoolClient>,
        dirs: Arc<DirManager>,
        codec: SpillCodec,
        default_page_bytes: i64,
        max_page_bytes: i64,
    ) -> Result<Self, String> {
        let serde = IpcSerde::new(codec)?;
        let schema_hash = schema_hash(schema.as_ref());
        Ok(Self {
            label: label.into(),
            schema,
            schema_hash,
            client,
            dirs,
            serde,
            default_page_bytes,
            max_page_bytes,
            pages: Vec::new(),
            spill_file: None,
            pinned: true,
            write_buffer_reserved: false,
            read_buffer_reserved: false,
            read_pos: 0,
            delete_on_read: false,
            num_rows: 0,
            byte_size: 0,
            bytes_pinned_pages: 0,
            closed: false,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Total bytes appended to the stream, resident or spilled.
    pub fn byte_size(&self) -> i64 {
        self.byte_size
    }

    /// Bytes currently charged against the client: resident pages plus any
    /// held write/read buffers.
    pub fn bytes_pinned(&self) -> i64 {
        let mut bytes = self.bytes_pinned_pages;
        if self.write_buffer_reserved {
            bytes += self.default_page_bytes;
        }
        if self.read_buffer_reserved {
            bytes += self.default_page_bytes;
        }
        bytes
    }

    /// Acquire the write buffer. Returns false when the reservation cannot
    /// cover it.
    pub fn prepare_for_write(&mut self) -> Result<bool, String> {
        self.check_open()?;
        if self.write_buffer_reserved {
            return Ok(true);
        }
        if !self.client.try_consume(self.default_page_bytes) {
            return Ok(false);
        }
        self.write_buffer_reserved = true;
        Ok(true)
    }

    /// Append one sub-chunk as a page. Returns Ok(false) when the stream is
    /// pinned and the reservation cannot admit the page; the caller is
    /// expected to free memory (spill a partition) and retry.
    pub fn add_chunk(&mut self, chunk: &Chunk) -> Result<bool, String> {
        self.check_open()?;
        if chunk.is_empty() {
            return Ok(true);
        }
        if schema_hash(chunk.schema().as_ref()) != self.schema_hash {
            return Err(format!(
                "stream '{}' append schema mismatch",
                self.label
            ));
        }
        let bytes = i64::try_from(chunk.estimated_bytes()).unwrap_or(i64::MAX);
        if bytes > self.max_page_bytes {
            return Err(format!(
                "stream '{}' page of {} bytes exceeds max row buffer size {}",
                self.label, bytes, self.max_page_bytes
            ));
        }
        if self.pinned {
            if !self.client.try_consume(bytes) {
                return Ok(false);
            }
            self.push_page(Some(chunk.clone()), None, bytes, chunk.len());
            self.bytes_pinned_pages += bytes;
            return Ok(true);
        }
        // Unpinned: earlier pages live on disk. Flush the previous write page,
        // then keep the new page resident if memory allows, else write through.
        self.flush_resident_pages(self.pages.len())?;
        if self.client.try_consume(bytes) {
            self.push_page(Some(chunk.clone()), None, bytes, chunk.len());
            self.bytes_pinned_pages += bytes;
        } else {
            let slot = self.write_page_to_disk(chunk)?;
            self.push_page(None, Some(slot), bytes, chunk.len());
        }
        Ok(true)
    }

    /// Flush pages to disk. `UnpinAllExceptCurrent` keeps the current write
    /// page resident; `UnpinAll` flushes everything and drops the write
    /// buffer so that nothing stays pinned.
    pub fn unpin_stream(&mut self, mode: UnpinMode) -> Result<(), String> {
        self.check_open()?;
        match mode {
            UnpinMode::UnpinAllExceptCurrent => {
                let keep_from = self.pages.len().saturating_sub(1);
                self.flush_resident_pages(keep_from)?;
            }
            UnpinMode::UnpinAll => {
                self.flush_resident_pages(self.pages.len())?;
                if self.write_buffer_reserved {
                    self.client.release(self.default_page_bytes);
                    self.write_buffer_reserved = false;
                }
            }
        }
        if self.pinned {
            debug!(
                "stream '{}' unpinned: mode={:?} pages={} disk_bytes={}",
                self.label,
                mode,
                self.pages.len(),
                self.byte_size - self.bytes_pinned_pages
            );
        }
        self.pinned = false;
        Ok(())
    }

    /// Bring every page back into memory. Returns false when the reservation
    /// cannot admit the spilled bytes; the stream stays unpinned.
    pub fn pin_stream(&mut self) -> Result<bool, String> {
        self.check_open()?;
        if self.pinned {
            return Ok(true);
        }
        let needed: i64 = self
            .pages
            .iter()
            .filter(|p| !p.is_resident() && p.slot.is_some())
            .map(|p| p.bytes)
            .sum();
        if !self.client.try_consume(needed) {
            return Ok(false);
        }
        let mut materialized = 0i64;
        for idx in 0..self.pages.len() {
            if self.pages[idx].is_resident() || self.pages[idx].slot.is_none() {
                continue;
            }
            match self.read_page(idx) {
                Ok(chunk) => {
                    materialized += self.pages[idx].bytes;
                    self.pages[idx].chunk = Some(chunk);
                }
                Err(e) => {
                    self.client.release(needed - materialized);
                    self.bytes_pinned_pages += materialized;
                    return Err(e);
                }
            }
        }
        self.bytes_pinned_pages += needed;
        self.pinned = true;
        Ok(true)
    }

    /// Start a read pass from the first page. For unpinned streams a read
    /// buffer must be acquired; returns false when it does not fit.
    pub fn prepare_for_read(&mut self, delete_on_read: bool) -> Result<bool, String> {
        self.check_open()?;
        self.read_pos = 0;
        self.delete_on_read = delete_on_read;
        if !self.pinned && !self.read_buffer_reserved {
            if !self.client.try_consume(self.default_page_bytes) {
                return Ok(false);
            }
            self.read_buffer_reserved = true;
        }
        Ok(true)
    }

    /// Return the next page's chunk, or None at end of stream.
    pub fn get_next(&mut self) -> Result<Option<Chunk>, String> {
        self.check_open()?;
        while self.read_pos < self.pages.len() {
            let idx = self.read_pos;
            self.read_pos += 1;
            if self.pages[idx].chunk.is_none() && self.pages[idx].slot.is_none() {
                // Page already consumed by a previous delete-on-read pass.
                continue;
            }
            let chunk = match self.pages[idx].chunk.as_ref() {
                Some(chunk) => chunk.clone(),
                None => self.read_page(idx)?,
            };
            if self.delete_on_read {
                if self.pages[idx].is_resident() {
                    self.client.release(self.pages[idx].bytes);
                    self.bytes_pinned_pages -= self.pages[idx].bytes;
                }
                self.pages[idx].chunk = None;
                self.pages[idx].slot = None;
            }
            return Ok(Some(chunk));
        }
        self.release_read_buffer();
        Ok(None)
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.client.release(self.bytes_pinned_pages);
        self.bytes_pinned_pages = 0;
        if self.write_buffer_reserved {
            self.client.release(self.default_page_bytes);
            self.write_buffer_reserved = false;
        }
        self.release_read_buffer();
        self.pages.clear();
        self.spill_file = None;
        self.closed = true;
    }

    fn check_open(&self) -> Result<(), String> {
        if self.closed {
            return Err(format!("stream '{}' is closed", self.label));
        }
        Ok(())
    }

    fn push_page(
        &mut self,
        chunk: Option<Chunk>,
        slot: Option<PageSlot>,
        bytes: i64,
        num_rows: usize,
    ) {
        self.pages.push(Page { chunk, slot, bytes });
        self.num_rows += num_rows;
        self.byte_size += bytes;
    }

    /// Flush resident pages in `[0, end)` to the spill file and release their
    /// charges. Pages that already have an on-disk copy are not rewritten.
    fn flush_resident_pages(&mut self, end: usize) -> Result<(), String> {
        for idx in 0..end.min(self.pages.len()) {
            if !self.pages[idx].is_resident() {
                continue;
            }
            if self.pages[idx].slot.is_none() {
                let chunk = self.pages[idx]
                    .chunk
                    .as_ref()
                    .expect("resident page has chunk")
                    .clone();
                let slot = self.write_page_to_disk(&chunk)?;
                self.pages[idx].slot = Some(slot);
            }
            self.pages[idx].chunk = None;
            self.client.release(self.pages[idx].bytes);
            self.bytes_pinned_pages -= self.pages[idx].bytes;
        }
        Ok(())
    }

    fn write_page_to_disk(&mut self, chunk: &Chunk) -> Result<PageSlot, String> {
        let payload = self.serde.encode_record_batch(&chunk.batch)?;
        if self.spill_file.is_none() {
            let file =
                SpillPageFile::create(self.dirs.as_ref(), self.serde.codec(), self.schema_hash)?;
            debug!(
                "stream '{}' spill file created: {}",
                self.label,
                file.path().display()
            );
            self.spill_file = Some(file);
        }
        let file = self.spill_file.as_mut().expect("spill file just created");
        let num_rows = u32::try_from(chunk.len())
            .map_err(|_| "page row count overflows u32".to_string())?;
        file.append_page(&payload, num_rows)
    }

    fn read_page(&mut self, idx: usize) -> Result<Chunk, String> {
        let slot = self.pages[idx]
            .slot
            .clone()
            .ok_or_else(|| format!("stream '{}' page {} has no data", self.label, idx))?;
        let file = self
            .spill_file
            .as_mut()
            .ok_or_else(|| format!("stream '{}' has no spill file", self.label))?;
        let payload = file.read_page(&slot)?;
        let batch = self.serde.decode_record_batch(&self.schema, &payload)?;
        Chunk::try_new(batch)
    }

    fn release_read_buffer(&mut self) {
        if self.read_buffer_reserved {
            self.client.release(self.default_page_bytes);
            self.read_buffer_reserved = false;
        }
    }
}

impl Drop for BufferedChunkStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::path::PathBuf;
    use tempfile::tempdir;

    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;

    const PAGE: i64 = 4096;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("k", DataType::Int32, true),
            SlotId::new(1),
        )]))
    }

    fn chunk_of(values: Vec<i32>) -> Chunk {
        let batch =
            RecordBatch::try_new(test_schema(), vec![Arc::new(Int32Array::from(values))]).unwrap();
        Chunk::new(batch)
    }

    fn stream_with(
        reservation: i64,
        tmp: &std::path::Path,
    ) -> (Arc<BufferPoolClient>, BufferedChunkStream) {
        let client = Arc::new(BufferPoolClient::new("test", reservation));
        let dirs = Arc::new(DirManager::new(vec![PathBuf::from(tmp)]).unwrap());
        let stream = BufferedChunkStream::new(
            "build_rows",
            test_schema(),
            Arc::clone(&client),
            dirs,
            SpillCodec::None,
            PAGE,
            1 << 20,
        )
        .unwrap();
        (client, stream)
    }

    fn read_all(stream: &mut BufferedChunkStream) -> Vec<i32> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.get_next().unwrap() {
            let col = chunk.column_by_slot_id(SlotId::new(1)).unwrap();
            let col = col.as_any().downcast_ref::<Int32Array>().unwrap();
            out.extend(col.values().iter().copied());
        }
        out
    }

    #[test]
    fn pinned_append_and_ordered_read() {
        let tmp = tempdir().unwrap();
        let (_client, mut stream) = stream_with(1 << 20, tmp.path());
        assert!(stream.prepare_for_write().unwrap());
        assert!(stream.add_chunk(&chunk_of(vec![1, 2])).unwrap());
        assert!(stream.add_chunk(&chunk_of(vec![3])).unwrap());
        assert_eq!(stream.num_rows(), 3);
        assert!(stream.prepare_for_read(false).unwrap());
        assert_eq!(read_all(&mut stream), vec![1, 2, 3]);
    }

    #[test]
    fn unpin_all_leaves_zero_bytes_pinned() {
        let tmp = tempdir().unwrap();
        let (client, mut stream) = stream_with(1 << 20, tmp.path());
        assert!(stream.prepare_for_write().unwrap());
        assert!(stream.add_chunk(&chunk_of((0..100).collect())).unwrap());
        assert!(stream.bytes_pinned() > 0);
        stream.unpin_stream(UnpinMode::UnpinAll).unwrap();
        assert_eq!(stream.bytes_pinned(), 0);
        assert!(!stream.is_pinned());
        // Pages are gone from the client as well.
        assert_eq!(client.used(), 0);
        // Rows survive on disk.
        assert!(stream.prepare_for_read(false).unwrap());
        assert_eq!(read_all(&mut stream).len(), 100);
    }

    #[test]
    fn unpin_except_current_keeps_write_page() {
        let tmp = tempdir().unwrap();
        let (_client, mut stream) = stream_with(1 << 20, tmp.path());
        assert!(stream.prepare_for_write().unwrap());
        assert!(stream.add_chunk(&chunk_of(vec![1, 2])).unwrap());
        assert!(stream.add_chunk(&chunk_of(vec![3, 4])).unwrap());
        stream
            .unpin_stream(UnpinMode::UnpinAllExceptCurrent)
            .unwrap();
        // Write buffer plus the current page stay pinned.
        assert!(stream.bytes_pinned() > PAGE);
        // Appends continue against disk.
        assert!(stream.add_chunk(&chunk_of(vec![5])).unwrap());
        assert!(stream.prepare_for_read(false).unwrap());
        assert_eq!(read_all(&mut stream), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn pin_stream_restores_spilled_pages() {
        let tmp = tempdir().unwrap();
        let (_client, mut stream) = stream_with(1 << 20, tmp.path());
        assert!(stream.prepare_for_write().unwrap());
        assert!(stream.add_chunk(&chunk_of(vec![7, 8, 9])).unwrap());
        stream.unpin_stream(UnpinMode::UnpinAll).unwrap();
        assert!(stream.pin_stream().unwrap());
        assert!(stream.is_pinned());
        assert!(stream.prepare_for_read(false).unwrap());
        assert_eq!(read_all(&mut stream), vec![7, 8, 9]);
    }

    #[test]
    fn pin_fails_without_reservation() {
        let tmp = tempdir().unwrap();
        let (client, mut stream) = stream_with(1 << 20, tmp.path());
        assert!(stream.prepare_for_write().unwrap());
        assert!(stream.add_chunk(&chunk_of((0..512).collect())).unwrap());
        stream.unpin_stream(UnpinMode::UnpinAll).unwrap();
        // Exhaust the reservation so the pin cannot be admitted.
        let grab = client.unused_reservation();
        assert!(client.try_consume(grab));
        assert!(!stream.pin_stream().unwrap());
        assert!(!stream.is_pinned());
        client.release(grab);
    }

    #[test]
    fn append_fails_when_reservation_is_exhausted() {
        let tmp = tempdir().unwrap();
        let (_client, mut stream) = stream_with(PAGE + 512, tmp.path());
        assert!(stream.prepare_for_write().unwrap());
        // Write buffer took the page; a large chunk cannot be admitted.
        assert!(!stream.add_chunk(&chunk_of((0..2048).collect())).unwrap());
        // After unpinning, the same append goes to disk.
        stream
            .unpin_stream(UnpinMode::UnpinAllExceptCurrent)
            .unwrap();
        assert!(stream.add_chunk(&chunk_of((0..2048).collect())).unwrap());
    }

    #[test]
    fn delete_on_read_releases_pages() {
        let tmp = tempdir().unwrap();
        let (client, mut stream) = stream_with(1 << 20, tmp.path());
        assert!(stream.prepare_for_write().unwrap());
        assert!(stream.add_chunk(&chunk_of(vec![1])).unwrap());
        assert!(stream.add_chunk(&chunk_of(vec![2])).unwrap());
        let before = client.used();
        assert!(stream.prepare_for_read(true).unwrap());
        assert_eq!(read_all(&mut stream), vec![1, 2]);
        assert!(client.used() < before);
        // A second pass yields nothing.
        assert!(stream.prepare_for_read(true).unwrap());
        assert_eq!(read_all(&mut stream), Vec::<i32>::new());
    }

    #[test]
    fn close_releases_everything() {
        let tmp = tempdir().unwrap();
        let (client, mut stream) = stream_with(1 << 20, tmp.path());
        assert!(stream.prepare_for_write().unwrap());
        assert!(stream.add_chunk(&chunk_of(vec![1, 2, 3])).unwrap());
        stream.close();
        assert_eq!(client.used(), 0);
        assert!(stream.add_chunk(&chunk_of(vec![4])).is_err());
    }
}
