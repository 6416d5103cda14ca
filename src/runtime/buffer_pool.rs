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
//! Buffer-pool client handle and named sub-reservations.
//!
//! The client is the single memory authority for an operator: stream pages and
//! hash-table buckets are admitted against its reservation, and probe-side
//! memory is earmarked through a named `SubReservation` that can be saved,
//! restored and transferred without releasing the underlying budget.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Handle onto a reservation granted by the shared buffer pool.
///
/// `used` covers both live allocations and bytes earmarked in sub-reservations;
/// `unused_reservation` is what remains available for admission.
#[derive(Debug)]
pub struct BufferPoolClient {
    label: String,
    reservation: AtomicI64,
    used: AtomicI64,
}

impl BufferPoolClient {
    pub fn new(label: impl Into<String>, reservation: i64) -> Self {
        Self {
            label: label.into(),
            reservation: AtomicI64::new(reservation.max(0)),
            used: AtomicI64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn reservation(&self) -> i64 {
        self.reservation.load(Ordering::Acquire)
    }

    pub fn used(&self) -> i64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn unused_reservation(&self) -> i64 {
        self.reservation() - self.used()
    }

    /// Admit `bytes` against the reservation. Returns false without side
    /// effects when the reservation cannot cover them.
    pub fn try_consume(&self, bytes: i64) -> bool {
        if bytes <= 0 {
            return true;
        }
        let reservation = self.reservation();
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            if used + bytes > reservation {
                return false;
            }
            match self.used.compare_exchange(
                used,
                used + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => used = actual,
            }
        }
    }

    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Move `bytes` of unused reservation into the sub-reservation. The bytes
    /// stay counted against this client but cannot be consumed until restored.
    pub fn save_reservation(&self, sub: &SubReservation, bytes: i64) -> Result<(), String> {
        if bytes <= 0 {
            return Ok(());
        }
        if !self.try_consume(bytes) {
            return Err(format!(
                "cannot save {} bytes into sub-reservation '{}': {}",
                bytes,
                sub.label(),
                self.debug_string()
            ));
        }
        sub.saved.fetch_add(bytes, Ordering::AcqRel);
        Ok(())
    }

    /// Move `bytes` back from the sub-reservation into the unused reservation.
    pub fn restore_reservation(&self, sub: &SubReservation, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let prev = sub.saved.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "restoring more than was saved");
        self.release(bytes);
    }

    pub fn debug_string(&self) -> String {
        format!(
            "BufferPoolClient(label={} reservation={} used={} unused={})",
            self.label,
            self.reservation(),
            self.used(),
            self.unused_reservation()
        )
    }
}

/// Named earmark of reservation held on behalf of another consumer.
#[derive(Debug)]
pub struct SubReservation {
    label: String,
    saved: AtomicI64,
    closed: AtomicBool,
}

impl SubReservation {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            saved: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn get_reservation(&self) -> i64 {
        self.saved.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Return any remaining saved bytes to the client and mark closed.
    pub fn close(&self, client: &BufferPoolClient) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let remaining = self.saved.swap(0, Ordering::AcqRel);
        client.release(remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_respects_reservation() {
        let client = BufferPoolClient::new("test", 100);
        assert!(client.try_consume(60));
        assert!(!client.try_consume(50));
        assert_eq!(client.unused_reservation(), 40);
        client.release(20);
        assert!(client.try_consume(50));
        assert_eq!(client.unused_reservation(), 10);
    }

    #[test]
    fn save_and_restore_roundtrip() {
        let client = BufferPoolClient::new("test", 100);
        let sub = SubReservation::new("probe_stream_reservation");
        client.save_reservation(&sub, 30).unwrap();
        assert_eq!(sub.get_reservation(), 30);
        assert_eq!(client.unused_reservation(), 70);
        // Earmarked bytes are not available for consumption.
        assert!(!client.try_consume(80));
        client.restore_reservation(&sub, 30);
        assert_eq!(sub.get_reservation(), 0);
        assert_eq!(client.unused_reservation(), 100);
    }

    #[test]
    fn save_beyond_unused_fails() {
        let client = BufferPoolClient::new("test", 100);
        assert!(client.try_consume(90));
        let sub = SubReservation::new("probe_stream_reservation");
        let err = client.save_reservation(&sub, 20).unwrap_err();
        assert!(err.contains("cannot save"), "err={}", err);
        assert_eq!(sub.get_reservation(), 0);
    }

    #[test]
    fn close_returns_remaining_bytes() {
        let client = BufferPoolClient::new("test", 100);
        let sub = SubReservation::new("probe_stream_reservation");
        client.save_reservation(&sub, 25).unwrap();
        sub.close(&client);
        assert!(sub.is_closed());
        assert_eq!(client.unused_reservation(), 100);
    }
}
