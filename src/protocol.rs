//! Allocation event protocol.
//!
//! The allocator reports allocation, pinning, degraded-mode, and
//! collection events to an [`AllocObserver`]. Observation is
//! best-effort diagnostics: a missing or failing observer never
//! affects allocation behavior.
//!
//! [`BinaryEventLog`] is the bundled observer. It encodes each event
//! as a tag byte followed by a fixed 24-byte little-endian payload,
//! buffers records, and flushes them to its sink at collection
//! boundaries so a trace always ends on a consistent epoch.

use std::io::Write;

use log::warn;
use parking_lot::Mutex;

use crate::object::VTable;
use crate::Generation;

/// Sink for allocator events.
///
/// All methods default to no-ops so observers implement only what
/// they care about. Methods may be called concurrently from multiple
/// threads, including from the lock-free allocation path.
pub trait AllocObserver: Send + Sync {
    /// A small object was allocated in the nursery.
    fn alloc(&self, _addr: usize, _vtable: &'static VTable, _size: usize) {}

    /// A pinned object was allocated.
    fn alloc_pinned(&self, _addr: usize, _vtable: &'static VTable, _size: usize) {}

    /// An object was allocated in the old generation under pressure.
    fn alloc_degraded(&self, _addr: usize, _vtable: &'static VTable, _size: usize) {}

    /// A collection is about to run.
    fn collection_begin(&self, _generation: Generation, _requested: usize) {}

    /// A collection finished.
    fn collection_end(&self, _generation: Generation) {}
}

/// Observer that discards every event.
pub struct NoopObserver;

impl AllocObserver for NoopObserver {}

// =============================================================================
// Binary Event Log
// =============================================================================

/// Buffered bytes before the log forces a flush.
const EVENT_BUFFER_SIZE: usize = 64 * 1024;

/// Bytes per payload; every record is `1 + PAYLOAD_SIZE` bytes.
const PAYLOAD_SIZE: usize = 24;

const TAG_ALLOC: u8 = 1;
const TAG_ALLOC_PINNED: u8 = 2;
const TAG_ALLOC_DEGRADED: u8 = 3;
const TAG_COLLECTION_BEGIN: u8 = 4;
const TAG_COLLECTION_END: u8 = 5;

struct LogInner {
    buffer: Vec<u8>,
    sink: Box<dyn Write + Send>,
}

impl LogInner {
    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Err(e) = self.sink.write_all(&self.buffer) {
            warn!("event log write failed: {}", e);
        }
        if let Err(e) = self.sink.flush() {
            warn!("event log flush failed: {}", e);
        }
        self.buffer.clear();
    }

    fn append(&mut self, tag: u8, payload: [u64; 3]) {
        if self.buffer.len() + 1 + PAYLOAD_SIZE > EVENT_BUFFER_SIZE {
            self.flush();
        }
        self.buffer.push(tag);
        for word in payload {
            self.buffer.extend_from_slice(&word.to_le_bytes());
        }
    }
}

/// Observer that writes a binary event trace.
///
/// Allocation records carry the object address, its size, and the
/// descriptor's address for offline correlation. Collection records
/// carry the generation and the request that triggered them.
pub struct BinaryEventLog {
    inner: Mutex<LogInner>,
}

impl BinaryEventLog {
    /// Create a log writing to `sink`.
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                buffer: Vec::with_capacity(EVENT_BUFFER_SIZE),
                sink,
            }),
        }
    }

    /// Write out everything buffered so far.
    pub fn flush(&self) {
        self.inner.lock().flush();
    }

    fn record(&self, tag: u8, payload: [u64; 3]) {
        self.inner.lock().append(tag, payload);
    }
}

fn descriptor_id(vtable: &'static VTable) -> u64 {
    vtable as *const VTable as usize as u64
}

impl AllocObserver for BinaryEventLog {
    fn alloc(&self, addr: usize, vtable: &'static VTable, size: usize) {
        self.record(TAG_ALLOC, [addr as u64, size as u64, descriptor_id(vtable)]);
    }

    fn alloc_pinned(&self, addr: usize, vtable: &'static VTable, size: usize) {
        self.record(
            TAG_ALLOC_PINNED,
            [addr as u64, size as u64, descriptor_id(vtable)],
        );
    }

    fn alloc_degraded(&self, addr: usize, vtable: &'static VTable, size: usize) {
        self.record(
            TAG_ALLOC_DEGRADED,
            [addr as u64, size as u64, descriptor_id(vtable)],
        );
    }

    fn collection_begin(&self, generation: Generation, requested: usize) {
        // Pending records belong to the epoch that is ending; push
        // them out before the boundary marker.
        let mut inner = self.inner.lock();
        inner.flush();
        inner.append(
            TAG_COLLECTION_BEGIN,
            [generation as u64, requested as u64, 0],
        );
        inner.flush();
    }

    fn collection_end(&self, generation: Generation) {
        let mut inner = self.inner.lock();
        inner.append(TAG_COLLECTION_END, [generation as u64, 0, 0]);
        inner.flush();
    }
}

impl Drop for BinaryEventLog {
    fn drop(&mut self) {
        self.inner.get_mut().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    static WIDGET: VTable = VTable::new("widget", 32);

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn bytes(&self) -> Vec<u8> {
            self.0.lock().clone()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn read_u64(bytes: &[u8], offset: usize) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[offset..offset + 8]);
        u64::from_le_bytes(word)
    }

    #[test]
    fn test_alloc_event_encoding() {
        let sink = SharedSink::default();
        let log = BinaryEventLog::new(Box::new(sink.clone()));

        log.alloc(0x1000, &WIDGET, 64);
        assert!(sink.bytes().is_empty()); // still buffered

        log.flush();
        let bytes = sink.bytes();
        assert_eq!(bytes.len(), 25);
        assert_eq!(bytes[0], TAG_ALLOC);
        assert_eq!(read_u64(&bytes, 1), 0x1000);
        assert_eq!(read_u64(&bytes, 9), 64);
        assert_eq!(read_u64(&bytes, 17), &WIDGET as *const VTable as u64);
    }

    #[test]
    fn test_collection_flushes_pending_events() {
        let sink = SharedSink::default();
        let log = BinaryEventLog::new(Box::new(sink.clone()));

        log.alloc(0x1000, &WIDGET, 64);
        log.collection_begin(Generation::Nursery, 128);

        let bytes = sink.bytes();
        assert_eq!(bytes.len(), 50);
        assert_eq!(bytes[0], TAG_ALLOC);
        assert_eq!(bytes[25], TAG_COLLECTION_BEGIN);
        assert_eq!(read_u64(&bytes, 26), Generation::Nursery as u64);
        assert_eq!(read_u64(&bytes, 34), 128);
    }

    #[test]
    fn test_drop_flushes() {
        let sink = SharedSink::default();
        {
            let log = BinaryEventLog::new(Box::new(sink.clone()));
            log.alloc_pinned(0x2000, &WIDGET, 32);
        }
        let bytes = sink.bytes();
        assert_eq!(bytes.len(), 25);
        assert_eq!(bytes[0], TAG_ALLOC_PINNED);
    }

    #[test]
    fn test_full_buffer_flushes_itself() {
        let sink = SharedSink::default();
        let log = BinaryEventLog::new(Box::new(sink.clone()));

        let records = EVENT_BUFFER_SIZE / 25 + 10;
        for i in 0..records {
            log.alloc(0x1000 + i * 8, &WIDGET, 8);
        }
        assert!(!sink.bytes().is_empty());

        log.flush();
        assert_eq!(sink.bytes().len(), records * 25);
    }
}
