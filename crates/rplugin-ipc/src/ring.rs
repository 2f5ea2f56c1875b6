//! The lock-free single-producer/single-consumer ring that carries realtime
//! opcodes between client and server without ever blocking inside a process
//! callback.
//!
//! The header lives inside shared memory (spec §6's control region) so both
//! processes observe the same `head`/`tail`/`written` cursors; the backing
//! byte array sits immediately after it. All three cursors are bounded to
//! `[0, RING_CAPACITY)`, never ever-increasing, so the arithmetic below is
//! modular throughout rather than wrapping-subtraction on a monotonic count.

use std::sync::atomic::{AtomicI32, AtomicI8, Ordering};

use rplugin_core::{Error, Result, RING_CAPACITY};

use crate::opcode::Opcode;

const INVALIDATED: i8 = 1;
const VALID: i8 = 0;

/// The portion of the ring that must be byte-identical across the shared
/// mapping in both processes. Field order and types are load-bearing.
#[repr(C)]
pub struct RingHeader {
    /// Next byte the reader will consume.
    tail: AtomicI32,
    /// Next byte a fully committed write has published to the reader.
    head: AtomicI32,
    /// Next byte the writer will produce; equals `head` outside of an
    /// in-progress write.
    written: AtomicI32,
    /// Set by the writer when a write must be abandoned mid-flight so the
    /// reader never observes a partial message.
    invalidate_commit: AtomicI8,
    _padding: [u8; 3],
    buffer: [AtomicI8; RING_CAPACITY],
}

impl RingHeader {
    /// Placement-initializes a zeroed header in caller-provided memory. The
    /// memory must be at least `size_of::<RingHeader>()` bytes and must
    /// outlive every `SharedRing` built over it.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `size_of::<RingHeader>()` bytes and
    /// suitably aligned for `RingHeader`.
    pub unsafe fn init_at(ptr: *mut RingHeader) {
        ptr.write_bytes(0, 1);
    }
}

/// A cursor onto one end of a shared ring. `Reader`/`Writer` marker types
/// keep a process from accidentally calling the wrong half's methods on its
/// own role, mirroring how the original client only ever produces and the
/// server only ever consumes on a given ring instance.
pub struct SharedRing {
    header: *const RingHeader,
}

// SAFETY: `RingHeader`'s fields are all atomics; `SharedRing` only ever
// hands out `&RingHeader`, never a mutable reference to the pointee.
unsafe impl Send for SharedRing {}

impl SharedRing {
    /// Wraps an existing header already mapped into this process's address
    /// space (by `Transport`/`shm`).
    ///
    /// # Safety
    /// `header` must point to a live, initialized `RingHeader` for the
    /// entire lifetime of the returned `SharedRing`.
    #[must_use]
    pub const unsafe fn from_raw(header: *const RingHeader) -> Self {
        Self { header }
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: invariant upheld by `from_raw`'s caller.
        unsafe { &*self.header }
    }

    fn readable(&self) -> usize {
        let h = self.header();
        let head = i64::from(h.head.load(Ordering::Acquire));
        let tail = i64::from(h.tail.load(Ordering::Acquire));
        (head - tail).rem_euclid(RING_CAPACITY as i64) as usize
    }

    fn writable(&self) -> usize {
        let h = self.header();
        let written = i64::from(h.written.load(Ordering::Acquire));
        let tail = i64::from(h.tail.load(Ordering::Acquire));
        (RING_CAPACITY as i64 - 1 - (written - tail).rem_euclid(RING_CAPACITY as i64)) as usize
    }

    /// Writes `data` into the ring without publishing it to the reader.
    /// Returns `Err(ConnectionLost)` if there isn't room; the caller should
    /// treat that as fatal for this instance, same as the upstream
    /// implementation does for a stalled peer.
    fn write_raw(&self, data: &[u8]) -> Result<()> {
        let h = self.header();
        if h.invalidate_commit.load(Ordering::Acquire) == INVALIDATED {
            return Err(Error::ConnectionLost);
        }
        if self.writable() < data.len() {
            h.invalidate_commit.store(INVALIDATED, Ordering::Release);
            return Err(Error::ConnectionLost);
        }
        let written = h.written.load(Ordering::Acquire);
        for (i, &byte) in data.iter().enumerate() {
            let idx = (written as i64 + i as i64).rem_euclid(RING_CAPACITY as i64) as usize;
            h.buffer[idx].store(byte as i8, Ordering::Relaxed);
        }
        let new_written =
            (i64::from(written) + data.len() as i64).rem_euclid(RING_CAPACITY as i64) as i32;
        h.written.store(new_written, Ordering::Release);
        Ok(())
    }

    /// Publishes every byte written since the last commit to the reader, or
    /// rewinds `written` back to `head` if the write was abandoned.
    fn commit(&self) -> Result<()> {
        let h = self.header();
        if h.invalidate_commit.swap(VALID, Ordering::AcqRel) == INVALIDATED {
            let head = h.head.load(Ordering::Acquire);
            h.written.store(head, Ordering::Release);
            return Err(Error::ConnectionLost);
        }
        let written = h.written.load(Ordering::Acquire);
        h.head.store(written, Ordering::Release);
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes without advancing `tail`.
    fn read_raw(&self, buf: &mut [u8]) -> Result<()> {
        if self.readable() < buf.len() {
            return Err(Error::ConnectionLost);
        }
        let h = self.header();
        let tail = h.tail.load(Ordering::Acquire);
        for (i, slot) in buf.iter_mut().enumerate() {
            let idx = (i64::from(tail) + i as i64).rem_euclid(RING_CAPACITY as i64) as usize;
            *slot = h.buffer[idx].load(Ordering::Relaxed) as u8;
        }
        Ok(())
    }

    fn advance_tail(&self, count: usize) {
        let h = self.header();
        let tail = h.tail.load(Ordering::Acquire);
        let new_tail = (i64::from(tail) + count as i64).rem_euclid(RING_CAPACITY as i64) as i32;
        h.tail.store(new_tail, Ordering::Release);
    }

    // --- writer-side typed primitives -------------------------------------

    pub fn write_opcode(&self, opcode: Opcode) -> Result<()> {
        self.write_raw(&(opcode as i32).to_ne_bytes())
    }

    pub fn write_int(&self, value: i32) -> Result<()> {
        self.write_raw(&value.to_ne_bytes())
    }

    pub fn write_float(&self, value: f32) -> Result<()> {
        self.write_raw(&value.to_ne_bytes())
    }

    pub fn write_string(&self, value: &str) -> Result<()> {
        self.write_int(value.len() as i32)?;
        self.write_raw(value.as_bytes())
    }

    /// Layout: count, then `count` of (3 MIDI bytes + i32 frame offset).
    pub fn write_midi_batch(
        &self,
        events: &[crate::MidiEventWire],
    ) -> Result<()> {
        self.write_int(events.len() as i32)?;
        for event in events {
            self.write_raw(&event.bytes)?;
            self.write_int(event.frame_offset)?;
        }
        Ok(())
    }

    /// Commits everything written since the previous commit, publishing it
    /// to the reader. No-op (still returns the pending error) if the write
    /// had already been invalidated.
    pub fn commit_write(&self) -> Result<()> {
        self.commit()
    }

    // --- reader-side typed primitives -------------------------------------

    pub fn read_opcode(&self) -> Result<Opcode> {
        let mut buf = [0u8; 4];
        self.read_raw(&mut buf)?;
        self.advance_tail(4);
        let raw = i32::from_ne_bytes(buf);
        Opcode::from_i32(raw)
            .ok_or_else(|| Error::ProtocolViolation(format!("unknown opcode {raw}")))
    }

    pub fn read_int(&self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_raw(&mut buf)?;
        self.advance_tail(4);
        Ok(i32::from_ne_bytes(buf))
    }

    pub fn read_float(&self) -> Result<f32> {
        let mut buf = [0u8; 4];
        self.read_raw(&mut buf)?;
        self.advance_tail(4);
        Ok(f32::from_ne_bytes(buf))
    }

    pub fn read_string(&self) -> Result<String> {
        let len = self.read_int()?;
        if len < 0 || len as usize > RING_CAPACITY {
            return Err(Error::ProtocolViolation(format!(
                "implausible string length {len}"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.read_raw(&mut buf)?;
        self.advance_tail(buf.len());
        String::from_utf8(buf)
            .map_err(|e| Error::ProtocolViolation(format!("non-utf8 string: {e}")))
    }

    pub fn read_midi_batch(&self) -> Result<Vec<crate::MidiEventWire>> {
        let count = self.read_int()?;
        if count < 0 || count as usize > RING_CAPACITY / 7 {
            return Err(Error::ProtocolViolation(format!(
                "implausible midi batch count {count}"
            )));
        }
        let mut events = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut bytes = [0u8; 3];
            self.read_raw(&mut bytes)?;
            self.advance_tail(3);
            let frame_offset = self.read_int()?;
            events.push(crate::MidiEventWire {
                bytes,
                frame_offset,
            });
        }
        Ok(events)
    }

    /// Number of bytes immediately available to read without blocking.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.readable() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct Harness {
        ptr: *mut u8,
        layout: Layout,
    }

    impl Harness {
        fn new() -> Self {
            let layout = Layout::new::<RingHeader>();
            let ptr = unsafe { alloc_zeroed(layout) };
            Self { ptr, layout }
        }

        fn ring(&self) -> SharedRing {
            unsafe { SharedRing::from_raw(self.ptr.cast::<RingHeader>()) }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    #[test]
    fn readable_and_writable_sum_to_capacity_minus_one() {
        let h = Harness::new();
        let ring = h.ring();
        assert_eq!(ring.readable() + ring.writable(), RING_CAPACITY - 1);
    }

    #[test]
    fn write_then_commit_then_read_round_trips_exact_bytes() {
        let h = Harness::new();
        let ring = h.ring();
        ring.write_opcode(Opcode::SetParameter).unwrap();
        ring.write_int(7).unwrap();
        ring.write_float(0.5).unwrap();
        ring.commit_write().unwrap();

        assert_eq!(ring.read_opcode().unwrap(), Opcode::SetParameter);
        assert_eq!(ring.read_int().unwrap(), 7);
        assert!((ring.read_float().unwrap() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn string_round_trips_with_length_prefix() {
        let h = Harness::new();
        let ring = h.ring();
        ring.write_string("hello").unwrap();
        ring.commit_write().unwrap();
        assert_eq!(ring.read_string().unwrap(), "hello");
    }

    #[test]
    fn midi_batch_round_trips() {
        let h = Harness::new();
        let ring = h.ring();
        let events = vec![
            crate::MidiEventWire {
                bytes: [0x90, 60, 127],
                frame_offset: 0,
            },
            crate::MidiEventWire {
                bytes: [0x80, 60, 0],
                frame_offset: 128,
            },
        ];
        ring.write_midi_batch(&events).unwrap();
        ring.commit_write().unwrap();
        let read_back = ring.read_midi_batch().unwrap();
        assert_eq!(read_back.len(), 2);
        assert_eq!(read_back[0].bytes, [0x90, 60, 127]);
        assert_eq!(read_back[1].frame_offset, 128);
    }

    #[test]
    fn failed_write_leaves_no_trace_for_the_reader() {
        let h = Harness::new();
        let ring = h.ring();
        // Force an over-large write to trip invalidation.
        let huge = vec![0u8; RING_CAPACITY];
        let err = ring.write_raw(&huge).unwrap_err();
        assert!(matches!(err, Error::ConnectionLost));
        // Nothing was published: a commit attempt also reports the loss,
        // and head/tail/written stay where they started.
        assert!(ring.commit().is_err());
        assert_eq!(ring.readable(), 0);
    }

    #[test]
    fn exactly_capacity_minus_one_bytes_fit_in_one_write() {
        let h = Harness::new();
        let ring = h.ring();
        let data = vec![0xABu8; RING_CAPACITY - 1];
        ring.write_raw(&data).unwrap();
        ring.commit().unwrap();
        assert_eq!(ring.readable(), RING_CAPACITY - 1);
    }

    #[test]
    fn writes_wrap_around_the_backing_array() {
        let h = Harness::new();
        let ring = h.ring();
        // Push tail/head/written forward near the end of the buffer first.
        let warm = vec![0u8; RING_CAPACITY - 4];
        ring.write_raw(&warm).unwrap();
        ring.commit().unwrap();
        let mut sink = vec![0u8; RING_CAPACITY - 4];
        ring.read_raw(&mut sink).unwrap();
        ring.advance_tail(sink.len());

        // Now a write of 8 bytes straddles the wrap point.
        ring.write_int(0x1122_3344).unwrap();
        ring.write_int(0x5566_7788u32 as i32).unwrap();
        ring.commit().unwrap();
        assert_eq!(ring.read_int().unwrap(), 0x1122_3344);
        assert_eq!(ring.read_int().unwrap(), 0x5566_7788u32 as i32);
    }
}
