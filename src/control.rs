//! Fixed 1,000-byte header holding the stream and full-dump bookkeeping
//! fields, little-endian unsigned encoding.
//!
//! A single `magic: AtomicU32` handshake word is kept just ahead of this
//! region (see `MAGIC_LEN`) purely to let an attacher wait out a creator
//! that is still initializing the segment; it is not part of the
//! wire-visible control-block layout below.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

pub const MAGIC_LEN: usize = 4;
pub const CONTROL_LEN: usize = 1000;
pub const TOTAL_LEN: usize = MAGIC_LEN + CONTROL_LEN;

const MAGIC_INITIALIZING: u32 = 0x0000_0000;
const MAGIC_READY: u32 = 0xcafe_babe;

const OFF_STREAM_END: usize = MAGIC_LEN + 0;
const OFF_LOCK_PID: usize = MAGIC_LEN + 4;
const OFF_LOCK_BYTE: usize = MAGIC_LEN + 8;
const OFF_DUMP_COUNTER: usize = MAGIC_LEN + 10;
const OFF_DUMP_STATIC_SIZE: usize = MAGIC_LEN + 14;
const OFF_SHARED_LOCK_FLAG: usize = MAGIC_LEN + 18;
const OFF_RECURSE_FLAG: usize = MAGIC_LEN + 19;
const OFF_DUMP_NAME: usize = MAGIC_LEN + 20;
pub const DUMP_NAME_LEN: usize = 255;

/// A typed view over the control block's bytes. Does not own the memory; the
/// caller (`crate::map::SharedMap`) keeps the backing `Segment` alive.
pub struct ControlView {
    base: *mut u8,
}

unsafe impl Send for ControlView {}
unsafe impl Sync for ControlView {}

impl ControlView {
    /// # Safety
    /// `base` must point at a writable region of at least `TOTAL_LEN` bytes,
    /// live for as long as the returned view is used.
    pub unsafe fn new(base: *mut u8) -> Self {
        ControlView { base }
    }

    unsafe fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        &*self.base.add(offset).cast::<AtomicU32>()
    }

    unsafe fn atomic_u8(&self, offset: usize) -> &AtomicU8 {
        &*self.base.add(offset).cast::<AtomicU8>()
    }

    pub fn magic(&self) -> &AtomicU32 {
        unsafe { self.atomic_u32(0) }
    }

    pub fn stream_end(&self) -> &AtomicU32 {
        unsafe { self.atomic_u32(OFF_STREAM_END) }
    }

    pub fn lock_pid(&self) -> &AtomicU32 {
        unsafe { self.atomic_u32(OFF_LOCK_PID) }
    }

    pub fn lock_byte(&self) -> &AtomicU8 {
        unsafe { self.atomic_u8(OFF_LOCK_BYTE) }
    }

    pub fn dump_counter(&self) -> &AtomicU32 {
        unsafe { self.atomic_u32(OFF_DUMP_COUNTER) }
    }

    pub fn dump_static_size(&self) -> &AtomicU32 {
        unsafe { self.atomic_u32(OFF_DUMP_STATIC_SIZE) }
    }

    pub fn shared_lock_flag(&self) -> &AtomicU8 {
        unsafe { self.atomic_u8(OFF_SHARED_LOCK_FLAG) }
    }

    pub fn recurse_flag(&self) -> &AtomicU8 {
        unsafe { self.atomic_u8(OFF_RECURSE_FLAG) }
    }

    fn dump_name_bytes(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base.add(OFF_DUMP_NAME), DUMP_NAME_LEN) }
    }

    pub fn read_dump_name(&self) -> String {
        let bytes = self.dump_name_bytes();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    pub fn write_dump_name(&self, name: &str) {
        assert!(name.len() <= DUMP_NAME_LEN, "dump segment name too long");
        let bytes = self.dump_name_bytes();
        bytes.fill(0);
        bytes[..name.len()].copy_from_slice(name.as_bytes());
    }

    pub fn set_flag(&self, flag: &AtomicU8, value: bool) {
        flag.store(if value { b'1' } else { 0 }, Ordering::Relaxed);
    }

    pub fn get_flag(&self, flag: &AtomicU8) -> bool {
        flag.load(Ordering::Relaxed) == b'1'
    }

    /// Block (bounded) until a just-created control block finishes its
    /// in-place initialization.
    pub fn await_ready(&self) -> crate::error::Result<()> {
        for _ in 0..1000 {
            match self.magic().load(Ordering::SeqCst) {
                MAGIC_INITIALIZING => std::thread::sleep(std::time::Duration::from_millis(1)),
                m if m == MAGIC_READY => return Ok(()),
                other => {
                    return Err(crate::error::Error::Corruption {
                        position: 0,
                        reason: format!("control block has unknown magic 0x{other:08x}"),
                    })
                }
            }
        }
        Err(crate::error::Error::Corruption {
            position: 0,
            reason: "control block did not finish initialization before timeout".to_string(),
        })
    }

    pub fn mark_initializing(&self) {
        self.magic().store(MAGIC_INITIALIZING, Ordering::SeqCst);
    }

    pub fn mark_ready(&self) {
        self.magic().store(MAGIC_READY, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets_match_spec() {
        assert_eq!(OFF_STREAM_END - MAGIC_LEN, 0);
        assert_eq!(OFF_LOCK_PID - MAGIC_LEN, 4);
        assert_eq!(OFF_LOCK_BYTE - MAGIC_LEN, 8);
        assert_eq!(OFF_DUMP_COUNTER - MAGIC_LEN, 10);
        assert_eq!(OFF_DUMP_STATIC_SIZE - MAGIC_LEN, 14);
        assert_eq!(OFF_SHARED_LOCK_FLAG - MAGIC_LEN, 18);
        assert_eq!(OFF_RECURSE_FLAG - MAGIC_LEN, 19);
        assert_eq!(OFF_DUMP_NAME - MAGIC_LEN, 20);
        // dump_name occupies [20, 275); the remaining bytes up to the fixed
        // 1,000-byte control block are reserved padding.
        assert!(OFF_DUMP_NAME - MAGIC_LEN + DUMP_NAME_LEN <= CONTROL_LEN);
    }

    #[test]
    fn round_trips_fields() {
        let mut buf = vec![0u8; TOTAL_LEN];
        let view = unsafe { ControlView::new(buf.as_mut_ptr()) };

        view.stream_end().store(42, Ordering::Relaxed);
        assert_eq!(view.stream_end().load(Ordering::Relaxed), 42);

        view.write_dump_name("/sharedmap-full-7");
        assert_eq!(view.read_dump_name(), "/sharedmap-full-7");

        view.set_flag(view.recurse_flag(), true);
        assert!(view.get_flag(view.recurse_flag()));
        view.set_flag(view.recurse_flag(), false);
        assert!(!view.get_flag(view.recurse_flag()));
    }
}
