//! An append-only log of framed `0xFF len:u32 0xFF payload` records inside
//! a fixed-size buffer segment.

use std::sync::atomic::Ordering;

use crate::control::ControlView;
use crate::error::{Error, Result};
use crate::segment::Segment;

pub const HEADER_LEN: u32 = 6;
const SENTINEL: u8 = 0xFF;

pub enum AppendOutcome {
    Written,
    Overflow,
}

/// Write a frame at `[stream_end, stream_end+payload.len()+6)`, publishing
/// the payload before the `stream_end` advance so a reader who observes the
/// new end also observes a complete frame. Caller must already hold the lock.
pub fn append(buffer: &Segment, control: &ControlView, payload: &[u8]) -> Result<AppendOutcome> {
    let start = control.stream_end().load(Ordering::Relaxed);
    let frame_len = HEADER_LEN + payload.len() as u32;

    if start as u64 + frame_len as u64 > buffer.size() as u64 {
        return Ok(AppendOutcome::Overflow);
    }

    let start = start as usize;
    let slice = buffer.as_mut_slice();
    slice[start] = SENTINEL;
    slice[start + 1..start + 5].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    slice[start + 5] = SENTINEL;
    slice[start + 6..start + 6 + payload.len()].copy_from_slice(payload);

    control
        .stream_end()
        .store(start as u32 + frame_len, Ordering::Release);
    Ok(AppendOutcome::Written)
}

/// Replay records in `[from, to)`, calling `f` with each payload slice in
/// order. Returns the position reached (`to` on full success).
pub fn for_each_record(
    buffer: &Segment,
    from: u32,
    to: u32,
    mut f: impl FnMut(&[u8]) -> Result<()>,
) -> Result<u32> {
    let slice = buffer.as_slice();
    let mut pos = from;

    while pos < to {
        let p = pos as usize;
        if slice.get(p).copied() != Some(SENTINEL) {
            return Err(Error::Corruption {
                position: pos,
                reason: "expected leading frame sentinel".to_string(),
            });
        }
        let len_bytes = slice.get(p + 1..p + 5).ok_or_else(|| Error::Corruption {
            position: pos,
            reason: "truncated frame length".to_string(),
        })?;
        let len = u32::from_le_bytes(len_bytes.try_into().unwrap());
        if slice.get(p + 5).copied() != Some(SENTINEL) {
            return Err(Error::Corruption {
                position: pos + 5,
                reason: "expected trailing frame sentinel".to_string(),
            });
        }

        let payload_start = p + 6;
        let payload_end = payload_start + len as usize;
        let payload = slice.get(payload_start..payload_end).ok_or_else(|| Error::Corruption {
            position: pos,
            reason: format!("frame length {len} overruns stream buffer"),
        })?;

        f(payload)?;
        pos = payload_end as u32;
    }

    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlView, TOTAL_LEN};
    use std::sync::atomic::Ordering as O;

    fn unique(tag: &str) -> String {
        format!(
            "/sharedmap-test-stream-{tag}-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        )
    }

    #[test]
    fn append_then_replay_records_in_order() {
        let control_seg = Segment::open_or_create(&unique("ctrl"), TOTAL_LEN).unwrap();
        let control = unsafe { ControlView::new(control_seg.as_ptr()) };
        let buffer = Segment::open_or_create(&unique("buf"), 256).unwrap();

        assert!(matches!(append(&buffer, &control, b"one").unwrap(), AppendOutcome::Written));
        assert!(matches!(append(&buffer, &control, b"two").unwrap(), AppendOutcome::Written));

        let mut seen = Vec::new();
        let end = control.stream_end().load(O::Relaxed);
        let reached = for_each_record(&buffer, 0, end, |payload| {
            seen.push(payload.to_vec());
            Ok(())
        })
        .unwrap();

        assert_eq!(reached, end);
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);

        Segment::unlink_by_name(control_seg.name(), true).unwrap();
        Segment::unlink_by_name(buffer.name(), true).unwrap();
    }

    #[test]
    fn append_reports_overflow_instead_of_writing_past_buffer() {
        let control_seg = Segment::open_or_create(&unique("ctrl2"), TOTAL_LEN).unwrap();
        let control = unsafe { ControlView::new(control_seg.as_ptr()) };
        let buffer = Segment::open_or_create(&unique("buf2"), 8).unwrap();

        assert!(matches!(append(&buffer, &control, b"toolong").unwrap(), AppendOutcome::Overflow));
        assert_eq!(control.stream_end().load(O::Relaxed), 0);

        Segment::unlink_by_name(control_seg.name(), true).unwrap();
        Segment::unlink_by_name(buffer.name(), true).unwrap();
    }

    #[test]
    fn replay_detects_corrupted_sentinel() {
        let control_seg = Segment::open_or_create(&unique("ctrl3"), TOTAL_LEN).unwrap();
        let control = unsafe { ControlView::new(control_seg.as_ptr()) };
        let buffer = Segment::open_or_create(&unique("buf3"), 64).unwrap();

        append(&buffer, &control, b"ok").unwrap();
        buffer.as_mut_slice()[0] = 0x00;

        let end = control.stream_end().load(O::Relaxed);
        assert!(matches!(
            for_each_record(&buffer, 0, end, |_| Ok(())),
            Err(Error::Corruption { .. })
        ));

        Segment::unlink_by_name(control_seg.name(), true).unwrap();
        Segment::unlink_by_name(buffer.name(), true).unwrap();
    }
}
