//! A complete serialized snapshot of the map, referenced by segment name
//! plus the control block's `dump_counter` generation.

use std::sync::atomic::Ordering;

use crate::control::ControlView;
use crate::error::{Error, Result};
use crate::segment::Segment;

const HEADER_LEN: usize = 6;
const SENTINEL: u8 = 0xFF;

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(SENTINEL);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.push(SENTINEL);
    out.extend_from_slice(payload);
    out
}

fn unframe(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < HEADER_LEN || bytes[0] != SENTINEL {
        return Err(Error::Corruption {
            position: 0,
            reason: "missing leading dump sentinel".to_string(),
        });
    }
    let len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    if bytes[5] != SENTINEL {
        return Err(Error::Corruption {
            position: 5,
            reason: "missing trailing dump sentinel".to_string(),
        });
    }
    bytes.get(HEADER_LEN..HEADER_LEN + len).ok_or_else(|| Error::Corruption {
        position: HEADER_LEN as u32,
        reason: format!("dump payload length {len} exceeds segment"),
    })
}

/// Where a freshly produced dump landed. Dynamic dumps return the still
/// mapped segment; the caller closes it once done (unmapping never unlinks
/// the underlying object, so later attachers still find it by name).
pub enum DumpTarget {
    Fixed,
    Dynamic { name: String, segment: Segment },
}

/// Serialize-and-publish a full snapshot. Caller must already hold the lock
/// and must have already folded any pending stream records into `payload`.
pub fn produce(base_name: &str, control: &ControlView, fixed: Option<&Segment>, payload: &[u8]) -> Result<DumpTarget> {
    let framed = frame(payload);

    let target = match fixed {
        Some(segment) => {
            if framed.len() > segment.size() {
                return Err(Error::DumpTooLarge {
                    needed: framed.len(),
                    available: segment.size(),
                });
            }
            segment.as_mut_slice()[..framed.len()].copy_from_slice(&framed);
            DumpTarget::Fixed
        }
        None => {
            let generation = control.dump_counter().load(Ordering::Relaxed) + 1;
            let name = format!("{base_name}_full_{generation}_{}", std::process::id());
            let segment = Segment::open_or_create(&name, framed.len())?;
            segment.as_mut_slice().copy_from_slice(&framed);
            DumpTarget::Dynamic { name, segment }
        }
    };

    if let DumpTarget::Dynamic { name, .. } = &target {
        let previous = control.read_dump_name();
        control.write_dump_name(name);
        control.dump_counter().fetch_add(1, Ordering::SeqCst);
        control.stream_end().store(0, Ordering::SeqCst);
        if !previous.is_empty() && previous != *name {
            let _ = Segment::unlink_by_name(&previous, true);
        }
    } else {
        control.dump_counter().fetch_add(1, Ordering::SeqCst);
        control.stream_end().store(0, Ordering::SeqCst);
    }

    tracing::debug!(base_name, generation = control.dump_counter().load(Ordering::Relaxed), "produced full dump");
    Ok(target)
}

/// Attach to the current dump and return its raw payload bytes, retrying a
/// handful of times to ride out a dump that was just unlinked by a writer
/// that has already moved on to a newer generation.
pub fn consume(control: &ControlView, fixed: Option<&Segment>) -> Result<Vec<u8>> {
    if let Some(segment) = fixed {
        return Ok(unframe(segment.as_slice())?.to_vec());
    }

    let mut attempts = 0;
    loop {
        let name = control.read_dump_name();
        if name.is_empty() {
            return Err(Error::Corruption {
                position: 0,
                reason: "no full dump has been produced yet".to_string(),
            });
        }

        match Segment::attach(&name) {
            Ok(segment) => {
                let payload = unframe(segment.as_slice())?.to_vec();
                segment.close();
                return Ok(payload);
            }
            Err(e) if attempts < 3 => {
                attempts += 1;
                tracing::warn!(name, attempts, "dump attach failed, retrying");
                std::thread::sleep(std::time::Duration::from_millis(1));
                let _ = e;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlView, TOTAL_LEN};

    fn unique(tag: &str) -> String {
        format!(
            "/sharedmap-test-dump-{tag}-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        )
    }

    #[test]
    fn fixed_dump_round_trips() {
        let name = unique("ctrl");
        let control_seg = Segment::open_or_create(&name, TOTAL_LEN).unwrap();
        let control = unsafe { ControlView::new(control_seg.as_ptr()) };
        let fixed = Segment::open_or_create(&unique("full"), 128).unwrap();

        let target = produce(&name, &control, Some(&fixed), b"hello world").unwrap();
        assert!(matches!(target, DumpTarget::Fixed));

        let payload = consume(&control, Some(&fixed)).unwrap();
        assert_eq!(payload, b"hello world");

        Segment::unlink_by_name(control_seg.name(), true).unwrap();
        Segment::unlink_by_name(fixed.name(), true).unwrap();
    }

    #[test]
    fn fixed_dump_too_large_is_rejected() {
        let name = unique("ctrl2");
        let control_seg = Segment::open_or_create(&name, TOTAL_LEN).unwrap();
        let control = unsafe { ControlView::new(control_seg.as_ptr()) };
        let fixed = Segment::open_or_create(&unique("full2"), 8).unwrap();

        let err = produce(&name, &control, Some(&fixed), b"too long for this segment").unwrap_err();
        assert!(matches!(err, Error::DumpTooLarge { .. }));

        Segment::unlink_by_name(control_seg.name(), true).unwrap();
        Segment::unlink_by_name(fixed.name(), true).unwrap();
    }

    #[test]
    fn dynamic_dump_publishes_name_and_bumps_counter() {
        let name = unique("ctrl3");
        let control_seg = Segment::open_or_create(&name, TOTAL_LEN).unwrap();
        let control = unsafe { ControlView::new(control_seg.as_ptr()) };

        let target = produce(&name, &control, None, b"first snapshot").unwrap();
        let first_name = match target {
            DumpTarget::Dynamic { name, segment } => {
                segment.close();
                name
            }
            DumpTarget::Fixed => panic!("expected dynamic target"),
        };
        assert_eq!(control.read_dump_name(), first_name);
        assert_eq!(control.dump_counter().load(std::sync::atomic::Ordering::Relaxed), 1);

        let payload = consume(&control, None).unwrap();
        assert_eq!(payload, b"first snapshot");

        let target = produce(&name, &control, None, b"second snapshot").unwrap();
        match target {
            DumpTarget::Dynamic { name: second_name, segment } => {
                segment.close();
                assert_ne!(second_name, first_name);
                assert_eq!(control.read_dump_name(), second_name);
            }
            DumpTarget::Fixed => panic!("expected dynamic target"),
        }
        assert_eq!(control.dump_counter().load(std::sync::atomic::Ordering::Relaxed), 2);
        // previous dynamic dump was unlinked as part of the second produce()
        assert!(Segment::attach(&first_name).is_err());

        Segment::unlink_by_name(control_seg.name(), true).unwrap();
        Segment::unlink_by_name(&control.read_dump_name(), true).unwrap();
    }

    #[test]
    fn consume_without_any_dump_yet_is_corruption() {
        let name = unique("ctrl4");
        let control_seg = Segment::open_or_create(&name, TOTAL_LEN).unwrap();
        let control = unsafe { ControlView::new(control_seg.as_ptr()) };

        assert!(matches!(consume(&control, None), Err(Error::Corruption { .. })));

        Segment::unlink_by_name(control_seg.name(), true).unwrap();
    }
}
