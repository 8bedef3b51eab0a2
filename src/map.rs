//! The per-process replica and catch-up engine: owns the control, stream and
//! dump segments for one map handle, and keeps a local `HashMap` in sync with
//! them by replaying update-stream records (falling back to a full dump on a
//! generation rollover) before every read-visible operation.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{de::DeserializeOwned, Serialize};

use crate::config::SharedMapConfig;
use crate::control::{self, ControlView};
use crate::dump::{self, DumpTarget};
use crate::error::{Error, Result};
use crate::lock::{LocalLock, MapLock, SharedLock};
use crate::segment::Segment;
use crate::serializer::{BincodeSerializer, Record, Serializer, OP_DELETE, OP_SET};
use crate::stream::{self, AppendOutcome};

static ANON_COUNTER: AtomicU32 = AtomicU32::new(0);

fn generate_name() -> String {
    let n = ANON_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/sharedmap-anon-{}-{n}", std::process::id())
}

/// Plain snapshot of the control block's fields, decoded to Rust values, for
/// debugging and diagnostics.
#[derive(Debug, Clone)]
pub struct Status {
    pub stream_end: u32,
    pub lock_pid: u32,
    pub dump_counter: u32,
    pub dump_name: String,
    pub shared_lock: bool,
    pub recurse: bool,
    pub local_stream_pos: u32,
    pub local_dump_counter: u32,
}

/// A shared, synchronized map backed by named POSIX shared-memory segments.
pub struct SharedMap<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    name: String,
    control_segment: Segment,
    stream_segment: Segment,
    fixed_dump_segment: Option<Segment>,
    lock: MapLock,
    created_by_us: bool,
    auto_unlink: bool,
    recurse: bool,
    replica: RefCell<HashMap<K, V>>,
    local_stream_pos: Cell<u32>,
    local_dump_counter: Cell<u32>,
    serializer: BincodeSerializer,
    closed: Cell<bool>,
}

impl<K, V> SharedMap<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn new(config: SharedMapConfig) -> Result<Self> {
        let name = config.name.clone().unwrap_or_else(generate_name);
        let stream_name = format!("{name}_memory");
        let full_name = format!("{name}_full");

        let control_segment = Segment::open_or_create(&name, control::TOTAL_LEN)?;
        let created_by_us = control_segment.created_by_us();

        let view = unsafe { ControlView::new(control_segment.as_ptr()) };

        if created_by_us {
            view.mark_initializing();
            view.stream_end().store(0, Ordering::Relaxed);
            view.lock_pid().store(0, Ordering::Relaxed);
            view.lock_byte().store(0, Ordering::Relaxed);
            view.dump_counter().store(0, Ordering::Relaxed);
            view.dump_static_size()
                .store(config.full_dump_size.unwrap_or(0), Ordering::Relaxed);
            view.set_flag(view.shared_lock_flag(), config.shared_lock);
            view.set_flag(view.recurse_flag(), config.recurse);
            view.write_dump_name("");
        } else {
            view.await_ready()?;
            let actual_shared_lock = view.get_flag(view.shared_lock_flag());
            if actual_shared_lock != config.shared_lock {
                return Err(Error::ParameterMismatch {
                    field: "shared_lock",
                    requested: config.shared_lock,
                    actual: actual_shared_lock,
                });
            }
            let actual_recurse = view.get_flag(view.recurse_flag());
            if actual_recurse != config.recurse {
                return Err(Error::ParameterMismatch {
                    field: "recurse",
                    requested: config.recurse,
                    actual: actual_recurse,
                });
            }
        }

        let stream_segment = if created_by_us {
            Segment::open_or_create(&stream_name, config.buffer_size as usize)?
        } else {
            Segment::attach(&stream_name)?
        };

        let dump_static_size = view.dump_static_size().load(Ordering::Relaxed);
        let fixed_dump_segment = if dump_static_size > 0 {
            Some(if created_by_us {
                Segment::open_or_create(&full_name, dump_static_size as usize)?
            } else {
                Segment::attach(&full_name)?
            })
        } else {
            None
        };

        let lock = if config.shared_lock {
            // SAFETY: the pointers refer into `control_segment`, which this
            // map keeps mapped for at least as long as `lock` lives.
            MapLock::Shared(unsafe { SharedLock::new(view.lock_byte() as *const _, view.lock_pid() as *const _) })
        } else {
            MapLock::Local(LocalLock::new())
        };

        let auto_unlink = config.auto_unlink.unwrap_or(created_by_us);

        let map = SharedMap {
            name,
            control_segment,
            stream_segment,
            fixed_dump_segment,
            lock,
            created_by_us,
            auto_unlink,
            recurse: config.recurse,
            replica: RefCell::new(HashMap::new()),
            local_stream_pos: Cell::new(0),
            local_dump_counter: Cell::new(0),
            serializer: BincodeSerializer,
            closed: Cell::new(false),
        };

        if created_by_us {
            view.mark_ready();
        } else {
            map.apply_update()?;
        }

        tracing::debug!(name = %map.name, created_by_us, "map handle ready");
        Ok(map)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_by_us(&self) -> bool {
        self.created_by_us
    }

    pub fn recurse_enabled(&self) -> bool {
        self.recurse
    }

    /// Size in bytes of this map's update-stream buffer, as actually
    /// allocated (not just requested) — for callers that need to derive a
    /// sibling segment's sizing from this one.
    pub fn buffer_size(&self) -> u32 {
        self.stream_segment.size() as u32
    }

    fn control(&self) -> ControlView {
        unsafe { ControlView::new(self.control_segment.as_ptr()) }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.get() {
            Err(Error::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    /// Lock-free catch-up: replay any stream records this handle hasn't
    /// seen yet, or reload from the latest full dump if the generation
    /// counter has moved past what the local replica was built from. Called
    /// before every read-visible operation and after acquiring the lock for
    /// a write.
    pub fn apply_update(&self) -> Result<()> {
        self.ensure_open()?;
        self.apply_update_inner(false)
    }

    fn apply_update_inner(&self, force_dump: bool) -> Result<()> {
        let control = self.control();
        let remote_dump_counter = control.dump_counter().load(Ordering::Acquire);

        if force_dump || self.local_dump_counter.get() < remote_dump_counter {
            return self.load_full_dump(remote_dump_counter);
        }

        let end = control.stream_end().load(Ordering::Acquire);
        let from = self.local_stream_pos.get();

        if from > end {
            // A writer reset stream_end for a new generation concurrently;
            // the dump-counter branch above will catch up next pass.
            return self.apply_update_inner(true);
        }

        match self.replay(from, end) {
            Ok(new_pos) => {
                self.local_stream_pos.set(new_pos);
                Ok(())
            }
            Err(Error::Corruption { .. }) => {
                let advanced = control.dump_counter().load(Ordering::Acquire);
                if advanced > self.local_dump_counter.get() {
                    self.apply_update_inner(true)
                } else {
                    self.lock.with_guard(|| {
                        let end = control.stream_end().load(Ordering::Acquire);
                        let pos = self.replay(self.local_stream_pos.get(), end)?;
                        self.local_stream_pos.set(pos);
                        Ok(())
                    })
                }
            }
            Err(e) => Err(e),
        }
    }

    fn replay(&self, from: u32, to: u32) -> Result<u32> {
        let mut replica = self.replica.borrow_mut();
        stream::for_each_record(&self.stream_segment, from, to, |payload| {
            let record: Record<K, V> = self.serializer.decode(payload)?;
            match record.op {
                OP_SET => {
                    replica.insert(record.key, record.value.ok_or_else(|| Error::Corruption {
                        position: from,
                        reason: "set record missing value".to_string(),
                    })?);
                }
                OP_DELETE => {
                    replica.remove(&record.key);
                }
                other => {
                    return Err(Error::Corruption {
                        position: from,
                        reason: format!("unknown record op {other}"),
                    })
                }
            }
            Ok(())
        })
    }

    fn load_full_dump(&self, hint_counter: u32) -> Result<()> {
        let control = self.control();
        let payload = dump::consume(&control, self.fixed_dump_segment.as_ref())?;
        let restored: HashMap<K, V> =
            bincode::deserialize(&payload).map_err(|e| Error::Serialization(e.to_string()))?;

        *self.replica.borrow_mut() = restored;
        let settled = control.dump_counter().load(Ordering::Acquire).max(hint_counter);
        self.local_dump_counter.set(settled);
        self.local_stream_pos.set(0);
        tracing::debug!(name = %self.name, dump_counter = settled, "loaded full dump");
        Ok(())
    }

    fn append_record(&self, record: Record<K, V>) -> Result<()> {
        let payload = Serializer::<Record<K, V>>::encode(&self.serializer, &record)?;
        match stream::append(&self.stream_segment, &self.control(), &payload)? {
            AppendOutcome::Written => Ok(()),
            AppendOutcome::Overflow => self.produce_full_dump(),
        }
    }

    fn produce_full_dump(&self) -> Result<()> {
        let payload = {
            let replica = self.replica.borrow();
            bincode::serialize(&*replica).map_err(|e| Error::Serialization(e.to_string()))?
        };

        let control = self.control();
        let target = dump::produce(&self.name, &control, self.fixed_dump_segment.as_ref(), &payload)?;
        if let DumpTarget::Dynamic { segment, .. } = target {
            segment.close();
        }

        self.local_dump_counter.set(control.dump_counter().load(Ordering::Acquire));
        self.local_stream_pos.set(0);
        tracing::warn!(name = %self.name, "update stream overflowed, produced full dump");
        Ok(())
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.ensure_open()?;
        self.apply_update()?;
        Ok(self.replica.borrow().get(key).cloned())
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.ensure_open()?;
        self.apply_update()?;
        Ok(self.replica.borrow().contains_key(key))
    }

    pub fn set(&self, key: K, value: V) -> Result<()> {
        self.ensure_open()?;
        self.lock.with_guard(|| {
            self.apply_update_inner(false)?;
            self.replica.borrow_mut().insert(key.clone(), value.clone());
            self.append_record(Record { op: OP_SET, key, value: Some(value) })
        })
    }

    pub fn delete(&self, key: &K) -> Result<bool> {
        self.ensure_open()?;
        self.lock.with_guard(|| {
            self.apply_update_inner(false)?;
            let existed = self.replica.borrow_mut().remove(key).is_some();
            if existed {
                self.append_record(Record {
                    op: OP_DELETE,
                    key: key.clone(),
                    value: None,
                })?;
            }
            Ok(existed)
        })
    }

    /// Bulk insert: one lock acquisition for the whole batch, instead of
    /// one per pair.
    pub fn update(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Result<()> {
        self.ensure_open()?;
        self.lock.with_guard(|| {
            self.apply_update_inner(false)?;
            for (key, value) in pairs {
                self.replica.borrow_mut().insert(key.clone(), value.clone());
                self.append_record(Record { op: OP_SET, key, value: Some(value) })?;
            }
            Ok(())
        })
    }

    /// Delete every currently known key as one batch under a single lock
    /// acquisition.
    pub fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.lock.with_guard(|| {
            self.apply_update_inner(false)?;
            let keys: Vec<K> = self.replica.borrow().keys().cloned().collect();
            for key in keys {
                self.replica.borrow_mut().remove(&key);
                self.append_record(Record { op: OP_DELETE, key, value: None })?;
            }
            Ok(())
        })
    }

    pub fn len(&self) -> Result<usize> {
        self.ensure_open()?;
        self.apply_update()?;
        Ok(self.replica.borrow().len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn keys(&self) -> Result<Vec<K>> {
        self.ensure_open()?;
        self.apply_update()?;
        Ok(self.replica.borrow().keys().cloned().collect())
    }

    pub fn values(&self) -> Result<Vec<V>> {
        self.ensure_open()?;
        self.apply_update()?;
        Ok(self.replica.borrow().values().cloned().collect())
    }

    /// Snapshot taken right after `apply_update()`; later changes made by
    /// other handles are not reflected in the returned vector.
    pub fn items(&self) -> Result<Vec<(K, V)>> {
        self.ensure_open()?;
        self.apply_update()?;
        Ok(self
            .replica
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    pub fn snapshot(&self) -> Result<HashMap<K, V>> {
        self.ensure_open()?;
        self.apply_update()?;
        Ok(self.replica.borrow().clone())
    }

    /// Plain decode of the control block's fields, for diagnostics.
    pub fn status(&self) -> Status {
        let control = self.control();
        Status {
            stream_end: control.stream_end().load(Ordering::Relaxed),
            lock_pid: control.lock_pid().load(Ordering::Relaxed),
            dump_counter: control.dump_counter().load(Ordering::Relaxed),
            dump_name: control.read_dump_name(),
            shared_lock: control.get_flag(control.shared_lock_flag()),
            recurse: control.get_flag(control.recurse_flag()),
            local_stream_pos: self.local_stream_pos.get(),
            local_dump_counter: self.local_dump_counter.get(),
        }
    }

    /// Remove all backing segments from the host namespace, regardless of
    /// `auto_unlink`, then close.
    pub fn unlink(&self) -> Result<()> {
        Segment::unlink_by_name(&self.name, true)?;
        Segment::unlink_by_name(&format!("{}_memory", self.name), true)?;
        Segment::unlink_by_name(&format!("{}_full", self.name), true)?;
        let dump_name = self.control().read_dump_name();
        if !dump_name.is_empty() {
            Segment::unlink_by_name(&dump_name, true)?;
        }
        self.closed.set(true);
        Ok(())
    }

    /// Idempotent; releases resources exactly once even if called N times.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        if self.auto_unlink {
            let _ = Segment::unlink_by_name(&self.name, true);
            let _ = Segment::unlink_by_name(&format!("{}_memory", self.name), true);
            let _ = Segment::unlink_by_name(&format!("{}_full", self.name), true);
            let dump_name = self.control().read_dump_name();
            if !dump_name.is_empty() {
                let _ = Segment::unlink_by_name(&dump_name, true);
            }
        }
    }
}

impl<K, V> Drop for SharedMap<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    fn drop(&mut self) {
        self.close();
    }
}

impl<K, V> std::fmt::Debug for SharedMap<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
    V: Clone + Serialize + DeserializeOwned + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let _ = self.apply_update();
        f.debug_struct("SharedMap")
            .field("name", &self.name)
            .field("replica", &self.replica.borrow())
            .finish()
    }
}

impl<K, V> PartialEq for SharedMap<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned,
    V: Clone + PartialEq + Serialize + DeserializeOwned,
{
    fn eq(&self, other: &Self) -> bool {
        let _ = self.apply_update();
        let _ = other.apply_update();
        *self.replica.borrow() == *other.replica.borrow()
    }
}
