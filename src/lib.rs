//! A synchronized, streaming map backed by named POSIX shared-memory
//! segments: multiple independent processes attach to the same control
//! segment, serialize writes through a byte-wide atomic lock, and catch up
//! opportunistically by replaying an append-only update stream or loading a
//! full dump when the stream overflows.
//!
//! The entry points are [`SharedMap`] for the common, statically-typed
//! key/value case, and [`recurse::NestedMap`] for the dynamically-typed,
//! recursively-nested variant.

pub mod config;
pub mod control;
pub mod dump;
pub mod error;
pub mod lock;
pub mod map;
pub mod recurse;
pub mod segment;
pub mod serializer;
pub mod stream;

pub use config::SharedMapConfig;
pub use error::{Error, Result};
pub use map::{SharedMap, Status};
pub use recurse::NestedMap;
pub use segment::Segment;
pub use serializer::{BincodeSerializer, ChildRef, Serializer, Value};
