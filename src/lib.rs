//! STRATA - LSM Segment Engine
//!
//! An embeddable, crash-recoverable key-value engine that keeps its data in
//! a stack of segments and compacts them in the background.
//!
//! ## Features
//! - **Segment zero**: mutable in-memory ordered map backed by a CRC32 WAL
//! - **Read-only queue**: frozen segments waiting to be merged
//! - **Disk segments**: sorted runs with a sparse index, optionally split
//!   into parts that later merges reuse without rewriting
//! - **Bottom segments**: oversized runs, merged on demand
//! - **Topology log**: durable record of which segments make up the engine
//! - **Iterators**: ordered, seekable, forward and reverse, with snapshot
//!   and auto-refresh modes
//! - **Metrics**: lock-free atomic counters for observability
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use strata::{Config, EngineOptions, IteratorMode, OptionDeletionPolicy, Strata};
//!
//! let options: EngineOptions<String, Option<String>> =
//!     EngineOptions::new(Config::new("./data"), Arc::new(OptionDeletionPolicy)).unwrap();
//! let engine = Strata::open(options).unwrap();
//!
//! engine.upsert("key".to_string(), Some("value".to_string())).unwrap();
//! engine.move_segment_zero_forward().unwrap();
//! engine.merge();
//!
//! for entry in engine.create_iterator(IteratorMode::NoRefresh).unwrap() {
//!     let (key, value) = entry.unwrap();
//!     println!("{} -> {:?}", key, value);
//! }
//! ```

pub mod comparer;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod options;
pub mod serializer;
pub mod types;

pub use config::Config;
pub use engine::iterator::StrataIterator;
pub use engine::maintainer::Maintainer;
pub use engine::{MergeHandle, Strata};
pub use error::{Result, StrataError};
pub use options::{DeletionPolicy, EngineOptions, FnDeletionPolicy, OptionDeletionPolicy};
pub use types::{DiskSegmentMode, IteratorMode, MergeResult, OpIndex, SegmentId};
