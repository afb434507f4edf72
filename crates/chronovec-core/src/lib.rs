#![cfg_attr(feature = "nightly-simd", feature(portable_simd))]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod distance;
pub mod error;

pub use config::{DistanceKind, IndexOptions, RuntimeConfig};
pub use error::{Error, Result};

/// Internal node identifier (dense, assigned on vector append).
pub type NodeId = u32;

/// Sentinel for "no entry point": the graph is empty.
pub const NO_ENTRY_POINT: i64 = -1;
