#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

mod cache;
mod chunk;
mod store;

pub use cache::ChunkCache;
pub use chunk::{decode_addr, encode_addr, Chunk};
pub use store::{ChunkResolver, EdgeGeometry, EdgeStore, ALLOC_STRIPES, NODE_STRIPES};
