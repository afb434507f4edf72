#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod blob;
mod pmap;
mod vector_store;

pub use blob::{BlobStore, FsBlobStore, MemBlobStore, ROOTS_KEY};
pub use pmap::{hex_key, PersistentMap};
pub use vector_store::VectorStore;
