//! Backoff n-gram language model library.
//!
//! This crate provides:
//! - A trigram scoring model with backoff, word classes and a context cache
//! - ARPA text reading and writing
//! - Count models built from text, with pluggable discounting
//! - A compact binary format for count models
//!
//! Scoring uses integer logarithms in a configurable base (see [`logmath`]).

/// Binary count-model files (`write_bin`, `read_bin`).
pub mod binlm;

/// ARPA text format, shared by scoring and count models.
pub mod arpa;

/// Engine configuration, loadable from TOML.
pub mod config;

/// Count trees, discounting and the count-model builder.
pub mod counts;

/// Error type of the crate.
pub mod error;

/// Integer logarithms.
pub mod logmath;

/// The scoring model, its vocabulary, classes and iterators.
pub mod model;

/// Open-addressing word → id table with a binary layout.
pub mod sih;

/// I/O utilities (line readers, path helpers, binary fields).
///
/// Not exposed
pub(crate) mod io;

pub use config::LmConfig;
pub use error::{LmError, Result};
pub use model::{ModelRef, NgramModel};
