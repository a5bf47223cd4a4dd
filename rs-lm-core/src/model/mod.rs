//! The scoring model: a unigram → bigram → trigram backoff tree.
//!
//! This module provides:
//! - The model itself with its vocabulary and weights (`NgramModel`)
//! - Shared ownership of a loaded model (`ModelRef`)
//! - Word classes (`NgramClass`)
//! - Backoff scoring and in-order iteration

/// Word classes and class-definition files.
pub mod class;

/// N-gram iteration (`mgrams`, `successors`, `ngram_iter`).
pub mod iter;

/// Compact tree storage and its builder. Internal.
pub(crate) mod lm3g;

/// The model type, file dispatch and vocabulary operations.
pub mod ngram_model;

/// Backoff scoring.
mod score;

/// Postcard snapshots (`.lmdump`).
pub(crate) mod snapshot;

/// Trigram context cache. Internal.
mod tginfo;

pub use class::{ClassDef, NgramClass};
pub use iter::{NgramEntry, NgramIter};
pub use ngram_model::{CaseFold, ModelFileType, ModelRef, NgramModel};

/// Id returned for words that are not in the vocabulary.
pub const INVALID_WID: i32 = -1;
