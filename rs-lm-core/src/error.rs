use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Every failure the engine can report.
///
/// Data warnings (a malformed ARPA record, a duplicate word) are not errors:
/// they are logged with `log::warn!` and the offending record is skipped.
#[derive(Error, Debug)]
pub enum LmError {
	/// A tuning parameter or an input value is out of its legal range.
	#[error("invalid configuration: {0}")]
	Config(String),

	/// An input file does not follow the expected layout.
	#[error("format error: {0}")]
	Format(String),

	/// The model does not fit the fixed-width fields of the tree.
	#[error("model too large: {0}")]
	TooLarge(String),

	/// An I/O operation failed. `what` names the field or step.
	#[error("I/O error while {what}: {source}")]
	Io {
		what: String,
		#[source]
		source: io::Error,
	},

	/// Mutation requested on a model that was loaded read-only.
	#[error("model is not writable")]
	ReadOnly,

	/// A word is absent from the vocabulary and no `<UNK>` fallback applies.
	#[error("unknown word: {0}")]
	UnknownWord(String),

	/// Class definition or class membership problem.
	#[error("class error: {0}")]
	Class(String),

	/// A discounted probability ended above 1.0 while writing a model.
	#[error("probability {prob} > 1.0 for {ngram}")]
	ProbabilityOverflow { ngram: String, prob: f64 },

	/// Snapshot (de)serialization failure.
	#[error("snapshot error: {0}")]
	Snapshot(#[from] postcard::Error),

	/// Configuration file could not be parsed.
	#[error("config file {path}: {source}")]
	ConfigFile {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},
}

pub type Result<T> = std::result::Result<T, LmError>;

/// Attaches a label to a raw I/O error.
pub(crate) trait IoContext<T> {
	fn context(self, what: &str) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
	fn context(self, what: &str) -> Result<T> {
		self.map_err(|source| LmError::Io { what: what.to_owned(), source })
	}
}
