//! Tunable parameters of the engine, loadable from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IoContext, LmError, Result};
use crate::logmath::DEFAULT_BASE;

/// Sentence-boundary and unknown-word symbols.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Symbols {
	pub start: String,
	pub end: String,
	pub unknown: String,
}

impl Default for Symbols {
	fn default() -> Self {
		Self { start: "<s>".to_owned(), end: "</s>".to_owned(), unknown: "<UNK>".to_owned() }
	}
}

/// Occupancy policy of vocabulary hash tables.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HashConfig {
	pub max_occupancy: f64,
	pub growth_ratio: f64,
	pub warn_on_update: bool,
}

impl Default for HashConfig {
	fn default() -> Self {
		Self { max_occupancy: 0.5, growth_ratio: 2.0, warn_on_update: true }
	}
}

/// Engine configuration.
///
/// Every field has a default, so an empty TOML document is valid.
///
/// ```toml
/// lw = 6.5
/// wip = 0.2
/// uw = 1.0
///
/// [symbols]
/// unknown = "<unk>"
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LmConfig {
	/// Language weight.
	pub lw: f32,
	/// Word insertion penalty (linear).
	pub wip: f32,
	/// Unigram weight (interpolation with the uniform distribution).
	pub uw: f32,
	/// Base of the integer logarithms.
	pub log_base: f64,
	pub symbols: Symbols,
	pub hash: HashConfig,
}

impl Default for LmConfig {
	fn default() -> Self {
		Self {
			lw: 1.0,
			wip: 1.0,
			uw: 1.0,
			log_base: DEFAULT_BASE,
			symbols: Symbols::default(),
			hash: HashConfig::default(),
		}
	}
}

impl LmConfig {
	/// Parses a TOML document.
	pub fn from_toml_str(text: &str) -> Result<Self> {
		let config: Self = toml::from_str(text)
			.map_err(|source| LmError::ConfigFile { path: PathBuf::from("<inline>"), source })?;
		config.validate()?;
		Ok(config)
	}

	/// Reads a TOML file.
	pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
		let path = path.as_ref();
		let text = fs::read_to_string(path).context(&format!("reading {}", path.display()))?;
		let config: Self = toml::from_str(&text)
			.map_err(|source| LmError::ConfigFile { path: path.to_path_buf(), source })?;
		config.validate()?;
		Ok(config)
	}

	/// Checks the ranges the scoring engine relies on.
	pub fn validate(&self) -> Result<()> {
		if self.lw <= 0.0 {
			return Err(LmError::Config(format!("language weight must be positive, got {}", self.lw)));
		}
		if self.wip <= 0.0 {
			return Err(LmError::Config(format!("word insertion penalty must be positive, got {}", self.wip)));
		}
		if !(0.0..=1.0).contains(&self.uw) {
			return Err(LmError::Config(format!("unigram weight must be in [0, 1], got {}", self.uw)));
		}
		if self.log_base <= 1.0 {
			return Err(LmError::Config(format!("log base must exceed 1, got {}", self.log_base)));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn empty_document_gives_defaults() {
		assert_eq!(LmConfig::from_toml_str("").unwrap(), LmConfig::default());
	}

	#[test]
	fn partial_document_overrides_fields() {
		let cfg = LmConfig::from_toml_str("lw = 6.5\n[symbols]\nunknown = \"<unk>\"\n").unwrap();
		assert_eq!(cfg.lw, 6.5);
		assert_eq!(cfg.symbols.unknown, "<unk>");
		assert_eq!(cfg.symbols.start, "<s>");
	}

	#[test]
	fn out_of_range_weight_is_rejected() {
		assert!(matches!(LmConfig::from_toml_str("uw = 1.5"), Err(LmError::Config(_))));
	}

	#[test]
	fn load_from_file() {
		let dir = tempdir().expect("temp dir");
		let path = dir.path().join("lm.toml");
		fs::write(&path, "wip = 0.5\n").unwrap();
		assert_eq!(LmConfig::load(&path).unwrap().wip, 0.5);
	}
}
