//! Postcard snapshot of a scoring model (`.lmdump`).
//!
//! A snapshot stores the tree exactly as held in memory, with the weights
//! that were active when it was written. Models loaded from a snapshot are
//! read-only until casefolded.

use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use super::class::{self, NgramClass, MAX_CLASSES};
use super::lm3g::Lm3g;
use super::ngram_model::NgramModel;
use crate::config::{HashConfig, LmConfig, Symbols};
use crate::error::{IoContext, LmError, Result};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotOut<'a> {
	version: u32,
	log_base: f64,
	symbols: &'a Symbols,
	hash: &'a HashConfig,
	n: usize,
	words: &'a [String],
	wids: Vec<i32>,
	lm3g: &'a Lm3g,
	classes: &'a [NgramClass],
	weights: Weights,
}

#[derive(Deserialize)]
struct SnapshotIn {
	version: u32,
	log_base: f64,
	symbols: Symbols,
	hash: HashConfig,
	n: usize,
	words: Vec<String>,
	wids: Vec<i32>,
	lm3g: Lm3g,
	classes: Vec<NgramClass>,
	weights: Weights,
}

#[derive(Serialize, Deserialize)]
struct Weights {
	lw: f32,
	log_wip: i32,
	log_uw: i32,
	log_uniform: i32,
	log_uniform_weight: i32,
}

pub(crate) fn save<P: AsRef<Path>>(model: &NgramModel, path: P) -> Result<()> {
	let path = path.as_ref();
	let snapshot = SnapshotOut {
		version: SNAPSHOT_VERSION,
		log_base: model.lmath.base(),
		symbols: &model.symbols,
		hash: model.hash_config(),
		n: model.n,
		words: &model.word_str,
		wids: model.vocab_ids(),
		lm3g: &model.lm3g,
		classes: &model.classes,
		weights: Weights {
			lw: model.lw,
			log_wip: model.log_wip,
			log_uw: model.log_uw,
			log_uniform: model.log_uniform,
			log_uniform_weight: model.log_uniform_weight,
		},
	};
	let bytes = postcard::to_stdvec(&snapshot)?;
	fs::write(path, bytes).context(&format!("writing {}", path.display()))?;
	info!("snapshot of {} words written to {}", model.word_str.len(), path.display());
	Ok(())
}

pub(crate) fn load<P: AsRef<Path>>(path: P) -> Result<NgramModel> {
	let path = path.as_ref();
	let bytes = fs::read(path).context(&format!("reading {}", path.display()))?;
	let snapshot: SnapshotIn = postcard::from_bytes(&bytes)?;
	if snapshot.version != SNAPSHOT_VERSION {
		return Err(LmError::Format(format!(
			"snapshot version {} (expected {SNAPSHOT_VERSION})",
			snapshot.version
		)));
	}
	check_structure(&snapshot)?;

	let config = LmConfig { log_base: snapshot.log_base, symbols: snapshot.symbols, hash: snapshot.hash, ..LmConfig::default() };
	let mut model = NgramModel::init(&config, snapshot.n, snapshot.words.len())
		.map_err(|e| LmError::Format(format!("snapshot settings: {e}")))?;
	model.restore_vocab(snapshot.words, &snapshot.wids)?;
	model.set_tree(snapshot.lm3g);
	model.classes = snapshot.classes;
	let w = snapshot.weights;
	model.restore_weights(w.lw, w.log_wip, w.log_uw, w.log_uniform, w.log_uniform_weight);
	info!("snapshot {} loaded: {:?} n-grams", path.display(), model.counts());
	Ok(model)
}

/// Rejects snapshots whose tables would not index each other.
fn check_structure(snapshot: &SnapshotIn) -> Result<()> {
	let n_words = snapshot.words.len();
	if !(1..=3).contains(&snapshot.n) || n_words != snapshot.wids.len() {
		return Err(LmError::Format("inconsistent snapshot header".to_owned()));
	}
	if !(snapshot.log_base.is_finite() && snapshot.log_base > 1.0) {
		return Err(LmError::Format(format!("snapshot log base {}", snapshot.log_base)));
	}
	if snapshot.classes.len() > MAX_CLASSES {
		return Err(LmError::Format(format!("{} classes in snapshot", snapshot.classes.len())));
	}
	let n_ug = snapshot.lm3g.n_unigrams();
	if n_ug > n_words {
		return Err(LmError::Format(format!("{n_ug} unigrams for {n_words} words")));
	}
	let known = |wid: i32| {
		if class::is_class_wid(wid) {
			class::class_id(wid) < snapshot.classes.len() && (class::base_wid(wid) as usize) < n_words
		} else {
			usize::try_from(wid).is_ok_and(|w| w < n_words)
		}
	};
	if let Some(wid) = snapshot.wids.iter().copied().find(|&w| !known(w)) {
		return Err(LmError::Format(format!("word id {wid} outside the snapshot vocabulary")));
	}
	snapshot.lm3g.validate(snapshot.n)?;
	snapshot.classes.iter().try_for_each(|c| c.validate(n_ug))
}
