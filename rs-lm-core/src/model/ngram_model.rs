use std::cell::RefCell;
use std::io::{self, Write};
use std::ops::Deref;
use std::path::Path;
use std::rc::Rc;

use log::{debug, info, warn};

use super::class::{self, NgramClass, MAX_CLASSES};
use super::lm3g::{Lm3g, MAX_RESERVE};
use super::snapshot;
use super::tginfo::TgInfoCache;
use crate::arpa::{self, ArpaEntry, ArpaSource, BAD_LOG_PROB};
use crate::config::{HashConfig, LmConfig, Symbols};
use crate::error::{LmError, Result};
use crate::io::{build_output_path, extension_of};
use crate::logmath::LogMath;
use crate::sih::SihTable;

/// On-disk representations of a scoring model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelFileType {
	/// Pick by extension, or try every format in turn.
	Auto,
	/// ARPA text.
	Arpa,
	/// Postcard snapshot of the in-memory tree.
	Dump,
}

impl ModelFileType {
	/// Type implied by a file extension (`.arpa`, `.lm`, `.lmdump`).
	pub fn from_path<P: AsRef<Path>>(path: P) -> Option<Self> {
		match extension_of(path)?.as_str() {
			"arpa" | "lm" => Some(Self::Arpa),
			"lmdump" => Some(Self::Dump),
			_ => None,
		}
	}

	pub fn from_name(name: &str) -> Option<Self> {
		match name.to_ascii_lowercase().as_str() {
			"arpa" => Some(Self::Arpa),
			"dump" | "lmdump" => Some(Self::Dump),
			"auto" => Some(Self::Auto),
			_ => None,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Auto => "auto",
			Self::Arpa => "arpa",
			Self::Dump => "dump",
		}
	}
}

/// Case conversion for [`NgramModel::casefold`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaseFold {
	Upper,
	Lower,
}

/// A backoff trigram language model ready for scoring.
///
/// # Responsibilities
/// - Own the vocabulary (word strings and the word → id table)
/// - Own the unigram/bigram/trigram tree and the trigram context cache
/// - Apply language weight, insertion penalty and unigram interpolation
/// - Manage word classes
///
/// # Invariants
/// - `word_str[i]` is the word of base id `i`; the hash table maps it back
///   to its (possibly class-tagged) id
/// - every scored id is either a unigram index or a class-tagged id
/// - `1 <= n <= 3`
///
/// # Notes
/// Scoring takes `&self` but updates the trigram cache through a `RefCell`,
/// so a model must not be scored from several threads at once.
#[derive(Clone, Debug)]
pub struct NgramModel {
	pub(crate) lmath: LogMath,
	pub(crate) symbols: Symbols,
	hash: HashConfig,
	pub(crate) n: usize,
	pub(crate) word_str: Vec<String>,
	wid: SihTable,
	writable: bool,
	pub(crate) lw: f32,
	pub(crate) log_wip: i32,
	pub(crate) log_uw: i32,
	pub(crate) log_uniform: i32,
	pub(crate) log_uniform_weight: i32,
	pub(crate) log_zero: i32,
	pub(crate) classes: Vec<NgramClass>,
	pub(crate) lm3g: Lm3g,
	pub(crate) tginfo: RefCell<TgInfoCache>,
}

impl NgramModel {
	/// Empty model of order `n` with the default weights.
	///
	/// `n_unigram` is the declared vocabulary size; it sets the uniform
	/// distribution used for unigram interpolation.
	pub(crate) fn init(config: &LmConfig, n: usize, n_unigram: usize) -> Result<Self> {
		let lmath = LogMath::new(config.log_base);
		let reserve = n_unigram.min(MAX_RESERVE);
		let wid = SihTable::new(
			reserve,
			config.hash.max_occupancy,
			config.hash.growth_ratio,
			config.hash.warn_on_update,
		)?;
		Ok(Self {
			lmath,
			symbols: config.symbols.clone(),
			hash: config.hash.clone(),
			n,
			word_str: Vec::with_capacity(reserve),
			wid,
			writable: false,
			lw: 1.0,
			log_wip: 0,
			log_uw: 0,
			log_uniform: lmath.log(1.0 / n_unigram.max(1) as f64),
			log_uniform_weight: lmath.zero(),
			log_zero: lmath.zero(),
			classes: Vec::new(),
			lm3g: Lm3g::default(),
			tginfo: RefCell::new(TgInfoCache::default()),
		})
	}

	/// Installs the tree and sizes the trigram cache.
	pub(crate) fn set_tree(&mut self, lm3g: Lm3g) {
		self.tginfo = RefCell::new(TgInfoCache::new(lm3g.n_unigrams()));
		self.lm3g = lm3g;
	}

	pub(crate) fn set_writable(&mut self, writable: bool) {
		self.writable = writable;
	}

	/// Reads a model from disk and applies the weights of `config`.
	///
	/// With [`ModelFileType::Auto`] the extension decides; an unknown
	/// extension tries ARPA first, then the snapshot format.
	pub fn read<P: AsRef<Path>>(path: P, file_type: ModelFileType, config: &LmConfig) -> Result<Self> {
		let path = path.as_ref();
		let file_type = match file_type {
			ModelFileType::Auto => ModelFileType::from_path(path).unwrap_or(ModelFileType::Auto),
			other => other,
		};
		let mut model = match file_type {
			ModelFileType::Arpa => arpa::read_arpa(path, config)?,
			ModelFileType::Dump => snapshot::load(path)?,
			ModelFileType::Auto => match arpa::read_arpa(path, config) {
				Ok(model) => model,
				Err(e) => {
					debug!("{} is not an ARPA file ({e}), trying snapshot", path.display());
					snapshot::load(path)?
				}
			},
		};
		model.apply_weights(config.lw, config.wip, config.uw);
		Ok(model)
	}

	/// Loads `<stem>.lmdump` next to an ARPA file when it exists; otherwise
	/// parses the ARPA file and writes the snapshot for the next run.
	///
	/// A snapshot that fails to decode or validate is replaced by a fresh
	/// one built from the ARPA file.
	pub fn open_cached<P: AsRef<Path>>(arpa_path: P, config: &LmConfig) -> Result<Self> {
		let dump_path = build_output_path(&arpa_path, "lmdump")?;
		let cached = if dump_path.exists() {
			match snapshot::load(&dump_path) {
				Ok(model) => Some(model),
				Err(e @ (LmError::Format(_) | LmError::Snapshot(_))) => {
					warn!("ignoring snapshot {}: {e}", dump_path.display());
					None
				}
				Err(e) => return Err(e),
			}
		} else {
			None
		};
		let mut model = match cached {
			Some(model) => model,
			None => {
				let model = arpa::read_arpa(&arpa_path, config)?;
				snapshot::save(&model, &dump_path)?;
				model
			}
		};
		model.apply_weights(config.lw, config.wip, config.uw);
		Ok(model)
	}

	/// Writes the model. `Auto` picks the format from the extension and
	/// falls back to ARPA.
	pub fn write<P: AsRef<Path>>(&self, path: P, file_type: ModelFileType) -> Result<()> {
		let path = path.as_ref();
		let file_type = match file_type {
			ModelFileType::Auto => ModelFileType::from_path(path).unwrap_or(ModelFileType::Arpa),
			other => other,
		};
		match file_type {
			ModelFileType::Dump => snapshot::save(self, path),
			_ => arpa::write_arpa(self, path).map(|_| ()),
		}
	}

	/// Model order (1 to 3).
	pub fn order(&self) -> usize {
		self.n
	}

	/// Number of unigrams, bigrams and trigrams.
	pub fn counts(&self) -> [usize; 3] {
		[self.lm3g.n_unigrams(), self.lm3g.n_bigrams(), self.lm3g.n_trigrams()]
	}

	/// Number of vocabulary words, class members included.
	pub fn n_words(&self) -> usize {
		self.word_str.len()
	}

	pub fn is_writable(&self) -> bool {
		self.writable
	}

	pub fn zero(&self) -> i32 {
		self.log_zero
	}

	pub fn logmath(&self) -> &LogMath {
		&self.lmath
	}

	pub fn symbols(&self) -> &Symbols {
		&self.symbols
	}

	pub(crate) fn hash_config(&self) -> &HashConfig {
		&self.hash
	}

	/// Current language weight, log insertion penalty and log unigram weight.
	pub fn weights(&self) -> (f32, i32, i32) {
		(self.lw, self.log_wip, self.log_uw)
	}

	/// Id of `word` without the unknown-word fallback.
	pub fn lookup(&self, word: &str) -> Option<i32> {
		self.wid.lookup(word).map(|v| v as i32)
	}

	/// Id of `word`, or of the unknown word when `word` is absent.
	pub fn word_id(&self, word: &str) -> Option<i32> {
		self.lookup(word).or_else(|| self.unknown_wid())
	}

	pub fn unknown_wid(&self) -> Option<i32> {
		self.lookup(&self.symbols.unknown)
	}

	/// Word of `wid`; class tags are ignored.
	pub fn word(&self, wid: i32) -> Option<&str> {
		if wid < 0 && !class::is_class_wid(wid) {
			return None;
		}
		self.word_str.get(class::base_wid(wid) as usize).map(String::as_str)
	}

	/// Appends a word read from a model file. A duplicate keeps the id of
	/// its first occurrence.
	pub(crate) fn push_file_word(&mut self, word: &str) -> Result<()> {
		let wid = self.word_str.len() as i64;
		self.word_str.push(word.to_owned());
		if self.wid.lookup(word).is_some() {
			warn!("duplicate word in dictionary: {word}");
			return Ok(());
		}
		self.wid.add(word, wid)
	}

	/// Adds `word` to the vocabulary, tagging it with `classid` when given.
	/// An existing word keeps its id.
	fn add_word_internal(&mut self, word: &str, classid: Option<usize>) -> Result<i32> {
		if let Some(wid) = self.lookup(word) {
			warn!("omit duplicate word '{word}'");
			return Ok(wid);
		}
		let base = self.word_str.len() as i32;
		let wid = match classid {
			Some(c) => class::class_wid(base, c),
			None => base,
		};
		self.word_str.push(word.to_owned());
		self.wid.add(word, wid as i64)?;
		Ok(wid)
	}

	/// Adds a word with unigram weight `weight` (relative to the uniform
	/// distribution) and returns its id.
	///
	/// # Errors
	/// `LmError::ReadOnly` when the model was loaded from a snapshot.
	pub fn add_word(&mut self, word: &str, weight: f32) -> Result<i32> {
		if !self.writable {
			warn!("can't add word '{word}' to a read-only language model");
			return Err(LmError::ReadOnly);
		}
		if let Some(wid) = self.lookup(word) {
			warn!("omit duplicate word '{word}'");
			return Ok(wid);
		}
		let wid = self.add_word_internal(word, None)?;
		self.add_ug(wid as usize, self.lmath.log(weight as f64));
		Ok(wid)
	}

	fn add_ug(&mut self, wid: usize, lweight: i32) -> i32 {
		let mut score = lweight + self.log_uniform + self.log_uw;
		score = self.lmath.add(score, self.log_uniform + self.log_uniform_weight);
		let prob1 = (score as f64 * self.lw as f64) as i32 + self.log_wip;
		self.lm3g.push_unigram(wid, prob1, 0, self.log_zero);
		self.tginfo.get_mut().grow(self.lm3g.n_unigrams());
		score
	}

	/// Converts every word to upper or lower case. Tags (`<s>`) and class
	/// names (`[city]`) are left alone. The model becomes writable.
	pub fn casefold(&mut self, kase: CaseFold) -> Result<()> {
		let mut folded = SihTable::new(
			self.word_str.len(),
			self.hash.max_occupancy,
			self.hash.growth_ratio,
			self.hash.warn_on_update,
		)?;
		for (i, word) in self.word_str.iter_mut().enumerate() {
			let wid = match self.wid.lookup(word) {
				Some(v) if class::base_wid(v as i32) as usize == i => v,
				_ => i as i64,
			};
			if !(word.starts_with('<') || word.starts_with('[')) {
				*word = match kase {
					CaseFold::Upper => word.to_uppercase(),
					CaseFold::Lower => word.to_lowercase(),
				};
			}
			if folded.lookup(word).is_some() {
				warn!("duplicate word in dictionary after conversion: {word}");
				continue;
			}
			folded.add(word, wid)?;
		}
		self.wid = folded;
		self.writable = true;
		Ok(())
	}

	/// Rescales the stored scores for a new language weight `lw`, word
	/// insertion penalty `wip` and unigram weight `uw`.
	pub fn apply_weights(&mut self, lw: f32, wip: f32, uw: f32) {
		let log_wip = self.lmath.log(wip as f64);
		let log_uw = self.lmath.log(uw as f64);
		let log_uniform_weight = self.lmath.log(1.0 - uw as f64);
		let old_lw = self.lw as f64;
		let old_log_wip = self.log_wip;
		let lw64 = lw as f64;

		for i in 0..self.lm3g.n_unigrams() {
			let bo_wt = (self.lm3g.unigrams[i].bo_wt1 as f64 / old_lw) as i32;
			let mut prob1 = self.raw_unigram(i);
			self.lm3g.unigrams[i].bo_wt1 = (bo_wt as f64 * lw64) as i32;
			if self.word_str.get(i).map(String::as_str) != Some(self.symbols.start.as_str()) {
				prob1 += log_uw;
				prob1 = self.lmath.add(prob1, self.log_uniform + log_uniform_weight);
			}
			self.lm3g.unigrams[i].prob1 = (prob1 as f64 * lw64) as i32 + log_wip;
		}

		let rescale = |p: &mut i32| {
			let raw = ((*p - old_log_wip) as f64 / old_lw) as i32;
			*p = (raw as f64 * lw64) as i32 + log_wip;
		};
		self.lm3g.prob2.iter_mut().for_each(rescale);
		if self.n > 2 {
			for bo in &mut self.lm3g.bo_wt2 {
				*bo = (*bo as f64 / old_lw * lw64) as i32;
			}
			self.lm3g.prob3.iter_mut().for_each(rescale);
		}

		self.log_wip = log_wip;
		self.log_uw = log_uw;
		self.log_uniform_weight = log_uniform_weight;
		self.lw = lw;
		// cached backoff weights are stale now
		self.tginfo = RefCell::new(TgInfoCache::new(self.lm3g.n_unigrams()));
	}

	/// Drops trigram contexts not used since the previous flush.
	pub fn flush(&self) {
		self.tginfo.borrow_mut().reset();
	}

	/// Adds a class tagged `classname`. The tag word is created with weight
	/// `classweight` when missing. Returns the class number.
	pub fn add_class(&mut self, classname: &str, classweight: f32, words: &[&str], weights: &[f32]) -> Result<usize> {
		if words.len() != weights.len() {
			return Err(LmError::Class(format!(
				"class {classname}: {} words but {} weights",
				words.len(),
				weights.len()
			)));
		}
		let tag_wid = match self.lookup(classname) {
			Some(wid) => wid,
			None => self.add_word(classname, classweight)?,
		};
		if self.classes.len() == MAX_CLASSES {
			return Err(LmError::Class(format!("number of classes cannot exceed {MAX_CLASSES}")));
		}
		let classid = self.classes.len();
		let start_wid = self.word_str.len() as i32;
		for word in words {
			if self.lookup(word).is_some() {
				return Err(LmError::Class(format!("class member {word} is already in the vocabulary")));
			}
			self.add_word_internal(word, Some(classid))?;
		}
		self.classes.push(NgramClass::new(&self.lmath, tag_wid, start_wid, weights));
		info!("class {classname} added with {} words", words.len());
		Ok(classid)
	}

	/// Adds `word` to an existing class with relative weight `weight`; the
	/// other members are scaled down to make room. Returns the new id.
	pub fn add_class_word(&mut self, classname: &str, word: &str, weight: f32) -> Result<i32> {
		let tag_wid = self
			.lookup(classname)
			.ok_or_else(|| LmError::Class(format!("no such word or class tag: {classname}")))?;
		let classid = self
			.classes
			.iter()
			.position(|c| c.tag_wid == tag_wid)
			.ok_or_else(|| LmError::Class(format!("word {classname} is not a class tag")))?;

		let wid = self.add_word_internal(word, Some(classid))?;
		let lmclass = &mut self.classes[classid];
		let fprob = weight as f64 / (lmclass.len() + 1) as f64;
		lmclass.rescale(self.lmath.log(1.0 - fprob));
		lmclass.add_word(wid, self.lmath.log(fprob));
		Ok(wid)
	}

	/// In-class log weight of a class member id.
	pub fn class_prob(&self, wid: i32) -> Option<i32> {
		if !class::is_class_wid(wid) {
			return None;
		}
		self.classes.get(class::class_id(wid))?.prob(wid)
	}

	pub fn classes(&self) -> &[NgramClass] {
		&self.classes
	}

	/// Loads every class of a class-definition file.
	pub fn read_classdef<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
		let defs = class::read_classdef(path)?;
		for def in &defs {
			let words: Vec<&str> = def.words.iter().map(String::as_str).collect();
			self.add_class(&def.name, 1.0, &words, &def.weights)?;
		}
		Ok(defs.len())
	}

	/// Snapshot restore: vocabulary with explicit ids.
	pub(crate) fn restore_vocab(&mut self, words: Vec<String>, wids: &[i32]) -> Result<()> {
		for (word, &wid) in words.iter().zip(wids) {
			if self.wid.lookup(word).is_none() {
				self.wid.add(word, wid as i64)?;
			}
		}
		self.word_str = words;
		Ok(())
	}

	/// Vocabulary ids in base-id order, for snapshots.
	pub(crate) fn vocab_ids(&self) -> Vec<i32> {
		self.word_str
			.iter()
			.enumerate()
			.map(|(i, w)| self.lookup(w).filter(|&v| class::base_wid(v) as usize == i).unwrap_or(i as i32))
			.collect()
	}

	pub(crate) fn restore_weights(&mut self, lw: f32, log_wip: i32, log_uw: i32, log_uniform: i32, log_uniform_weight: i32) {
		self.lw = lw;
		self.log_wip = log_wip;
		self.log_uw = log_uw;
		self.log_uniform = log_uniform;
		self.log_uniform_weight = log_uniform_weight;
	}
}

impl ArpaSource for NgramModel {
	fn order(&self) -> usize {
		self.n
	}

	fn boundary_symbols(&self) -> (&str, &str) {
		(&self.symbols.start, &self.symbols.end)
	}

	fn write_banner(&self, out: &mut dyn Write) -> io::Result<()> {
		writeln!(out, "This is an ARPA-format language model file, generated by rs-lm")
	}

	fn generated_count(&self, k: usize) -> usize {
		self.counts()[k - 1]
	}

	fn visit_ngrams(&self, k: usize, visit: &mut dyn FnMut(ArpaEntry<'_>) -> Result<()>) -> Result<()> {
		let to_log10 = |l: i32| if l <= self.log_zero { BAD_LOG_PROB } else { self.lmath.log_to_log10(l) };
		for entry in self.mgrams(k - 1) {
			let words = entry
				.wids()
				.iter()
				.map(|&w| self.word(w).ok_or_else(|| LmError::Format(format!("n-gram refers to unknown word id {w}"))))
				.collect::<Result<Vec<_>>>()?;
			visit(ArpaEntry {
				words,
				log10_prob: to_log10(entry.score()),
				log10_bowt: (k < self.n).then(|| to_log10(entry.bowt())),
			})?;
		}
		Ok(())
	}
}

/// Shared, immutable handle on a model.
///
/// `retain` hands out another holder, `release` gives one back; the model
/// is freed with its last holder.
#[derive(Clone, Debug)]
pub struct ModelRef(Rc<NgramModel>);

impl ModelRef {
	pub fn new(model: NgramModel) -> Self {
		Self(Rc::new(model))
	}

	pub fn retain(&self) -> Self {
		Self(Rc::clone(&self.0))
	}

	/// Drops this holder and returns how many remain.
	pub fn release(self) -> usize {
		Rc::strong_count(&self.0) - 1
	}

	pub fn refcount(&self) -> usize {
		Rc::strong_count(&self.0)
	}

	/// Mutable access, only while this is the sole holder.
	pub fn get_mut(&mut self) -> Option<&mut NgramModel> {
		Rc::get_mut(&mut self.0)
	}
}

impl Deref for ModelRef {
	type Target = NgramModel;

	fn deref(&self) -> &NgramModel {
		&self.0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn file_types_from_names() {
		assert_eq!(ModelFileType::from_path("x/model.ARPA"), Some(ModelFileType::Arpa));
		assert_eq!(ModelFileType::from_path("model.lmdump"), Some(ModelFileType::Dump));
		assert_eq!(ModelFileType::from_path("model.txt"), None);
		assert_eq!(ModelFileType::from_name("Dump"), Some(ModelFileType::Dump));
		assert_eq!(ModelFileType::Arpa.as_str(), "arpa");
	}
}
