//! Count-based backoff models.
//!
//! A [`CountModel`] keeps raw n-gram counts in a tree of sorted successor
//! arrays, together with the discounting parameters and the backoff weights
//! derived from them. Probabilities are produced on demand, when the model is
//! scored or exported. Models come from [`CountModelBuilder`] or from
//! [`crate::binlm::read_bin`].

use std::io::{self, Write};
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::arpa::{ArpaEntry, ArpaSource, BAD_LOG_PROB};
use crate::config::Symbols;
use crate::error::{LmError, Result};
use crate::sih::SihTable;

pub mod alpha;
mod builder;
pub mod discount;
pub(crate) mod index;

pub use alpha::AlphaCodec;
pub use builder::{CountModelBuilder, CountOptions};
pub use discount::{DiscountStrategy, Discounting};

use discount::LazyDiscounter;

/// How out-of-vocabulary words were treated when counting.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VocabType {
	/// OOV n-grams were dropped; `<UNK>` has no probability.
	#[default]
	Closed,
	/// OOVs were mapped to `<UNK>`, counted like any other word.
	OpenType1,
	/// `<UNK>` receives a fixed share of the unigram mass.
	OpenType2,
}

impl VocabType {
	pub fn code(self) -> u16 {
		match self {
			Self::Closed => 0,
			Self::OpenType1 => 1,
			Self::OpenType2 => 2,
		}
	}

	pub fn from_code(code: u16) -> Option<Self> {
		match code {
			0 => Some(Self::Closed),
			1 => Some(Self::OpenType1),
			2 => Some(Self::OpenType2),
			_ => None,
		}
	}

	/// Lowest id carrying probability mass.
	pub fn first_id(self) -> u16 {
		match self {
			Self::Closed => 1,
			Self::OpenType1 | Self::OpenType2 => 0,
		}
	}
}

/// Counts of one tree level, either stored directly or as indices into the
/// level's count table.
#[derive(Clone, Debug, PartialEq)]
pub enum CountStore {
	Full(Vec<u32>),
	Indexed(Vec<u16>),
}

impl CountStore {
	pub fn len(&self) -> usize {
		match self {
			Self::Full(v) => v.len(),
			Self::Indexed(v) => v.len(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn get(&self, pos: usize, table: &[u32]) -> u32 {
		match self {
			Self::Full(v) => v[pos],
			Self::Indexed(v) => table.get(v[pos] as usize).copied().unwrap_or(0),
		}
	}
}

/// Log10 backoff weights of one tree level, either as `f32` or as
/// [`AlphaCodec`] codes.
#[derive(Clone, Debug, PartialEq)]
pub enum AlphaStore {
	Full(Vec<f32>),
	Quantized(Vec<u16>),
}

impl AlphaStore {
	pub fn len(&self) -> usize {
		match self {
			Self::Full(v) => v.len(),
			Self::Quantized(v) => v.len(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// A count tree with its discounting parameters.
///
/// Level 0 is indexed by word id; level `k` holds the `(k + 1)`-grams. The
/// children of node `j` on level `k` are a contiguous, id-sorted run on
/// level `k + 1`, located through 16-bit short indices and the level's
/// pointer table.
///
/// # Invariants
/// - `vocab[0]` is the unknown-word symbol; ids run from 0 to `vocab_size()`
/// - `num_kgrams[0] == vocab_size() + 1` and `counts[k].len() == num_kgrams[k]`
/// - `ind[k].len() == num_kgrams[k]` for every level with children
/// - `bo_weights` has one entry per context level (at least one)
/// - the counts of the children of a node sum to at most the node's count
#[derive(Clone, Debug, PartialEq)]
pub struct CountModel {
	pub(crate) n: usize,
	pub(crate) symbols: Symbols,
	pub(crate) vocab: Vec<String>,
	pub(crate) vocab_ht: SihTable,
	pub(crate) vocab_type: VocabType,
	pub(crate) first_id: u16,
	pub(crate) n_context_cues: u16,
	pub(crate) count_table_size: u16,
	pub(crate) discounting: Discounting,
	pub(crate) alpha_codec: AlphaCodec,
	pub(crate) n_unigrams: i64,
	pub(crate) zeroton_fraction: f64,
	pub(crate) oov_fraction: f64,
	pub(crate) four_byte_counts: bool,
	pub(crate) four_byte_alphas: bool,
	pub(crate) marg_counts: CountStore,
	/// One table per level when counts are indexed, empty otherwise.
	pub(crate) count_tables: Vec<Vec<u32>>,
	/// One table per level; the last level has no children and an empty table.
	pub(crate) ptr_tables: Vec<Vec<i32>>,
	pub(crate) uni_probs: Vec<f32>,
	/// Natural log of `uni_probs`.
	pub(crate) uni_log_probs: Vec<f32>,
	pub(crate) context_cue: Vec<u8>,
	pub(crate) cutoffs: Vec<i32>,
	pub(crate) num_kgrams: Vec<i64>,
	/// `word_ids[k][j]`: last word of node `j` on level `k`; level 0 is empty.
	pub(crate) word_ids: Vec<Vec<u32>>,
	pub(crate) counts: Vec<CountStore>,
	pub(crate) bo_weights: Vec<AlphaStore>,
	pub(crate) ind: Vec<Vec<u16>>,
	pub(crate) discounter: LazyDiscounter,
}

impl CountModel {
	pub fn order(&self) -> usize {
		self.n
	}

	/// Highest word id; `<UNK>` is id 0 and not counted.
	pub fn vocab_size(&self) -> usize {
		self.vocab.len() - 1
	}

	pub fn vocab_type(&self) -> VocabType {
		self.vocab_type
	}

	pub fn first_id(&self) -> u32 {
		self.first_id as u32
	}

	pub fn discounting(&self) -> &Discounting {
		&self.discounting
	}

	pub fn word(&self, id: u32) -> Option<&str> {
		self.vocab.get(id as usize).map(String::as_str)
	}

	pub fn word_id(&self, word: &str) -> Option<u32> {
		self.vocab_ht.lookup(word).and_then(|v| u32::try_from(v).ok())
	}

	/// Number of nodes on `level`.
	pub fn num_kgrams(&self, level: usize) -> usize {
		self.num_kgrams.get(level).map_or(0, |&c| c as usize)
	}

	pub fn count(&self, level: usize, pos: usize) -> u32 {
		let table = self.count_tables.get(level).map_or(&[][..], Vec::as_slice);
		self.counts[level].get(pos, table)
	}

	/// Number of times word `w` was seen as a context.
	pub fn marg_count(&self, w: usize) -> u32 {
		let table = self.count_tables.first().map_or(&[][..], Vec::as_slice);
		self.marg_counts.get(w, table)
	}

	/// Last word of node `pos` on `level`.
	pub fn word_at(&self, level: usize, pos: usize) -> u32 {
		if level == 0 { pos as u32 } else { self.word_ids[level][pos] }
	}

	/// Positions on `level + 1` of the children of node `pos`.
	pub fn children(&self, level: usize, pos: usize) -> Range<usize> {
		if level + 1 >= self.n {
			return 0..0;
		}
		let ind = &self.ind[level];
		let table = &self.ptr_tables[level];
		let start = index::full_index(ind[pos], table, pos);
		let end = if pos + 1 < ind.len() {
			index::full_index(ind[pos + 1], table, pos + 1)
		} else {
			self.num_kgrams(level + 1)
		};
		start..end.max(start)
	}

	/// Position of the child of node `pos` whose last word is `word`.
	pub fn find_child(&self, level: usize, pos: usize, word: u32) -> Option<usize> {
		let range = self.children(level, pos);
		if range.is_empty() {
			return None;
		}
		let ids = &self.word_ids[level + 1][range.clone()];
		ids.binary_search(&word).ok().map(|i| range.start + i)
	}

	/// Node of the n-gram `ids` (oldest first) on level `ids.len() - 1`.
	pub fn find_path(&self, ids: &[u32]) -> Option<usize> {
		let (&first, rest) = ids.split_first()?;
		if first as usize > self.vocab_size() {
			return None;
		}
		let mut pos = first as usize;
		for (level, &w) in rest.iter().enumerate() {
			pos = self.find_child(level, pos, w)?;
		}
		Some(pos)
	}

	/// Backoff weight of node `pos` on `level`; 1.0 for nodes without one.
	pub fn alpha(&self, level: usize, pos: usize) -> f64 {
		let log10_alpha = match self.bo_weights.get(level) {
			Some(AlphaStore::Full(v)) => v.get(pos).map(|&a| a as f64),
			Some(AlphaStore::Quantized(v)) => v.get(pos).map(|&code| self.alpha_codec.decode(code)),
			None => None,
		};
		match log10_alpha {
			Some(a) if a <= BAD_LOG_PROB => 0.0,
			Some(a) => 10f64.powf(a),
			None => 1.0,
		}
	}

	pub fn uni_prob(&self, w: u32) -> f64 {
		self.uni_probs.get(w as usize).map_or(0.0, |&p| p as f64)
	}

	pub(crate) fn discounter(&self) -> &dyn DiscountStrategy {
		self.discounter.get(&self.discounting)
	}

	/// Discounted probability of node `pos` on `level >= 1` given its
	/// context node `parent` on `level - 1`.
	pub fn node_prob(&self, level: usize, pos: usize, parent: usize) -> f64 {
		let count = self.count(level, pos);
		let marg = if level == 1 { self.marg_count(parent) } else { self.count(level - 1, parent) };
		if marg == 0 {
			return 0.0;
		}
		self.discounter().discounted_count(self, level, count, marg, parent) / marg as f64
	}

	/// Backoff probability of the last id of `ids` given the ones before it.
	///
	/// Only the last `order()` ids are used.
	pub fn prob(&self, ids: &[u32]) -> f64 {
		let ids = &ids[ids.len().saturating_sub(self.n)..];
		match ids {
			[] => 0.0,
			[w] => self.uni_prob(*w),
			_ => {
				let last = ids.len() - 1;
				match self.find_path(&ids[..last]) {
					Some(parent) => match self.find_child(last - 1, parent, ids[last]) {
						Some(pos) => self.node_prob(last, pos, parent),
						None => self.alpha(last - 1, parent) * self.prob(&ids[1..]),
					},
					None => self.prob(&ids[1..]),
				}
			}
		}
	}

	/// Checks the array shapes and tree links that queries rely on.
	///
	/// # Errors
	/// `LmError::Format` naming the first inconsistency.
	pub(crate) fn check_structure(&self) -> Result<()> {
		let bad = |what: String| Err(LmError::Format(what));
		let n = self.n;
		let n_words = self.vocab.len();
		if n == 0 || n_words == 0 {
			return bad("empty count model".to_owned());
		}
		if self.first_id != self.vocab_type.first_id() {
			return bad(format!("first id {} does not match the vocabulary type", self.first_id));
		}

		let context_levels = n.saturating_sub(1).max(1);
		let mut shapes = vec![
			(self.num_kgrams.len(), n, "levels in num_kgrams"),
			(self.counts.len(), n, "count levels"),
			(self.word_ids.len(), n, "word id levels"),
			(self.ptr_tables.len(), n, "pointer tables"),
			(self.cutoffs.len(), n, "cutoffs"),
			(self.bo_weights.len(), context_levels, "backoff weight levels"),
			(self.ind.len(), n - 1, "successor index levels"),
			(self.marg_counts.len(), n_words, "marginal counts"),
			(self.uni_probs.len(), n_words, "unigram probabilities"),
			(self.uni_log_probs.len(), n_words, "unigram log probabilities"),
			(self.context_cue.len(), n_words, "context cue flags"),
		];
		if !self.four_byte_counts {
			shapes.push((self.count_tables.len(), n, "count tables"));
		}
		for (got, expected, what) in shapes {
			if got != expected {
				return bad(format!("{what}: {got} entries, expected {expected}"));
			}
		}

		self.discounting.validate(n).map_err(|e| LmError::Format(e.to_string()))?;
		if let Discounting::GoodTuring { fof_size, freq_of_freq, .. } = &self.discounting {
			let sized = freq_of_freq.len() == n
				&& freq_of_freq.iter().zip(fof_size).all(|(fof, &size)| fof.len() == size as usize + 1);
			if !sized {
				return bad("frequency of frequency tables do not match their sizes".to_owned());
			}
		}

		let mut sizes = Vec::with_capacity(n);
		for (k, &count) in self.num_kgrams.iter().enumerate() {
			match usize::try_from(count) {
				Ok(size) => sizes.push(size),
				Err(_) => return bad(format!("negative number of {}-grams ({count})", k + 1)),
			}
		}
		if sizes[0] != n_words {
			return bad(format!("{} unigrams for {n_words} vocabulary entries", sizes[0]));
		}
		for (k, &size) in sizes.iter().enumerate() {
			let mut lens = vec![(self.counts[k].len(), "counts")];
			if k > 0 {
				lens.push((self.word_ids[k].len(), "word ids"));
			}
			if k + 1 < n {
				lens.push((self.ind[k].len(), "successor indices"));
			}
			if k < context_levels {
				lens.push((self.bo_weights[k].len(), "backoff weights"));
			}
			if let Some((len, what)) = lens.into_iter().find(|&(len, _)| len != size) {
				return bad(format!("{}-gram {what}: {len} entries for {size} nodes", k + 1));
			}
			if k > 0 && self.word_ids[k].iter().any(|&w| w as usize >= n_words) {
				return bad(format!("{}-gram word id outside the vocabulary", k + 1));
			}
		}

		for k in 0..n - 1 {
			let mut prev_end = 0;
			for pos in 0..sizes[k] {
				let range = self.children(k, pos);
				if range.start < prev_end || range.end > sizes[k + 1] {
					return bad(format!("children of {}-gram node {pos} are out of order", k + 1));
				}
				prev_end = range.end;
			}
		}
		Ok(())
	}

	/// Word ids along `path`, where `path[k]` is the node position on level `k`.
	pub(crate) fn path_words(&self, path: &[usize]) -> Vec<u32> {
		path.iter().enumerate().map(|(level, &pos)| self.word_at(level, pos)).collect()
	}

	/// Calls `visit` with the path of every node on `level`, in tree order.
	pub(crate) fn walk(&self, level: usize, visit: &mut dyn FnMut(&[usize]) -> Result<()>) -> Result<()> {
		let mut path = Vec::with_capacity(level + 1);
		for w in self.first_id as usize..=self.vocab_size() {
			path.push(w);
			self.walk_from(level, &mut path, visit)?;
			path.pop();
		}
		Ok(())
	}

	fn walk_from(&self, target: usize, path: &mut Vec<usize>, visit: &mut dyn FnMut(&[usize]) -> Result<()>) -> Result<()> {
		let level = path.len() - 1;
		if level == target {
			return visit(path);
		}
		for child in self.children(level, path[level]) {
			path.push(child);
			self.walk_from(target, path, visit)?;
			path.pop();
		}
		Ok(())
	}

	fn ngram_text(&self, path: &[usize]) -> String {
		let words: Vec<&str> =
			self.path_words(path).iter().map(|&w| self.word(w).unwrap_or("<?>")).collect();
		words.join(" ")
	}
}

fn log10_or_bad(p: f64) -> f64 {
	if p > 0.0 { p.log10() } else { BAD_LOG_PROB }
}

impl ArpaSource for CountModel {
	fn order(&self) -> usize {
		self.n
	}

	fn boundary_symbols(&self) -> (&str, &str) {
		(&self.symbols.start, &self.symbols.end)
	}

	fn write_banner(&self, out: &mut dyn Write) -> io::Result<()> {
		let first = |i: usize| self.vocab.get(i).map_or("", String::as_str);
		writeln!(out, "#############################################################################")?;
		writeln!(out, "## Copyright (c) 1996, Carnegie Mellon University, Cambridge University,")?;
		writeln!(out, "## Ronald Rosenfeld and Philip Clarkson")?;
		writeln!(out, "## Version 3, Copyright (c) 2006, Carnegie Mellon University ")?;
		writeln!(out, "## Contributors includes Wen Xu, Ananlada Chotimongkol, ")?;
		writeln!(out, "## David Huggins-Daines, Arthur Chan and Alan Black ")?;
		writeln!(out, "#############################################################################")?;
		writeln!(out, "=============================================================================")?;
		writeln!(out, "===============  This file was produced by the CMU-Cambridge  ===============")?;
		writeln!(out, "===============     Statistical Language Modeling Toolkit     ===============")?;
		writeln!(out, "=============================================================================")?;
		writeln!(
			out,
			"This is a {}-gram language model, based on a vocabulary of {} words,",
			self.n,
			self.vocab_size()
		)?;
		writeln!(out, "  which begins \"{}\", \"{}\", \"{}\"...", first(1), first(2), first(3))?;

		match self.vocab_type {
			VocabType::Closed => {
				writeln!(out, "This is a CLOSED-vocabulary model")?;
				writeln!(out, "  (OOVs eliminated from training data and are forbidden in test data)")?;
			}
			VocabType::OpenType1 => {
				writeln!(out, "This is an OPEN-vocabulary model (type 1)")?;
				writeln!(out, "  (OOVs were mapped to UNK, which is treated as any other vocabulary word)")?;
			}
			VocabType::OpenType2 => {
				writeln!(out, "This is an OPEN-vocabulary model (type 2)")?;
				writeln!(out, "  ({:.2} of the unigram discount mass was allocated to OOVs)", self.oov_fraction)?;
			}
		}
		self.discounter().describe(out)?;

		writeln!(out, "This file is in the ARPA-standard format introduced by Doug Paul.")?;
		writeln!(out)?;
		writeln!(out, "p(wd3|wd1,wd2)= if(trigram exists)           p_3(wd1,wd2,wd3)")?;
		writeln!(out, "                else if(bigram w1,w2 exists) bo_wt_2(w1,w2)*p(wd3|wd2)")?;
		writeln!(out, "                else                         p(wd3|w2)")?;
		writeln!(out)?;
		writeln!(out, "p(wd2|wd1)= if(bigram exists) p_2(wd1,wd2)")?;
		writeln!(out, "            else              bo_wt_1(wd1)*p_1(wd2)")?;
		writeln!(out)?;
		writeln!(out, "All probs and back-off weights (bo_wt) are given in log10 form.")?;
		writeln!(out)?;
		writeln!(out, "Data formats:")?;
		writeln!(out)?;
		writeln!(out, "Beginning of data mark: \\data\\")?;
		for i in 1..=self.n {
			writeln!(out, "ngram {i}=nr            # number of {i}-grams")?;
		}
		writeln!(out)?;
		for i in 1..=self.n {
			writeln!(out, "\\{i}-grams:")?;
			write!(out, "p_{i}     ")?;
			for j in 1..=i {
				write!(out, "wd_{j} ")?;
			}
			if i == self.n {
				writeln!(out)?;
			} else {
				writeln!(out, "bo_wt_{i}")?;
			}
		}
		writeln!(out)?;
		writeln!(out, "end of data mark: \\end\\")?;
		writeln!(out)
	}

	fn generated_count(&self, k: usize) -> usize {
		if k == 1 {
			1 + self.vocab_size() - self.first_id as usize
		} else {
			self.num_kgrams(k - 1)
		}
	}

	fn visit_ngrams(&self, k: usize, visit: &mut dyn FnMut(ArpaEntry<'_>) -> Result<()>) -> Result<()> {
		if k == 1 {
			for w in self.first_id as usize..=self.vocab_size() {
				let log10_prob = if self.uni_probs[w] <= 0.0 {
					BAD_LOG_PROB
				} else {
					self.uni_log_probs[w] as f64 * std::f64::consts::LOG10_E
				};
				let log10_bowt = (self.n > 1).then(|| log10_or_bad(self.alpha(0, w)));
				visit(ArpaEntry { words: vec![&self.vocab[w]], log10_prob, log10_bowt })?;
			}
			return Ok(());
		}

		let level = k - 1;
		self.walk(level, &mut |path: &[usize]| {
			let pos = path[level];
			let prob = self.node_prob(level, pos, path[level - 1]);
			if prob > 1.0 {
				return Err(LmError::ProbabilityOverflow { ngram: self.ngram_text(path), prob });
			}
			let log10_bowt = (level + 1 < self.n).then(|| log10_or_bad(self.alpha(level, pos)));
			let words = self.path_words(path).into_iter().map(|w| self.vocab[w as usize].as_str()).collect();
			visit(ArpaEntry { words, log10_prob: log10_or_bad(prob), log10_bowt })
		})
	}
}
