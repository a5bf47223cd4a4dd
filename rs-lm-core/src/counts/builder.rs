use std::collections::{BTreeMap, HashMap};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::alpha::{AlphaCodec, DEFAULT_MAX_ALPHA, DEFAULT_MIN_ALPHA, DEFAULT_OUT_OF_RANGE_ALPHAS};
use super::discount::{Discounting, LazyDiscounter};
use super::index::new_index;
use super::{AlphaStore, CountModel, CountStore, VocabType};
use crate::arpa::BAD_LOG_PROB;
use crate::config::{LmConfig, Symbols};
use crate::error::{LmError, Result};
use crate::sih::SihTable;

/// Counting and storage choices for [`CountModelBuilder`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CountOptions {
	pub vocab_type: VocabType,
	pub discounting: Discounting,
	/// `cutoffs[k]`: `(k + 1)`-grams seen at most this often are dropped.
	/// Entry 0 is ignored. Empty means no cutoff.
	pub cutoffs: Vec<i32>,
	/// Words that only ever appear as context, such as `<s>`.
	pub context_cues: Vec<String>,
	/// Weight of an unseen word relative to a word seen once.
	pub zeroton_fraction: f64,
	/// Unigram mass given to `<UNK>` in an open type 2 vocabulary.
	pub oov_fraction: f64,
	pub four_byte_counts: bool,
	pub four_byte_alphas: bool,
	pub count_table_size: u16,
	pub min_alpha: f64,
	pub max_alpha: f64,
	pub out_of_range_alphas: u16,
}

impl Default for CountOptions {
	fn default() -> Self {
		Self {
			vocab_type: VocabType::Closed,
			discounting: Discounting::WittenBell,
			cutoffs: Vec::new(),
			context_cues: Vec::new(),
			zeroton_fraction: 1.0,
			oov_fraction: 0.5,
			four_byte_counts: false,
			four_byte_alphas: false,
			count_table_size: u16::MAX,
			min_alpha: DEFAULT_MIN_ALPHA,
			max_alpha: DEFAULT_MAX_ALPHA,
			out_of_range_alphas: DEFAULT_OUT_OF_RANGE_ALPHAS,
		}
	}
}

/// Accumulates n-gram counts over a fixed vocabulary and turns them into a
/// [`CountModel`].
///
/// Words are read as one continuous stream: every run of `n` consecutive
/// words is counted, across sentence boundaries. Include the sentence
/// symbols in the text to get boundary n-grams.
///
/// # Example
/// ```
/// use rs_lm_core::config::LmConfig;
/// use rs_lm_core::counts::{CountModelBuilder, CountOptions};
///
/// let vocab = ["<s>", "</s>", "a", "b"];
/// let mut builder = CountModelBuilder::new(2, &vocab, CountOptions::default(), &LmConfig::default()).unwrap();
/// builder.add_sentence("<s> a b </s>");
/// let model = builder.build().unwrap();
/// assert_eq!(model.order(), 2);
/// ```
#[derive(Debug)]
pub struct CountModelBuilder {
	n: usize,
	symbols: Symbols,
	options: CountOptions,
	vocab: Vec<String>,
	vocab_ht: SihTable,
	ngrams: BTreeMap<Vec<u32>, u32>,
	/// Last `n` ids seen; `None` marks a word outside a closed vocabulary.
	window: Vec<Option<u32>>,
}

impl CountModelBuilder {
	/// Builder for an `n`-gram model over `words`, which get ids from 1 in
	/// list order. Id 0 is the unknown-word symbol.
	///
	/// # Errors
	/// `LmError::Config` for `n == 0`, inconsistent options or an empty word.
	pub fn new<S: AsRef<str>>(n: usize, words: &[S], options: CountOptions, config: &LmConfig) -> Result<Self> {
		if n == 0 {
			return Err(LmError::Config("n must be at least 1".to_owned()));
		}
		options.discounting.validate(n)?;
		if !options.cutoffs.is_empty() && options.cutoffs.len() != n {
			return Err(LmError::Config(format!("{} cutoffs for a {n}-gram model", options.cutoffs.len())));
		}
		if !(0.0..=1.0).contains(&options.zeroton_fraction) || !(0.0..=1.0).contains(&options.oov_fraction) {
			return Err(LmError::Config("zeroton and OOV fractions must be in 0-1".to_owned()));
		}
		if options.count_table_size == 0 {
			return Err(LmError::Config("count_table_size must be positive".to_owned()));
		}

		let mut vocab_ht = SihTable::new(
			words.len() + 1,
			config.hash.max_occupancy,
			config.hash.growth_ratio,
			config.hash.warn_on_update,
		)?;
		let unknown = config.symbols.unknown.clone();
		vocab_ht.add(&unknown, 0)?;
		let mut vocab = vec![unknown];
		for word in words {
			let word = word.as_ref();
			if vocab_ht.lookup(word).is_some() {
				warn!("Word {word} is already in the vocabulary, ignored");
				continue;
			}
			vocab_ht.add(word, vocab.len() as i64)?;
			vocab.push(word.to_owned());
		}
		info!("Vocabulary of {} words, {n}-gram counts", vocab.len() - 1);

		Ok(Self {
			n,
			symbols: config.symbols.clone(),
			options,
			vocab,
			vocab_ht,
			ngrams: BTreeMap::new(),
			window: Vec::with_capacity(n),
		})
	}

	pub fn vocab_size(&self) -> usize {
		self.vocab.len() - 1
	}

	/// Counts the whitespace-separated words of `sentence`, continuing the
	/// window left by the previous sentence.
	pub fn add_sentence(&mut self, sentence: &str) {
		for word in sentence.split_whitespace() {
			self.push_word(word);
		}
	}

	fn push_word(&mut self, word: &str) {
		let id = match self.vocab_ht.lookup(word) {
			Some(id) => Some(id as u32),
			None if self.options.vocab_type == VocabType::Closed => None,
			None => Some(0),
		};
		if self.window.len() == self.n {
			self.window.remove(0);
		}
		self.window.push(id);
		if self.window.len() == self.n {
			if let Some(key) = self.window.iter().copied().collect::<Option<Vec<u32>>>() {
				let count = self.ngrams.entry(key).or_insert(0);
				*count = count.saturating_add(1);
			}
		}
	}

	/// Adds `count` occurrences of the id n-gram `ids`.
	///
	/// # Errors
	/// `LmError::Config` if `ids` is not an n-gram of known ids.
	pub fn add_ngram(&mut self, ids: &[u32], count: u32) -> Result<()> {
		if ids.len() != self.n {
			return Err(LmError::Config(format!("{}-gram given to a {}-gram builder", ids.len(), self.n)));
		}
		if let Some(&bad) = ids.iter().find(|&&id| id as usize > self.vocab_size()) {
			return Err(LmError::Config(format!("word id {bad} is out of the vocabulary")));
		}
		let entry = self.ngrams.entry(ids.to_vec()).or_insert(0);
		*entry = entry.saturating_add(count);
		Ok(())
	}

	/// Builds the count tree, the unigram distribution and the backoff
	/// weights.
	///
	/// # Errors
	/// `LmError::TooLarge` when counts overflow the count tables or the
	/// alpha side table.
	pub fn build(self) -> Result<CountModel> {
		let n = self.n;
		let vocab_size = self.vocab_size();
		let first_id = self.options.vocab_type.first_id();
		let cutoffs = if self.options.cutoffs.is_empty() { vec![0; n] } else { self.options.cutoffs.clone() };
		info!("{} distinct {n}-grams counted", self.ngrams.len());

		let levels = self.count_levels(&cutoffs);
		let mut unigram_counts = vec![0u32; vocab_size + 1];
		for (key, count) in &levels[0] {
			unigram_counts[key[0] as usize] = *count;
		}

		let mut num_kgrams = vec![(vocab_size + 1) as i64];
		let mut word_ids = vec![Vec::new()];
		let mut raw_counts = vec![unigram_counts.clone()];
		for level in &levels[1..] {
			num_kgrams.push(level.len() as i64);
			word_ids.push(level.iter().map(|(key, _)| key[key.len() - 1]).collect());
			raw_counts.push(level.iter().map(|(_, c)| *c).collect());
		}
		for (k, count) in num_kgrams.iter().enumerate() {
			debug!("{} {}-grams kept", count, k + 1);
		}

		let (ind, ptr_tables) = successor_indices(&levels, vocab_size);
		let (count_tables, counts, marg_counts) = self.store_counts(raw_counts, &unigram_counts)?;
		let context_cue = self.context_cue_flags();
		let (uni_probs, uni_log_probs, n_unigrams) = self.unigram_probs(&unigram_counts, &context_cue, first_id);

		let mut discounting = self.options.discounting.clone();
		if let Discounting::GoodTuring { fof_size, freq_of_freq, .. } = &mut discounting {
			*freq_of_freq = levels_fof(&levels, fof_size, first_id);
		}

		let context_levels = n.saturating_sub(1).max(1);
		let bo_weights = (0..context_levels)
			.map(|k| {
				let len = num_kgrams[k] as usize;
				if self.options.four_byte_alphas {
					AlphaStore::Full(vec![0.0; len])
				} else {
					AlphaStore::Quantized(vec![0; len])
				}
			})
			.collect();

		let mut model = CountModel {
			n,
			symbols: self.symbols,
			vocab: self.vocab,
			vocab_ht: self.vocab_ht,
			vocab_type: self.options.vocab_type,
			first_id,
			n_context_cues: context_cue.iter().filter(|&&c| c != 0).count() as u16,
			count_table_size: self.options.count_table_size,
			discounting,
			alpha_codec: AlphaCodec {
				min_alpha: self.options.min_alpha,
				max_alpha: self.options.max_alpha,
				out_of_range_alphas: self.options.out_of_range_alphas,
				alpha_array: Vec::new(),
			},
			n_unigrams,
			zeroton_fraction: self.options.zeroton_fraction,
			oov_fraction: self.options.oov_fraction,
			four_byte_counts: self.options.four_byte_counts,
			four_byte_alphas: self.options.four_byte_alphas,
			marg_counts,
			count_tables,
			ptr_tables,
			uni_probs,
			uni_log_probs,
			context_cue,
			cutoffs,
			num_kgrams,
			word_ids,
			counts,
			bo_weights,
			ind,
			discounter: LazyDiscounter::default(),
		};
		compute_alphas(&mut model)?;
		info!("Count model built");
		Ok(model)
	}

	/// Sorted `(prefix, count)` pairs per level, after cutoffs. Level 0
	/// lists every id.
	fn count_levels(&self, cutoffs: &[i32]) -> Vec<Vec<(Vec<u32>, u32)>> {
		let mut sums: Vec<BTreeMap<Vec<u32>, u32>> = vec![BTreeMap::new(); self.n];
		for (key, &count) in &self.ngrams {
			for (k, level) in sums.iter_mut().enumerate() {
				let total = level.entry(key[..=k].to_vec()).or_insert(0);
				*total = total.saturating_add(count);
			}
		}

		let mut levels: Vec<Vec<(Vec<u32>, u32)>> = Vec::with_capacity(self.n);
		levels.push((0..=self.vocab_size() as u32).map(|w| (vec![w], sums[0].get(&vec![w]).copied().unwrap_or(0))).collect());
		for k in 1..self.n {
			let parents: Vec<&Vec<u32>> = levels[k - 1].iter().map(|(key, _)| key).collect();
			let kept: Vec<(Vec<u32>, u32)> = sums[k]
				.iter()
				.filter(|(key, count)| {
					**count as i64 > cutoffs[k] as i64
						&& (k == 1 || parents.binary_search(&&key[..k].to_vec()).is_ok())
				})
				.map(|(key, count)| (key.clone(), *count))
				.collect();
			let dropped = sums[k].len() - kept.len();
			if dropped > 0 {
				debug!("{dropped} {}-grams removed by the cutoff", k + 1);
			}
			levels.push(kept);
		}
		levels
	}

	fn store_counts(
		&self,
		raw_counts: Vec<Vec<u32>>,
		unigram_counts: &[u32],
	) -> Result<(Vec<Vec<u32>>, Vec<CountStore>, CountStore)> {
		if self.options.four_byte_counts {
			let stores = raw_counts.into_iter().map(CountStore::Full).collect();
			return Ok((Vec::new(), stores, CountStore::Full(unigram_counts.to_vec())));
		}

		let size = self.options.count_table_size as usize;
		let mut tables = Vec::with_capacity(raw_counts.len());
		let mut stores = Vec::with_capacity(raw_counts.len());
		let mut marg = CountStore::Indexed(Vec::new());
		for (k, counts) in raw_counts.iter().enumerate() {
			let mut table = vec![0u32];
			let mut lookup: HashMap<u32, u16> = HashMap::new();
			lookup.insert(0, 0);
			let mut indexed = Vec::with_capacity(counts.len());
			for &count in counts {
				let idx = match lookup.get(&count) {
					Some(&idx) => idx,
					None => {
						if table.len() > size {
							return Err(LmError::TooLarge(format!(
								"more than {size} distinct {}-gram counts, use four-byte counts",
								k + 1
							)));
						}
						table.push(count);
						let idx = (table.len() - 1) as u16;
						lookup.insert(count, idx);
						idx
					}
				};
				indexed.push(idx);
			}
			if k == 0 {
				marg = CountStore::Indexed(indexed.clone());
			}
			table.resize(size + 1, 0);
			tables.push(table);
			stores.push(CountStore::Indexed(indexed));
		}
		Ok((tables, stores, marg))
	}

	fn context_cue_flags(&self) -> Vec<u8> {
		let mut flags = vec![0u8; self.vocab.len()];
		for cue in &self.options.context_cues {
			match self.vocab_ht.lookup(cue) {
				Some(id) => flags[id as usize] = 1,
				None => warn!("Context cue {cue} is not in the vocabulary, ignored"),
			}
		}
		flags
	}

	/// Maximum likelihood unigram distribution. Unseen words count as
	/// `zeroton_fraction` of a singleton; context cues get no mass.
	fn unigram_probs(&self, counts: &[u32], context_cue: &[u8], first_id: u16) -> (Vec<f32>, Vec<f32>, i64) {
		let open2 = self.options.vocab_type == VocabType::OpenType2;
		let mut weights = vec![0f64; counts.len()];
		for w in first_id as usize..counts.len() {
			if context_cue[w] != 0 || (open2 && w == 0) {
				continue;
			}
			weights[w] = if counts[w] == 0 { self.options.zeroton_fraction } else { counts[w] as f64 };
		}
		let total: f64 = weights.iter().sum();
		let scale = if open2 { 1.0 - self.options.oov_fraction } else { 1.0 };

		let mut probs: Vec<f32> =
			weights.iter().map(|&w| if total > 0.0 { (w / total * scale) as f32 } else { 0.0 }).collect();
		if open2 {
			probs[0] = self.options.oov_fraction as f32;
		}
		let log_probs = probs
			.iter()
			.map(|&p| if p > 0.0 { (p as f64).ln() as f32 } else { (BAD_LOG_PROB / std::f64::consts::LOG10_E) as f32 })
			.collect();
		let n_unigrams = counts.iter().map(|&c| c as i64).sum();
		(probs, log_probs, n_unigrams)
	}
}

/// Short successor indices and pointer tables for every level with
/// children. The last level gets an empty pointer table.
fn successor_indices(levels: &[Vec<(Vec<u32>, u32)>], vocab_size: usize) -> (Vec<Vec<u16>>, Vec<Vec<i32>>) {
	let n = levels.len();
	let mut ind = Vec::with_capacity(n.saturating_sub(1));
	let mut ptr_tables = vec![Vec::new(); n];
	for k in 1..n {
		let parents = &levels[k - 1];
		let children = &levels[k];
		let mut short = Vec::with_capacity(parents.len());
		let mut c = 0usize;
		for (pos, (key, _)) in parents.iter().enumerate() {
			while c < children.len() && children[c].0[..k] < key[..] {
				c += 1;
			}
			short.push(new_index(c, &mut ptr_tables[k - 1], pos));
		}
		ind.push(short);
	}
	debug!("successor indices built for {} levels over {} words", ind.len(), vocab_size + 1);
	(ind, ptr_tables)
}

/// Frequency of frequency per level, counting nodes seen 1 to `fof_size`
/// times.
fn levels_fof(levels: &[Vec<(Vec<u32>, u32)>], fof_size: &[u16], first_id: u16) -> Vec<Vec<i32>> {
	levels
		.iter()
		.zip(fof_size)
		.map(|(level, &size)| {
			let mut fof = vec![0i32; size as usize + 1];
			for (key, count) in level {
				if key.len() == 1 && key[0] < first_id as u32 {
					continue;
				}
				if let Some(slot) = fof.get_mut(*count as usize).filter(|_| *count > 0) {
					*slot += 1;
				}
			}
			fof
		})
		.collect()
}

/// Fills the backoff weights level by level, so that each level can use
/// the weights of the shorter contexts.
fn compute_alphas(model: &mut CountModel) -> Result<()> {
	for level in 0..model.bo_weights.len() {
		let mut values = vec![0f64; model.num_kgrams(level)];
		let reader: &CountModel = model;
		reader.walk(level, &mut |path: &[usize]| {
			values[path[level]] = log10_alpha(reader, level, path);
			Ok(())
		})?;

		let store = if model.four_byte_alphas {
			AlphaStore::Full(values.iter().map(|&v| v as f32).collect())
		} else {
			let codes = values.iter().map(|&v| model.alpha_codec.encode(v)).collect::<Result<Vec<u16>>>()?;
			AlphaStore::Quantized(codes)
		};
		model.bo_weights[level] = store;
		debug!("{}-gram backoff weights computed", level + 1);
	}
	Ok(())
}

/// Log10 of the mass left by the discounted children of a context,
/// normalized by the mass the shorter context gives the same words.
fn log10_alpha(model: &CountModel, level: usize, path: &[usize]) -> f64 {
	let pos = path[level];
	let children = model.children(level, pos);
	if children.is_empty() {
		return 0.0;
	}
	let context = model.path_words(path);
	let mut numerator = 1.0;
	let mut denominator = 1.0;
	for child in children {
		numerator -= model.node_prob(level + 1, child, pos);
		let mut lower = context[1..].to_vec();
		lower.push(model.word_at(level + 1, child));
		denominator -= model.prob(&lower);
	}
	if numerator <= 0.0 || denominator <= 0.0 {
		BAD_LOG_PROB
	} else {
		(numerator / denominator).log10()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const VOCAB: [&str; 5] = ["<s>", "</s>", "a", "b", "c"];

	fn builder(n: usize, options: CountOptions) -> CountModelBuilder {
		CountModelBuilder::new(n, &VOCAB, options, &LmConfig::default()).unwrap()
	}

	#[test]
	fn stream_windows_cross_sentences() {
		let mut b = builder(2, CountOptions::default());
		b.add_sentence("<s> a b </s>");
		b.add_sentence("<s> a c </s>");
		let model = b.build().unwrap();

		let s = model.word_id("<s>").unwrap();
		let end = model.word_id("</s>").unwrap();
		let a = model.word_id("a").unwrap();
		assert_eq!(model.count(0, a as usize), 2);
		assert!(model.find_path(&[end, s]).is_some());
		assert_eq!(model.num_kgrams(1), 6);
		assert_eq!(model.children(0, a as usize).len(), 2);
		assert_eq!(model.marg_count(a as usize), 2);
	}

	#[test]
	fn closed_vocabulary_drops_oov_windows() {
		let mut b = builder(2, CountOptions::default());
		b.add_sentence("a zz b a b");
		let model = b.build().unwrap();
		let a = model.word_id("a").unwrap();
		let bb = model.word_id("b").unwrap();
		assert_eq!(model.num_kgrams(1), 2);
		assert!(model.find_path(&[a, bb]).is_some());
		assert_eq!(model.count(0, 0), 0);
	}

	#[test]
	fn open_vocabulary_maps_oov_to_unknown() {
		let options = CountOptions { vocab_type: VocabType::OpenType1, ..CountOptions::default() };
		let mut b = builder(2, options);
		b.add_sentence("a zz b");
		let model = b.build().unwrap();
		let a = model.word_id("a").unwrap();
		assert!(model.find_path(&[a, 0]).is_some());
		assert_eq!(model.first_id(), 0);
	}

	#[test]
	fn cutoffs_remove_rare_ngrams_and_their_children() {
		let options = CountOptions { cutoffs: vec![0, 1, 0], ..CountOptions::default() };
		let mut b = builder(3, options);
		b.add_sentence("a b c a b c a c b");
		let model = b.build().unwrap();
		let [a, bb, c] = ["a", "b", "c"].map(|w| model.word_id(w).unwrap());
		assert!(model.find_path(&[a, bb]).is_some());
		assert!(model.find_path(&[a, c]).is_none());
		assert!(model.find_path(&[a, c, bb]).is_none());
		assert!(model.find_path(&[a, bb, c]).is_some());
	}

	#[test]
	fn unigram_distribution_sums_to_one() {
		let options = CountOptions { context_cues: vec!["<s>".to_owned()], ..CountOptions::default() };
		let mut b = builder(2, options);
		b.add_sentence("<s> a a b </s> <s> a");
		let model = b.build().unwrap();
		let total: f64 = (1..=model.vocab_size() as u32).map(|w| model.uni_prob(w)).sum();
		assert!((total - 1.0).abs() < 1e-5);
		assert_eq!(model.uni_prob(model.word_id("<s>").unwrap()), 0.0);
		let c = model.word_id("c").unwrap();
		assert!(model.uni_prob(c) > 0.0);
		assert_eq!(model.n_context_cues, 1);
	}

	#[test]
	fn conditional_probabilities_sum_to_one() {
		let mut b = builder(3, CountOptions::default());
		b.add_sentence("<s> a b c </s> <s> a c b </s> <s> b a c </s>");
		let model = b.build().unwrap();
		for context in [vec![1u32], vec![3], vec![1, 3], vec![3, 5]] {
			let total: f64 = (1..=model.vocab_size() as u32)
				.map(|w| {
					let mut ids = context.clone();
					ids.push(w);
					model.prob(&ids)
				})
				.sum();
			assert!((total - 1.0).abs() < 1e-2, "{context:?}: {total}");
		}
	}

	#[test]
	fn good_turing_fills_frequency_of_frequency() {
		let options = CountOptions {
			discounting: Discounting::GoodTuring {
				fof_size: vec![3, 3],
				disc_range: vec![1, 2],
				freq_of_freq: Vec::new(),
				ratios: vec![vec![0.0, 0.8], vec![0.0, 0.5, 0.75]],
			},
			..CountOptions::default()
		};
		let mut b = builder(2, options);
		b.add_sentence("a b a b a c");
		let model = b.build().unwrap();
		let Discounting::GoodTuring { freq_of_freq, .. } = model.discounting() else {
			panic!("discounting changed");
		};
		// bigrams: a b (2), b a (2), a c (1)
		assert_eq!(freq_of_freq[1], vec![0, 1, 2, 0]);
	}

	#[test]
	fn too_many_distinct_counts_need_four_bytes() {
		let options = CountOptions { count_table_size: 2, ..CountOptions::default() };
		let mut b = builder(1, options);
		for (i, w) in VOCAB.iter().enumerate() {
			for _ in 0..=i {
				b.add_sentence(w);
			}
		}
		assert!(matches!(b.build(), Err(LmError::TooLarge(_))));
	}

	#[test]
	fn bad_ngrams_are_rejected() {
		let mut b = builder(2, CountOptions::default());
		assert!(matches!(b.add_ngram(&[1], 1), Err(LmError::Config(_))));
		assert!(matches!(b.add_ngram(&[1, 99], 1), Err(LmError::Config(_))));
		assert!(b.add_ngram(&[1, 2], 4).is_ok());
	}
}
