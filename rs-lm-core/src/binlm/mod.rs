//! Binary count-model files.
//!
//! The file is a flat sequence of native-endian fields: a scalar header,
//! the vocabulary hash table, the count and pointer tables, the unigram
//! statistics, the discounting parameters and finally the tree arrays,
//! written in chunks. The two four-byte flags of the header select the
//! width of counts and backoff weights for the rest of the file.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::info;

use crate::config::LmConfig;
use crate::counts::discount::{self, LazyDiscounter};
use crate::counts::{AlphaCodec, AlphaStore, CountModel, CountStore, Discounting, VocabType};
use crate::error::{IoContext, LmError, Result};
use crate::io::{BinReader, BinWriter};
use crate::sih::SihTable;

/// Version tag at the start of every binary model.
pub const BIN_VERSION: i32 = 970314;

/// Largest number of records moved by one read or write of a tree array.
const CHUNK: usize = 100_000;

/// Writes `model` to `path`.
///
/// # Errors
/// `LmError::Io` on any write failure, `LmError::Format` if the model's
/// stores disagree with its four-byte flags. A failed write leaves a
/// partial file behind.
pub fn write_bin<P: AsRef<Path>>(model: &CountModel, path: P) -> Result<()> {
	let path = path.as_ref();
	info!("Binary {}-gram will be written to {}", model.n, path.display());
	let file = File::create(path).context(&format!("creating {}", path.display()))?;
	let mut out = BinWriter::new(BufWriter::new(file));
	write_model(model, &mut out)?;
	out.flush()?;
	info!("Binary model {} written", path.display());
	Ok(())
}

/// Reads a model written by [`write_bin`].
///
/// Only the sentence symbols are taken from `config`; everything else comes
/// from the file.
///
/// # Errors
/// `LmError::Format` on a version mismatch, an unknown code in the header,
/// an inconsistent vocabulary or trailing bytes; `LmError::Io` when the file
/// ends early.
pub fn read_bin<P: AsRef<Path>>(path: P, config: &LmConfig) -> Result<CountModel> {
	let path = path.as_ref();
	info!("Reading binary model {}", path.display());
	let file = File::open(path).context(&format!("opening {}", path.display()))?;
	let mut input = BinReader::new(BufReader::new(file));
	let model = read_model(&mut input, config)?;
	input.expect_end()?;
	info!("{}-gram binary model read, vocabulary of {} words", model.n, model.vocab_size());
	Ok(model)
}

fn check_stores(model: &CountModel) -> Result<()> {
	let counts_ok = model
		.counts
		.iter()
		.chain(std::iter::once(&model.marg_counts))
		.all(|s| matches!(s, CountStore::Full(_)) == model.four_byte_counts);
	let alphas_ok = model.bo_weights.iter().all(|s| matches!(s, AlphaStore::Full(_)) == model.four_byte_alphas);
	if counts_ok && alphas_ok {
		Ok(())
	} else {
		Err(LmError::Format("count or alpha storage does not match the four-byte flags".to_owned()))
	}
}

fn write_counts<W: Write>(out: &mut BinWriter<W>, store: &CountStore, chunked: bool, what: &str) -> Result<()> {
	match (store, chunked) {
		(CountStore::Full(v), false) => out.slice(v, what),
		(CountStore::Full(v), true) => out.chunked(v, CHUNK, what),
		(CountStore::Indexed(v), false) => out.slice(v, what),
		(CountStore::Indexed(v), true) => out.chunked(v, CHUNK, what),
	}
}

fn write_alphas<W: Write>(out: &mut BinWriter<W>, store: &AlphaStore, chunked: bool, what: &str) -> Result<()> {
	match (store, chunked) {
		(AlphaStore::Full(v), false) => out.slice(v, what),
		(AlphaStore::Full(v), true) => out.chunked(v, CHUNK, what),
		(AlphaStore::Quantized(v), false) => out.slice(v, what),
		(AlphaStore::Quantized(v), true) => out.chunked(v, CHUNK, what),
	}
}

fn write_model<W: Write>(model: &CountModel, out: &mut BinWriter<W>) -> Result<()> {
	check_stores(model)?;
	model.check_structure()?;
	let n = model.n;

	out.scalar(BIN_VERSION, "version")?;
	out.scalar(narrow::<u16>(n, "model order")?, "n")?;
	out.scalar(narrow::<u32>(model.vocab_size(), "vocabulary size")?, "vocab_size")?;
	out.scalar(model.n_context_cues, "no_of_ccs")?;
	out.scalar(model.vocab_type.code(), "vocab_type")?;
	out.scalar(model.count_table_size, "count_table_size")?;
	out.scalar(model.discounting.code(), "discounting_method")?;
	out.scalar(model.alpha_codec.min_alpha, "min_alpha")?;
	out.scalar(model.alpha_codec.max_alpha, "max_alpha")?;
	out.scalar(model.alpha_codec.out_of_range_alphas, "out_of_range_alphas")?;
	out.scalar(narrow::<u16>(model.alpha_codec.alpha_array.len(), "alpha array")?, "size_of_alpha_array")?;
	out.scalar(model.n_unigrams, "n_unigrams")?;
	out.scalar(model.zeroton_fraction, "zeroton_fraction")?;
	out.scalar(model.oov_fraction, "oov_fraction")?;
	out.scalar(model.four_byte_counts as u8, "four_byte_counts")?;
	out.scalar(model.four_byte_alphas as u8, "four_byte_alphas")?;
	out.scalar(model.first_id, "first_id")?;

	model.vocab_ht.write(out)?;

	write_counts(out, &model.marg_counts, false, "marg_counts")?;
	out.slice(&model.alpha_codec.alpha_array, "alpha_array")?;
	if !model.four_byte_counts {
		for table in &model.count_tables {
			out.slice(table, "count_table")?;
		}
	}

	let ptr_sizes = model
		.ptr_tables
		.iter()
		.map(|t| narrow::<u16>(t.len(), "pointer table"))
		.collect::<Result<Vec<u16>>>()?;
	out.slice(&ptr_sizes, "ptr_table_size")?;
	for table in &model.ptr_tables {
		out.slice(table, "ptr_table")?;
	}

	out.slice(&model.uni_probs, "uni_probs")?;
	out.slice(&model.uni_log_probs, "uni_log_probs")?;
	out.slice(&model.context_cue, "context_cue")?;
	out.slice(&model.cutoffs, "cutoffs")?;

	match &model.discounting {
		Discounting::GoodTuring { fof_size, disc_range, freq_of_freq, ratios } => {
			out.slice(fof_size, "fof_size")?;
			out.slice(disc_range, "disc_range")?;
			for fof in freq_of_freq {
				out.slice(fof, "freq_of_freq")?;
			}
			for r in ratios {
				out.slice(r, "gt_disc_ratio")?;
			}
		}
		Discounting::WittenBell => {}
		Discounting::Linear { ratios } => out.slice(ratios, "lin_disc_ratio")?,
		Discounting::Absolute { constants } => out.slice(constants, "abs_disc_const")?,
	}

	out.slice(&model.num_kgrams, "num_kgrams")?;
	write_counts(out, &model.counts[0], false, "unigram counts")?;
	write_alphas(out, &model.bo_weights[0], false, "unigram backoff weights")?;
	if n > 1 {
		out.slice(&model.ind[0], "unigram -> bigram pointers")?;
	}

	for k in 1..n {
		out.chunked(&model.word_ids[k], CHUNK, &format!("{}-gram word ids", k + 1))?;
	}
	for k in 1..n {
		write_counts(out, &model.counts[k], true, &format!("{}-gram counts", k + 1))?;
	}
	for k in 1..n.saturating_sub(1) {
		write_alphas(out, &model.bo_weights[k], true, &format!("{}-gram backoff weights", k + 1))?;
	}
	for k in 1..n.saturating_sub(1) {
		out.chunked(&model.ind[k], CHUNK, &format!("{}-gram -> {}-gram pointers", k + 1, k + 2))?;
	}
	Ok(())
}

fn read_counts<R: Read>(
	input: &mut BinReader<R>,
	len: usize,
	four_byte: bool,
	chunked: bool,
	what: &str,
) -> Result<CountStore> {
	Ok(match (four_byte, chunked) {
		(true, false) => CountStore::Full(input.vec(len, what)?),
		(true, true) => CountStore::Full(input.chunked(len, CHUNK, what)?),
		(false, false) => CountStore::Indexed(input.vec(len, what)?),
		(false, true) => CountStore::Indexed(input.chunked(len, CHUNK, what)?),
	})
}

fn read_alphas<R: Read>(
	input: &mut BinReader<R>,
	len: usize,
	four_byte: bool,
	chunked: bool,
	what: &str,
) -> Result<AlphaStore> {
	Ok(match (four_byte, chunked) {
		(true, false) => AlphaStore::Full(input.vec(len, what)?),
		(true, true) => AlphaStore::Full(input.chunked(len, CHUNK, what)?),
		(false, false) => AlphaStore::Quantized(input.vec(len, what)?),
		(false, true) => AlphaStore::Quantized(input.chunked(len, CHUNK, what)?),
	})
}

/// `value` as a narrower header field.
fn narrow<T: TryFrom<usize>>(value: usize, what: &str) -> Result<T> {
	T::try_from(value).map_err(|_| LmError::TooLarge(format!("{what} of {value} does not fit the binary header")))
}

fn checked_len(value: i64, what: &str) -> Result<usize> {
	usize::try_from(value).map_err(|_| LmError::Format(format!("{what} is negative ({value})")))
}

fn read_model<R: Read>(input: &mut BinReader<R>, config: &LmConfig) -> Result<CountModel> {
	let version: i32 = input.scalar("version")?;
	if version != BIN_VERSION {
		return Err(LmError::Format(format!(
			"binary file version is {version}, this program reads version {BIN_VERSION}"
		)));
	}
	let n = input.scalar::<u16>("n")? as usize;
	if n == 0 {
		return Err(LmError::Format("binary model of order 0".to_owned()));
	}
	let vocab_size = input.scalar::<u32>("vocab_size")? as usize;
	let n_context_cues: u16 = input.scalar("no_of_ccs")?;
	let vocab_code: u16 = input.scalar("vocab_type")?;
	let vocab_type = VocabType::from_code(vocab_code)
		.ok_or_else(|| LmError::Format(format!("unknown vocabulary type {vocab_code}")))?;
	let count_table_size: u16 = input.scalar("count_table_size")?;
	let method: u16 = input.scalar("discounting_method")?;
	let min_alpha: f64 = input.scalar("min_alpha")?;
	let max_alpha: f64 = input.scalar("max_alpha")?;
	let out_of_range_alphas: u16 = input.scalar("out_of_range_alphas")?;
	let size_of_alpha_array = input.scalar::<u16>("size_of_alpha_array")? as usize;
	let n_unigrams: i64 = input.scalar("n_unigrams")?;
	let zeroton_fraction: f64 = input.scalar("zeroton_fraction")?;
	let oov_fraction: f64 = input.scalar("oov_fraction")?;
	let four_byte_counts = input.scalar::<u8>("four_byte_counts")? != 0;
	let four_byte_alphas = input.scalar::<u8>("four_byte_alphas")? != 0;
	let first_id: u16 = input.scalar("first_id")?;

	let vocab_ht = SihTable::read(input)?;
	// every id needs a word in the table, so the table bounds the vocabulary
	if vocab_size >= vocab_ht.len() {
		return Err(LmError::Format(format!(
			"vocabulary of {vocab_size} words but only {} words in its table",
			vocab_ht.len()
		)));
	}
	let mut vocab = vec![String::new(); vocab_size + 1];
	let mut filled = vec![false; vocab_size + 1];
	for (word, id) in vocab_ht.iter() {
		if let Some(slot) = usize::try_from(id).ok().filter(|&i| i <= vocab_size) {
			vocab[slot] = word.to_owned();
			filled[slot] = true;
		}
	}
	if let Some(missing) = filled.iter().position(|&f| !f) {
		return Err(LmError::Format(format!("word id {missing} is missing from the vocabulary table")));
	}

	let marg_counts = read_counts(input, vocab_size + 1, four_byte_counts, false, "marg_counts")?;
	let alpha_array: Vec<f64> = input.vec(size_of_alpha_array, "alpha_array")?;
	let count_tables = if four_byte_counts {
		Vec::new()
	} else {
		(0..n)
			.map(|_| input.vec::<u32>(count_table_size as usize + 1, "count_table"))
			.collect::<Result<Vec<_>>>()?
	};

	let ptr_sizes: Vec<u16> = input.vec(n, "ptr_table_size")?;
	let ptr_tables = ptr_sizes
		.iter()
		.map(|&size| input.vec::<i32>(size as usize, "ptr_table"))
		.collect::<Result<Vec<_>>>()?;

	let uni_probs: Vec<f32> = input.vec(vocab_size + 1, "uni_probs")?;
	let uni_log_probs: Vec<f32> = input.vec(vocab_size + 1, "uni_log_probs")?;
	let context_cue: Vec<u8> = input.vec(vocab_size + 1, "context_cue")?;
	let cutoffs: Vec<i32> = input.vec(n, "cutoffs")?;

	let discounting = match method {
		discount::GOOD_TURING => {
			let fof_size: Vec<u16> = input.vec(n, "fof_size")?;
			let disc_range: Vec<u16> = input.vec(n, "disc_range")?;
			let freq_of_freq = fof_size
				.iter()
				.map(|&size| input.vec::<i32>(size as usize + 1, "freq_of_freq"))
				.collect::<Result<Vec<_>>>()?;
			let ratios = disc_range
				.iter()
				.map(|&range| input.vec::<f64>(range as usize + 1, "gt_disc_ratio"))
				.collect::<Result<Vec<_>>>()?;
			Discounting::GoodTuring { fof_size, disc_range, freq_of_freq, ratios }
		}
		discount::WITTEN_BELL => Discounting::WittenBell,
		discount::LINEAR => Discounting::Linear { ratios: input.vec(n, "lin_disc_ratio")? },
		discount::ABSOLUTE => Discounting::Absolute { constants: input.vec(n, "abs_disc_const")? },
		other => return Err(LmError::Format(format!("unknown discounting method {other}"))),
	};

	let num_kgrams: Vec<i64> = input.vec(n, "num_kgrams")?;
	let sizes = num_kgrams
		.iter()
		.enumerate()
		.map(|(k, &c)| checked_len(c, &format!("number of {}-grams", k + 1)))
		.collect::<Result<Vec<usize>>>()?;
	if sizes[0] != vocab_size + 1 {
		return Err(LmError::Format(format!(
			"{} unigrams for a vocabulary of {vocab_size} words",
			sizes[0]
		)));
	}

	let mut counts = vec![read_counts(input, sizes[0], four_byte_counts, false, "unigram counts")?];
	let mut bo_weights = vec![read_alphas(input, sizes[0], four_byte_alphas, false, "unigram backoff weights")?];
	let mut ind = Vec::with_capacity(n.saturating_sub(1));
	if n > 1 {
		ind.push(input.vec::<u16>(sizes[0], "unigram -> bigram pointers")?);
	}

	let mut word_ids = vec![Vec::new()];
	for k in 1..n {
		word_ids.push(input.chunked::<u32>(sizes[k], CHUNK, &format!("{}-gram word ids", k + 1))?);
	}
	for k in 1..n {
		counts.push(read_counts(input, sizes[k], four_byte_counts, true, &format!("{}-gram counts", k + 1))?);
	}
	for k in 1..n.saturating_sub(1) {
		let what = format!("{}-gram backoff weights", k + 1);
		bo_weights.push(read_alphas(input, sizes[k], four_byte_alphas, true, &what)?);
	}
	for k in 1..n.saturating_sub(1) {
		ind.push(input.chunked::<u16>(sizes[k], CHUNK, &format!("{}-gram -> {}-gram pointers", k + 1, k + 2))?);
	}

	let model = CountModel {
		n,
		symbols: config.symbols.clone(),
		vocab,
		vocab_ht,
		vocab_type,
		first_id,
		n_context_cues,
		count_table_size,
		discounting,
		alpha_codec: AlphaCodec { min_alpha, max_alpha, out_of_range_alphas, alpha_array },
		n_unigrams,
		zeroton_fraction,
		oov_fraction,
		four_byte_counts,
		four_byte_alphas,
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
	model.check_structure()?;
	Ok(model)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::counts::{CountModelBuilder, CountOptions};

	fn small_model(options: CountOptions) -> CountModel {
		let vocab = ["<s>", "</s>", "the", "cat", "dog", "sat"];
		let mut builder = CountModelBuilder::new(3, &vocab, options, &LmConfig::default()).unwrap();
		builder.add_sentence("<s> the cat sat </s>");
		builder.add_sentence("<s> the dog sat </s>");
		builder.add_sentence("<s> the cat </s>");
		builder.build().unwrap()
	}

	fn round_trip(model: &CountModel) -> CountModel {
		let mut bytes = Vec::new();
		{
			let mut out = BinWriter::new(&mut bytes);
			write_model(model, &mut out).unwrap();
		}
		let mut input = BinReader::new(bytes.as_slice());
		let back = read_model(&mut input, &LmConfig::default()).unwrap();
		input.expect_end().unwrap();
		back
	}

	#[test]
	fn header_starts_with_version() {
		let model = small_model(CountOptions::default());
		let mut bytes = Vec::new();
		write_model(&model, &mut BinWriter::new(&mut bytes)).unwrap();
		assert_eq!(bytes[..4], BIN_VERSION.to_ne_bytes());
		assert_eq!(bytes[4..6], 3u16.to_ne_bytes());
	}

	#[test]
	fn indexed_model_round_trips() {
		let model = small_model(CountOptions::default());
		assert_eq!(round_trip(&model), model);
	}

	#[test]
	fn four_byte_model_round_trips() {
		let options = CountOptions { four_byte_counts: true, four_byte_alphas: true, ..CountOptions::default() };
		let model = small_model(options);
		assert!(model.count_tables.is_empty());
		assert_eq!(round_trip(&model), model);
	}

	#[test]
	fn discounting_parameters_round_trip() {
		let methods = [
			Discounting::Linear { ratios: vec![0.9, 0.8, 0.7] },
			Discounting::Absolute { constants: vec![0.5, 0.5, 0.5] },
			Discounting::GoodTuring {
				fof_size: vec![5, 5, 5],
				disc_range: vec![1, 3, 3],
				freq_of_freq: Vec::new(),
				ratios: vec![vec![0.0, 0.9], vec![0.0, 0.5, 0.7, 0.9], vec![0.0, 0.4, 0.6, 0.8]],
			},
		];
		for discounting in methods {
			let model = small_model(CountOptions { discounting, ..CountOptions::default() });
			let back = round_trip(&model);
			assert_eq!(back.discounting(), model.discounting());
			assert_eq!(back, model);
		}
	}

	#[test]
	fn wrong_version_is_rejected() {
		let model = small_model(CountOptions::default());
		let mut bytes = Vec::new();
		write_model(&model, &mut BinWriter::new(&mut bytes)).unwrap();
		bytes[..4].copy_from_slice(&970313i32.to_ne_bytes());
		let result = read_model(&mut BinReader::new(bytes.as_slice()), &LmConfig::default());
		assert!(matches!(result, Err(LmError::Format(_))));
	}

	#[test]
	fn truncated_file_reports_io() {
		let model = small_model(CountOptions::default());
		let mut bytes = Vec::new();
		write_model(&model, &mut BinWriter::new(&mut bytes)).unwrap();
		bytes.truncate(bytes.len() - 3);
		let result = read_model(&mut BinReader::new(bytes.as_slice()), &LmConfig::default());
		assert!(matches!(result, Err(LmError::Io { .. })));
	}

	#[test]
	fn vocabulary_larger_than_its_table_is_rejected() {
		let model = small_model(CountOptions::default());
		let mut bytes = Vec::new();
		write_model(&model, &mut BinWriter::new(&mut bytes)).unwrap();
		bytes[6..10].copy_from_slice(&u32::MAX.to_ne_bytes());
		let result = read_model(&mut BinReader::new(bytes.as_slice()), &LmConfig::default());
		assert!(matches!(result, Err(LmError::Format(_))));
	}

	#[test]
	fn inconsistent_models_are_not_written() {
		let mut bytes = Vec::new();

		let mut model = small_model(CountOptions::default());
		model.word_ids[1][0] = 999;
		assert!(matches!(write_model(&model, &mut BinWriter::new(&mut bytes)), Err(LmError::Format(_))));

		let mut model = small_model(CountOptions::default());
		model.counts[2] = CountStore::Indexed(Vec::new());
		assert!(matches!(write_model(&model, &mut BinWriter::new(&mut bytes)), Err(LmError::Format(_))));

		let options = CountOptions {
			discounting: Discounting::GoodTuring {
				fof_size: vec![5, 5, 5],
				disc_range: vec![1, 3, 3],
				freq_of_freq: Vec::new(),
				ratios: vec![vec![0.0, 0.9], vec![0.0, 0.5, 0.7, 0.9], vec![0.0, 0.4, 0.6, 0.8]],
			},
			..CountOptions::default()
		};
		let mut model = small_model(options);
		if let Discounting::GoodTuring { freq_of_freq, .. } = &mut model.discounting {
			freq_of_freq.push(vec![0; 6]);
		}
		assert!(matches!(write_model(&model, &mut BinWriter::new(&mut bytes)), Err(LmError::Format(_))));
	}

	#[test]
	fn oversized_header_fields_are_too_large() {
		let mut model = small_model(CountOptions::default());
		model.alpha_codec.alpha_array = vec![0.0; usize::from(u16::MAX) + 1];
		let mut bytes = Vec::new();
		let result = write_model(&model, &mut BinWriter::new(&mut bytes));
		assert!(matches!(result, Err(LmError::TooLarge(_))));
		assert!(matches!(narrow::<u16>(70_000, "pointer table"), Err(LmError::TooLarge(_))));
	}
}
