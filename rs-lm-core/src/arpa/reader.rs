use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use log::{info, warn};

use crate::config::LmConfig;
use crate::error::{IoContext, LmError, Result};
use crate::io::open_lines;
use crate::logmath::LogMath;
use crate::model::lm3g::Lm3gBuilder;
use crate::model::NgramModel;

/// Trimmed lines with their 1-based position.
struct ArpaLines {
	lines: io::Lines<BufReader<File>>,
	line_no: usize,
}

impl ArpaLines {
	fn next_line(&mut self) -> Result<Option<String>> {
		match self.lines.next() {
			None => Ok(None),
			Some(line) => {
				self.line_no += 1;
				let line = line.context("reading ARPA file")?;
				Ok(Some(line.trim().to_owned()))
			}
		}
	}

	fn format_error(&self, message: &str) -> LmError {
		LmError::Format(format!("line {}: {message}", self.line_no))
	}
}

/// Truncates to four decimals, as bigram and trigram values are stored.
fn quantize(p: f32) -> f32 {
	((p * 10000.0) as i32) as f32 / 10000.0
}

fn parse_value(lines: &ArpaLines, field: &str) -> Result<f32> {
	field.parse().map_err(|_| lines.format_error(&format!("bad number '{field}'")))
}

/// Reads an ARPA file into a writable scoring model.
///
/// # Errors
/// - `LmError::Format` for a missing `\data\` mark, bad counts, out-of-order
///   records or a trigram without its bigram
/// - `LmError::TooLarge` when a trigram segment overflows
///
/// Records with unknown words are skipped with a warning, unless the
/// vocabulary has an unknown-word entry to map them to.
pub fn read_arpa<P: AsRef<Path>>(path: P, config: &LmConfig) -> Result<NgramModel> {
	let path = path.as_ref();
	let mut lines = ArpaLines { lines: open_lines(path)?, line_no: 0 };

	let [n_ug, n_bg, n_tg] = read_counts(&mut lines)?;
	info!("ngrams 1={n_ug}, 2={n_bg}, 3={n_tg}");
	let n = if n_tg > 0 {
		3
	} else if n_bg > 0 {
		2
	} else {
		1
	};

	let mut model = NgramModel::init(config, n, n_ug)?;
	model.set_writable(true);
	let lmath = *model.logmath();
	let mut builder = Lm3gBuilder::new(n_ug, n_bg, n_tg);

	let n_read = read_unigrams(&mut lines, &mut model, &mut builder, &lmath, n_ug)?;
	info!("{n_read:8} = #unigrams created");
	builder.end_unigrams(n_read);

	if n_bg > 0 {
		read_bigrams(&mut lines, &model, &mut builder, &lmath)?;
	}
	builder.end_bigrams();
	if n_tg > 0 {
		read_trigrams(&mut lines, &model, &mut builder, &lmath)?;
	}

	model.set_tree(builder.finish()?);
	Ok(model)
}

/// Parses the `\data\` block and stops on the `\1-grams:` mark.
fn read_counts(lines: &mut ArpaLines) -> Result<[usize; 3]> {
	loop {
		match lines.next_line()? {
			Some(line) if line == "\\data\\" => break,
			Some(_) => {}
			None => return Err(LmError::Format("no \\data\\ mark in LM file".to_owned())),
		}
	}

	let mut counts = [0i64; 3];
	let mut line = loop {
		let Some(line) = lines.next_line()? else {
			return Err(lines.format_error("EOF while reading ngram counts"));
		};
		let Some((order, count)) = parse_count_line(&line) else {
			break line;
		};
		match order {
			1..=3 => counts[order as usize - 1] = count,
			_ => return Err(lines.format_error(&format!("unknown ngram ({order})"))),
		}
	};

	while line != "\\1-grams:" {
		line = lines.next_line()?.ok_or_else(|| lines.format_error("failed to read \\1-grams: mark"))?;
	}

	if counts[0] <= 0 || counts[1] < 0 || counts[2] < 0 {
		return Err(LmError::Format("bad or missing ngram count".to_owned()));
	}
	Ok(counts.map(|c| c as usize))
}

/// `ngram K=V`
fn parse_count_line(line: &str) -> Option<(i64, i64)> {
	let rest = line.strip_prefix("ngram")?.trim_start();
	let (order, count) = rest.split_once('=')?;
	Some((order.trim().parse().ok()?, count.trim().parse().ok()?))
}

fn read_unigrams(
	lines: &mut ArpaLines,
	model: &mut NgramModel,
	builder: &mut Lm3gBuilder,
	lmath: &LogMath,
	n_ug: usize,
) -> Result<usize> {
	info!("Reading unigrams");
	let mut wcnt = 0usize;
	while let Some(line) = lines.next_line()? {
		if line == "\\2-grams:" || line == "\\end\\" {
			break;
		}
		let fields: Vec<&str> = line.split_whitespace().take(3).collect();
		if fields.len() < 2 {
			if !line.is_empty() {
				warn!("Format error; unigram ignored: {line}");
			}
			continue;
		}
		let p1 = parse_value(lines, fields[0])?;
		let bo_wt = match fields.get(2) {
			Some(f) => parse_value(lines, f)?,
			None => 0.0,
		};
		if wcnt >= n_ug {
			return Err(lines.format_error("too many unigrams"));
		}

		model.push_file_word(fields[1])?;
		builder.set_unigram(wcnt, lmath.log10_to_log(p1 as f64), lmath.log10_to_log(bo_wt as f64));
		wcnt += 1;
	}

	if wcnt != n_ug {
		warn!("unigram count ({n_ug}) != #unigrams read ({wcnt})");
	}
	Ok(wcnt)
}

/// Id of `word` for a higher-order record, `None` (with a warning) when
/// neither the word nor an unknown-word entry exists.
fn record_wid(model: &NgramModel, word: &str, record: &str) -> Option<u32> {
	match model.word_id(word) {
		Some(wid) => Some(wid as u32),
		None => {
			warn!("Unknown word: {word}, skipping ({record})");
			None
		}
	}
}

fn read_bigrams(lines: &mut ArpaLines, model: &NgramModel, builder: &mut Lm3gBuilder, lmath: &LogMath) -> Result<()> {
	info!("Reading bigrams");
	let last = loop {
		let Some(line) = lines.next_line()? else {
			return Err(lines.format_error("bad bigram: unexpected end of file"));
		};
		let fields: Vec<&str> = line.split_whitespace().take(4).collect();
		if fields.len() < 3 {
			if line.is_empty() {
				continue;
			}
			break line;
		}

		let p = parse_value(lines, fields[0])?;
		let bo_wt = match fields.get(3) {
			Some(f) => parse_value(lines, f)?,
			None => 0.0,
		};
		let record = fields[1..3].join(" ");
		let (Some(w1), Some(w2)) = (record_wid(model, fields[1], &record), record_wid(model, fields[2], &record))
		else {
			continue;
		};

		let p2 = lmath.log10_to_log(quantize(p) as f64);
		let bo_wt2 = lmath.log10_to_log(quantize(bo_wt) as f64);
		builder
			.push_bigram(w1 as usize, w2, p2, bo_wt2)
			.map_err(|e| lines.format_error(&format!("bigram {record}: {e}")))?;
	};

	if last != "\\end\\" && last != "\\3-grams:" {
		return Err(lines.format_error(&format!("bad bigram: {last}")));
	}
	Ok(())
}

fn read_trigrams(lines: &mut ArpaLines, model: &NgramModel, builder: &mut Lm3gBuilder, lmath: &LogMath) -> Result<()> {
	info!("Reading trigrams");
	let last = loop {
		let Some(line) = lines.next_line()? else {
			return Err(lines.format_error("bad trigram: unexpected end of file"));
		};
		let fields: Vec<&str> = line.split_whitespace().collect();
		if fields.len() != 4 {
			if line.is_empty() {
				continue;
			}
			break line;
		}

		let p = parse_value(lines, fields[0])?;
		let record = fields[1..4].join(" ");
		let (Some(w1), Some(w2), Some(w3)) = (
			record_wid(model, fields[1], &record),
			record_wid(model, fields[2], &record),
			record_wid(model, fields[3], &record),
		) else {
			continue;
		};

		let p3 = lmath.log10_to_log(quantize(p) as f64);
		builder.push_trigram(w1 as usize, w2, w3, p3).map_err(|e| match e {
			LmError::TooLarge(_) => e,
			other => lines.format_error(&format!("trigram {record}: {other}")),
		})?;
	};

	if last != "\\end\\" {
		return Err(lines.format_error(&format!("bad trigram: {last}")));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use tempfile::tempdir;

	#[test]
	fn count_lines_parse() {
		assert_eq!(parse_count_line("ngram 2=835668"), Some((2, 835668)));
		assert_eq!(parse_count_line("ngram 1=####ONEGRAMPLACEHOLDER####"), None);
		assert_eq!(parse_count_line("\\1-grams:"), None);
	}

	#[test]
	fn quantize_truncates_toward_zero() {
		assert_eq!(quantize(-0.69897), -0.6989);
		assert_eq!(quantize(0.12349), 0.1234);
	}

	fn read_text(text: &str) -> Result<NgramModel> {
		let dir = tempdir().expect("temp dir");
		let path = dir.path().join("m.arpa");
		fs::write(&path, text).expect("write arpa");
		read_arpa(&path, &LmConfig::default())
	}

	#[test]
	fn missing_data_mark_is_rejected() {
		assert!(matches!(read_text("hello\n"), Err(LmError::Format(_))));
	}

	#[test]
	fn bad_counts_are_rejected() {
		let text = "\\data\\\nngram 1=0\n\n\\1-grams:\n\\end\\\n";
		assert!(matches!(read_text(text), Err(LmError::Format(_))));
		let text = "\\data\\\nngram 4=2\n";
		assert!(matches!(read_text(text), Err(LmError::Format(_))));
	}

	#[test]
	fn unigram_only_model() {
		let text = "\\data\\\nngram 1=3\n\n\\1-grams:\n-1.0 a\n-0.5 b\nbroken\n\n\\end\\\n";
		let model = read_text(text).unwrap();
		assert_eq!(model.order(), 1);
		assert_eq!(model.counts(), [2, 0, 0]);
		assert_eq!(model.lookup("b"), Some(1));
		assert!(model.is_writable());
	}

	#[test]
	fn unknown_words_without_unk_are_skipped() {
		let text = "\\data\\\nngram 1=2\nngram 2=2\n\n\\1-grams:\n-1 a -0.1\n-1 b -0.1\n\n\\2-grams:\n-0.3 a b\n-0.3 a zz\n\n\\end\\\n";
		let model = read_text(text).unwrap();
		assert_eq!(model.counts(), [2, 1, 0]);
	}

	#[test]
	fn missing_bigram_of_trigram_fails() {
		let text = "\\data\\\nngram 1=2\nngram 2=1\nngram 3=1\n\n\\1-grams:\n-1 a -0.1\n-1 b -0.1\n\n\\2-grams:\n-0.3 a b -0.2\n\n\\3-grams:\n-0.1 b a b\n\n\\end\\\n";
		assert!(matches!(read_text(text), Err(LmError::Format(_))));
	}

	#[test]
	fn bigram_section_must_end_properly() {
		let text = "\\data\\\nngram 1=2\nngram 2=1\n\n\\1-grams:\n-1 a\n-1 b\n\n\\2-grams:\n-0.3 a b\nfoo\n";
		assert!(matches!(read_text(text), Err(LmError::Format(_))));
	}
}
