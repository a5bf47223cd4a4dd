use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use log::{debug, info};
use tempfile::NamedTempFile;

use super::{ArpaEntry, ArpaSource, WriteSession};
use crate::error::{IoContext, LmError, Result};

/// Count lines written before the n-gram sections, patched once the real
/// counts are known.
const PLACEHOLDERS: [&str; 3] = [
	"ngram 1=####ONEGRAMPLACEHOLDER####",
	"ngram 2=####TWOGRAMPLACEHOLDER####",
	"ngram 3=####THREEGRAMPLACEHOLDER####",
];

/// Writes `source` to `path` in ARPA format.
///
/// N-grams whose first word ends a sentence, and trigrams whose last word
/// starts one, are left out. The `ngram k=` lines are written as
/// placeholders and rewritten afterwards with the counts of what was
/// actually written.
///
/// # Errors
/// Any I/O failure, or an error raised by the source while producing its
/// entries. The file at `path` is unusable after a failure.
pub fn write_arpa<S, P>(source: &S, path: P) -> Result<WriteSession>
where
	S: ArpaSource + ?Sized,
	P: AsRef<Path>,
{
	let path = path.as_ref();
	let n = source.order();
	if !(1..=3).contains(&n) {
		return Err(LmError::Config(format!("cannot write a {n}-gram model as ARPA")));
	}
	info!("ARPA-style {n}-gram will be written to {}", path.display());

	let mut session = WriteSession::default();
	{
		let file = File::create(path).context(&format!("creating {}", path.display()))?;
		let mut out = BufWriter::new(file);
		source.write_banner(&mut out).context("writing ARPA banner")?;

		out.write_all(b"\\data\\\n").context("writing ARPA header")?;
		for k in 1..=n {
			out.write_all(PLACEHOLDERS[k - 1].as_bytes()).context("writing ARPA header")?;
			session.generated[k - 1] = source.generated_count(k);
		}

		let (start, end) = source.boundary_symbols();
		for k in 1..=n {
			write!(out, "\n\\{k}-grams:\n").context("writing ARPA section header")?;
			source.visit_ngrams(k, &mut |entry: ArpaEntry<'_>| {
				let last = entry.words.len().saturating_sub(1);
				if k >= 2 && (entry.words[0] == end || (k >= 3 && entry.words[last] == start)) {
					session.skipped[k - 1] += 1;
					return Ok(());
				}
				write_entry(&mut out, &entry)
			})?;
		}
		out.write_all(b"\n\\end\\\n").context("writing ARPA trailer")?;
		out.flush().context("flushing ARPA file")?;
	}

	patch_counts(path, n, &session)?;
	info!(
		"ARPA file {} written: {:?} n-grams, {:?} skipped",
		path.display(),
		(1..=n).map(|k| session.final_count(k)).collect::<Vec<_>>(),
		&session.skipped[..n]
	);
	Ok(session)
}

fn write_entry<W: Write>(out: &mut W, entry: &ArpaEntry<'_>) -> Result<()> {
	format_entry(out, entry).context("writing ARPA entry")
}

fn format_entry<W: Write>(out: &mut W, entry: &ArpaEntry<'_>) -> io::Result<()> {
	if let [word] = entry.words.as_slice() {
		write!(out, "{:.4} {word}", entry.log10_prob)?;
		return match entry.log10_bowt {
			Some(bowt) => writeln!(out, "\t{bowt:.4}"),
			None => writeln!(out),
		};
	}
	write!(out, "{:.4} ", entry.log10_prob)?;
	for word in &entry.words {
		write!(out, "{word} ")?;
	}
	match entry.log10_bowt {
		Some(bowt) => writeln!(out, "{bowt:.4}"),
		None => writeln!(out),
	}
}

/// Replaces the placeholder run by the final counts.
///
/// The patched text goes to a temporary file next to `path`, which is then
/// renamed over it.
fn patch_counts(path: &Path, n: usize, session: &WriteSession) -> Result<()> {
	let needle = PLACEHOLDERS[..n].concat();
	let replacement: String = (1..=n).map(|k| format!("ngram {k}={}\n", session.final_count(k))).collect();

	let text = fs::read(path).context(&format!("re-reading {}", path.display()))?;
	let patched = replace_all(&text, needle.as_bytes(), replacement.as_bytes());
	debug!("patched {} bytes into {} bytes", text.len(), patched.len());

	let dir = match path.parent() {
		Some(p) if !p.as_os_str().is_empty() => p,
		_ => Path::new("."),
	};
	let mut tmp = NamedTempFile::new_in(dir).context("creating temporary ARPA file")?;
	tmp.write_all(&patched).context("writing temporary ARPA file")?;
	tmp.flush().context("flushing temporary ARPA file")?;
	tmp.persist(path).map_err(|e| LmError::Io {
		what: format!("replacing {}", path.display()),
		source: e.error,
	})?;
	Ok(())
}

fn replace_all(haystack: &[u8], needle: &[u8], with: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(haystack.len());
	let mut i = 0;
	while i < haystack.len() {
		if haystack[i..].starts_with(needle) {
			out.extend_from_slice(with);
			i += needle.len();
		} else {
			out.push(haystack[i]);
			i += 1;
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	struct Toy {
		bigrams: Vec<(&'static str, &'static str)>,
	}

	impl ArpaSource for Toy {
		fn order(&self) -> usize {
			2
		}

		fn boundary_symbols(&self) -> (&str, &str) {
			("<s>", "</s>")
		}

		fn write_banner(&self, out: &mut dyn Write) -> io::Result<()> {
			writeln!(out, "toy model")
		}

		fn generated_count(&self, k: usize) -> usize {
			if k == 1 { 2 } else { self.bigrams.len() }
		}

		fn visit_ngrams(&self, k: usize, visit: &mut dyn FnMut(ArpaEntry<'_>) -> Result<()>) -> Result<()> {
			if k == 1 {
				for w in ["<s>", "</s>"] {
					visit(ArpaEntry { words: vec![w], log10_prob: -0.30103, log10_bowt: Some(0.0) })?;
				}
			} else {
				for (a, b) in &self.bigrams {
					visit(ArpaEntry { words: vec![*a, *b], log10_prob: -0.5, log10_bowt: None })?;
				}
			}
			Ok(())
		}
	}

	#[test]
	fn replace_all_handles_repeats() {
		assert_eq!(replace_all(b"aXbXc", b"X", b"--"), b"a--b--c".to_vec());
		assert_eq!(replace_all(b"abc", b"zz", b"y"), b"abc".to_vec());
	}

	#[test]
	fn skipped_bigram_is_not_counted() {
		let dir = tempdir().expect("temp dir");
		let path = dir.path().join("toy.arpa");
		let toy = Toy { bigrams: vec![("</s>", "<s>")] };
		let session = write_arpa(&toy, &path).unwrap();
		assert_eq!(session.final_count(1), 2);
		assert_eq!(session.final_count(2), 0);

		let text = fs::read_to_string(&path).unwrap();
		assert!(text.contains("\\data\\\nngram 1=2\nngram 2=0\n\n\\1-grams:\n"));
		assert!(text.contains("-0.3010 <s>\t0.0000\n"));
		assert!(!text.contains("PLACEHOLDER"));
		assert!(text.ends_with("\\2-grams:\n\n\\end\\\n"));
	}

	#[test]
	fn sessions_do_not_leak_between_calls() {
		let dir = tempdir().expect("temp dir");
		let path = dir.path().join("toy.arpa");
		write_arpa(&Toy { bigrams: vec![("</s>", "<s>")] }, &path).unwrap();
		let second = write_arpa(&Toy { bigrams: vec![("<s>", "</s>")] }, &path).unwrap();
		assert_eq!(second.skipped(2), 0);
		let text = fs::read_to_string(&path).unwrap();
		assert!(text.contains("ngram 2=1\n"));
		assert!(text.contains("-0.5000 <s> </s> \n"));
	}
}
