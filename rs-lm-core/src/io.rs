use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use log::debug;

use crate::error::{IoContext, LmError, Result};

/// Opens a text file for line-by-line reading.
pub(crate) fn open_lines<P: AsRef<Path>>(filename: P) -> Result<io::Lines<BufReader<File>>> {
	let path = filename.as_ref();
	let file = File::open(path).context(&format!("opening {}", path.display()))?;
	Ok(BufReader::new(file).lines())
}

/// Builds an output path based on an input path and a new extension.
///
/// Example:
/// `data/model.arpa` + `"lmdump"` → `data/model.lmdump`
pub(crate) fn build_output_path<P: AsRef<Path>>(input_path: P, output_extension: &str) -> Result<PathBuf> {
	let input_path = input_path.as_ref();

	let parent = input_path.parent().unwrap_or_else(|| Path::new("."));
	let file_stem = input_path
		.file_stem()
		.ok_or_else(|| LmError::Config(format!("{} has no filename", input_path.display())))?;

	let mut output = PathBuf::from(parent);
	output.push(file_stem);
	output.set_extension(output_extension);

	Ok(output)
}

/// Lower-cased extension of a path, if any.
pub(crate) fn extension_of<P: AsRef<Path>>(path: P) -> Option<String> {
	path.as_ref().extension().map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// Native-endian writer for plain-old-data fields.
///
/// Every call carries a `what` label that ends up in the error when the
/// underlying stream fails.
pub(crate) struct BinWriter<W: Write> {
	inner: W,
}

impl<W: Write> BinWriter<W> {
	pub(crate) fn new(inner: W) -> Self {
		Self { inner }
	}

	pub(crate) fn scalar<T: Pod>(&mut self, value: T, what: &str) -> Result<()> {
		self.inner.write_all(bytemuck::bytes_of(&value)).context(&format!("writing {what}"))
	}

	pub(crate) fn slice<T: Pod>(&mut self, values: &[T], what: &str) -> Result<()> {
		self.inner.write_all(bytemuck::cast_slice(values)).context(&format!("writing {what}"))
	}

	/// Writes `values` in pieces of at most `chunk` records.
	pub(crate) fn chunked<T: Pod>(&mut self, values: &[T], chunk: usize, what: &str) -> Result<()> {
		for (i, piece) in values.chunks(chunk.max(1)).enumerate() {
			debug!("{what}: chunk {i} ({} records)", piece.len());
			self.slice(piece, what)?;
		}
		Ok(())
	}

	pub(crate) fn bytes(&mut self, bytes: &[u8], what: &str) -> Result<()> {
		self.inner.write_all(bytes).context(&format!("writing {what}"))
	}

	pub(crate) fn flush(&mut self) -> Result<()> {
		self.inner.flush().context("flushing output")
	}
}

/// Records allocated ahead of a read.
const READ_STEP: usize = 1 << 16;

fn check_byte_len<T>(len: usize, what: &str) -> Result<()> {
	match len.checked_mul(std::mem::size_of::<T>()) {
		Some(bytes) if bytes <= isize::MAX as usize => Ok(()),
		_ => Err(LmError::Format(format!("{what}: {len} records cannot be addressed"))),
	}
}

/// Native-endian reader, the exact inverse of [`BinWriter`].
pub(crate) struct BinReader<R: Read> {
	inner: R,
}

impl<R: Read> BinReader<R> {
	pub(crate) fn new(inner: R) -> Self {
		Self { inner }
	}

	pub(crate) fn scalar<T: Pod>(&mut self, what: &str) -> Result<T> {
		let mut value = T::zeroed();
		self.inner
			.read_exact(bytemuck::bytes_of_mut(&mut value))
			.context(&format!("reading {what}"))?;
		Ok(value)
	}

	/// Reads `len` records. Memory grows with the data actually read, so a
	/// corrupt length fails on the short stream instead of allocating it
	/// up front.
	///
	/// # Errors
	/// `LmError::Format` when `len` records cannot be addressed at all,
	/// `LmError::Io` when the stream ends first.
	pub(crate) fn vec<T: Pod + Zeroable>(&mut self, len: usize, what: &str) -> Result<Vec<T>> {
		check_byte_len::<T>(len, what)?;
		let mut values = Vec::with_capacity(len.min(READ_STEP));
		while values.len() < len {
			let start = values.len();
			values.resize(start + READ_STEP.min(len - start), T::zeroed());
			self.inner
				.read_exact(bytemuck::cast_slice_mut(&mut values[start..]))
				.context(&format!("reading {what}"))?;
		}
		Ok(values)
	}

	pub(crate) fn chunked<T: Pod + Zeroable>(&mut self, len: usize, chunk: usize, what: &str) -> Result<Vec<T>> {
		check_byte_len::<T>(len, what)?;
		let mut values = Vec::with_capacity(len.min(chunk.max(1)));
		let chunk = chunk.max(1);
		while values.len() < len {
			let take = chunk.min(len - values.len());
			debug!("{what}: reading {take} records");
			values.extend(self.vec::<T>(take, what)?);
		}
		Ok(values)
	}

	pub(crate) fn bytes(&mut self, len: usize, what: &str) -> Result<Vec<u8>> {
		self.vec::<u8>(len, what)
	}

	/// Fails unless the stream is exhausted.
	pub(crate) fn expect_end(&mut self) -> Result<()> {
		let mut extra = [0u8; 1];
		match self.inner.read(&mut extra).context("checking end of file")? {
			0 => Ok(()),
			_ => Err(LmError::Format("trailing data after end of model".to_owned())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn output_path_replaces_extension() {
		let p = build_output_path("data/model.arpa", "lmdump").unwrap();
		assert_eq!(p, PathBuf::from("data/model.lmdump"));
		assert_eq!(extension_of("X/Y.ARPA").as_deref(), Some("arpa"));
	}

	#[test]
	fn chunked_values_read_back() {
		let values: Vec<u32> = (0..1000).collect();
		let mut buf = Vec::new();
		let mut w = BinWriter::new(&mut buf);
		w.scalar(7i16, "tag").unwrap();
		w.chunked(&values, 64, "values").unwrap();

		let mut r = BinReader::new(buf.as_slice());
		assert_eq!(r.scalar::<i16>("tag").unwrap(), 7);
		assert_eq!(r.chunked::<u32>(1000, 100, "values").unwrap(), values);
		r.expect_end().unwrap();
	}

	#[test]
	fn huge_lengths_fail_without_allocating() {
		let mut r = BinReader::new(&[0u8; 16][..]);
		assert!(matches!(r.vec::<i64>(1 << 61, "values"), Err(LmError::Format(_))));
		assert!(matches!(r.chunked::<u32>(usize::MAX / 2, 100, "values"), Err(LmError::Format(_))));

		// addressable but far longer than the stream
		let mut r = BinReader::new(&[0u8; 16][..]);
		assert!(matches!(r.vec::<i64>(1 << 40, "values"), Err(LmError::Io { .. })));
		let mut r = BinReader::new(&[0u8; 16][..]);
		assert!(matches!(r.chunked::<u16>(1 << 40, 100_000, "values"), Err(LmError::Io { .. })));
	}

	#[test]
	fn long_reads_cross_allocation_steps() {
		let values: Vec<u16> = (0..(READ_STEP as u32 * 2 + 17)).map(|v| v as u16).collect();
		let mut buf = Vec::new();
		BinWriter::new(&mut buf).slice(&values, "values").unwrap();
		let mut r = BinReader::new(buf.as_slice());
		assert_eq!(r.vec::<u16>(values.len(), "values").unwrap(), values);
	}

	#[test]
	fn short_stream_reports_field() {
		let mut r = BinReader::new(&[1u8, 2][..]);
		let err = r.scalar::<u64>("n_entries").unwrap_err();
		assert!(err.to_string().contains("n_entries"));
	}
}
