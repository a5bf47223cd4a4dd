//! ARPA text format.
//!
//! ```text
//! \data\
//! ngram 1=4989
//! ngram 2=835668
//!
//! \1-grams:
//! -0.9792 ABC	-2.2031
//!
//! \2-grams:
//! -0.8328 ABC DEFG
//!
//! \end\
//! ```
//!
//! The writer works for any [`ArpaSource`]; the reader always builds a
//! scoring [`NgramModel`](crate::model::NgramModel).

use std::io::{self, Write};

mod reader;
mod writer;

pub use reader::read_arpa;
pub use writer::write_arpa;

/// Value written for a zero probability or backoff weight.
pub const BAD_LOG_PROB: f64 = -99.0;

/// One line of an n-gram section.
#[derive(Clone, Debug, PartialEq)]
pub struct ArpaEntry<'a> {
	/// Words, oldest first.
	pub words: Vec<&'a str>,
	pub log10_prob: f64,
	/// Printed only for orders below the model order.
	pub log10_bowt: Option<f64>,
}

/// A model that can be exported as ARPA text.
pub trait ArpaSource {
	/// Highest n-gram order, 1 to 3.
	fn order(&self) -> usize;

	/// Sentence start and end symbols, used to suppress boundary n-grams.
	fn boundary_symbols(&self) -> (&str, &str);

	/// Free text written before `\data\`.
	fn write_banner(&self, out: &mut dyn Write) -> io::Result<()>;

	/// Number of n-grams of 1-based order `k` the source will produce.
	fn generated_count(&self, k: usize) -> usize;

	/// Calls `visit` for every n-gram of 1-based order `k`, in file order.
	fn visit_ngrams(
		&self,
		k: usize,
		visit: &mut dyn FnMut(ArpaEntry<'_>) -> crate::error::Result<()>,
	) -> crate::error::Result<()>;
}

/// Counters of one ARPA write.
///
/// A fresh session is created for every call to [`write_arpa`], so nothing
/// leaks from one file into the next.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteSession {
	generated: [usize; 3],
	skipped: [usize; 3],
}

impl WriteSession {
	/// Number of n-grams of 1-based order `k` actually written.
	pub fn final_count(&self, k: usize) -> usize {
		self.generated[k - 1] - self.skipped[k - 1]
	}

	/// Number of n-grams of 1-based order `k` left out.
	pub fn skipped(&self, k: usize) -> usize {
		self.skipped[k - 1]
	}
}
