//! Discounting strategies.
//!
//! The parameters are estimated elsewhere; a strategy only applies them to
//! the stored counts when probabilities are produced.

use std::cell::OnceCell;
use std::fmt;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use super::CountModel;
use crate::error::{LmError, Result};

/// Method codes stored in the binary header.
pub const GOOD_TURING: u16 = 1;
pub const ABSOLUTE: u16 = 2;
pub const LINEAR: u16 = 3;
pub const WITTEN_BELL: u16 = 4;

/// Discounting method with its per-order parameters (index 0 is unigrams).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub enum Discounting {
	GoodTuring {
		/// Largest frequency-of-frequency index kept per order.
		fof_size: Vec<u16>,
		/// Counts up to this value are discounted, per order.
		disc_range: Vec<u16>,
		/// `freq_of_freq[i][r]`: number of order-`i` n-grams seen `r` times.
		freq_of_freq: Vec<Vec<i32>>,
		/// `ratios[i][r]`: discount ratio of count `r` at order `i`.
		ratios: Vec<Vec<f64>>,
	},
	Absolute {
		constants: Vec<f64>,
	},
	Linear {
		ratios: Vec<f64>,
	},
	#[default]
	WittenBell,
}

impl Discounting {
	pub fn code(&self) -> u16 {
		match self {
			Self::GoodTuring { .. } => GOOD_TURING,
			Self::Absolute { .. } => ABSOLUTE,
			Self::Linear { .. } => LINEAR,
			Self::WittenBell => WITTEN_BELL,
		}
	}

	/// Checks that every per-order array covers the `n` orders.
	///
	/// # Errors
	/// `LmError::Config` naming the first inconsistent array.
	pub fn validate(&self, n: usize) -> Result<()> {
		let check = |len: usize, what: &str| {
			if len == n {
				Ok(())
			} else {
				Err(LmError::Config(format!("{what} has {len} entries for a {n}-gram model")))
			}
		};
		match self {
			Self::GoodTuring { fof_size, disc_range, ratios, .. } => {
				check(fof_size.len(), "fof_size")?;
				check(disc_range.len(), "disc_range")?;
				check(ratios.len(), "Good-Turing ratios")?;
				for (i, (r, &range)) in ratios.iter().zip(disc_range).enumerate() {
					if r.len() != range as usize + 1 {
						return Err(LmError::Config(format!(
							"{}-gram Good-Turing ratios need {} entries, got {}",
							i + 1,
							range as usize + 1,
							r.len()
						)));
					}
				}
				Ok(())
			}
			Self::Absolute { constants } => check(constants.len(), "absolute discounting constants"),
			Self::Linear { ratios } => check(ratios.len(), "linear discounting ratios"),
			Self::WittenBell => Ok(()),
		}
	}
}

/// Applies a discount to one n-gram count.
pub trait DiscountStrategy: fmt::Debug {
	/// Discounted count of an n-gram at tree `level` (1 for bigrams) seen
	/// `count` times after a context seen `marg_count` times. `parent` is
	/// the position of the context node at `level - 1`.
	fn discounted_count(&self, model: &CountModel, level: usize, count: u32, marg_count: u32, parent: usize) -> f64;

	/// Human-readable description for the ARPA banner.
	fn describe(&self, out: &mut dyn Write) -> io::Result<()>;
}

#[derive(Debug)]
struct GoodTuring {
	disc_range: Vec<u16>,
	freq_of_freq: Vec<Vec<i32>>,
	ratios: Vec<Vec<f64>>,
}

impl DiscountStrategy for GoodTuring {
	fn discounted_count(&self, _: &CountModel, level: usize, count: u32, _: u32, _: usize) -> f64 {
		let range = self.disc_range.get(level).copied().unwrap_or(0) as u32;
		match self.ratios.get(level).and_then(|r| r.get(count as usize)) {
			Some(&ratio) if count <= range => count as f64 * ratio,
			_ => count as f64,
		}
	}

	fn describe(&self, out: &mut dyn Write) -> io::Result<()> {
		writeln!(out, "Good-Turing discounting was applied.")?;
		for (i, fof) in self.freq_of_freq.iter().enumerate() {
			let shown: Vec<String> = fof.iter().map(i32::to_string).collect();
			writeln!(out, "{}-gram frequency of frequency : {}", i + 1, shown.join(" "))?;
		}
		for (i, ratios) in self.ratios.iter().enumerate() {
			let shown: Vec<String> = ratios.iter().skip(1).map(|r| format!("{r:.2}")).collect();
			writeln!(out, "{}-gram discounting ratios : {}", i + 1, shown.join(" "))?;
		}
		Ok(())
	}
}

#[derive(Debug)]
struct Absolute {
	constants: Vec<f64>,
}

impl DiscountStrategy for Absolute {
	fn discounted_count(&self, _: &CountModel, level: usize, count: u32, _: u32, _: usize) -> f64 {
		count as f64 - self.constants.get(level).copied().unwrap_or(0.0)
	}

	fn describe(&self, out: &mut dyn Write) -> io::Result<()> {
		writeln!(out, "Absolute discounting was applied.")?;
		for (i, c) in self.constants.iter().enumerate() {
			writeln!(out, "{}-gram discounting constant : {c:.6}", i + 1)?;
		}
		Ok(())
	}
}

#[derive(Debug)]
struct Linear {
	ratios: Vec<f64>,
}

impl DiscountStrategy for Linear {
	fn discounted_count(&self, _: &CountModel, level: usize, count: u32, _: u32, _: usize) -> f64 {
		count as f64 * self.ratios.get(level).copied().unwrap_or(1.0)
	}

	fn describe(&self, out: &mut dyn Write) -> io::Result<()> {
		writeln!(out, "Linear discounting was applied.")?;
		for (i, r) in self.ratios.iter().enumerate() {
			writeln!(out, "{}-gram discounting ratio : {r:.6}", i + 1)?;
		}
		Ok(())
	}
}

#[derive(Debug)]
struct WittenBell;

impl DiscountStrategy for WittenBell {
	fn discounted_count(&self, model: &CountModel, level: usize, count: u32, marg_count: u32, parent: usize) -> f64 {
		let types = model.children(level - 1, parent).len() as f64;
		let marg = marg_count as f64;
		count as f64 * marg / (marg + types)
	}

	fn describe(&self, out: &mut dyn Write) -> io::Result<()> {
		writeln!(out, "Witten Bell discounting was applied.")
	}
}

/// Strategy built on first use from the stored parameters.
///
/// Clones start empty and compare equal, so the cell never affects model
/// equality.
#[derive(Default)]
pub(crate) struct LazyDiscounter(OnceCell<Box<dyn DiscountStrategy>>);

impl LazyDiscounter {
	pub(crate) fn get(&self, params: &Discounting) -> &dyn DiscountStrategy {
		self.0.get_or_init(|| init(params)).as_ref()
	}
}

impl Clone for LazyDiscounter {
	fn clone(&self) -> Self {
		Self::default()
	}
}

impl PartialEq for LazyDiscounter {
	fn eq(&self, _: &Self) -> bool {
		true
	}
}

impl fmt::Debug for LazyDiscounter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(if self.0.get().is_some() { "LazyDiscounter(ready)" } else { "LazyDiscounter(empty)" })
	}
}

/// Strategy for `discounting`.
pub fn init(discounting: &Discounting) -> Box<dyn DiscountStrategy> {
	match discounting {
		Discounting::GoodTuring { disc_range, freq_of_freq, ratios, .. } => Box::new(GoodTuring {
			disc_range: disc_range.clone(),
			freq_of_freq: freq_of_freq.clone(),
			ratios: ratios.clone(),
		}),
		Discounting::Absolute { constants } => Box::new(Absolute { constants: constants.clone() }),
		Discounting::Linear { ratios } => Box::new(Linear { ratios: ratios.clone() }),
		Discounting::WittenBell => Box::new(WittenBell),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn codes_follow_binary_header() {
		assert_eq!(Discounting::WittenBell.code(), 4);
		assert_eq!(Discounting::Linear { ratios: vec![] }.code(), 3);
		assert_eq!(Discounting::Absolute { constants: vec![] }.code(), 2);
	}

	#[test]
	fn good_turing_arrays_must_match_ranges() {
		let gt = Discounting::GoodTuring {
			fof_size: vec![10, 10],
			disc_range: vec![1, 7],
			freq_of_freq: vec![],
			ratios: vec![vec![0.0, 0.9], vec![0.0; 8]],
		};
		assert!(gt.validate(2).is_ok());
		assert!(matches!(gt.validate(3), Err(LmError::Config(_))));

		let short = Discounting::GoodTuring {
			fof_size: vec![10],
			disc_range: vec![3],
			freq_of_freq: vec![],
			ratios: vec![vec![0.0, 0.5]],
		};
		assert!(matches!(short.validate(1), Err(LmError::Config(_))));
	}

	#[test]
	fn banner_text_names_the_method() {
		let mut out = Vec::new();
		init(&Discounting::Linear { ratios: vec![0.5, 0.25] }).describe(&mut out).unwrap();
		let text = String::from_utf8(out).unwrap();
		assert!(text.starts_with("Linear discounting was applied.\n"));
		assert!(text.contains("2-gram discounting ratio : 0.250000"));
	}
}
