//! Integer logarithm arithmetic.
//!
//! All scores in the engine are integer logarithms in a base slightly above
//! one (1.0001 by default). This keeps the trees compact and lets backoff be
//! computed with integer additions.

use serde::{Deserialize, Serialize};

/// Default logarithm base.
pub const DEFAULT_BASE: f64 = 1.0001;

/// Integer log-domain calculator for a fixed base.
///
/// # Invariants
/// - `base > 1.0`
/// - `zero()` is far enough from `i32::MIN` that adding a handful of
///   scores never overflows
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct LogMath {
	base: f64,
	ln_base: f64,
	log10_base: f64,
}

impl Default for LogMath {
	fn default() -> Self {
		Self::new(DEFAULT_BASE)
	}
}

impl LogMath {
	/// Creates a calculator for `base`. Bases at or below one fall back to
	/// the default base.
	pub fn new(base: f64) -> Self {
		let base = if base > 1.0 { base } else { DEFAULT_BASE };
		Self { base, ln_base: base.ln(), log10_base: base.log10() }
	}

	pub fn base(&self) -> f64 {
		self.base
	}

	/// The value standing for log(0).
	pub fn zero(&self) -> i32 {
		i32::MIN >> 2
	}

	/// Converts a linear probability. Non-positive input gives `zero()`.
	pub fn log(&self, p: f64) -> i32 {
		if p <= 0.0 {
			return self.zero();
		}
		(p.ln() / self.ln_base) as i32
	}

	pub fn exp(&self, l: i32) -> f64 {
		self.base.powi(l)
	}

	pub fn log10_to_log(&self, l: f64) -> i32 {
		(l / self.log10_base) as i32
	}

	pub fn log_to_log10(&self, l: i32) -> f64 {
		l as f64 * self.log10_base
	}

	pub fn ln_to_log(&self, l: f64) -> i32 {
		(l / self.ln_base) as i32
	}

	/// log(exp(a) + exp(b)) without leaving the log domain.
	pub fn add(&self, a: i32, b: i32) -> i32 {
		let zero = self.zero();
		if a <= zero {
			return b;
		}
		if b <= zero {
			return a;
		}
		let (hi, lo) = if a > b { (a, b) } else { (b, a) };
		let d = (lo - hi) as f64;
		let r = (1.0 + self.base.powf(d)).ln() / self.ln_base;
		hi + r.round() as i32
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn log_of_one_is_zero() {
		let lm = LogMath::default();
		assert_eq!(lm.log(1.0), 0);
		assert_eq!(lm.log(0.0), lm.zero());
		assert_eq!(lm.log(-3.0), lm.zero());
	}

	#[test]
	fn log10_conversion_matches_log() {
		let lm = LogMath::default();
		let a = lm.log10_to_log(0.2f64.log10());
		let b = lm.log(0.2);
		assert!((a - b).abs() <= 1);
		assert!((lm.log_to_log10(a) - 0.2f64.log10()).abs() < 1e-3);
	}

	#[test]
	fn add_sums_probabilities() {
		let lm = LogMath::default();
		let sum = lm.add(lm.log(0.25), lm.log(0.5));
		assert!((lm.exp(sum) - 0.75).abs() < 1e-3);
		assert_eq!(lm.add(lm.zero(), 17), 17);
		assert_eq!(lm.add(-5, lm.zero()), -5);
	}
}
