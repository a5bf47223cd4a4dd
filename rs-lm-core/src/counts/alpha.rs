//! Two-byte backoff weights.
//!
//! Weights inside `[min_alpha, max_alpha]` are quantized linearly onto the
//! codes `0..=elements_in_range`. Weights outside the range are kept exactly
//! in a side table and addressed by the codes above `elements_in_range`.

use serde::{Deserialize, Serialize};

use crate::error::{LmError, Result};

pub const DEFAULT_MIN_ALPHA: f64 = -3.2;
pub const DEFAULT_MAX_ALPHA: f64 = 2.5;
pub const DEFAULT_OUT_OF_RANGE_ALPHAS: u16 = 10000;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AlphaCodec {
	pub min_alpha: f64,
	pub max_alpha: f64,
	/// Capacity of the side table.
	pub out_of_range_alphas: u16,
	/// Exact out-of-range weights, in first-seen order.
	pub alpha_array: Vec<f64>,
}

impl Default for AlphaCodec {
	fn default() -> Self {
		Self {
			min_alpha: DEFAULT_MIN_ALPHA,
			max_alpha: DEFAULT_MAX_ALPHA,
			out_of_range_alphas: DEFAULT_OUT_OF_RANGE_ALPHAS,
			alpha_array: Vec::new(),
		}
	}
}

impl AlphaCodec {
	fn elements_in_range(&self) -> u16 {
		u16::MAX - self.out_of_range_alphas
	}

	/// Code of `alpha`, adding it to the side table when out of range.
	///
	/// # Errors
	/// `LmError::TooLarge` once the side table is full; four-byte weights
	/// avoid the limit.
	pub fn encode(&mut self, alpha: f64) -> Result<u16> {
		let eir = self.elements_in_range();
		if alpha > self.max_alpha || alpha < self.min_alpha {
			let idx = match self.alpha_array.iter().position(|&a| a == alpha) {
				Some(i) => i,
				None => {
					if self.alpha_array.len() >= self.out_of_range_alphas as usize {
						return Err(LmError::TooLarge(format!(
							"more than {} out of range alphas, use four-byte alphas",
							self.out_of_range_alphas
						)));
					}
					self.alpha_array.push(alpha);
					self.alpha_array.len() - 1
				}
			};
			return Ok(eir + idx as u16 + 1);
		}
		let scaled = (alpha - self.min_alpha) / (self.max_alpha - self.min_alpha) * eir as f64;
		Ok(scaled as u16)
	}

	pub fn decode(&self, code: u16) -> f64 {
		let eir = self.elements_in_range();
		if code > eir {
			return self.alpha_array.get((code - eir - 1) as usize).copied().unwrap_or(0.0);
		}
		self.min_alpha + code as f64 * (self.max_alpha - self.min_alpha) / eir as f64
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn in_range_values_quantize_closely() {
		let mut codec = AlphaCodec::default();
		for &a in &[0.0, 0.37, 1.0, 2.5, -3.2] {
			let code = codec.encode(a).unwrap();
			assert!((codec.decode(code) - a).abs() < 1e-3, "{a}");
		}
		assert!(codec.alpha_array.is_empty());
	}

	#[test]
	fn out_of_range_values_are_exact_and_shared() {
		let mut codec = AlphaCodec::default();
		let a = codec.encode(7.25).unwrap();
		let b = codec.encode(7.25).unwrap();
		let c = codec.encode(-10.0).unwrap();
		assert_eq!(a, b);
		assert_ne!(a, c);
		assert_eq!(codec.decode(a), 7.25);
		assert_eq!(codec.decode(c), -10.0);
		assert_eq!(codec.alpha_array.len(), 2);
	}

	#[test]
	fn full_side_table_is_an_error() {
		let mut codec = AlphaCodec { out_of_range_alphas: 1, ..AlphaCodec::default() };
		codec.encode(10.0).unwrap();
		assert!(matches!(codec.encode(11.0), Err(LmError::TooLarge(_))));
	}
}
