//! Unigram → bigram → trigram tree and its incremental builder.
//!
//! Bigram and trigram records keep 16-bit indices into deduplicated value
//! tables. Trigram positions are split into a per-segment base (one entry per
//! 512 bigrams) plus a 16-bit offset stored in each bigram, which bounds the
//! number of trigrams that can hang off a single segment.

use std::collections::BTreeMap;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{LmError, Result};

/// Bigrams per trigram segment.
pub(crate) const BG_SEG_SZ: usize = 512;
pub(crate) const LOG_BG_SEG_SZ: usize = 9;

/// Below this span, searches switch from bisection to a linear scan.
const BINARY_SEARCH_THRESH: usize = 16;

const MAX_SEG_OFFSET: usize = u16::MAX as usize;

/// Largest number of records reserved from a count declared in a file
/// header. Tables grow past it as records arrive.
pub(crate) const MAX_RESERVE: usize = 1 << 16;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct Unigram {
	pub prob1: i32,
	pub bo_wt1: i32,
	/// Index of the first bigram successor.
	pub bigrams: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct Bigram {
	pub wid: u32,
	pub prob2: u16,
	pub bo_wt2: u16,
	/// First trigram, relative to the segment base.
	pub trigrams: u16,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct Trigram {
	pub wid: u32,
	pub prob3: u16,
}

/// Sparse successor record, searchable by word id.
pub(crate) trait Successor {
	fn wid(&self) -> u32;
}

impl Successor for Bigram {
	fn wid(&self) -> u32 {
		self.wid
	}
}

impl Successor for Trigram {
	fn wid(&self) -> u32 {
		self.wid
	}
}

/// Position of `w` in a list sorted by word id.
pub(crate) fn find_successor<T: Successor>(list: &[T], w: u32) -> Option<usize> {
	let (mut b, mut e) = (0usize, list.len());
	while e - b > BINARY_SEARCH_THRESH {
		let i = (b + e) >> 1;
		let wid = list[i].wid();
		if wid < w {
			b = i + 1;
		} else if wid > w {
			e = i;
		} else {
			return Some(i);
		}
	}
	(b..e).find(|&i| list[i].wid() == w)
}

/// Distinct values in first-insertion order.
#[derive(Default, Debug)]
pub(crate) struct DedupTable {
	values: Vec<i32>,
	index: BTreeMap<i32, u16>,
}

impl DedupTable {
	/// Index of `value`, adding it when new.
	pub(crate) fn id(&mut self, value: i32) -> Result<u16> {
		if let Some(&id) = self.index.get(&value) {
			return Ok(id);
		}
		let id = u16::try_from(self.values.len())
			.map_err(|_| LmError::TooLarge("more than 65536 distinct probability values".to_owned()))?;
		self.values.push(value);
		self.index.insert(value, id);
		Ok(id)
	}

	pub(crate) fn len(&self) -> usize {
		self.values.len()
	}

	pub(crate) fn into_values(self) -> Vec<i32> {
		self.values
	}
}

/// The scoring tree.
///
/// # Invariants
/// - `unigrams.len() == n_counts[0] + 1`; the sentinel's `bigrams` equals the bigram count
/// - `unigrams[i].bigrams <= unigrams[i + 1].bigrams`
/// - `bigrams.len() == n_counts[1] + 1` (sentinel included)
/// - within a unigram's range, bigram word ids strictly increase; same for trigrams of a bigram
/// - `tseg_base` is empty when there are no trigrams
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub(crate) struct Lm3g {
	pub unigrams: Vec<Unigram>,
	pub bigrams: Vec<Bigram>,
	pub trigrams: Vec<Trigram>,
	pub prob2: Vec<i32>,
	pub bo_wt2: Vec<i32>,
	pub prob3: Vec<i32>,
	pub tseg_base: Vec<u32>,
}

impl Lm3g {
	pub(crate) fn n_unigrams(&self) -> usize {
		self.unigrams.len().saturating_sub(1)
	}

	pub(crate) fn n_bigrams(&self) -> usize {
		self.bigrams.len().saturating_sub(1)
	}

	pub(crate) fn n_trigrams(&self) -> usize {
		self.trigrams.len()
	}

	pub(crate) fn first_bg(&self, u: usize) -> usize {
		self.unigrams[u].bigrams as usize
	}

	/// Absolute index of the first trigram successor of bigram `b`.
	pub(crate) fn first_tg(&self, b: usize) -> usize {
		self.tseg_base[b >> LOG_BG_SEG_SZ] as usize + self.bigrams[b].trigrams as usize
	}

	/// Absolute index of bigram `(w1, w2)`.
	pub(crate) fn find_bg(&self, w1: usize, w2: u32) -> Option<usize> {
		let b = self.first_bg(w1);
		let e = self.first_bg(w1 + 1);
		find_successor(&self.bigrams[b..e], w2).map(|i| b + i)
	}

	/// Trigram range of bigram `b`.
	pub(crate) fn tg_range(&self, b: usize) -> (usize, usize) {
		if self.tseg_base.is_empty() {
			return (0, 0);
		}
		(self.first_tg(b), self.first_tg(b + 1))
	}

	/// Bigram backoff weight, zero when the model carries none.
	pub(crate) fn bigram_bowt(&self, b: usize) -> i32 {
		self.bo_wt2.get(self.bigrams[b].bo_wt2 as usize).copied().unwrap_or(0)
	}

	/// Checks the links between levels of a tree that was not built by
	/// [`Lm3gBuilder`], such as one read from a snapshot.
	pub(crate) fn validate(&self, n: usize) -> Result<()> {
		let bad = |what: &str| Err(LmError::Format(format!("scoring tree: {what}")));
		if self.unigrams.is_empty() || self.bigrams.is_empty() {
			return bad("missing sentinel entries");
		}
		let (n_ug, n_bg, n_tg) = (self.n_unigrams(), self.n_bigrams(), self.n_trigrams());

		let mut prev = 0;
		for u in &self.unigrams {
			let first = u.bigrams as usize;
			if first < prev || first > n_bg {
				return bad("bigram links out of order");
			}
			prev = first;
		}
		if prev != n_bg {
			return bad("unigram sentinel does not close the bigrams");
		}
		if self.bigrams[..n_bg].iter().any(|b| b.wid as usize >= n_ug || b.prob2 as usize >= self.prob2.len()) {
			return bad("bigram record out of range");
		}
		if self.trigrams.iter().any(|t| t.wid as usize >= n_ug || t.prob3 as usize >= self.prob3.len()) {
			return bad("trigram record out of range");
		}

		if self.tseg_base.is_empty() {
			return if n_tg > 0 || n > 2 { bad("trigrams without segment bases") } else { Ok(()) };
		}
		if self.tseg_base.len() <= n_bg >> LOG_BG_SEG_SZ {
			return bad("too few trigram segments");
		}
		let mut prev = 0;
		for b in 0..=n_bg {
			let first = self.first_tg(b);
			if first < prev || first > n_tg {
				return bad("trigram links out of order");
			}
			prev = first;
		}
		if prev != n_tg {
			return bad("bigram sentinel does not close the trigrams");
		}
		Ok(())
	}

	/// Appends a unigram entry for word id `wid`, filling any gap with
	/// entries that have no probability mass.
	pub(crate) fn push_unigram(&mut self, wid: usize, prob1: i32, bo_wt1: i32, zero: i32) {
		let n_bg = self.unigrams.last().map(|u| u.bigrams).unwrap_or(0);
		self.unigrams.pop();
		while self.unigrams.len() < wid {
			self.unigrams.push(Unigram { prob1: zero, bo_wt1: 0, bigrams: n_bg });
		}
		self.unigrams.push(Unigram { prob1, bo_wt1, bigrams: n_bg });
		self.unigrams.push(Unigram { prob1: 0, bo_wt1: 0, bigrams: n_bg });
	}
}

/// Incremental construction of an [`Lm3g`] from records that arrive in tree
/// order (unigrams by id, bigrams by first word, trigrams by bigram).
pub(crate) struct Lm3gBuilder {
	n_bg_declared: usize,
	n_tg_declared: usize,
	tree: Lm3g,
	prob2: DedupTable,
	bo_wt2: DedupTable,
	prob3: DedupTable,
	bg_count: usize,
	prev_w1: i64,
	tg_count: usize,
	tg_prev: (i64, i64),
	prev_bg: i64,
	prev_seg: i64,
}

impl Lm3gBuilder {
	pub(crate) fn new(n_ug: usize, n_bg: usize, n_tg: usize) -> Self {
		let mut tree = Lm3g::default();
		tree.unigrams = Vec::with_capacity(n_ug.min(MAX_RESERVE) + 1);
		tree.bigrams = Vec::with_capacity(n_bg.min(MAX_RESERVE) + 1);
		tree.trigrams = Vec::with_capacity(n_tg.min(MAX_RESERVE));
		Self {
			n_bg_declared: n_bg,
			n_tg_declared: n_tg,
			tree,
			prob2: DedupTable::default(),
			bo_wt2: DedupTable::default(),
			prob3: DedupTable::default(),
			bg_count: 0,
			prev_w1: -1,
			tg_count: 0,
			tg_prev: (-1, -1),
			prev_bg: -1,
			prev_seg: -1,
		}
	}

	pub(crate) fn set_unigram(&mut self, wid: usize, prob1: i32, bo_wt1: i32) {
		if wid >= self.tree.unigrams.len() {
			self.tree.unigrams.resize(wid + 1, Unigram::default());
		}
		self.tree.unigrams[wid].prob1 = prob1;
		self.tree.unigrams[wid].bo_wt1 = bo_wt1;
	}

	/// Sizes the unigram table to the entries actually read, plus the
	/// sentinel.
	pub(crate) fn end_unigrams(&mut self, n_read: usize) {
		self.tree.unigrams.resize(n_read + 1, Unigram::default());
	}

	pub(crate) fn push_bigram(&mut self, w1: usize, w2: u32, prob2: i32, bo_wt2: i32) -> Result<()> {
		if self.bg_count >= self.n_bg_declared {
			return Err(LmError::Format("too many bigrams".to_owned()));
		}
		let w1 = w1 as i64;
		if w1 < self.prev_w1 {
			return Err(LmError::Format(format!(
				"bigram not in unigram order: word id {w1} after {}",
				self.prev_w1
			)));
		}
		let mut record = Bigram { wid: w2, prob2: self.prob2.id(prob2)?, ..Bigram::default() };
		if self.n_tg_declared > 0 {
			record.bo_wt2 = self.bo_wt2.id(bo_wt2)?;
		}
		self.tree.bigrams.push(record);
		if w1 != self.prev_w1 {
			for u in (self.prev_w1 + 1)..=w1 {
				self.tree.unigrams[u as usize].bigrams = self.bg_count as u32;
			}
			self.prev_w1 = w1;
		}
		self.bg_count += 1;
		Ok(())
	}

	/// Closes the bigram section and sizes the trigram segment table.
	pub(crate) fn end_bigrams(&mut self) {
		let n_ug = self.tree.n_unigrams() as i64;
		for u in (self.prev_w1 + 1)..=n_ug {
			self.tree.unigrams[u as usize].bigrams = self.bg_count as u32;
		}
		self.prev_w1 = n_ug;
		self.tree.bigrams.push(Bigram::default());
		if self.n_tg_declared > 0 {
			self.tree.tseg_base = vec![0; (self.bg_count + 1) / BG_SEG_SZ + 1];
		}
		info!("{:8} = #bigrams created", self.bg_count);
		info!("{:8} = #prob2 entries", self.prob2.len());
	}

	pub(crate) fn push_trigram(&mut self, w1: usize, w2: u32, w3: u32, prob3: i32) -> Result<()> {
		if self.tg_count >= self.n_tg_declared {
			return Err(LmError::Format("too many trigrams".to_owned()));
		}
		let prob3 = self.prob3.id(prob3)?;
		let (w1i, w2i) = (w1 as i64, w2 as i64);
		let (prev_w1, prev_w2) = self.tg_prev;

		if w1i != prev_w1 || w2i != prev_w2 {
			if w1i < prev_w1 || (w1i == prev_w1 && w2i < prev_w2) {
				return Err(LmError::Format("trigrams not in bigram order".to_owned()));
			}
			let start = if w1i != prev_w1 { self.tree.first_bg(w1) } else { (self.prev_bg + 1) as usize };
			let end = self.tree.first_bg(w1 + 1);
			let bg = (start..end)
				.find(|&b| self.tree.bigrams[b].wid == w2)
				.ok_or_else(|| LmError::Format(format!("missing bigram for trigram ({w1} {w2} {w3})")))?;
			self.open_trigrams_of(bg)?;
			self.tg_prev = (w1i, w2i);
		}

		self.tree.trigrams.push(Trigram { wid: w3, prob3 });
		self.tg_count += 1;
		Ok(())
	}

	/// Records that bigram `bg` starts at the current trigram count and fills
	/// offsets for every bigram skipped since the previous one.
	fn open_trigrams_of(&mut self, bg: usize) -> Result<()> {
		let seg = (bg >> LOG_BG_SEG_SZ) as i64;
		let tg_count = self.tg_count as u32;
		for s in (self.prev_seg + 1)..=seg {
			self.tree.tseg_base[s as usize] = tg_count;
		}

		if self.prev_seg < seg {
			let mut offset = 0usize;
			if self.prev_seg >= 0 {
				offset = self.tg_count - self.tree.tseg_base[self.prev_seg as usize] as usize;
				check_offset(offset)?;
			}
			let prev_seg_last_bg = ((self.prev_seg + 1) << LOG_BG_SEG_SZ) - 1;
			let mut b = self.prev_bg + 1;
			while b <= prev_seg_last_bg {
				self.tree.bigrams[b as usize].trigrams = offset as u16;
				b += 1;
			}
			while b <= bg as i64 {
				self.tree.bigrams[b as usize].trigrams = 0;
				b += 1;
			}
		} else {
			let offset = self.tg_count - self.tree.tseg_base[self.prev_seg as usize] as usize;
			check_offset(offset)?;
			for b in (self.prev_bg + 1)..=(bg as i64) {
				self.tree.bigrams[b as usize].trigrams = offset as u16;
			}
		}
		self.prev_bg = bg as i64;
		self.prev_seg = seg;
		Ok(())
	}

	/// Completes the trailing bigram offsets and returns the tree.
	pub(crate) fn finish(mut self) -> Result<Lm3g> {
		if !self.tree.tseg_base.is_empty() {
			let n_bg = self.tree.n_bigrams() as i64;
			for b in (self.prev_bg + 1)..=n_bg {
				let b = b as usize;
				if b & (BG_SEG_SZ - 1) == 0 {
					self.tree.tseg_base[b >> LOG_BG_SEG_SZ] = self.tg_count as u32;
				}
				let offset = self.tg_count - self.tree.tseg_base[b >> LOG_BG_SEG_SZ] as usize;
				check_offset(offset)?;
				self.tree.bigrams[b].trigrams = offset as u16;
			}
			info!("{:8} = #trigrams created", self.tg_count);
			info!("{:8} = #prob3 entries", self.prob3.len());
		}
		self.tree.prob2 = self.prob2.into_values();
		self.tree.bo_wt2 = self.bo_wt2.into_values();
		self.tree.prob3 = self.prob3.into_values();
		Ok(self.tree)
	}
}

fn check_offset(offset: usize) -> Result<()> {
	if offset > MAX_SEG_OFFSET {
		return Err(LmError::TooLarge(
			"trigram segment holds more than 65535 trigrams, use a smaller vocabulary".to_owned(),
		));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dedup_reuses_indices() {
		let mut t = DedupTable::default();
		assert_eq!(t.id(-10).unwrap(), 0);
		assert_eq!(t.id(-20).unwrap(), 1);
		assert_eq!(t.id(-10).unwrap(), 0);
		assert_eq!(t.into_values(), vec![-10, -20]);
	}

	#[test]
	fn dedup_overflows_past_u16() {
		let mut t = DedupTable::default();
		for v in 0..65536 {
			t.id(v).unwrap();
		}
		assert!(matches!(t.id(70000), Err(LmError::TooLarge(_))));
	}

	#[test]
	fn search_handles_long_and_short_lists() {
		let list: Vec<Trigram> = (0..100).map(|i| Trigram { wid: i * 2, prob3: 0 }).collect();
		assert_eq!(find_successor(&list, 40), Some(20));
		assert_eq!(find_successor(&list, 41), None);
		assert_eq!(find_successor(&list[..5], 8), Some(4));
		assert_eq!(find_successor::<Trigram>(&[], 3), None);
	}

	fn three_word_tree() -> Lm3g {
		// a b c; bigrams a→b, a→c, b→c; trigram (a b)→c
		let mut b = Lm3gBuilder::new(3, 3, 1);
		for w in 0..3 {
			b.set_unigram(w, -100 * (w as i32 + 1), -5);
		}
		b.end_unigrams(3);
		b.push_bigram(0, 1, -50, -3).unwrap();
		b.push_bigram(0, 2, -60, -4).unwrap();
		b.push_bigram(1, 2, -70, -3).unwrap();
		b.end_bigrams();
		b.push_trigram(0, 1, 2, -20).unwrap();
		b.finish().unwrap()
	}

	#[test]
	fn builder_links_levels() {
		let t = three_word_tree();
		assert_eq!(t.n_unigrams(), 3);
		assert_eq!(t.n_bigrams(), 3);
		assert_eq!(t.n_trigrams(), 1);
		assert_eq!(t.first_bg(0), 0);
		assert_eq!(t.first_bg(1), 2);
		assert_eq!(t.first_bg(2), 3);
		assert_eq!(t.first_bg(3), 3);
		assert_eq!(t.find_bg(0, 2), Some(1));
		assert_eq!(t.find_bg(2, 0), None);
		assert_eq!(t.tg_range(0), (0, 1));
		assert_eq!(t.tg_range(1), (1, 1));
		assert_eq!(t.tg_range(2), (1, 1));
		assert_eq!(t.prob2, vec![-50, -60, -70]);
		assert_eq!(t.bo_wt2, vec![-3, -4]);
	}

	#[test]
	fn out_of_order_records_fail() {
		let mut b = Lm3gBuilder::new(3, 3, 0);
		b.end_unigrams(3);
		b.push_bigram(1, 2, -1, 0).unwrap();
		assert!(matches!(b.push_bigram(0, 1, -1, 0), Err(LmError::Format(_))));

		let mut b = Lm3gBuilder::new(3, 1, 1);
		b.end_unigrams(3);
		b.push_bigram(0, 1, -1, 0).unwrap();
		b.end_bigrams();
		assert!(matches!(b.push_trigram(0, 2, 1, -1), Err(LmError::Format(_))));
	}

	#[test]
	fn segment_overflow_is_rejected() {
		// 300 bigrams of word 0 all land in segment 0; 300 trigrams each
		// push the offset of the last bigrams past 65535.
		let n = 300usize;
		let mut b = Lm3gBuilder::new(n, n, n * n);
		b.end_unigrams(n);
		for w2 in 0..n {
			b.push_bigram(0, w2 as u32, -10, -1).unwrap();
		}
		b.end_bigrams();
		let mut failure = None;
		'outer: for w2 in 0..n {
			for w3 in 0..n {
				if let Err(e) = b.push_trigram(0, w2 as u32, w3 as u32, -5) {
					failure = Some(e);
					break 'outer;
				}
			}
		}
		let err = match failure {
			Some(e) => e,
			None => b.finish().unwrap_err(),
		};
		assert!(matches!(err, LmError::TooLarge(_)));
	}

	#[test]
	fn declared_counts_only_bound_reservations() {
		let huge = 1usize << 40;
		let mut b = Lm3gBuilder::new(huge, huge, huge);
		assert!(b.tree.unigrams.capacity() < huge);
		assert!(b.tree.trigrams.capacity() < huge);
		for w in 0..3 {
			b.set_unigram(w, -100 * (w as i32 + 1), -5);
		}
		b.end_unigrams(3);
		b.push_bigram(0, 1, -50, -3).unwrap();
		b.push_bigram(0, 2, -60, -4).unwrap();
		b.push_bigram(1, 2, -70, -3).unwrap();
		b.end_bigrams();
		b.push_trigram(0, 1, 2, -20).unwrap();
		assert_eq!(b.finish().unwrap(), three_word_tree());
	}

	#[test]
	fn built_trees_validate() {
		let t = three_word_tree();
		t.validate(3).unwrap();
		assert!(matches!(Lm3g::default().validate(1), Err(LmError::Format(_))));

		let mut b = Lm3gBuilder::new(2, 1, 0);
		b.set_unigram(0, -1, 0);
		b.set_unigram(1, -1, 0);
		b.end_unigrams(2);
		b.push_bigram(0, 1, -1, 0).unwrap();
		b.end_bigrams();
		let bigram_tree = b.finish().unwrap();
		bigram_tree.validate(2).unwrap();
		assert!(matches!(bigram_tree.validate(3), Err(LmError::Format(_))));
	}

	#[test]
	fn damaged_trees_fail_validation() {
		let damage: [fn(&mut Lm3g); 6] = [
			|t| t.bigrams[0].prob2 = 999,
			|t| t.trigrams[0].prob3 = 7,
			|t| t.bigrams[1].wid = 3,
			|t| t.unigrams[1].bigrams = 9,
			|t| t.bigrams[2].trigrams = 5,
			|t| t.tseg_base.clear(),
		];
		for (i, damage) in damage.into_iter().enumerate() {
			let mut t = three_word_tree();
			damage(&mut t);
			assert!(matches!(t.validate(3), Err(LmError::Format(_))), "damage {i} went unnoticed");
		}
	}

	#[test]
	fn gaps_are_filled_on_push() {
		let mut t = three_word_tree();
		t.push_unigram(5, -7, 0, -999);
		assert_eq!(t.n_unigrams(), 6);
		assert_eq!(t.unigrams[3].prob1, -999);
		assert_eq!(t.unigrams[5].prob1, -7);
		assert_eq!(t.first_bg(5), 3);
		assert_eq!(t.first_bg(6), 3);
	}
}
