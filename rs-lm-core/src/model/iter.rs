//! In-order traversal of the tree.
//!
//! `mgrams(m)` walks every n-gram of 0-based order `m`; `successors` walks
//! the continuations of one entry. Both are plain `Iterator`s over
//! [`NgramEntry`] values and can be restarted by calling them again.

use log::error;

use super::lm3g::find_successor;
use super::ngram_model::NgramModel;

/// Position in each level of the tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Cursor {
	ug: usize,
	bg: usize,
	tg: usize,
}

/// One n-gram with its stored (weighted) score and backoff weight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NgramEntry {
	m: usize,
	wids: [i32; 3],
	score: i32,
	bowt: i32,
	cursor: Cursor,
}

impl NgramEntry {
	/// 0-based order: 0 for unigrams.
	pub fn order(&self) -> usize {
		self.m
	}

	/// Word ids, oldest first.
	pub fn wids(&self) -> &[i32] {
		&self.wids[..=self.m]
	}

	pub fn score(&self) -> i32 {
		self.score
	}

	/// Backoff weight; zero for the highest order.
	pub fn bowt(&self) -> i32 {
		self.bowt
	}
}

pub struct NgramIter<'a> {
	model: &'a NgramModel,
	m: usize,
	next: Option<Cursor>,
	successor: bool,
}

impl Iterator for NgramIter<'_> {
	type Item = NgramEntry;

	fn next(&mut self) -> Option<NgramEntry> {
		let cursor = self.next?;
		let entry = self.model.entry_at(self.m, cursor);
		self.next = self.advance(cursor);
		Some(entry)
	}
}

impl NgramIter<'_> {
	fn advance(&self, mut c: Cursor) -> Option<Cursor> {
		let tree = &self.model.lm3g;
		let [n_ug, n_bg, n_tg] = self.model.counts();
		match self.m {
			0 => {
				c.ug += 1;
				(c.ug < n_ug).then_some(c)
			}
			1 => {
				c.bg += 1;
				if c.bg >= n_bg {
					return None;
				}
				while c.bg >= tree.first_bg(c.ug + 1) {
					if self.successor {
						return None;
					}
					c.ug += 1;
					if c.ug == n_ug {
						error!("bigram {} has no valid unigram parent", c.bg);
						return None;
					}
				}
				Some(c)
			}
			_ => {
				c.tg += 1;
				if c.tg >= n_tg {
					return None;
				}
				while c.tg >= tree.first_tg(c.bg + 1) {
					if self.successor {
						return None;
					}
					c.bg += 1;
					if c.bg == n_bg {
						error!("trigram {} has no valid bigram parent", c.tg);
						return None;
					}
				}
				while c.bg >= tree.first_bg(c.ug + 1) {
					c.ug += 1;
					if c.ug == n_ug {
						error!("trigram {} has no valid unigram parent", c.tg);
						return None;
					}
				}
				Some(c)
			}
		}
	}
}

impl NgramModel {
	/// Every n-gram of 0-based order `m`, in tree order.
	pub fn mgrams(&self, m: usize) -> NgramIter<'_> {
		let counts = self.counts();
		let mut iter = NgramIter { model: self, m, next: None, successor: false };
		if m >= self.n || counts[m] == 0 {
			return iter;
		}

		let tree = &self.lm3g;
		let mut c = Cursor::default();
		if m > 1 && counts[1] > 1 {
			while c.bg < counts[1] && tree.first_tg(c.bg + 1) <= c.tg {
				c.bg += 1;
			}
		}
		if m > 0 && counts[0] > 1 {
			while c.ug < counts[0] && tree.first_bg(c.ug + 1) <= c.bg {
				c.ug += 1;
			}
		}
		iter.next = Some(c);
		iter
	}

	/// Continuations of `entry` one order up. Empty at the highest order or
	/// when the entry has no successors.
	pub fn successors(&self, entry: &NgramEntry) -> NgramIter<'_> {
		let tree = &self.lm3g;
		let [_, n_bg, n_tg] = self.counts();
		let mut c = entry.cursor;
		let start = match entry.m {
			0 if self.n > 1 => {
				let first = tree.first_bg(c.ug);
				if first == tree.first_bg(c.ug + 1) || first == n_bg {
					None
				} else {
					c.bg = first;
					Some(c)
				}
			}
			1 if self.n > 2 => {
				let first = tree.first_tg(c.bg);
				if first == tree.first_tg(c.bg + 1) || first == n_tg {
					None
				} else {
					c.tg = first;
					Some(c)
				}
			}
			_ => None,
		};
		NgramIter { model: self, m: entry.m + 1, next: start, successor: true }
	}

	/// The entry for `wid` after `history` (most recent first), when that
	/// exact n-gram is stored.
	pub fn ngram_iter(&self, wid: i32, history: &[i32]) -> Option<NgramEntry> {
		let n_ug = self.lm3g.n_unigrams();
		let valid = |w: i32| usize::try_from(w).ok().filter(|&w| w < n_ug);
		let w = valid(wid)?;
		let cursor = match history.len() {
			0 => Cursor { ug: w, ..Cursor::default() },
			1 => {
				let h0 = valid(history[0])?;
				Cursor { ug: h0, bg: self.lm3g.find_bg(h0, w as u32)?, tg: 0 }
			}
			_ => {
				let (h0, h1) = (valid(history[0])?, valid(history[1])?);
				let span = self.tg_span(h1, h0);
				let tg = find_successor(&self.lm3g.trigrams[span.start..span.start + span.n_tg], w as u32)?;
				Cursor { ug: h1, bg: self.lm3g.find_bg(h1, h0 as u32)?, tg: span.start + tg }
			}
		};
		let m = history.len().min(2);
		if m >= self.n {
			return None;
		}
		Some(self.entry_at(m, cursor))
	}

	fn entry_at(&self, m: usize, c: Cursor) -> NgramEntry {
		let tree = &self.lm3g;
		let mut wids = [c.ug as i32, -1, -1];
		if m >= 1 {
			wids[1] = tree.bigrams[c.bg].wid as i32;
		}
		if m >= 2 {
			wids[2] = tree.trigrams[c.tg].wid as i32;
		}
		let (score, bowt) = match m {
			0 => (tree.unigrams[c.ug].prob1, tree.unigrams[c.ug].bo_wt1),
			1 => (tree.prob2[tree.bigrams[c.bg].prob2 as usize], tree.bigram_bowt(c.bg)),
			_ => (tree.prob3[tree.trigrams[c.tg].prob3 as usize], 0),
		};
		NgramEntry { m, wids, score, bowt, cursor: c }
	}
}
