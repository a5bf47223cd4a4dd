//! Per-context cache of trigram ranges.
//!
//! One chain per most-recent history word, stored in an arena. Hits move to
//! the front of their chain; `reset` drops entries that were not used since
//! the previous reset.

/// Trigram range and backoff weight of a two-word context.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct TgSpan {
	pub start: usize,
	pub n_tg: usize,
	pub bowt: i32,
}

#[derive(Clone, Debug)]
struct TgInfo {
	w1: usize,
	span: TgSpan,
	used: bool,
	next: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct TgInfoCache {
	heads: Vec<Option<usize>>,
	entries: Vec<TgInfo>,
	free: Vec<usize>,
}

impl TgInfoCache {
	pub(crate) fn new(n_words: usize) -> Self {
		Self { heads: vec![None; n_words], entries: Vec::new(), free: Vec::new() }
	}

	/// Makes room for chains up to word id `n_words - 1`.
	pub(crate) fn grow(&mut self, n_words: usize) {
		if self.heads.len() < n_words {
			self.heads.resize(n_words, None);
		}
	}

	/// Span for context `(w1, w2)`, computed by `load` on a miss.
	pub(crate) fn get_or_load(&mut self, w1: usize, w2: usize, load: impl FnOnce() -> TgSpan) -> TgSpan {
		self.grow(w2 + 1);

		let mut prev = None;
		let mut cur = self.heads[w2];
		while let Some(i) = cur {
			if self.entries[i].w1 == w1 {
				break;
			}
			prev = cur;
			cur = self.entries[i].next;
		}

		let idx = match (cur, prev) {
			(Some(i), Some(p)) => {
				self.entries[p].next = self.entries[i].next;
				self.entries[i].next = self.heads[w2];
				self.heads[w2] = Some(i);
				i
			}
			(Some(i), None) => i,
			(None, _) => {
				let info = TgInfo { w1, span: load(), used: false, next: self.heads[w2] };
				let i = match self.free.pop() {
					Some(slot) => {
						self.entries[slot] = info;
						slot
					}
					None => {
						self.entries.push(info);
						self.entries.len() - 1
					}
				};
				self.heads[w2] = Some(i);
				i
			}
		};

		self.entries[idx].used = true;
		self.entries[idx].span
	}

	/// Frees entries not used since the last reset and clears the flags of the rest.
	pub(crate) fn reset(&mut self) {
		for w2 in 0..self.heads.len() {
			let mut prev: Option<usize> = None;
			let mut cur = self.heads[w2];
			while let Some(i) = cur {
				let next = self.entries[i].next;
				if self.entries[i].used {
					self.entries[i].used = false;
					prev = Some(i);
				} else {
					match prev {
						Some(p) => self.entries[p].next = next,
						None => self.heads[w2] = next,
					}
					self.free.push(i);
				}
				cur = next;
			}
		}
	}

	/// Number of live entries.
	pub(crate) fn len(&self) -> usize {
		self.entries.len() - self.free.len()
	}

	/// Context order of the chain for `w2`, most recent first.
	#[cfg(test)]
	fn chain(&self, w2: usize) -> Vec<usize> {
		let mut out = Vec::new();
		let mut cur = self.heads[w2];
		while let Some(i) = cur {
			out.push(self.entries[i].w1);
			cur = self.entries[i].next;
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn span(n: usize) -> TgSpan {
		TgSpan { start: n, n_tg: n, bowt: -(n as i32) }
	}

	#[test]
	fn miss_loads_once() {
		let mut c = TgInfoCache::new(4);
		let mut loads = 0;
		let a = c.get_or_load(1, 2, || {
			loads += 1;
			span(7)
		});
		let b = c.get_or_load(1, 2, || {
			loads += 1;
			span(9)
		});
		assert_eq!(a, span(7));
		assert_eq!(b, span(7));
		assert_eq!(loads, 1);
	}

	#[test]
	fn hit_moves_to_front() {
		let mut c = TgInfoCache::new(4);
		c.get_or_load(0, 3, || span(0));
		c.get_or_load(1, 3, || span(1));
		c.get_or_load(2, 3, || span(2));
		assert_eq!(c.chain(3), vec![2, 1, 0]);
		c.get_or_load(0, 3, || span(99));
		assert_eq!(c.chain(3), vec![0, 2, 1]);
	}

	#[test]
	fn reset_drops_unused_entries() {
		let mut c = TgInfoCache::new(2);
		c.get_or_load(0, 1, || span(0));
		c.get_or_load(1, 1, || span(1));
		c.reset();
		assert_eq!(c.len(), 2);
		c.get_or_load(1, 1, || span(5));
		c.reset();
		assert_eq!(c.chain(1), vec![1]);
		assert_eq!(c.len(), 1);
		c.reset();
		assert_eq!(c.len(), 0);
		// freed slots are reused
		c.get_or_load(0, 0, || span(3));
		assert_eq!(c.len(), 1);
		assert_eq!(c.entries.len(), 2);
	}

	#[test]
	fn grows_for_new_words() {
		let mut c = TgInfoCache::new(1);
		assert_eq!(c.get_or_load(0, 10, || span(4)), span(4));
	}
}
