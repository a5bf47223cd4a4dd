//! Backoff scoring over the trigram tree.
//!
//! Histories are passed most recent word first: `[w(i-1), w(i-2)]`.

use super::class;
use super::lm3g::find_successor;
use super::ngram_model::NgramModel;
use super::tginfo::TgSpan;
use super::INVALID_WID;

impl NgramModel {
	/// Weighted score of `wid` after `history`, with the number of words of
	/// the n-gram that was actually found.
	///
	/// A class member is scored as its class tag plus its in-class weight.
	pub fn ng_score(&self, wid: i32, history: &[i32]) -> (i32, usize) {
		let Some((base, class_weight)) = self.declassify(wid) else {
			return (self.log_zero, 0);
		};
		let hist = self.history_ids(history);
		let (score, n_used) = match hist.len() {
			0 => (self.lm3g.unigrams[base].prob1, 1),
			1 => self.bg_lookup(hist[0], base),
			_ => self.tg_lookup(hist[1], hist[0], base),
		};
		(score + class_weight, n_used)
	}

	/// Like [`ng_score`](Self::ng_score) with the language weight, insertion
	/// penalty and unigram interpolation undone.
	pub fn ng_prob(&self, wid: i32, history: &[i32]) -> (i32, usize) {
		let Some((base, class_weight)) = self.declassify(wid) else {
			return (self.log_zero, 0);
		};
		let hist = self.history_ids(history);
		let (score, n_used) = match hist.len() {
			0 => return (self.raw_unigram(base) + class_weight, 1),
			1 => self.bg_lookup(hist[0], base),
			_ => self.tg_lookup(hist[1], hist[0], base),
		};
		// backed-off scores keep their unigram interpolation
		(self.score_to_prob(score) + class_weight, n_used)
	}

	/// Score of `word` given `history` (most recent first). Unknown words map
	/// to the unknown-word id when the model has one.
	pub fn score(&self, word: &str, history: &[&str]) -> i32 {
		let hist: Vec<i32> = history.iter().map(|w| self.word_id(w).unwrap_or(INVALID_WID)).collect();
		self.ng_score(self.word_id(word).unwrap_or(INVALID_WID), &hist).0
	}

	/// Unweighted log probability of `word` given `history`.
	pub fn prob(&self, word: &str, history: &[&str]) -> i32 {
		let hist: Vec<i32> = history.iter().map(|w| self.word_id(w).unwrap_or(INVALID_WID)).collect();
		self.ng_prob(self.word_id(word).unwrap_or(INVALID_WID), &hist).0
	}

	pub fn bg_score(&self, w2: i32, w1: i32) -> (i32, usize) {
		self.ng_score(w2, &[w1])
	}

	pub fn tg_score(&self, w3: i32, w2: i32, w1: i32) -> (i32, usize) {
		self.ng_score(w3, &[w2, w1])
	}

	/// Removes the insertion penalty and language weight from a score.
	pub fn score_to_prob(&self, score: i32) -> i32 {
		((score - self.log_wip) as f64 / self.lw as f64) as i32
	}

	/// Base unigram index and in-class weight of a scored id.
	fn declassify(&self, wid: i32) -> Option<(usize, i32)> {
		if wid == INVALID_WID {
			return None;
		}
		let (wid, class_weight) = if class::is_class_wid(wid) {
			let lmclass = self.classes.get(class::class_id(wid))?;
			(lmclass.tag_wid, lmclass.prob(wid)?)
		} else {
			(wid, 0)
		};
		let base = usize::try_from(wid).ok().filter(|&w| w < self.lm3g.n_unigrams())?;
		Some((base, class_weight))
	}

	/// History with class members replaced by their tags. Ids outside the
	/// unigram table become invalid.
	fn history_ids(&self, history: &[i32]) -> Vec<i32> {
		history
			.iter()
			.take(2)
			.map(|&h| {
				let h = if h != INVALID_WID && class::is_class_wid(h) {
					self.classes.get(class::class_id(h)).map_or(INVALID_WID, |c| c.tag_wid)
				} else {
					h
				};
				if h >= 0 && (h as usize) < self.lm3g.n_unigrams() { h } else { INVALID_WID }
			})
			.collect()
	}

	fn bg_lookup(&self, w1: i32, w2: usize) -> (i32, usize) {
		let unigrams = &self.lm3g.unigrams;
		if w1 < 0 || self.n < 2 {
			return (unigrams[w2].prob1, 1);
		}
		match self.lm3g.find_bg(w1 as usize, w2 as u32) {
			Some(b) => (self.lm3g.prob2[self.lm3g.bigrams[b].prob2 as usize], 2),
			None => (unigrams[w1 as usize].bo_wt1 + unigrams[w2].prob1, 1),
		}
	}

	fn tg_lookup(&self, w1: i32, w2: i32, w3: usize) -> (i32, usize) {
		if self.n < 3 || w1 < 0 || w2 < 0 {
			return self.bg_lookup(w2, w3);
		}
		let span = self.tg_span(w1 as usize, w2 as usize);
		let trigrams = &self.lm3g.trigrams[span.start..span.start + span.n_tg];
		match find_successor(trigrams, w3 as u32) {
			Some(i) => (self.lm3g.prob3[trigrams[i].prob3 as usize], 3),
			None => {
				let (score, n_used) = self.bg_lookup(w2, w3);
				(span.bowt + score, n_used)
			}
		}
	}

	/// Trigram range of context `(w1, w2)` through the cache.
	pub(crate) fn tg_span(&self, w1: usize, w2: usize) -> TgSpan {
		self.tginfo.borrow_mut().get_or_load(w1, w2, || match self.lm3g.find_bg(w1, w2 as u32) {
			Some(b) => {
				let (start, end) = self.lm3g.tg_range(b);
				TgSpan { start, n_tg: end - start, bowt: self.lm3g.bigram_bowt(b) }
			}
			None => TgSpan { start: 0, n_tg: 0, bowt: 0 },
		})
	}

	/// Stored unigram probability with every weight undone.
	///
	/// Removing the uniform interpolation subtracts two nearly equal
	/// probabilities and loses precision, so it is skipped when the uniform
	/// part is zero.
	pub(crate) fn raw_unigram(&self, wid: usize) -> i32 {
		let mut score = self.score_to_prob(self.lm3g.unigrams[wid].prob1);
		let uniform = self.log_uniform + self.log_uniform_weight;
		let is_start = self.word_str.get(wid).is_some_and(|w| *w == self.symbols.start);
		if !is_start && uniform > self.log_zero {
			score = self.lmath.log(self.lmath.exp(score) - self.lmath.exp(uniform));
		}
		score
	}
}
