//! Word classes: a tag word in the n-gram tree standing for a weighted set
//! of member words.
//!
//! Member word ids carry the class number in bits 24..31 and a set high bit,
//! so `score` can tell them apart from plain unigram ids.

use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{IoContext, LmError, Result};
use crate::io::open_lines;
use crate::logmath::LogMath;

/// Maximum number of classes per model.
pub const MAX_CLASSES: usize = 128;

/// Initial bucket count of the dynamic member table.
const NGRAM_HASH_SIZE: usize = 128;

const CLASS_BIT: u32 = 0x8000_0000;

/// Builds the class-tagged id of `wid` in class `classid`.
pub fn class_wid(wid: i32, classid: usize) -> i32 {
	(((wid as u32) & 0x00ff_ffff) | CLASS_BIT | ((classid as u32) << 24)) as i32
}

pub fn is_class_wid(wid: i32) -> bool {
	wid != -1 && (wid as u32) & CLASS_BIT != 0
}

pub fn class_id(wid: i32) -> usize {
	(((wid as u32) >> 24) & 0x7f) as usize
}

/// Id with any class tag removed.
pub fn base_wid(wid: i32) -> i32 {
	((wid as u32) & 0x00ff_ffff) as i32
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
struct HashEntry {
	wid: i32,
	prob1: i32,
	next: Option<usize>,
}

const EMPTY: HashEntry = HashEntry { wid: -1, prob1: 0, next: None };

/// One class of the model.
///
/// # Invariants
/// - `prob1[i]` is the in-class log weight of base id `start_wid + i`
/// - words added after creation live in `nword_hash`, chained by `next`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NgramClass {
	pub(crate) tag_wid: i32,
	start_wid: i32,
	prob1: Vec<i32>,
	nword_hash: Vec<HashEntry>,
	n_hash_inuse: usize,
}

impl NgramClass {
	/// Creates a class whose initial members occupy consecutive base ids
	/// from `start_wid`. Weights are normalized when they do not sum to
	/// roughly one.
	pub(crate) fn new(lmath: &LogMath, tag_wid: i32, start_wid: i32, weights: &[f32]) -> Self {
		let total: f32 = weights.iter().sum();
		let normalize = !(0.9..=1.1).contains(&total);
		if normalize {
			info!("total class probability is {total}, will normalize");
		}
		let prob1 = weights
			.iter()
			.map(|&w| lmath.log(if normalize { (w / total) as f64 } else { w as f64 }))
			.collect();
		Self { tag_wid, start_wid, prob1, nword_hash: Vec::new(), n_hash_inuse: 0 }
	}

	pub fn tag_wid(&self) -> i32 {
		self.tag_wid
	}

	/// Number of members, initial and added.
	pub fn len(&self) -> usize {
		self.prob1.len() + self.n_hash_inuse
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Scales every member weight by `scale` (a log value).
	pub(crate) fn rescale(&mut self, scale: i32) {
		for p in &mut self.prob1 {
			*p += scale;
		}
		for e in self.nword_hash.iter_mut().filter(|e| e.wid != -1) {
			e.prob1 += scale;
		}
	}

	/// Adds a member to the dynamic table and returns its bucket.
	///
	/// Collisions are chained through free buckets; a full table doubles and
	/// every member is re-inserted under the wider mask.
	pub(crate) fn add_word(&mut self, wid: i32, lweight: i32) -> usize {
		if self.nword_hash.is_empty() {
			self.nword_hash = vec![EMPTY; NGRAM_HASH_SIZE];
			self.n_hash_inuse = 0;
		}
		if self.n_hash_inuse == self.nword_hash.len() {
			let old = std::mem::replace(&mut self.nword_hash, vec![EMPTY; self.n_hash_inuse * 2]);
			self.n_hash_inuse = 0;
			for e in old.into_iter().filter(|e| e.wid != -1) {
				self.insert(e.wid, e.prob1);
			}
		}
		self.insert(wid, lweight)
	}

	fn insert(&mut self, wid: i32, lweight: i32) -> usize {
		let mut hash = (wid as u32 as usize) & (self.nword_hash.len() - 1);
		if self.nword_hash[hash].wid == -1 {
			self.nword_hash[hash] = HashEntry { wid, prob1: lweight, next: None };
			self.n_hash_inuse += 1;
			return hash;
		}
		while let Some(next) = self.nword_hash[hash].next {
			hash = next;
		}
		// the caller guarantees at least one empty bucket
		let free = self.nword_hash.iter().position(|e| e.wid == -1).unwrap_or(hash);
		self.nword_hash[free] = HashEntry { wid, prob1: lweight, next: None };
		if free != hash {
			self.nword_hash[hash].next = Some(free);
		}
		self.n_hash_inuse += 1;
		free
	}

	/// Checks a class that was not built by this process, such as one read
	/// from a snapshot, against a tree of `n_unigrams` words.
	pub(crate) fn validate(&self, n_unigrams: usize) -> Result<()> {
		let bad = |what: &str| Err(LmError::Format(format!("class with tag {}: {what}", self.tag_wid)));
		if usize::try_from(self.tag_wid).map_or(true, |w| w >= n_unigrams) {
			return bad("tag word is not a unigram");
		}
		let members = i32::try_from(self.prob1.len()).ok();
		if self.start_wid < 0 || members.and_then(|m| self.start_wid.checked_add(m)).is_none() {
			return bad("member ids out of range");
		}
		let size = self.nword_hash.len();
		if (size != 0 && !size.is_power_of_two()) || self.n_hash_inuse > size {
			return bad("malformed member table");
		}
		// each chain must end within `size` links
		for start in 0..size {
			let mut hash = Some(start);
			let mut steps = 0;
			while let Some(h) = hash {
				if h >= size || steps > size {
					return bad("broken member chain");
				}
				hash = self.nword_hash[h].next;
				steps += 1;
			}
		}
		Ok(())
	}

	/// In-class log weight of `wid`, `None` when it is not a member.
	pub fn prob(&self, wid: i32) -> Option<i32> {
		let base = base_wid(wid);
		if base >= self.start_wid && base < self.start_wid + self.prob1.len() as i32 {
			return Some(self.prob1[(base - self.start_wid) as usize]);
		}
		if self.nword_hash.is_empty() {
			return None;
		}
		let mut hash = Some((wid as u32 as usize) & (self.nword_hash.len() - 1));
		while let Some(h) = hash {
			if self.nword_hash[h].wid == wid {
				return Some(self.nword_hash[h].prob1);
			}
			hash = self.nword_hash[h].next;
		}
		None
	}
}

/// A class as declared in a class-definition file.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassDef {
	pub name: String,
	pub words: Vec<String>,
	pub weights: Vec<f32>,
}

/// Parses a class-definition file.
///
/// ```text
/// LMCLASS [city]
/// paris 0.5
/// london
/// END [city]
/// ```
///
/// A member without a weight gets 1.0. Lines outside a class are ignored.
///
/// # Errors
/// `LmError::Class` on a mismatched `END`, a duplicate class name or a class
/// left open at the end of the file.
pub fn read_classdef<P: AsRef<Path>>(path: P) -> Result<Vec<ClassDef>> {
	let mut defs: Vec<ClassDef> = Vec::new();
	let mut current: Option<ClassDef> = None;

	for line in open_lines(&path)? {
		let line = line.context("reading class definition")?;
		let mut fields = line.split_whitespace();
		let Some(first) = fields.next() else {
			continue;
		};
		let second = fields.next();

		match current.as_mut() {
			Some(class) => {
				if first == "END" && second.is_some() {
					if second != Some(class.name.as_str()) {
						return Err(LmError::Class(format!(
							"END {} does not close class {}",
							second.unwrap_or_default(),
							class.name
						)));
					}
					if let Some(done) = current.take() {
						if defs.iter().any(|d| d.name == done.name) {
							return Err(LmError::Class(format!("class {} defined twice", done.name)));
						}
						defs.push(done);
					}
				} else {
					let weight = second.and_then(|s| s.parse::<f32>().ok()).unwrap_or(1.0);
					class.words.push(first.to_owned());
					class.weights.push(weight);
				}
			}
			None => {
				if first == "LMCLASS" {
					if let Some(name) = second {
						current = Some(ClassDef { name: name.to_owned(), words: Vec::new(), weights: Vec::new() });
					}
				}
			}
		}
	}

	if let Some(open) = current {
		return Err(LmError::Class(format!("class {} is never closed", open.name)));
	}
	Ok(defs)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use tempfile::tempdir;

	#[test]
	fn class_ids_round_trip() {
		let w = class_wid(1234, 5);
		assert!(is_class_wid(w));
		assert_eq!(class_id(w), 5);
		assert_eq!(base_wid(w), 1234);
		assert!(!is_class_wid(1234));
		assert!(!is_class_wid(-1));
	}

	#[test]
	fn weights_are_normalized() {
		let lm = LogMath::default();
		let c = NgramClass::new(&lm, 0, 10, &[2.0, 2.0]);
		let p = c.prob(class_wid(10, 0)).unwrap();
		assert!((lm.exp(p) - 0.5).abs() < 1e-3);
		assert_eq!(c.prob(class_wid(12, 0)), None);
	}

	#[test]
	fn dynamic_members_chain_on_collision() {
		let lm = LogMath::default();
		let mut c = NgramClass::new(&lm, 0, 0, &[1.0]);
		let a = class_wid(1, 0);
		let b = class_wid(1 + NGRAM_HASH_SIZE as i32, 0);
		c.add_word(a, -10);
		c.add_word(b, -20);
		assert_eq!(c.prob(a), Some(-10));
		assert_eq!(c.prob(b), Some(-20));
		assert_eq!(c.len(), 3);
		c.rescale(-1);
		assert_eq!(c.prob(b), Some(-21));
	}

	#[test]
	fn full_table_doubles() {
		let lm = LogMath::default();
		let mut c = NgramClass::new(&lm, 0, 0, &[]);
		for i in 0..(NGRAM_HASH_SIZE as i32 + 5) {
			c.add_word(class_wid(1000 + i, 0), -i);
		}
		assert_eq!(c.nword_hash.len(), NGRAM_HASH_SIZE * 2);
		assert_eq!(c.prob(class_wid(1000 + 130, 0)), Some(-130));
	}

	#[test]
	fn damaged_classes_fail_validation() {
		let lm = LogMath::default();
		let mut c = NgramClass::new(&lm, 3, 10, &[1.0, 1.0]);
		c.add_word(class_wid(20, 0), -10);
		assert!(c.validate(4).is_ok());
		assert!(matches!(c.validate(3), Err(LmError::Format(_))));

		let mut looped = c.clone();
		let h = looped.nword_hash.iter().position(|e| e.wid != -1).unwrap();
		looped.nword_hash[h].next = Some(h);
		assert!(matches!(looped.validate(4), Err(LmError::Format(_))));

		let mut dangling = c.clone();
		dangling.nword_hash[0].next = Some(NGRAM_HASH_SIZE);
		assert!(matches!(dangling.validate(4), Err(LmError::Format(_))));

		let mut overflowing = c;
		overflowing.start_wid = i32::MAX;
		assert!(matches!(overflowing.validate(4), Err(LmError::Format(_))));
	}

	#[test]
	fn classdef_parses_and_checks_end() {
		let dir = tempdir().expect("temp dir");
		let good = dir.path().join("good.cls");
		fs::write(&good, "junk\nLMCLASS [city]\nparis 0.5\nlondon\nEND [city]\n").unwrap();
		let defs = read_classdef(&good).unwrap();
		assert_eq!(defs.len(), 1);
		assert_eq!(defs[0].words, vec!["paris", "london"]);
		assert_eq!(defs[0].weights, vec![0.5, 1.0]);

		let bad = dir.path().join("bad.cls");
		fs::write(&bad, "LMCLASS [a]\nx\nEND [b]\n").unwrap();
		assert!(matches!(read_classdef(&bad), Err(LmError::Class(_))));
	}
}
