//! String → integer hash table with open addressing.
//!
//! The table keeps its own occupancy policy and grows by rehashing into a
//! prime-sized slot array. It can be written to and read back from a stream
//! in a layout that is embedded verbatim inside the binary count model.

use std::io::{Read, Write};

use log::{debug, warn};

use crate::error::{LmError, Result};
use crate::io::{BinReader, BinWriter};

/// Tag written in front of every serialized table.
pub const HASH_VERSION: i32 = 0o60414;

const MIN_SIZE: usize = 11;

/// DJB2 hash of the key bytes, masked to 31 bits.
fn sih_key(key: &[u8]) -> u32 {
	let mut hash: u32 = 5381;
	for &b in key {
		hash = (hash << 5).wrapping_add(hash).wrapping_add(b as u32);
	}
	hash & 0x7FFF_FFFF
}

/// Smallest odd number `>= num` with no divisor in `3..=n/3`.
fn nearest_prime_up(mut num: usize) -> usize {
	if num % 2 == 0 {
		num += 1;
	}
	loop {
		let has_divisor = (3..=num / 3).any(|d| num % d == 0);
		if !has_divisor {
			return num;
		}
		num += 2;
	}
}

#[derive(Clone, Debug, PartialEq)]
struct Slot {
	key: Option<String>,
	value: i64,
}

/// Open-addressing map from non-empty strings to integers.
///
/// # Responsibilities
/// - Map words to ids for the vocabulary of both model kinds
/// - Grow automatically to respect `max_occupancy`
/// - Persist itself in a stable binary layout
///
/// # Invariants
/// - `slots.len()` is odd and was produced by `nearest_prime_up`
/// - `n_entries` equals the number of occupied slots
/// - `(n_entries + 1) / slots.len() <= max_occupancy` after every insertion
#[derive(Clone, Debug, PartialEq)]
pub struct SihTable {
	max_occupancy: f64,
	growth_ratio: f64,
	warn_on_update: bool,
	n_entries: usize,
	slots: Vec<Slot>,
}

impl SihTable {
	/// Creates an empty table.
	///
	/// # Errors
	/// `LmError::Config` if `max_occupancy` is outside `[0.01, 0.99]` or
	/// `growth_ratio` is outside `[1.10, 100]`.
	pub fn new(initial_size: usize, max_occupancy: f64, growth_ratio: f64, warn_on_update: bool) -> Result<Self> {
		if !(0.01..=0.99).contains(&max_occupancy) {
			return Err(LmError::Config(format!(
				"max_occupancy ({max_occupancy:.3}) must be in the range 0.01-0.99"
			)));
		}
		if !(1.10..=100.0).contains(&growth_ratio) {
			return Err(LmError::Config(format!(
				"growth_ratio ({growth_ratio:.3}) must be in the range 1.1-100"
			)));
		}
		let size = nearest_prime_up(initial_size.max(MIN_SIZE));
		Ok(Self {
			max_occupancy,
			growth_ratio,
			warn_on_update,
			n_entries: 0,
			slots: vec![Slot { key: None, value: 0 }; size],
		})
	}

	pub fn len(&self) -> usize {
		self.n_entries
	}

	pub fn is_empty(&self) -> bool {
		self.n_entries == 0
	}

	/// Number of slots.
	pub fn capacity(&self) -> usize {
		self.slots.len()
	}

	/// Inserts or updates `key`.
	///
	/// # Errors
	/// `LmError::Config` for the empty string.
	pub fn add(&mut self, key: &str, value: i64) -> Result<()> {
		if key.is_empty() {
			return Err(LmError::Config("cannot hash the empty string".to_owned()));
		}
		if (self.n_entries + 1) as f64 / self.slots.len() as f64 > self.max_occupancy {
			self.grow();
		}
		self.insert(key, value);
		Ok(())
	}

	fn grow(&mut self) {
		let mut size = (self.slots.len() as f64 * self.growth_ratio) as usize + 3;
		if self.n_entries as f64 / size as f64 > self.max_occupancy {
			size = size * (self.max_occupancy + 1.0) as usize + 3;
		}
		let size = nearest_prime_up(size);
		debug!("growing hash table from {} to {size} slots", self.slots.len());

		let old = std::mem::replace(&mut self.slots, vec![Slot { key: None, value: 0 }; size]);
		self.n_entries = 0;
		for slot in old {
			if let Some(key) = slot.key {
				self.insert(&key, slot.value);
			}
		}
	}

	fn insert(&mut self, key: &str, value: i64) {
		let size = self.slots.len();
		let mut idx = sih_key(key.as_bytes()) as usize % size;
		loop {
			let slot = &mut self.slots[idx];
			match &slot.key {
				None => {
					slot.key = Some(key.to_owned());
					slot.value = value;
					self.n_entries += 1;
					return;
				}
				Some(existing) if existing == key => {
					if self.warn_on_update {
						if slot.value != value {
							warn!("repeated hashing of '{key}', older value will be overridden");
						} else {
							warn!("repeated hashing of '{key}'");
						}
					}
					slot.value = value;
					return;
				}
				Some(_) => idx = (idx + 1) % size,
			}
		}
	}

	/// Value stored for `key`, `None` when absent.
	pub fn lookup(&self, key: &str) -> Option<i64> {
		if key.is_empty() {
			return None;
		}
		let size = self.slots.len();
		let mut idx = sih_key(key.as_bytes()) as usize % size;
		loop {
			match &self.slots[idx].key {
				None => return None,
				Some(existing) if existing == key => return Some(self.slots[idx].value),
				Some(_) => idx = (idx + 1) % size,
			}
		}
	}

	/// Occupied `(key, value)` pairs in slot order.
	pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> + '_ {
		self.slots.iter().filter_map(|s| s.key.as_deref().map(|k| (k, s.value)))
	}

	/// Serializes the table.
	///
	/// Layout: version, occupancy, growth, warn flag, size, entries, one value
	/// per slot, the string block length, then one NUL-terminated string per
	/// slot (a lone NUL for an empty slot).
	pub(crate) fn write<W: Write>(&self, out: &mut BinWriter<W>) -> Result<()> {
		let occupied = self.slots.iter().filter(|s| s.key.is_some()).count();
		if occupied != self.n_entries {
			return Err(LmError::Format(format!(
				"hash table claims {} entries, but {occupied} slots are occupied",
				self.n_entries
			)));
		}

		out.scalar(HASH_VERSION, "hash version")?;
		out.scalar(self.max_occupancy, "hash max_occupancy")?;
		out.scalar(self.growth_ratio, "hash growth_ratio")?;
		out.scalar(self.warn_on_update as i32, "hash warn_on_update")?;
		out.scalar(self.slots.len() as i64, "hash size")?;
		out.scalar(self.n_entries as i64, "hash n_entries")?;

		let values: Vec<i64> = self.slots.iter().map(|s| s.value).collect();
		out.slice(&values, "hash values")?;

		let mut block = Vec::new();
		for slot in &self.slots {
			if let Some(key) = &slot.key {
				block.extend_from_slice(key.as_bytes());
			}
			block.push(0);
		}
		out.scalar(block.len() as i64, "hash total_string_space")?;
		out.bytes(&block, "hash strings")?;
		debug!("hash table of {} slots ({} non-empty) written", self.slots.len(), self.n_entries);
		Ok(())
	}

	/// Deserializes a table written by [`SihTable::write`].
	///
	/// # Errors
	/// `LmError::Format` on a version mismatch, a string block that ends in
	/// the middle of a string, or bytes left over after the last slot.
	pub(crate) fn read<R: Read>(input: &mut BinReader<R>) -> Result<Self> {
		let version: i32 = input.scalar("hash version")?;
		if version != HASH_VERSION {
			return Err(LmError::Format(format!(
				"hash table version is {version}, current version is {HASH_VERSION}"
			)));
		}
		let max_occupancy: f64 = input.scalar("hash max_occupancy")?;
		let growth_ratio: f64 = input.scalar("hash growth_ratio")?;
		let warn_on_update = input.scalar::<i32>("hash warn_on_update")? != 0;
		let size = checked_len(input.scalar::<i64>("hash size")?, "hash size")?;
		let n_entries = checked_len(input.scalar::<i64>("hash n_entries")?, "hash n_entries")?;
		let values: Vec<i64> = input.vec(size, "hash values")?;
		let space = checked_len(input.scalar::<i64>("hash total_string_space")?, "hash total_string_space")?;
		let block = input.bytes(space, "hash strings")?;

		let mut slots = Vec::with_capacity(size);
		let mut pos = 0usize;
		for value in values {
			if pos >= block.len() {
				return Err(LmError::Format("hash string block ended prematurely".to_owned()));
			}
			if block[pos] == 0 {
				slots.push(Slot { key: None, value });
				pos += 1;
				continue;
			}
			let end = block[pos..]
				.iter()
				.position(|&b| b == 0)
				.map(|off| pos + off)
				.ok_or_else(|| LmError::Format("hash string block ended prematurely".to_owned()))?;
			let key = String::from_utf8_lossy(&block[pos..end]).into_owned();
			slots.push(Slot { key: Some(key), value });
			pos = end + 1;
		}
		if pos != block.len() {
			return Err(LmError::Format("some hash strings remained unaccounted for".to_owned()));
		}
		if slots.is_empty() {
			return Err(LmError::Format("hash table has no slots".to_owned()));
		}
		let occupied = slots.iter().filter(|s| s.key.is_some()).count();
		if occupied != n_entries || occupied == slots.len() {
			return Err(LmError::Format(format!(
				"hash table claims {n_entries} entries in {size} slots, {occupied} are occupied"
			)));
		}
		if !(0.01..=0.99).contains(&max_occupancy) || !(1.10..=100.0).contains(&growth_ratio) {
			return Err(LmError::Format(format!(
				"hash table parameters out of range (occupancy {max_occupancy}, growth {growth_ratio})"
			)));
		}
		debug!("hash table of {size} slots ({n_entries} non-empty) read");
		Ok(Self { max_occupancy, growth_ratio, warn_on_update, n_entries, slots })
	}
}

fn checked_len(v: i64, what: &str) -> Result<usize> {
	usize::try_from(v).map_err(|_| LmError::Format(format!("{what} is negative ({v})")))
}
