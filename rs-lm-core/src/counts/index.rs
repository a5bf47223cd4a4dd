//! 16-bit successor indices.
//!
//! Each node of the count tree stores the index of its first child modulo
//! [`KEY`]. A per-level pointer table records the node position at which
//! the full index entered each new block of `KEY` children, so the full
//! index can be rebuilt from the short one and the node position.

/// Block size of short indices.
pub const KEY: usize = 65535;

/// Short form of `full_index` for the node at `position`, extending
/// `ptr_table` when the index enters a new block.
///
/// Positions must be presented in increasing order with non-decreasing
/// full indices.
pub(crate) fn new_index(full_index: usize, ptr_table: &mut Vec<i32>, position: usize) -> u16 {
	while full_index as i64 - (ptr_table.len() as i64 - 1) * KEY as i64 >= KEY as i64 {
		ptr_table.push(position as i32);
	}
	(full_index % KEY) as u16
}

/// Full index of the node at `position` whose short index is `short`.
pub(crate) fn full_index(short: u16, ptr_table: &[i32], position: usize) -> usize {
	let block = ptr_table.partition_point(|&p| p as i64 <= position as i64).saturating_sub(1);
	block * KEY + short as usize
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_call_opens_block_zero() {
		let mut table = Vec::new();
		assert_eq!(new_index(0, &mut table, 0), 0);
		assert_eq!(table, vec![0]);
		assert_eq!(new_index(10, &mut table, 1), 10);
		assert_eq!(table, vec![0]);
	}

	#[test]
	fn indices_survive_block_crossings() {
		let mut table = Vec::new();
		let fulls: Vec<usize> = (0..10).map(|i| i * 30_000).collect();
		let shorts: Vec<u16> = fulls.iter().enumerate().map(|(pos, &f)| new_index(f, &mut table, pos)).collect();
		for (pos, (&short, &full)) in shorts.iter().zip(&fulls).enumerate() {
			assert_eq!(full_index(short, &table, pos), full);
		}
	}

	#[test]
	fn jumps_over_a_whole_block() {
		let mut table = Vec::new();
		let a = new_index(5, &mut table, 0);
		let b = new_index(3 * KEY + 7, &mut table, 1);
		assert_eq!(full_index(a, &table, 0), 5);
		assert_eq!(full_index(b, &table, 1), 3 * KEY + 7);
	}
}
