/*
 * This file is part of Pebble.
 *
 * Pebble is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Pebble is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Pebble. If not, see <https://www.gnu.org/licenses/>.
 */

//! Software page table: component C.
//!
//! A sparse two-level table keyed by virtual page number: a fixed first
//! level of pointers to lazily-allocated 1024-entry second-level tables.
//! Frame allocation and swap-slot duplication are the caller's business
//! ([`crate::memory::coremap`] and [`crate::memory::swap`]); this module
//! only owns the PTE bookkeeping, taking allocation as injected closures so
//! it stays decoupled from the coremap's locking.

use crate::error::{errno, EResult};
use crate::limits::{l1_index, l2_index, PT_L1_SIZE, PT_L2_SIZE};
use crate::memory::swap::SwapSlot;
use crate::memory::{Pfn, VirtAddr};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

/// One page table entry.
///
/// `pfn` is meaningful only when `resident`; `swap_slot` is meaningful only
/// when `valid && !resident`. There is no in-band sentinel: absence is
/// `swap_slot: None`.
#[derive(Clone, Copy, Default)]
pub struct Pte {
	pub valid: bool,
	pub resident: bool,
	pub read_only: bool,
	pub dirty: bool,
	pub pfn: Pfn,
	pub swap_slot: Option<SwapSlot>,
}

impl Pte {
	const fn empty() -> Self {
		Self {
			valid: false,
			resident: false,
			read_only: false,
			dirty: false,
			pfn: Pfn(0),
			swap_slot: None,
		}
	}
}

type L2Table = Box<[Pte]>;

fn new_l2_table() -> L2Table {
	vec![Pte::empty(); PT_L2_SIZE].into_boxed_slice()
}

/// Two-level, per-address-space virtual-to-physical map.
pub struct PageTable {
	l1: Vec<Option<L2Table>>,
}

impl PageTable {
	/// An empty table; no second-level tables allocated yet.
	pub fn new() -> Self {
		let mut l1 = Vec::with_capacity(PT_L1_SIZE);
		l1.resize_with(PT_L1_SIZE, || None);
		Self { l1 }
	}

	/// Returns the PTE for `vaddr`, or `None` if its second-level table has
	/// never been allocated. A `Some` may still carry `valid = false`.
	pub fn lookup(&self, vaddr: VirtAddr) -> Option<&Pte> {
		let l2 = self.l1[l1_index(vaddr.0)].as_ref()?;
		Some(&l2[l2_index(vaddr.0)])
	}

	/// Mutable counterpart of [`Self::lookup`].
	pub fn lookup_mut(&mut self, vaddr: VirtAddr) -> Option<&mut Pte> {
		let l2 = self.l1[l1_index(vaddr.0)].as_mut()?;
		Some(&mut l2[l2_index(vaddr.0)])
	}

	/// Lazily allocates the second-level table for `vaddr` if absent and sets
	/// `valid, resident, read_only, pfn`; `dirty` starts clear, `swap_slot`
	/// starts empty.
	pub fn insert(&mut self, vaddr: VirtAddr, pfn: Pfn, read_only: bool) -> EResult<()> {
		let l1i = l1_index(vaddr.0);
		let l2 = self.l1[l1i].get_or_insert_with(new_l2_table);
		l2[l2_index(vaddr.0)] = Pte {
			valid: true,
			resident: true,
			read_only,
			dirty: false,
			pfn,
			swap_slot: None,
		};
		Ok(())
	}

	/// Deep-copies this table. For every resident entry, `copy_frame(pfn)`
	/// allocates a fresh frame and copies the page's bytes, returning the
	/// new PFN. For every non-resident (swapped-out) entry, `copy_slot(slot)`
	/// allocates a fresh swap slot with an independent copy of the page
	/// bytes, returning the new slot — the clone never shares a slot with
	/// its source (see the design note on the source's aliasing bug).
	pub fn copy(
		&self,
		mut copy_frame: impl FnMut(Pfn) -> EResult<Pfn>,
		mut copy_slot: impl FnMut(SwapSlot) -> EResult<SwapSlot>,
	) -> EResult<PageTable> {
		let mut out = PageTable::new();
		for (i, l2) in self.l1.iter().enumerate() {
			let Some(l2) = l2 else { continue };
			let mut new_l2 = new_l2_table();
			for (j, pte) in l2.iter().enumerate() {
				if !pte.valid {
					continue;
				}
				if pte.resident {
					let new_pfn = copy_frame(pte.pfn)?;
					new_l2[j] = Pte {
						valid: true,
						resident: true,
						read_only: pte.read_only,
						dirty: pte.dirty,
						pfn: new_pfn,
						swap_slot: None,
					};
				} else {
					let slot = pte.swap_slot.ok_or(errno!(EFAULT))?;
					let new_slot = copy_slot(slot)?;
					new_l2[j] = Pte {
						valid: true,
						resident: false,
						read_only: pte.read_only,
						dirty: false,
						pfn: Pfn(0),
						swap_slot: Some(new_slot),
					};
				}
			}
			out.l1[i] = Some(new_l2);
		}
		Ok(out)
	}

	/// Frees every swap slot referenced by a non-resident entry via
	/// `free_slot`. Resident frames are the enclosing address space's job
	/// (it walks regions, not the page table, to free them).
	pub fn destroy(&mut self, mut free_slot: impl FnMut(SwapSlot)) {
		for l2 in self.l1.iter_mut().flatten() {
			for pte in l2.iter_mut() {
				if pte.valid && !pte.resident {
					if let Some(slot) = pte.swap_slot.take() {
						free_slot(slot);
					}
				}
			}
		}
	}

	/// Iterates over every valid entry as `(vaddr_base, pte)`, in ascending
	/// VPN order. Used by address-space teardown to free resident frames.
	pub fn iter_valid(&self) -> impl Iterator<Item = (VirtAddr, &Pte)> {
		self.l1.iter().enumerate().flat_map(|(i, l2)| {
			let l2 = l2.as_deref();
			(0..PT_L2_SIZE).filter_map(move |j| {
				let pte = &l2?[j];
				pte.valid.then(|| {
					let vaddr = (i << (crate::limits::PT_L2_BITS + crate::limits::PAGE_SHIFT))
						| (j << crate::limits::PAGE_SHIFT);
					(VirtAddr(vaddr), pte)
				})
			})
		})
	}
}

impl Default for PageTable {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lookup_before_insert_is_none() {
		let pt = PageTable::new();
		assert!(pt.lookup(VirtAddr(0x400000)).is_none());
	}

	#[test]
	fn insert_then_lookup() {
		let mut pt = PageTable::new();
		pt.insert(VirtAddr(0x400000), Pfn(5), false).unwrap();
		let pte = pt.lookup(VirtAddr(0x400000)).unwrap();
		assert!(pte.valid && pte.resident);
		assert_eq!(pte.pfn, Pfn(5));
		assert!(!pte.read_only);
		assert!(!pte.dirty);
	}

	#[test]
	fn copy_resident_gives_independent_frame() {
		let mut pt = PageTable::new();
		pt.insert(VirtAddr(0x400000), Pfn(1), false).unwrap();
		let clone = pt
			.copy(|_src| Ok(Pfn(2)), |slot| Ok(slot))
			.unwrap();
		let orig = pt.lookup(VirtAddr(0x400000)).unwrap();
		let cloned = clone.lookup(VirtAddr(0x400000)).unwrap();
		assert_eq!(orig.pfn, Pfn(1));
		assert_eq!(cloned.pfn, Pfn(2));
		assert_ne!(orig.pfn, cloned.pfn);
	}

	#[test]
	fn copy_non_resident_gets_a_new_slot() {
		let mut pt = PageTable::new();
		pt.insert(VirtAddr(0x400000), Pfn(1), false).unwrap();
		pt.lookup_mut(VirtAddr(0x400000)).unwrap().resident = false;
		pt.lookup_mut(VirtAddr(0x400000)).unwrap().swap_slot = Some(SwapSlot(3));
		let clone = pt
			.copy(|src| Ok(src), |_slot| Ok(SwapSlot(9)))
			.unwrap();
		let cloned = clone.lookup(VirtAddr(0x400000)).unwrap();
		assert!(!cloned.resident);
		assert_eq!(cloned.swap_slot, Some(SwapSlot(9)));
	}

	#[test]
	fn destroy_frees_non_resident_slots_only() {
		let mut pt = PageTable::new();
		pt.insert(VirtAddr(0x400000), Pfn(1), false).unwrap();
		pt.insert(VirtAddr(0x401000), Pfn(2), false).unwrap();
		pt.lookup_mut(VirtAddr(0x401000)).unwrap().resident = false;
		pt.lookup_mut(VirtAddr(0x401000)).unwrap().swap_slot = Some(SwapSlot(4));
		let mut freed = Vec::new();
		pt.destroy(|slot| freed.push(slot));
		assert_eq!(freed, vec![SwapSlot(4)]);
	}
}
