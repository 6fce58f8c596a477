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

//! TLB hardware model: component E's hardware-facing half.
//!
//! 64-entry fully associative, indexed read/write by slot, with a `probe`
//! that scans for a matching `entry_hi`. Mutation only ever happens under
//! `tlb_spinlock` with interrupts masked (see [`crate::sync::IntSpin`]); this
//! module never touches the interrupt mask itself, callers go through
//! [`crate::vm::VmSystem`].

use crate::limits::{NUM_TLB, PAGE_SHIFT};
use crate::memory::{Pfn, VirtAddr};

/// Entry is valid and usable for translation.
pub const VALID: usize = 1 << 0;
/// Entry allows writes (MIPS-style "dirty" bit doubling as write-enable).
pub const DIRTY: usize = 1 << 1;

#[derive(Clone, Copy, Default)]
struct Entry {
	entry_hi: usize,
	entry_lo: usize,
	present: bool,
}

/// A fixed-size, fully associative TLB.
pub struct Tlb {
	entries: [Entry; NUM_TLB],
	/// Round-robin pointer used once every slot is occupied.
	victim: usize,
}

impl Tlb {
	/// An empty TLB, as at boot or just after an address-space switch.
	pub const fn new() -> Self {
		Self {
			entries: [Entry {
				entry_hi: 0,
				entry_lo: 0,
				present: false,
			}; NUM_TLB],
			victim: 0,
		}
	}

	/// Returns the slot whose `entry_hi` matches the page-aligned `vaddr`, if any.
	pub fn probe(&self, vaddr: VirtAddr) -> Option<usize> {
		let key = vaddr.page_base().0;
		self.entries.iter().position(|e| e.present && e.entry_hi == key)
	}

	/// Encodes and installs a translation for `vaddr`, picking the first
	/// invalid slot, or round-robining over occupied ones if all are in use.
	/// Returns the slot written.
	pub fn install(&mut self, vaddr: VirtAddr, pfn: Pfn, writable: bool) -> usize {
		let slot = self
			.entries
			.iter()
			.position(|e| !e.present)
			.unwrap_or_else(|| {
				let slot = self.victim;
				self.victim = (self.victim + 1) % NUM_TLB;
				slot
			});
		let mut entry_lo = (pfn.0 << PAGE_SHIFT) | VALID;
		if writable {
			entry_lo |= DIRTY;
		}
		self.entries[slot] = Entry {
			entry_hi: vaddr.page_base().0,
			entry_lo,
			present: true,
		};
		slot
	}

	/// Invalidates the entry for `vaddr`, if present. Returns whether one was found.
	pub fn shootdown(&mut self, vaddr: VirtAddr) -> bool {
		match self.probe(vaddr) {
			Some(slot) => {
				self.entries[slot].present = false;
				true
			}
			None => false,
		}
	}

	/// Invalidates every slot. Used on address-space switch.
	pub fn flush_all(&mut self) {
		for e in &mut self.entries {
			e.present = false;
		}
	}

	/// Returns the raw `(entry_hi, entry_lo)` pair for a slot, for tests/inspection.
	pub fn entry(&self, slot: usize) -> Option<(usize, usize)> {
		let e = self.entries[slot];
		e.present.then_some((e.entry_hi, e.entry_lo))
	}
}

impl Default for Tlb {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn install_then_probe() {
		let mut tlb = Tlb::new();
		let va = VirtAddr(0x400ab0);
		let slot = tlb.install(va, Pfn(7), true);
		let found = tlb.probe(va).unwrap();
		assert_eq!(found, slot);
		let (hi, lo) = tlb.entry(slot).unwrap();
		assert_eq!(hi, 0x400000);
		assert_eq!(lo, (7 << PAGE_SHIFT) | VALID | DIRTY);
	}

	#[test]
	fn readonly_entry_has_no_dirty_bit() {
		let mut tlb = Tlb::new();
		let slot = tlb.install(VirtAddr(0x10000), Pfn(3), false);
		let (_, lo) = tlb.entry(slot).unwrap();
		assert_eq!(lo & DIRTY, 0);
		assert_eq!(lo & VALID, VALID);
	}

	#[test]
	fn shootdown_removes_entry() {
		let mut tlb = Tlb::new();
		let va = VirtAddr(0x400000);
		tlb.install(va, Pfn(1), true);
		assert!(tlb.shootdown(va));
		assert!(tlb.probe(va).is_none());
		assert!(!tlb.shootdown(va));
	}

	#[test]
	fn fills_then_round_robins() {
		let mut tlb = Tlb::new();
		for i in 0..NUM_TLB {
			tlb.install(VirtAddr(i * 0x1000), Pfn(i), true);
		}
		// All slots occupied; next install evicts slot 0 (round-robin start).
		let slot = tlb.install(VirtAddr(0xdead_0000), Pfn(99), true);
		assert_eq!(slot, 0);
		assert!(tlb.probe(VirtAddr(0)).is_none());
	}

	#[test]
	fn flush_all_clears_every_slot() {
		let mut tlb = Tlb::new();
		tlb.install(VirtAddr(0x1000), Pfn(1), true);
		tlb.install(VirtAddr(0x2000), Pfn(2), true);
		tlb.flush_all();
		assert!(tlb.probe(VirtAddr(0x1000)).is_none());
		assert!(tlb.probe(VirtAddr(0x2000)).is_none());
	}
}
