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

//! Address spaces: component D.
//!
//! An [`AddrSpace`] owns a page table, a region list, a heap range and a
//! stack base, behind the sleeping `as_lock`. The operations that are purely
//! local state — `define_region`, `prepare_load`/`complete_load`, stack/heap
//! setup — live on [`AddrSpaceState`] here. `copy`, `destroy`, `activate`
//! and `deactivate` cross into the coremap, swap device and TLB (component D
//! "walks C and allocates new frames via B", per the data-flow description),
//! so those are [`crate::vm::VmSystem`] methods instead; see that module.

pub mod region;

use crate::error::{errno, EResult};
use crate::limits::USERSTACK;
use crate::memory::pagetable::PageTable;
use crate::memory::VirtAddr;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use region::Region;

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// State guarded by `as_lock`.
pub struct AddrSpaceState {
	pub page_table: PageTable,
	pub regions: Vec<Region>,
	pub heap_start: VirtAddr,
	pub heap_end: VirtAddr,
	pub stack_base: VirtAddr,
}

impl AddrSpaceState {
	fn new() -> Self {
		Self {
			page_table: PageTable::new(),
			regions: Vec::new(),
			heap_start: VirtAddr(0),
			heap_end: VirtAddr(0),
			stack_base: VirtAddr(USERSTACK),
		}
	}

	/// Appends a region, rounding `base` down and `size` up to whole pages.
	/// Overlap checks are the loader's job, not ours, but a region must not
	/// cross into stack space.
	pub fn define_region(&mut self, base: VirtAddr, size: usize, read: bool, write: bool, exec: bool) -> EResult<()> {
		let region = Region::new(base, size, read, write, exec);
		if region.base.0 + region.size() > USERSTACK {
			return Err(errno!(EFAULT));
		}
		self.regions.push(region);
		Ok(())
	}

	/// Sets the heap to the empty range `[start, start)`.
	pub fn set_brk_init(&mut self, start: VirtAddr) {
		self.heap_start = start;
		self.heap_end = start;
	}

	/// Fixes the stack base at `USERSTACK`; the source's `as_define_stack`
	/// always returns the same fixed top, it does not grow the stack.
	pub fn define_stack(&mut self) -> VirtAddr {
		self.stack_base = VirtAddr(USERSTACK);
		self.stack_base
	}

	/// Temporarily forces every region writable, for ELF loading through the
	/// ordinary fault path.
	pub fn prepare_load(&mut self) {
		for r in &mut self.regions {
			r.originally_write = r.write;
			r.write = true;
		}
	}

	/// Restores the write permission of regions that were not originally writable.
	pub fn complete_load(&mut self) {
		for r in &mut self.regions {
			if !r.originally_write {
				r.write = false;
			}
		}
	}

	/// The region containing `vaddr`, if any.
	pub fn find_region(&self, vaddr: VirtAddr) -> Option<&Region> {
		self.regions.iter().find(|r| r.contains(vaddr))
	}

	/// Whether `vaddr` falls inside a defined region, the heap, or the stack.
	pub fn validate(&self, vaddr: VirtAddr) -> bool {
		if self.find_region(vaddr).is_some() {
			return true;
		}
		if vaddr.0 >= self.heap_start.0 && vaddr.0 < self.heap_end.0 {
			return true;
		}
		vaddr.0 >= self.stack_base.0 && vaddr.0 < USERSTACK
	}
}

/// A process's virtual address space.
///
/// Compared with the source's global-ish `struct addrspace`, this carries an
/// identity (`id`) distinct from the coremap's `owner` pointer, so eviction
/// can tell two address spaces apart without relying on pointer reuse after
/// a drop.
pub struct AddrSpace {
	id: usize,
	state: crate::sync::Lock<AddrSpaceState>,
}

impl AddrSpace {
	/// An empty address space: empty page table, no regions, empty heap at
	/// `0`, stack base at `USERSTACK`.
	pub fn create() -> Arc<Self> {
		Arc::new(Self {
			id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
			state: crate::sync::Lock::new(AddrSpaceState::new()),
		})
	}

	/// A stable identity, distinct across every live or dropped address space.
	pub fn id(&self) -> usize {
		self.id
	}

	/// Acquires `as_lock`.
	pub fn lock(&self) -> crate::sync::lock::LockGuard<'_, AddrSpaceState> {
		self.state.lock()
	}
}

impl PartialEq for AddrSpace {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for AddrSpace {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn create_is_empty() {
		let asp = AddrSpace::create();
		let st = asp.lock();
		assert!(st.regions.is_empty());
		assert_eq!(st.heap_start, st.heap_end);
		assert_eq!(st.stack_base.0, USERSTACK);
	}

	#[test]
	fn distinct_address_spaces_have_distinct_ids() {
		let a = AddrSpace::create();
		let b = AddrSpace::create();
		assert_ne!(a.id(), b.id());
	}

	#[test]
	fn define_region_rejects_crossing_userstack() {
		let asp = AddrSpace::create();
		let mut st = asp.lock();
		let res = st.define_region(VirtAddr(USERSTACK - 0x1000), 0x2000, true, true, false);
		assert!(res.is_err());
	}

	#[test]
	fn validate_covers_region_heap_and_stack() {
		let asp = AddrSpace::create();
		let mut st = asp.lock();
		st.define_region(VirtAddr(0x400000), 0x1000, true, true, false).unwrap();
		st.set_brk_init(VirtAddr(0x600000));
		st.heap_end = VirtAddr(0x601000);
		st.define_stack();
		assert!(st.validate(VirtAddr(0x400500)));
		assert!(st.validate(VirtAddr(0x600500)));
		assert!(st.validate(VirtAddr(USERSTACK - 4)));
		assert!(!st.validate(VirtAddr(0x700000)));
	}
}
