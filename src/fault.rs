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

//! Fault entry point: the other half of component E (see [`crate::memory::tlb`]
//! for the hardware model).
//!
//! A TLB miss or protection fault funnels through [`VmSystem::handle_fault`].
//! The three cases in the component design — no entry, swapped out, already
//! resident — are the three arms of [`Kind`].

use crate::addrspace::AddrSpace;
use crate::error::{errno, EResult};
use crate::memory::VirtAddr;
use crate::platform::Platform;
use crate::vm::VmSystem;
use alloc::sync::Arc;

/// Why the hardware trapped into the fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
	/// TLB miss on a load.
	Read,
	/// TLB miss on a store.
	Write,
	/// The TLB held a valid, read-only entry and a store hit it.
	Readonly,
}

impl<P: Platform> VmSystem<P> {
	/// Services a fault at `vaddr` of kind `kind` against `asp`. Returns
	/// `Ok(())` once a TLB entry is installed (or, for a pure permission
	/// check on an already-resident page, once the dirty bit is updated).
	pub fn handle_fault(&self, platform: &mut P, asp: &Arc<AddrSpace>, vaddr: VirtAddr, kind: FaultKind) -> EResult<()> {
		let page = vaddr.page_base();
		let mut state = asp.lock();

		if !state.validate(vaddr) {
			return Err(errno!(EFAULT));
		}
		// Heap and stack pages (no defined region) are always writable.
		let read_only = state.find_region(vaddr).map(|r| !r.write).unwrap_or(false);

		match state.page_table.lookup(page) {
			// Case A: no entry, or present but not valid.
			None => {
				self.fault_fill_fresh(platform, asp, &mut state, page, read_only)?;
			}
			Some(pte) if !pte.valid => {
				self.fault_fill_fresh(platform, asp, &mut state, page, read_only)?;
			}
			// Case B: valid, not resident.
			Some(pte) if !pte.resident => {
				let slot = pte.swap_slot.ok_or(errno!(EFAULT))?;
				let new_pfn = self.alloc_user_page(platform, asp)?;
				if let Err(e) = self.swap.lock().read_page(platform, slot, new_pfn) {
					self.coremap.lock().free_user_page(new_pfn);
					return Err(e);
				}
				self.swap.lock().free_slot(Some(slot));
				let pte = state.page_table.lookup_mut(page).expect("looked up above");
				pte.resident = true;
				pte.dirty = false;
				pte.pfn = new_pfn;
				pte.swap_slot = None;
				self.coremap.lock().promote_to_user(new_pfn, asp.clone(), page);
			}
			// Case C: valid and resident, nothing to page in.
			Some(_) => {}
		}

		// Step 8: permission enforcement.
		let pte = state.page_table.lookup_mut(page).expect("populated above");
		if kind == FaultKind::Readonly && pte.read_only {
			return Err(errno!(EFAULT));
		}
		if kind == FaultKind::Write {
			pte.dirty = true;
			self.coremap.lock().mark_dirty(pte.pfn);
		}
		let writable = !pte.read_only;
		let pfn = pte.pfn;

		// Steps 9-10: compose and install the TLB entry.
		self.tlb.lock().install(page, pfn, writable);

		Ok(())
	}

	/// Case A: allocate a user frame (may evict), zero-fill it, insert a
	/// fresh PTE, and promote the frame to user-owned.
	fn fault_fill_fresh(
		&self,
		platform: &mut P,
		asp: &Arc<AddrSpace>,
		state: &mut crate::addrspace::AddrSpaceState,
		page: VirtAddr,
		read_only: bool,
	) -> EResult<()> {
		let pfn = self.alloc_user_page(platform, asp)?;
		platform.frame_write(pfn, &[0u8; crate::limits::PAGE_SIZE]);
		state.page_table.insert(page, pfn, read_only)?;
		self.coremap.lock().promote_to_user(pfn, asp.clone(), page);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::memory::tlb::{DIRTY, VALID};
	use crate::platform::FakePlatform;

	fn system(ram_pages: usize) -> (VmSystem<FakePlatform>, FakePlatform) {
		let mut platform = FakePlatform::new(ram_pages * crate::limits::PAGE_SIZE, 4);
		let vm = VmSystem::bootstrap(&mut platform);
		(vm, platform)
	}

	#[test]
	fn cold_fault_zero_fills_and_installs_tlb() {
		let (vm, mut platform) = system(32);
		let asp = AddrSpace::create();
		asp.lock().define_region(VirtAddr(0x400000), 4 * 0x1000, true, true, false).unwrap();

		vm.handle_fault(&mut platform, &asp, VirtAddr(0x400ab0), FaultKind::Read).unwrap();

		let state = asp.lock();
		let pte = state.page_table.lookup(VirtAddr(0x400000)).unwrap();
		assert!(pte.valid && pte.resident && !pte.read_only && !pte.dirty);
		let mut buf = [0xffu8; crate::limits::PAGE_SIZE];
		platform.frame_read(pte.pfn, &mut buf);
		assert!(buf.iter().all(|&b| b == 0));

		let slot = vm.tlb.lock().probe(VirtAddr(0x400000)).unwrap();
		let (hi, lo) = vm.tlb.lock().entry(slot).unwrap();
		assert_eq!(hi, 0x400000);
		assert_eq!(lo & VALID, VALID);
		assert_eq!(lo & DIRTY, DIRTY);
	}

	#[test]
	fn write_then_promotes_dirty_without_new_frame() {
		let (vm, mut platform) = system(32);
		let asp = AddrSpace::create();
		asp.lock().define_region(VirtAddr(0x400000), 4 * 0x1000, true, true, false).unwrap();
		vm.handle_fault(&mut platform, &asp, VirtAddr(0x400ab0), FaultKind::Read).unwrap();
		let pfn_before = asp.lock().page_table.lookup(VirtAddr(0x400000)).unwrap().pfn;

		vm.handle_fault(&mut platform, &asp, VirtAddr(0x400020), FaultKind::Write).unwrap();

		let state = asp.lock();
		let pte = state.page_table.lookup(VirtAddr(0x400000)).unwrap();
		assert!(pte.dirty);
		assert_eq!(pte.pfn, pfn_before);
	}

	#[test]
	fn readonly_violation_is_efault_and_does_not_flip_dirty() {
		let (vm, mut platform) = system(32);
		let asp = AddrSpace::create();
		asp.lock().define_region(VirtAddr(0x10000), 0x1000, true, false, true).unwrap();
		vm.handle_fault(&mut platform, &asp, VirtAddr(0x10000), FaultKind::Read).unwrap();

		let err = vm
			.handle_fault(&mut platform, &asp, VirtAddr(0x10004), FaultKind::Readonly)
			.unwrap_err();
		assert_eq!(err, crate::error::Errno::EFAULT);

		let state = asp.lock();
		let pte = state.page_table.lookup(VirtAddr(0x10000)).unwrap();
		assert!(!pte.dirty);
		drop(state);
		let slot = vm.tlb.lock().probe(VirtAddr(0x10000)).unwrap();
		let (_, lo) = vm.tlb.lock().entry(slot).unwrap();
		assert_eq!(lo & DIRTY, 0);
	}

	#[test]
	fn eviction_then_refault_restores_bytes_and_ownership() {
		// `victim` holds every user frame the platform has; faulting in a
		// second address space forces `evict_one` down its real success path
		// (steps 1-8, including the swap write) rather than the `ENOMEM`
		// short-circuit the other eviction tests exercise.
		let (vm, mut platform) = system(4);
		let victim = AddrSpace::create();
		victim.lock().define_region(VirtAddr(0x400000), 3 * 0x1000, true, true, false).unwrap();

		let pages = [VirtAddr(0x400000), VirtAddr(0x401000), VirtAddr(0x402000)];
		for (i, &page) in pages.iter().enumerate() {
			vm.handle_fault(&mut platform, &victim, page, FaultKind::Write).unwrap();
			let pfn = victim.lock().page_table.lookup(page).unwrap().pfn;
			platform.frame_write(pfn, &[i as u8 + 1; crate::limits::PAGE_SIZE]);
		}

		let other = AddrSpace::create();
		other.lock().define_region(VirtAddr(0x500000), 0x1000, true, true, false).unwrap();
		vm.handle_fault(&mut platform, &other, VirtAddr(0x500000), FaultKind::Write).unwrap();

		let (evicted_index, evicted_page) = pages
			.iter()
			.enumerate()
			.find(|(_, &page)| !victim.lock().page_table.lookup(page).unwrap().resident)
			.map(|(i, &page)| (i, page))
			.expect("evict_one must have reclaimed one of victim's frames");

		vm.handle_fault(&mut platform, &victim, evicted_page, FaultKind::Read).unwrap();

		let pte = victim.lock().page_table.lookup(evicted_page).unwrap();
		assert!(pte.valid && pte.resident);
		let mut buf = [0u8; crate::limits::PAGE_SIZE];
		platform.frame_read(pte.pfn, &mut buf);
		assert!(buf.iter().all(|&b| b == evicted_index as u8 + 1));

		let (owner, vaddr) = vm.coremap.lock().owner_of(pte.pfn).unwrap();
		assert_eq!(owner.id(), victim.id());
		assert_eq!(vaddr, evicted_page);
	}

	#[test]
	fn fault_outside_any_region_is_efault() {
		let (vm, mut platform) = system(32);
		let asp = AddrSpace::create();
		let err = vm
			.handle_fault(&mut platform, &asp, VirtAddr(0x900000), FaultKind::Read)
			.unwrap_err();
		assert_eq!(err, crate::error::Errno::EFAULT);
	}
}
