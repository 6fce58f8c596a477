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

//! The VM subsystem as a single value.
//!
//! The source keeps the coremap, the swap state and the TLB as global mutable
//! singletons reachable from anywhere. Here they are fields of one
//! [`VmSystem`], constructed once at boot via [`VmSystem::bootstrap`] and
//! threaded through every call instead of reached for globally; the `Platform`
//! it runs on is a type parameter rather than another singleton, so the same
//! code runs against real hardware or [`crate::platform::FakePlatform`].
//!
//! This is also where the multi-lock eviction protocol and address-space
//! copy/destroy/activate live — they are component D/B/A operations, but all
//! three only make sense with the others in scope, so they're methods here
//! rather than scattered across the leaf modules. See `fault.rs` and
//! `heap.rs` for the fault handler and `sbrk`, added as further impl blocks
//! on this type.

use crate::addrspace::AddrSpace;
use crate::error::{errno, EResult};
use crate::memory::coremap::Coremap;
use crate::memory::swap::SwapState;
use crate::memory::tlb::Tlb;
use crate::memory::{Pfn, VirtAddr};
use crate::platform::Platform;
use crate::sync::{IntSpin, Lock};
use alloc::sync::Arc;
use core::marker::PhantomData;

/// Owns the coremap, swap state and TLB, generic over the hardware/firmware
/// services in [`Platform`].
///
/// Lock order, outside-in: `as_lock` (per [`AddrSpace`]) -> `swap` -> `coremap`
/// -> `tlb`. `tlb` additionally masks interrupts for its lifetime. Callers
/// that need both `swap` and `coremap` must take `swap` first.
pub struct VmSystem<P: Platform> {
	pub(crate) coremap: IntSpin<Coremap>,
	pub(crate) swap: Lock<SwapState>,
	pub(crate) tlb: IntSpin<Tlb>,
	_platform: PhantomData<P>,
}

impl<P: Platform> VmSystem<P> {
	/// Builds the VM system against `platform`. Mirrors the source's boot
	/// order: steal memory for the coremap, then size the swap bitmap from
	/// the platform's swap device, then start with an empty TLB.
	pub fn bootstrap(platform: &mut P) -> Self {
		let coremap = Coremap::bootstrap(platform);
		let swap = SwapState::bootstrap(platform);
		Self {
			coremap: IntSpin::new(coremap),
			swap: Lock::new(swap),
			tlb: IntSpin::new(Tlb::new()),
			_platform: PhantomData,
		}
	}

	/// Allocates one user frame, evicting if necessary, on behalf of
	/// `current`. Bounded because each successful eviction strictly reduces
	/// the number of resident user frames by one, so the loop cannot spin
	/// forever if frames genuinely exist to reclaim.
	///
	/// `current` is the address space the allocation is for — the caller
	/// already holds its `as_lock` (fault handling, which is the only caller,
	/// locks it for the whole fault). Eviction must never try to reacquire
	/// that same lock, so it is passed down to [`Self::evict_one`], which
	/// skips candidate frames owned by `current` instead of attempting to.
	pub fn alloc_user_page(&self, platform: &mut P, current: &Arc<AddrSpace>) -> EResult<Pfn> {
		loop {
			// Bind and drop the guard before matching: the match scrutinee's
			// temporary would otherwise live across the whole match, holding
			// `cm_spinlock` (and, via `IntSpin`, the interrupt mask) into the
			// `Err` arm, where `evict_one` tries to reacquire it and spins
			// forever.
			let res = self.coremap.lock().alloc_kpages(1);
			match res {
				Ok(pfn) => return Ok(pfn),
				Err(_) => self.evict_one(platform, current)?,
			}
		}
	}

	/// Clock-replacement eviction on behalf of `current`. Follows the exact
	/// step ordering from the component design: the coremap lock is released
	/// before taking the victim's `as_lock`, and `busy` pins the frame across
	/// that gap so step 1 and the final free don't need to hold `cm_spinlock`
	/// across swap I/O.
	///
	/// `current` already holds its own `as_lock` (the caller is mid-fault),
	/// so a candidate frame owned by `current` is skipped rather than handed
	/// to step 2: `owner.lock()` there is not reentrant, and the clock hand
	/// can legitimately land on one of `current`'s own frames when it owns
	/// every evictable frame in the system. Skips are bounded by the frame
	/// count: once every evictable frame has been seen and rejected for this
	/// reason, there is nothing left this call can do, so it fails `ENOMEM`
	/// rather than cycling forever.
	pub fn evict_one(&self, platform: &mut P, current: &Arc<AddrSpace>) -> EResult<()> {
		let frame_count = self.coremap.lock().frame_count();
		let mut self_owned_skips = 0usize;
		loop {
			// Step 1.
			let Some(pfn) = self.coremap.lock().begin_evict() else {
				crate::println!("vm: no evictable frame, coremap exhausted");
				return Err(errno!(ENOMEM));
			};
			let Some((owner, vaddr)) = self.coremap.lock().owner_of(pfn) else {
				self.coremap.lock().clear_busy(pfn);
				continue;
			};

			if owner.id() == current.id() {
				self.coremap.lock().clear_busy(pfn);
				self_owned_skips += 1;
				if self_owned_skips > frame_count {
					crate::println!("vm: every evictable frame is owned by the faulting address space");
					return Err(errno!(ENOMEM));
				}
				continue;
			}

			// Step 2.
			let mut as_state = owner.lock();

			// Step 3: re-validate.
			let stale = match as_state.page_table.lookup(vaddr) {
				Some(pte) if pte.valid && pte.resident && pte.pfn == pfn => false,
				_ => true,
			};
			if stale {
				drop(as_state);
				self.coremap.lock().clear_busy(pfn);
				continue;
			}

			// Step 4. Bind before matching: the scrutinee's `swap.lock()`
			// guard would otherwise live until the end of the match (and the
			// `if let` below), holding `swap_lock` into an arm that then
			// tries to acquire `cm_spinlock` — forbidden nesting — or, in
			// step 5, tries to reacquire `swap_lock` itself and deadlocks.
			let alloc_res = self.swap.lock().alloc_slot();
			let slot = match alloc_res {
				Ok(slot) => slot,
				Err(e) => {
					drop(as_state);
					self.coremap.lock().clear_busy(pfn);
					return Err(e);
				}
			};

			// Step 5.
			let write_res = self.swap.lock().write_page(platform, pfn, slot);
			if let Err(e) = write_res {
				self.swap.lock().free_slot(Some(slot));
				drop(as_state);
				self.coremap.lock().clear_busy(pfn);
				return Err(e);
			}

			// Step 6.
			{
				let pte = as_state.page_table.lookup_mut(vaddr).expect("re-validated above");
				pte.resident = false;
				pte.dirty = false;
				pte.pfn = Pfn(0);
				pte.swap_slot = Some(slot);
			}

			// Step 7.
			self.shootdown(vaddr);

			// Step 8.
			drop(as_state);
			self.coremap.lock().free_user_page(pfn);
			crate::println!("vm: evicted frame {} to swap slot {}", pfn.0, slot.0);
			return Ok(());
		}
	}

	/// Deep-copies `src`: a fresh page table with independent frames and swap
	/// slots for every mapped page, plus a copy of the region list, heap
	/// range and stack base. The source shares a non-resident PTE's swap
	/// slot between parent and child, which aliases writes through the
	/// "independent" copy; here every entry gets its own backing storage.
	pub fn copy_addrspace(&self, platform: &mut P, src: &Arc<AddrSpace>) -> EResult<Arc<AddrSpace>> {
		let child = AddrSpace::create();
		let src_state = src.lock();
		let mut child_state = child.lock();

		let new_pt = src_state.page_table.copy(
			|src_pfn| {
				let new_pfn = self.coremap.lock().alloc_kpages(1)?;
				let mut buf = [0u8; crate::limits::PAGE_SIZE];
				platform.frame_read(src_pfn, &mut buf);
				platform.frame_write(new_pfn, &buf);
				Ok(new_pfn)
			},
			|src_slot| {
				let new_slot = self.swap.lock().alloc_slot()?;
				let mut buf = [0u8; crate::limits::PAGE_SIZE];
				platform.swap_read(src_slot.0, &mut buf)?;
				platform.swap_write(new_slot.0, &buf)?;
				Ok(new_slot)
			},
		)?;
		// Promote every freshly allocated frame in the child to user-owned,
		// same as the fault handler would for a newly faulted-in page.
		for (vaddr, pte) in new_pt.iter_valid() {
			if pte.resident {
				self.coremap.lock().promote_to_user(pte.pfn, child.clone(), vaddr);
			}
		}
		child_state.page_table = new_pt;
		child_state.regions = src_state.regions.clone();
		child_state.heap_start = src_state.heap_start;
		child_state.heap_end = src_state.heap_end;
		child_state.stack_base = src_state.stack_base;
		drop(child_state);
		drop(src_state);
		Ok(child)
	}

	/// Frees every resident frame and every swap slot held by `asp`. Frames
	/// are freed by walking the page table directly (the source walks
	/// regions instead; both visit exactly the set of mapped pages, since
	/// every resident page belongs to some defined region, the heap, or the
	/// stack).
	pub fn destroy_addrspace(&self, asp: &Arc<AddrSpace>) {
		let mut state = asp.lock();
		let resident: alloc::vec::Vec<Pfn> = state
			.page_table
			.iter_valid()
			.filter(|(_, pte)| pte.resident)
			.map(|(_, pte)| pte.pfn)
			.collect();
		for pfn in resident {
			self.coremap.lock().free_user_page(pfn);
		}
		let swap = &self.swap;
		state.page_table.destroy(|slot| swap.lock().free_slot(Some(slot)));
	}

	/// Invalidates every TLB entry. The source's `as_activate` is an empty
	/// stub; on a single CPU, switching the installed address space must
	/// flush the whole TLB or the new address space would observe stale
	/// translations belonging to the old one.
	pub fn activate(&self) {
		self.tlb.lock().flush_all();
	}

	/// No hardware state to tear down on this platform; kept as a named hook
	/// so callers don't need to special-case "no-op" versus "not yet wired up".
	pub fn deactivate(&self) {}

	/// Targeted TLB shootdown for one virtual address (§4.E).
	pub(crate) fn shootdown(&self, vaddr: VirtAddr) -> bool {
		self.tlb.lock().shootdown(vaddr)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::platform::FakePlatform;

	fn system(ram_pages: usize, swap_slots: usize) -> (VmSystem<FakePlatform>, FakePlatform) {
		let mut platform = FakePlatform::new(ram_pages * crate::limits::PAGE_SIZE, swap_slots);
		let vm = VmSystem::bootstrap(&mut platform);
		(vm, platform)
	}

	#[test]
	fn alloc_user_page_succeeds_with_free_frames() {
		let (vm, mut platform) = system(16, 4);
		let asp = AddrSpace::create();
		assert!(vm.alloc_user_page(&mut platform, &asp).is_ok());
	}

	#[test]
	fn eviction_with_no_evictable_frames_is_enomem() {
		let (vm, mut platform) = system(4, 4);
		let asp = AddrSpace::create();
		// Exhaust every free frame as kernel pages: nothing is evictable.
		loop {
			if vm.coremap.lock().alloc_kpages(1).is_err() {
				break;
			}
		}
		assert!(vm.evict_one(&mut platform, &asp).is_err());
	}

	#[test]
	fn eviction_skips_frames_owned_by_the_faulting_address_space() {
		// Every evictable frame belongs to `asp` itself; `asp` is the very
		// space calling `evict_one`, so it already holds its own `as_lock`
		// and the clock scan must never try to lock it again (it would
		// deadlock). It should instead fail `ENOMEM` in bounded time.
		let (vm, mut platform) = system(4, 4);
		let asp = AddrSpace::create();
		loop {
			let Ok(pfn) = vm.coremap.lock().alloc_kpages(1) else {
				break;
			};
			let vaddr = VirtAddr(0x400000 + pfn.0 * crate::limits::PAGE_SIZE);
			asp.lock().page_table.insert(vaddr, pfn, false).unwrap();
			vm.coremap.lock().promote_to_user(pfn, asp.clone(), vaddr);
		}
		assert!(vm.evict_one(&mut platform, &asp).is_err());
	}

	#[test]
	fn copy_then_destroy_both_leaks_nothing() {
		let (vm, mut platform) = system(16, 4);
		let parent = AddrSpace::create();
		let pfn = vm.alloc_user_page(&mut platform, &parent).unwrap();
		{
			let mut st = parent.lock();
			st.page_table.insert(VirtAddr(0x400000), pfn, false).unwrap();
		}
		vm.coremap.lock().promote_to_user(pfn, parent.clone(), VirtAddr(0x400000));

		let before = vm.coremap.lock().used_count();
		let child = vm.copy_addrspace(&mut platform, &parent).unwrap();
		let child_pfn = child.lock().page_table.lookup(VirtAddr(0x400000)).unwrap().pfn;
		assert_ne!(child_pfn, pfn);

		vm.destroy_addrspace(&parent);
		vm.destroy_addrspace(&child);
		assert_eq!(vm.coremap.lock().used_count(), before - 1);
	}

	#[test]
	fn activate_flushes_tlb() {
		let (vm, _platform) = system(16, 4);
		vm.tlb.lock().install(VirtAddr(0x400000), Pfn(1), true);
		vm.activate();
		assert!(vm.tlb.lock().probe(VirtAddr(0x400000)).is_none());
	}
}
