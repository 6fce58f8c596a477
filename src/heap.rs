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

//! `sbrk`: component F.

use crate::addrspace::AddrSpace;
use crate::error::{errno, EResult};
use crate::limits::page_ceil;
use crate::memory::VirtAddr;
use crate::platform::Platform;
use crate::vm::VmSystem;
use alloc::sync::Arc;

impl<P: Platform> VmSystem<P> {
	/// Grows or shrinks `asp`'s heap by `delta` bytes and returns the
	/// previous `heap_end`. `delta == 0` is a pure query.
	///
	/// Shrinking releases every page whose base lies in
	/// `[page_ceil(new_end), page_ceil(old_end))`: resident pages give their
	/// frame back via [`crate::memory::coremap::Coremap::free_user_page`]
	/// (never `free_kpages`, which would misinterpret a lone user frame as a
	/// kernel run — see the design note on that ambiguity), non-resident
	/// pages give their swap slot back, and either way the PTE is
	/// invalidated and its TLB entry shot down.
	pub fn sbrk(&self, platform: &mut P, asp: &Arc<AddrSpace>, delta: isize) -> EResult<VirtAddr> {
		let mut state = asp.lock();
		let old_end = state.heap_end;
		if delta == 0 {
			return Ok(old_end);
		}
		let new_end = old_end.0.checked_add_signed(delta).ok_or(errno!(EINVAL))?;

		if delta < 0 {
			if new_end < state.heap_start.0 {
				crate::println!("sbrk: shrink below heap_start rejected");
				return Err(errno!(EINVAL));
			}
			let mut vaddr = page_ceil(new_end);
			let limit = page_ceil(old_end.0);
			while vaddr < limit {
				let page = VirtAddr(vaddr);
				self.release_heap_page(&mut state, page);
				vaddr += crate::limits::PAGE_SIZE;
			}
			state.heap_end = VirtAddr(new_end);
			let _ = platform; // platform unused on the shrink path: no I/O, only bookkeeping.
			Ok(old_end)
		} else {
			if page_ceil(new_end) >= state.stack_base.0 {
				crate::println!("sbrk: grow would collide with the stack");
				return Err(errno!(ENOMEM));
			}
			state.heap_end = VirtAddr(new_end);
			Ok(old_end)
		}
	}

	fn release_heap_page(&self, state: &mut crate::addrspace::AddrSpaceState, page: VirtAddr) {
		let Some(pte) = state.page_table.lookup(page) else {
			return;
		};
		if !pte.valid {
			return;
		}
		if pte.resident {
			self.coremap.lock().free_user_page(pte.pfn);
		} else if let Some(slot) = pte.swap_slot {
			self.swap.lock().free_slot(Some(slot));
		}
		*state.page_table.lookup_mut(page).expect("looked up above") = Default::default();
		self.shootdown(page);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fault::FaultKind;
	use crate::platform::FakePlatform;

	fn system(ram_pages: usize) -> (VmSystem<FakePlatform>, FakePlatform) {
		let mut platform = FakePlatform::new(ram_pages * crate::limits::PAGE_SIZE, 4);
		let vm = VmSystem::bootstrap(&mut platform);
		(vm, platform)
	}

	#[test]
	fn grow_then_shrink_round_trips() {
		let (vm, mut platform) = system(32);
		let asp = AddrSpace::create();
		{
			let mut st = asp.lock();
			st.set_brk_init(VirtAddr(0x600000));
			st.stack_base = VirtAddr(0x7fff0000);
		}

		let prev = vm.sbrk(&mut platform, &asp, 0x3000).unwrap();
		assert_eq!(prev.0, 0x600000);
		assert_eq!(asp.lock().heap_end.0, 0x603000);

		for page in [0x600000usize, 0x601000, 0x602000] {
			vm.handle_fault(&mut platform, &asp, VirtAddr(page), FaultKind::Write).unwrap();
		}
		let used_before_shrink = vm.coremap.lock().used_count();

		let prev = vm.sbrk(&mut platform, &asp, -0x1000).unwrap();
		assert_eq!(prev.0, 0x603000);
		assert_eq!(asp.lock().heap_end.0, 0x602000);
		assert_eq!(vm.coremap.lock().used_count(), used_before_shrink - 1);

		let err = vm.sbrk(&mut platform, &asp, -0x4000).unwrap_err();
		assert_eq!(err, crate::error::Errno::EINVAL);
		assert_eq!(asp.lock().heap_end.0, 0x602000);
	}

	#[test]
	fn grow_that_would_reach_stack_is_enomem() {
		let (vm, mut platform) = system(32);
		let asp = AddrSpace::create();
		{
			let mut st = asp.lock();
			st.set_brk_init(VirtAddr(0x600000));
			st.stack_base = VirtAddr(0x601000);
		}
		let err = vm.sbrk(&mut platform, &asp, 0x2000).unwrap_err();
		assert_eq!(err, crate::error::Errno::ENOMEM);
	}

	#[test]
	fn large_negative_delta_is_einval_and_leaves_heap_end() {
		let (vm, mut platform) = system(32);
		let asp = AddrSpace::create();
		asp.lock().set_brk_init(VirtAddr(0x600000));
		let err = vm.sbrk(&mut platform, &asp, isize::MIN).unwrap_err();
		assert_eq!(err, crate::error::Errno::EINVAL);
		assert_eq!(asp.lock().heap_end.0, 0x600000);
	}
}
