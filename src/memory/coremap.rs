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

//! Coremap: component B.
//!
//! An array indexed by physical frame number, tracking ownership and
//! allocation state. Mutation only happens under `cm_spinlock` (modeled as
//! an [`crate::sync::IntSpin`] at the [`crate::vm::VmSystem`] level); this
//! type itself has no lock, it's the payload the spinlock protects.
//!
//! Eviction's multi-lock dance lives in [`crate::vm`], not here: this module
//! only owns step 1 of `evict_one` (the part that runs under `cm_spinlock`
//! alone, via [`Coremap::begin_evict`]) plus the plain allocation and free
//! paths. See the coremap entry invariants in the crate-level documentation.

use crate::addrspace::AddrSpace;
use crate::error::{errno, EResult};
use crate::memory::{Pfn, VirtAddr};
use crate::platform::Platform;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Per-frame bookkeeping. See the invariants documented alongside
/// [`Coremap`]: `busy => used`; `owner.is_some() => used && !kernel_page`;
/// `kernel_page => owner.is_none()`; a kernel allocation run has exactly one
/// `run_end` frame, its last.
#[derive(Default, Clone)]
pub struct CoremapEntry {
	pub used: bool,
	pub kernel_page: bool,
	pub busy: bool,
	pub run_end: bool,
	pub owner: Option<Arc<AddrSpace>>,
	pub vaddr: Option<VirtAddr>,
	pub dirty: bool,
}

impl CoremapEntry {
	/// A frame is a candidate for eviction iff it is in use, user-owned, not
	/// already being evicted, and actually mapped somewhere.
	fn evictable(&self) -> bool {
		self.used && !self.kernel_page && !self.busy && self.owner.is_some()
	}
}

/// Physical-frame allocator and ownership tracker.
pub struct Coremap {
	entries: Vec<CoremapEntry>,
	/// First frame not permanently reserved for the kernel image and the
	/// coremap's own storage; see [`Coremap::bootstrap`].
	first_user_frame: usize,
	/// The clock hand used by [`Coremap::begin_evict`].
	evict_hand: usize,
}

impl Coremap {
	/// Builds the coremap at boot. Mirrors `vm_bootstrap`: steal enough
	/// physical memory for the coremap's own storage first, then query the
	/// new top of stolen memory as `first_user_frame`, and mark every frame
	/// below it permanently kernel-owned.
	pub fn bootstrap<P: Platform>(platform: &mut P) -> Self {
		let total_frames = platform.ram_getsize() / crate::limits::PAGE_SIZE;
		let entry_bytes = total_frames * core::mem::size_of::<CoremapEntry>();
		let coremap_pages = entry_bytes.div_ceil(crate::limits::PAGE_SIZE);
		platform.ram_stealmem(coremap_pages * crate::limits::PAGE_SIZE);
		let first_user_frame = platform.ram_stealmem(0) / crate::limits::PAGE_SIZE;

		let mut entries = Vec::with_capacity(total_frames);
		entries.resize_with(total_frames, CoremapEntry::default);
		for e in &mut entries[..first_user_frame] {
			e.used = true;
			e.kernel_page = true;
		}
		Self {
			entries,
			first_user_frame,
			evict_hand: first_user_frame,
		}
	}

	/// Total number of frames tracked (`total_frames` in the invariants).
	pub fn frame_count(&self) -> usize {
		self.entries.len()
	}

	/// Number of frames currently marked `used` (invariant P1).
	pub fn used_count(&self) -> usize {
		self.entries.iter().filter(|e| e.used).count()
	}

	fn find_free_run(&self, npages: usize) -> Option<usize> {
		let n = self.entries.len();
		if npages == 0 || self.first_user_frame + npages > n {
			return None;
		}
		let mut start = self.first_user_frame;
		'search: while start + npages <= n {
			for i in 0..npages {
				if self.entries[start + i].used {
					// Hop past the first used frame found in this window.
					start += i + 1;
					continue 'search;
				}
			}
			return Some(start);
		}
		None
	}

	/// Finds the lowest-indexed run of `npages` contiguous free frames,
	/// marks them `used && kernel_page`, and tags the last one `run_end`.
	pub fn alloc_kpages(&mut self, npages: usize) -> EResult<Pfn> {
		let Some(start) = self.find_free_run(npages) else {
			crate::println!("coremap: no free run of {npages} page(s)");
			return Err(errno!(ENOMEM));
		};
		for i in 0..npages {
			self.entries[start + i] = CoremapEntry {
				used: true,
				kernel_page: true,
				..Default::default()
			};
		}
		self.entries[start + npages - 1].run_end = true;
		Ok(Pfn(start))
	}

	/// Frees a kernel allocation run starting at `pfn`, walking forward until
	/// and including the first `run_end` frame.
	///
	/// `pfn` must be the first frame of a kernel run; freeing a user frame
	/// this way would march past the valid range looking for a `run_end`
	/// that was never set, so this is a programmer error, not a runtime one.
	pub fn free_kpages(&mut self, pfn: Pfn) {
		assert!(
			self.entries[pfn.0].kernel_page,
			"free_kpages called on a non-kernel frame; use free_user_page"
		);
		let mut idx = pfn.0;
		loop {
			let run_end = self.entries[idx].run_end;
			self.entries[idx] = CoremapEntry::default();
			if run_end {
				break;
			}
			idx += 1;
		}
	}

	/// Frees a single user-owned frame. Does not consult `run_end`: user
	/// frames are always freed one at a time.
	pub fn free_user_page(&mut self, pfn: Pfn) {
		assert!(
			!self.entries[pfn.0].kernel_page,
			"free_user_page called on a kernel frame; use free_kpages"
		);
		self.entries[pfn.0] = CoremapEntry::default();
	}

	/// Flips a freshly allocated kernel frame to user-owned once the fault
	/// handler has installed its PTE. A frame never exists "user-owned but
	/// unmapped"; on failure after this call the caller must still free via
	/// [`Self::free_user_page`].
	pub fn promote_to_user(&mut self, pfn: Pfn, owner: Arc<AddrSpace>, vaddr: VirtAddr) {
		let e = &mut self.entries[pfn.0];
		debug_assert!(e.used && e.kernel_page);
		e.kernel_page = false;
		e.run_end = false;
		e.owner = Some(owner);
		e.vaddr = Some(vaddr);
	}

	/// Step 1 of `evict_one`: scans from the clock hand for the first
	/// evictable frame, marks it `busy`, and advances the hand past it. The
	/// remaining steps run outside `cm_spinlock` — see [`crate::vm::VmSystem::evict_one`].
	pub fn begin_evict(&mut self) -> Option<Pfn> {
		let n = self.entries.len();
		for step in 0..n {
			let idx = (self.evict_hand + step) % n;
			if self.entries[idx].evictable() {
				self.entries[idx].busy = true;
				self.evict_hand = (idx + 1) % n;
				return Some(Pfn(idx));
			}
		}
		None
	}

	/// Clears `busy` on a frame whose eviction attempt was abandoned
	/// (stale PTE found on re-validation, or a later step failed).
	pub fn clear_busy(&mut self, pfn: Pfn) {
		self.entries[pfn.0].busy = false;
	}

	/// Returns the owner and page-aligned vaddr of a resident user frame, if any.
	pub fn owner_of(&self, pfn: Pfn) -> Option<(Arc<AddrSpace>, VirtAddr)> {
		let e = &self.entries[pfn.0];
		Some((e.owner.clone()?, e.vaddr?))
	}

	/// Marks a frame dirty. Used by the fault handler on a write fault.
	pub fn mark_dirty(&mut self, pfn: Pfn) {
		self.entries[pfn.0].dirty = true;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::platform::FakePlatform;

	fn boot(ram_pages: usize) -> Coremap {
		let mut platform = FakePlatform::new(ram_pages * crate::limits::PAGE_SIZE, 4);
		Coremap::bootstrap(&mut platform)
	}

	#[test]
	fn alloc_marks_run_and_run_end() {
		let mut cm = boot(16);
		let pfn = cm.alloc_kpages(3).unwrap();
		for i in 0..2 {
			let e = &cm.entries[pfn.0 + i];
			assert!(e.used && e.kernel_page);
			assert!(!e.run_end);
		}
		assert!(cm.entries[pfn.0 + 2].run_end);
	}

	#[test]
	fn free_kpages_walks_to_run_end() {
		let mut cm = boot(16);
		let pfn = cm.alloc_kpages(3).unwrap();
		cm.free_kpages(pfn);
		for i in 0..3 {
			assert!(!cm.entries[pfn.0 + i].used);
		}
	}

	#[test]
	fn alloc_exhausts_then_enomem() {
		let mut cm = boot(4);
		let free = cm.frame_count() - cm.used_count();
		cm.alloc_kpages(free).unwrap();
		assert!(cm.alloc_kpages(1).is_err());
	}

	#[test]
	#[should_panic]
	fn free_kpages_on_user_frame_panics() {
		let mut cm = boot(8);
		let pfn = cm.alloc_kpages(1).unwrap();
		cm.entries[pfn.0].kernel_page = false;
		cm.free_kpages(pfn);
	}

	#[test]
	fn begin_evict_skips_kernel_and_busy_frames() {
		let mut cm = boot(8);
		let kern = cm.alloc_kpages(1).unwrap();
		assert!(cm.begin_evict().is_none());
		let _ = kern;
	}
}
