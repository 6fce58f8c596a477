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

//! Hardware abstraction boundary.
//!
//! The coremap needs to know how much RAM exists and how to claim a chunk of
//! it before the allocator is up (`ram_getsize`/`ram_stealmem`); the swap
//! device needs a raw block device to read and write whole pages to. Real
//! boot-time RAM probing and a real disk driver are both out of scope, but
//! every VM type in this crate is generic over a [`Platform`] so the core
//! logic (coremap accounting, eviction, fault handling) is exercised against
//! [`FakePlatform`] in tests exactly as it would run against real hardware.

use crate::error::{EResult, Errno};
use crate::limits::PAGE_SIZE;
use crate::memory::Pfn;

/// Hardware and firmware services the VM core needs but does not own.
pub trait Platform {
	/// Returns the total amount of installed RAM, in bytes.
	fn ram_getsize(&self) -> usize;

	/// Claims `size` bytes of physical memory from the boot-time allocator
	/// and returns the physical address of the first byte. Used exactly
	/// once, at bootstrap, to carve out the coremap's own backing storage.
	///
	/// Returns `0` once boot-time stealing has ended (mirrors `ram_stealmem`
	/// returning the current top when called with size `0`).
	fn ram_stealmem(&mut self, size: usize) -> usize;

	/// Reads one page from swap slot `slot` into `buf`.
	fn swap_read(&mut self, slot: u32, buf: &mut [u8; PAGE_SIZE]) -> EResult<()>;

	/// Writes one page to swap slot `slot` from `buf`.
	fn swap_write(&mut self, slot: u32, buf: &[u8; PAGE_SIZE]) -> EResult<()>;

	/// Number of page-sized slots the swap device exposes.
	fn swap_slot_count(&self) -> usize;

	/// Reads the live contents of frame `pfn` into `buf`. Used when writing a
	/// resident page out to swap.
	fn frame_read(&self, pfn: Pfn, buf: &mut [u8; PAGE_SIZE]);

	/// Overwrites the contents of frame `pfn` with `buf`. Used when a page is
	/// faulted back in from swap, and to zero-fill a fresh anonymous page.
	fn frame_write(&mut self, pfn: Pfn, buf: &[u8; PAGE_SIZE]);
}

/// An in-memory stand-in for real RAM probing and a real disk, used by tests
/// and by the doctests in this crate. Not compiled into a kernel build.
#[cfg(any(test, feature = "test-platform"))]
pub struct FakePlatform {
	ram_size: usize,
	stolen: usize,
	frames: alloc::vec::Vec<[u8; PAGE_SIZE]>,
	swap: alloc::vec::Vec<[u8; PAGE_SIZE]>,
}

#[cfg(any(test, feature = "test-platform"))]
impl FakePlatform {
	/// Creates a platform with `ram_bytes` of RAM and `swap_slots` page slots
	/// of swap.
	pub fn new(ram_bytes: usize, swap_slots: usize) -> Self {
		let num_frames = ram_bytes / PAGE_SIZE;
		Self {
			ram_size: ram_bytes,
			stolen: 0,
			frames: alloc::vec![[0u8; PAGE_SIZE]; num_frames],
			swap: alloc::vec![[0u8; PAGE_SIZE]; swap_slots],
		}
	}
}

#[cfg(any(test, feature = "test-platform"))]
impl Platform for FakePlatform {
	fn ram_getsize(&self) -> usize {
		self.ram_size
	}

	fn ram_stealmem(&mut self, size: usize) -> usize {
		let addr = self.stolen;
		self.stolen += size;
		addr
	}

	fn swap_read(&mut self, slot: u32, buf: &mut [u8; PAGE_SIZE]) -> EResult<()> {
		let slot = self.swap.get(slot as usize).ok_or(Errno::EIO)?;
		buf.copy_from_slice(slot);
		Ok(())
	}

	fn swap_write(&mut self, slot: u32, buf: &[u8; PAGE_SIZE]) -> EResult<()> {
		let dst = self.swap.get_mut(slot as usize).ok_or(Errno::EIO)?;
		dst.copy_from_slice(buf);
		Ok(())
	}

	fn swap_slot_count(&self) -> usize {
		self.swap.len()
	}

	fn frame_read(&self, pfn: Pfn, buf: &mut [u8; PAGE_SIZE]) {
		buf.copy_from_slice(&self.frames[pfn.0]);
	}

	fn frame_write(&mut self, pfn: Pfn, buf: &[u8; PAGE_SIZE]) {
		self.frames[pfn.0].copy_from_slice(buf);
	}
}
