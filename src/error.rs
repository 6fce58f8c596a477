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

//! Error kinds surfaced by the VM core.
//!
//! [`EResult`] is the one result alias used throughout: fault handling,
//! `sbrk`, swap I/O, and frame/page-table-node allocation all fail with the
//! same [`Errno`] set.

use core::fmt;

/// An error kind the core can return to its caller.
///
/// The trap layer (out of scope) turns this into process termination with
/// the appropriate signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
	/// No free frame and nothing evictable, no swap slots, or a page-table
	/// node allocation failed.
	ENOMEM,
	/// Address outside any defined region/heap/stack, a write to a
	/// read-only PTE, or an internally inconsistent PTE.
	EFAULT,
	/// `sbrk` would shrink the heap below `heap_start`.
	EINVAL,
	/// The swap device has no free slot.
	ENOSPC,
	/// Short read or write on the swap device.
	EIO,
}

impl fmt::Display for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::ENOMEM => "ENOMEM",
			Self::EFAULT => "EFAULT",
			Self::EINVAL => "EINVAL",
			Self::ENOSPC => "ENOSPC",
			Self::EIO => "EIO",
		};
		f.write_str(s)
	}
}

/// Result of an operation that can fail with an [`Errno`].
pub type EResult<T> = Result<T, Errno>;

/// Builds an [`Errno`] value by variant name, e.g. `errno!(EFAULT)`.
macro_rules! errno {
	($variant:ident) => {
		$crate::error::Errno::$variant
	};
}

pub(crate) use errno;
