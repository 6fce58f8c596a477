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

//! Sleeping mutual exclusion primitive.
//!
//! `as_lock` and `swap_lock` are modeled as sleeping locks: a task blocked on
//! one should give up the CPU rather than spin, since the holder may itself
//! be waiting on swap I/O. The process scheduler that would actually park
//! and wake a task is out of scope for this crate, so [`Lock`] degrades to
//! busy-waiting on an acquire counter — callers outside of this crate are
//! expected to plug a real wait queue in at the scheduler boundary. The
//! acquire/release protocol and guard shape match what a real sleeping lock
//! presents, so that boundary is a drop-in.

use crate::sync::spin::IntSpin;
use core::{
	cell::UnsafeCell,
	fmt,
	fmt::Formatter,
	hint,
	ops::{Deref, DerefMut},
};

struct Queue {
	acquired: usize,
}

/// Sleeping lock used for `as_lock` and `swap_lock`.
pub struct Lock<T: ?Sized> {
	queue: IntSpin<Queue>,
	data: UnsafeCell<T>,
}

impl<T: Default> Default for Lock<T> {
	fn default() -> Self {
		Self::new(Default::default())
	}
}

impl<T> Lock<T> {
	/// Creates a new instance wrapping the given `data`.
	pub const fn new(data: T) -> Self {
		Self {
			queue: IntSpin::new(Queue { acquired: 0 }),
			data: UnsafeCell::new(data),
		}
	}

	/// Acquires the lock, consumes it and returns the inner value.
	pub fn into_inner(self) -> T {
		self.data.into_inner()
	}
}

impl<T: ?Sized> Lock<T> {
	/// Acquires the lock, blocking until it becomes available.
	pub fn lock(&self) -> LockGuard<T> {
		loop {
			let mut q = self.queue.lock();
			if q.acquired == 0 {
				q.acquired = 1;
				break;
			}
			drop(q);
			hint::spin_loop();
		}
		LockGuard { lock: self }
	}

	/// Releases the lock.
	///
	/// # Safety
	///
	/// Undefined behaviour if the lock is not held, or called other than from
	/// the guard's `Drop`.
	unsafe fn unlock(&self) {
		self.queue.lock().acquired = 0;
	}
}

unsafe impl<T> Sync for Lock<T> {}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Lock<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		let guard = self.lock();
		fmt::Debug::fmt(&*guard, f)
	}
}

/// Releases the associated [`Lock`] when dropped.
pub struct LockGuard<'m, T: ?Sized> {
	lock: &'m Lock<T>,
}

impl<T: ?Sized> Deref for LockGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		unsafe { &*self.lock.data.get() }
	}
}

impl<T: ?Sized> DerefMut for LockGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		unsafe { &mut *self.lock.data.get() }
	}
}

impl<T: ?Sized> Drop for LockGuard<'_, T> {
	fn drop(&mut self) {
		unsafe {
			self.lock.unlock();
		}
	}
}

impl<T: ?Sized> !Send for LockGuard<'_, T> {}

unsafe impl<T: ?Sized + Sync> Sync for LockGuard<'_, T> {}
