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

//! Synchronization primitives used by the VM core.
//!
//! See the crate-level lock ordering note: `as_lock` -> `swap_lock` ->
//! `cm_spinlock` -> `tlb_spinlock`, never the reverse.

pub mod irq;
pub mod lock;
pub mod spin;

pub use lock::Lock;
pub use spin::{IntSpin, Spin};
