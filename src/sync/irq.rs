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

//! Interrupt mask state.
//!
//! This crate does not own interrupt hardware (that belongs to the trap
//! layer, out of scope); [`IntSpin`](super::spin::IntSpin) still needs
//! something to mask so that a caller holding `tlb_spinlock` cannot be
//! re-entered by a handler running on the same core. We model a single
//! process-wide enabled/disabled flag and flip it on `cli`/`sti`, same as
//! hardware would expose through `EFLAGS.IF`.

use core::sync::atomic::{AtomicBool, Ordering};

static IRQ_ENABLED: AtomicBool = AtomicBool::new(true);

/// Returns whether interrupts are currently enabled.
pub fn enabled() -> bool {
	IRQ_ENABLED.load(Ordering::Acquire)
}

/// Disables interrupts.
pub fn cli() {
	IRQ_ENABLED.store(false, Ordering::Release);
}

/// Enables interrupts.
pub fn sti() {
	IRQ_ENABLED.store(true, Ordering::Release);
}
