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

//! Virtual memory subsystem for the Pebble teaching kernel.
//!
//! This crate owns the coupling between four pieces of state: the coremap
//! (physical frame ownership), the per-address-space page table, the TLB,
//! and the swap device. Everything outside of that — the scheduler, VFS,
//! ELF loading, syscall dispatch — is a collaborator reached through the
//! [`platform::Platform`] trait or left for the embedding kernel to supply.
//!
//! Entry points: [`vm::VmSystem::bootstrap`] to stand the subsystem up,
//! [`vm::VmSystem::handle_fault`] for the TLB-miss/protection-fault path,
//! [`vm::VmSystem::sbrk`] for heap growth, and [`vm::VmSystem::copy_addrspace`]
//! for `fork`.
//!
//! Lock order, outermost first: `as_lock` (per [`addrspace::AddrSpace`]) ->
//! `swap_lock` -> `cm_spinlock` -> `tlb_spinlock` (interrupts masked). See
//! [`vm::VmSystem`] for where each lives.

#![no_std]
#![feature(negative_impls)]

extern crate alloc;

pub mod addrspace;
pub mod error;
pub mod fault;
pub mod heap;
pub mod limits;
pub mod logger;
pub mod memory;
pub mod platform;
mod print;
pub mod sync;
pub mod vm;

pub use error::{EResult, Errno};
pub use fault::FaultKind;
pub use platform::Platform;
pub use vm::VmSystem;
