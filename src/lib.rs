//! Transport layer for single-master SPI controllers in real-time control firmware.
//!
//! One blocking/non-blocking transfer API over three controller realities:
//! software-timed bit-banging, a fixed-size hardware shift-register window,
//! and a descriptor-chained DMA engine. Per-chip register layouts stay out of
//! this crate: a board implements [`spi::Instance`] for each physical
//! controller and the collaborator traits in [`board`], then creates one
//! `static` [`spi::Bus`] per controller.

// IMPORTANT: Everything reachable from `spi::interrupt_handler` runs in
// interrupt context. Main-line mutations that race it must go through
// `critical_section::with`; the handler itself never needs to mask its own
// source (same-source interrupts do not nest on the supported targets).
#![no_std]
#![warn(clippy::undocumented_unsafe_blocks)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod board;
pub mod spi;

use core::{cell::RefCell, task::Waker};

use critical_section::Mutex;

/// Spin on a hardware status flag until it clears.
///
/// These waits are bounded by hardware timing, never by user data size beyond
/// one window or one descriptor chain. Under test a wedged flag fails the
/// test instead of hanging it; production builds spin unconditionally.
pub(crate) fn spin_while(mut busy: impl FnMut() -> bool) {
    #[cfg(test)]
    let mut iterations: u32 = 0;
    while busy() {
        core::hint::spin_loop();
        #[cfg(test)]
        {
            iterations += 1;
            assert!(iterations < 50_000_000, "hardware status flag never settled");
        }
    }
}

pub(crate) struct WakerCell(Mutex<RefCell<Option<Waker>>>);

impl WakerCell {
    pub(crate) const fn new() -> Self {
        Self(Mutex::new(RefCell::new(None)))
    }

    /// Park `waker` to be woken by the next [`WakerCell::wake`].
    pub(crate) fn set(&self, waker: &Waker) {
        critical_section::with(|cs| {
            *self.0.borrow_ref_mut(cs) = Some(waker.clone());
        });
    }

    /// Wake and clear the parked waker, if any.
    pub(crate) fn wake(&self) {
        critical_section::with(|cs| {
            if let Some(waker) = self.0.borrow_ref_mut(cs).take() {
                waker.wake();
            }
        });
    }
}
