//! Interrupt-driven single-outstanding-transfer state machine.
//!
//! One transfer may be in flight process-wide. The record lives in a per-bus
//! slot; a process-wide owner token names the bus it belongs to, so the
//! completion handler can reject interrupts for any other bus without
//! touching the record. Main-line mutations (start, abort) run inside
//! critical sections against the handler; the handler never needs to mask
//! its own source, since same-source interrupts do not nest.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU16, Ordering};

use critical_section::Mutex;

use crate::board::Fault;
use crate::spin_while;

use super::transaction::Transaction;
use super::transfer::{self, WINDOW_WORDS_MAX};
use super::{Bus, Capabilities};

/// Completion continuation for [`Transaction::write_async`].
///
/// A `static` trait object rather than a function/context pointer pair: the
/// call site picks the concrete continuation, nothing is allocated, and the
/// handler has one method to call.
pub trait Notify: Sync {
    fn complete(&self);
}

pub(crate) struct AsyncProcess {
    buf: *const u8,
    len: usize,
    /// Next unsent byte; the window ahead of it is already in hardware.
    offset: usize,
    reverse: bool,
    notify: Option<&'static dyn Notify>,
}

// Safety: `buf` points into a buffer the start contract keeps valid and
// untouched for the whole flight, so the record may move between the
// issuing context and the interrupt handler.
unsafe impl Send for AsyncProcess {}

pub(crate) struct AsyncSlot(Mutex<RefCell<Option<AsyncProcess>>>);

impl AsyncSlot {
    pub(crate) const fn new() -> Self {
        Self(Mutex::new(RefCell::new(None)))
    }
}

/// Which bus owns the in-flight transfer: 0 for none, else index + 1.
static OWNER: AtomicU16 = AtomicU16::new(0);

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    OWNER.store(0, Ordering::SeqCst);
}

fn token(bus: &Bus) -> u16 {
    bus.index as u16 + 1
}

pub(crate) fn is_running(bus: &Bus) -> bool {
    OWNER.load(Ordering::Acquire) == token(bus)
}

/// The async barrier: wait out an in-flight transfer on `bus`.
pub(crate) fn join(bus: &Bus) {
    spin_while(|| is_running(bus));
}

pub(crate) fn start(
    transaction: &Transaction,
    buf: &'static [u8],
    notify: &'static dyn Notify,
) {
    // Safety: a 'static borrow outlives any flight.
    unsafe { start_raw(transaction, buf.as_ptr(), buf.len(), notify) }
}

/// Start an interrupt-driven write of `len` bytes at `buf`.
///
/// # Safety
///
/// `buf..buf+len` must stay valid and unmodified until `notify` fires or
/// the transfer is aborted.
pub(crate) unsafe fn start_raw(
    transaction: &Transaction,
    buf: *const u8,
    len: usize,
    notify: &'static dyn Notify,
) {
    let bus = transaction.bus;
    if !bus.caps.contains(Capabilities::ASYNC | Capabilities::HARDWARE_WINDOW) {
        bus.board.beacon.fatal(Fault::Unsupported);
    }

    // Wait out any in-flight transfer, on this bus or another: the record
    // is system-wide single-occupancy.
    spin_while(|| OWNER.load(Ordering::Acquire) != 0);
    if OWNER
        .compare_exchange(0, token(bus), Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // Two starts raced past the barrier; that is a build that issues
        // concurrent async transfers, not a runtime condition.
        bus.board.beacon.fatal(Fault::AsyncConflict);
    }

    if len == 0 {
        OWNER.store(0, Ordering::Release);
        notify.complete();
        return;
    }

    let reverse = transaction.reverse_bits();
    let first = len.min(bus.config.window_bytes);
    critical_section::with(|cs| {
        let mut slot = bus.slot.0.borrow_ref_mut(cs);
        *slot = Some(AsyncProcess {
            buf,
            len,
            offset: first,
            reverse,
            notify: Some(notify),
        });
        bus.instance.set_irq_enabled(true);
        // Prime the first window so the first completion interrupt has
        // something to report.
        let mut words = [0u32; WINDOW_WORDS_MAX];
        // Safety: in range per this function's contract.
        let chunk = unsafe { core::slice::from_raw_parts(buf, first) };
        transfer::pack(&mut words, chunk, reverse);
        bus.instance.load_window(&words[..first.div_ceil(4)], first as u32 * 8);
        bus.instance.start();
    });
}

/// Cancel the in-flight transfer on `bus`, if any, without notifying.
pub(crate) fn abort(bus: &Bus) {
    critical_section::with(|cs| {
        if OWNER.load(Ordering::Acquire) != token(bus) {
            return;
        }
        bus.instance.set_irq_enabled(false);
        *bus.slot.0.borrow_ref_mut(cs) = None;
        OWNER.store(0, Ordering::Release);
    });
}

/// Completion-interrupt entry point.
///
/// Boards register a per-bus shim for this through their interrupt table:
/// `unsafe fn spi2_irq() { spibus::spi::interrupt_handler(&BUS2) }`.
///
/// Refills the next window while data remains; on the last completion it
/// disables the interrupt, clears the record, and invokes the continuation
/// exactly once, outside the critical section so the continuation may issue
/// new bus operations.
///
/// # Safety
///
/// Must only be called from the interrupt entry path for `bus`'s
/// completion source (tests stand in for that path).
pub unsafe fn interrupt_handler(bus: &'static Bus) {
    if !bus.instance.take_irq() {
        // Not our flag: spurious interrupt, nothing to acknowledge.
        return;
    }
    if OWNER.load(Ordering::Acquire) != token(bus) {
        // Flag was ours, transfer is not: a completion that raced an abort
        // or a wrong-bus wakeup. Ignore without touching any state.
        return;
    }

    let mut finished: Option<&'static dyn Notify> = None;
    critical_section::with(|cs| {
        let mut slot = bus.slot.0.borrow_ref_mut(cs);
        let Some(process) = slot.as_mut() else {
            return;
        };
        if process.offset < process.len {
            let len = (process.len - process.offset).min(bus.config.window_bytes);
            // Safety: in range for the buffer the start contract keeps
            // valid for the whole flight.
            let chunk =
                unsafe { core::slice::from_raw_parts(process.buf.add(process.offset), len) };
            let mut words = [0u32; WINDOW_WORDS_MAX];
            transfer::pack(&mut words, chunk, process.reverse);
            bus.instance.load_window(&words[..len.div_ceil(4)], len as u32 * 8);
            bus.instance.start();
            process.offset += len;
        } else {
            bus.instance.set_irq_enabled(false);
            finished = process.notify.take();
            *slot = None;
            OWNER.store(0, Ordering::Release);
        }
    });

    if let Some(notify) = finished {
        notify.complete();
    }
}
