//! `embedded-hal-async` adapter.
//!
//! `write` rides the interrupt-driven state machine: the future parks its
//! waker in a shared cell, starts the flight, and the completion
//! continuation wakes it. Dropping a pending future aborts the flight, so
//! the borrowed buffer never outlives the hardware's view of it. The other
//! bus methods run the blocking engine to completion; only writes have an
//! interrupt to suspend on.

use core::convert::Infallible;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use embedded_hal_async::spi as hal_async;

use crate::WakerCell;

use super::transaction::{Transaction, EMPTY_READ_FILL};
use super::{asynch, Capabilities, Notify};

static WRITE_WAKER: WakerCell = WakerCell::new();

struct WakeOnDone;

impl Notify for WakeOnDone {
    fn complete(&self) {
        WRITE_WAKER.wake();
    }
}

static WAKE_ON_DONE: WakeOnDone = WakeOnDone;

struct WriteFut<'a, 'b> {
    transaction: &'a mut Transaction,
    buf: &'b [u8],
    started: bool,
}

impl Future for WriteFut<'_, '_> {
    type Output = Result<(), Infallible>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if !this.started {
            if this.buf.is_empty() {
                return Poll::Ready(Ok(()));
            }
            // Park the waker before arming the interrupt; a completion that
            // lands between start and return still finds it.
            WRITE_WAKER.set(cx.waker());
            this.transaction.ensure_selected();
            // Safety: `Drop` below aborts a still-pending flight, so the
            // borrow outlives the hardware's view of the buffer.
            unsafe {
                asynch::start_raw(
                    this.transaction,
                    this.buf.as_ptr(),
                    this.buf.len(),
                    &WAKE_ON_DONE,
                )
            };
            this.started = true;
            Poll::Pending
        } else if asynch::is_running(this.transaction.bus) {
            WRITE_WAKER.set(cx.waker());
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }
}

impl Drop for WriteFut<'_, '_> {
    fn drop(&mut self) {
        if self.started {
            // No-op once the flight finished; the bus claim we hold keeps
            // anyone else from starting one in between.
            asynch::abort(self.transaction.bus);
        }
    }
}

impl hal_async::SpiBus for Transaction {
    async fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.read_buffer(words, EMPTY_READ_FILL);
        Ok(())
    }

    async fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        if self
            .bus
            .caps
            .contains(Capabilities::ASYNC | Capabilities::HARDWARE_WINDOW)
        {
            WriteFut {
                transaction: self,
                buf: words,
                started: false,
            }
            .await
        } else {
            self.write_buffer(words);
            Ok(())
        }
    }

    async fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        embedded_hal::spi::SpiBus::transfer(self, read, write)
    }

    async fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.exchange_in_place(words);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        embedded_hal::spi::SpiBus::flush(self)
    }
}
