//! Transaction scope manager and public transfer surface.
//!
//! A [`Transaction`] is one open configure/close scope on a bus. It owns the
//! resolved pin routing and the chip-select lifecycle: select is asserted
//! lazily on the first transfer, stays asserted across operations, and only
//! [`Transaction::close`] releases it. Callers never manage select
//! themselves.

use core::convert::Infallible;
use core::sync::atomic::Ordering;

use embedded_hal::spi as hal;
use embedded_hal_nb::{nb, spi as hal_nb};

use crate::board::Fault;
use crate::spin_while;

use super::pins::{self, PinMapping};
use super::{asynch, clock, dma, transfer};
use super::{BitOrder, Bus, Capabilities, ClockDivider, Mode, Notify, PinRequest};

/// Frame clocked out when a read has nothing meaningful to transmit.
pub(crate) const EMPTY_READ_FILL: u8 = 0xFF;

impl Bus {
    /// Open a transaction scope on this bus.
    ///
    /// Resolves and installs pin routing, synthesizes the clock divider for
    /// `max_freq_hz`, and ungates the controller. Scopes nest 1:1 per bus;
    /// opening a second scope before [`Transaction::close`] is a fatal
    /// configuration fault.
    pub fn configure(&'static self, max_freq_hz: u32, request: PinRequest) -> Transaction {
        if self.claimed.swap(true, Ordering::AcqRel) {
            self.board.beacon.fatal(Fault::BusBusy);
        }
        debug_assert!(self.config.window_bytes <= transfer::WINDOW_BYTES_MAX);
        let mapping = pins::install(self, request);
        let divider = clock::synthesize(max_freq_hz, self.config);
        self.instance.gate_clock(true);
        self.instance.set_divider(&divider);
        self.instance.set_mode(Mode::Mode0);
        Transaction {
            bus: self,
            mapping,
            divider,
            bit_order: BitOrder::MsbFirst,
            mode: Mode::Mode0,
            cs_active: false,
            soft_rx: 0,
        }
    }
}

/// One open transfer scope. See the module docs for the select lifecycle.
pub struct Transaction {
    pub(crate) bus: &'static Bus,
    pub(crate) mapping: PinMapping,
    pub(crate) divider: ClockDivider,
    pub(crate) bit_order: BitOrder,
    pub(crate) mode: Mode,
    cs_active: bool,
    /// Last frame captured by the non-blocking path on window-less buses.
    soft_rx: u8,
}

impl Transaction {
    pub(crate) fn reverse_bits(&self) -> bool {
        self.bit_order == BitOrder::LsbFirst
    }

    fn has_window(&self) -> bool {
        self.bus.caps.contains(Capabilities::HARDWARE_WINDOW)
    }

    /// Async barrier, then lazy select. Every blocking transfer runs
    /// through here first.
    fn prepare(&mut self) {
        asynch::join(self.bus);
        self.ensure_selected();
    }

    pub(crate) fn ensure_selected(&mut self) {
        if !self.cs_active {
            if let Some(pin) = self.mapping.cs_pin() {
                self.bus.board.gpio.write_level(pin, false);
            }
            self.cs_active = true;
        }
    }

    fn release_selected(&mut self) {
        if self.cs_active {
            spin_while(|| self.bus.instance.busy());
            if let Some(pin) = self.mapping.cs_pin() {
                self.bus.board.gpio.write_level(pin, true);
            }
            self.cs_active = false;
        }
    }

    /// Send one frame, discarding whatever comes back.
    pub fn send(&mut self, byte: u8) {
        self.write_buffer(&[byte]);
    }

    /// Clock `fill` out and return the frame that came back.
    pub fn receive(&mut self, fill: u8) -> u8 {
        let mut frame = [fill];
        self.exchange_in_place(&mut frame);
        frame[0]
    }

    /// Send one 16-bit frame; the configured bit order decides which byte
    /// leads on the wire.
    pub fn send_word(&mut self, word: u16) {
        let bytes = match self.bit_order {
            BitOrder::MsbFirst => word.to_be_bytes(),
            BitOrder::LsbFirst => word.to_le_bytes(),
        };
        self.write_buffer(&bytes);
    }

    /// Clock a 16-bit `fill` frame out and return what came back.
    pub fn receive_word(&mut self, fill: u16) -> u16 {
        let mut bytes = match self.bit_order {
            BitOrder::MsbFirst => fill.to_be_bytes(),
            BitOrder::LsbFirst => fill.to_le_bytes(),
        };
        self.exchange_in_place(&mut bytes);
        match self.bit_order {
            BitOrder::MsbFirst => u16::from_be_bytes(bytes),
            BitOrder::LsbFirst => u16::from_le_bytes(bytes),
        }
    }

    /// Blocking write. Large aligned payloads take the DMA engine when this
    /// bus has one; everything else streams through the window or, on
    /// window-less buses, the software-timed path.
    pub fn write_buffer(&mut self, buf: &[u8]) {
        self.prepare();
        if !self.has_window() {
            transfer::soft_write(self, buf);
        } else if dma::eligible(self, buf) {
            dma::write(self, buf);
        } else {
            transfer::write_chunked(self, buf);
        }
    }

    /// Blocking read: clocks `fill` frames and captures what comes back.
    pub fn read_buffer(&mut self, buf: &mut [u8], fill: u8) {
        self.prepare();
        if self.has_window() {
            transfer::read_chunked(self, buf, fill);
        } else if self.mapping.miso.is_some() {
            transfer::soft_read(self, buf, fill);
        } else {
            // Still needs the clock pulses even with nothing to capture.
            transfer::soft_repeated(self, fill, buf.len());
        }
    }

    /// Blocking full-duplex exchange in place.
    pub(crate) fn exchange_in_place(&mut self, buf: &mut [u8]) {
        self.prepare();
        if self.has_window() {
            transfer::exchange_chunked(self, buf);
        } else {
            transfer::soft_exchange(self, buf);
        }
    }

    /// Clock the same frame out `count` times (display fills).
    pub fn write_repeated(&mut self, value: u8, count: usize) {
        self.prepare();
        if self.has_window() {
            transfer::write_repeated(self, value, count);
        } else {
            transfer::soft_repeated(self, value, count);
        }
    }

    /// Start an interrupt-driven write and return immediately.
    ///
    /// `notify` fires exactly once, after the last byte, unless the
    /// transfer is aborted first. The buffer must be `'static`: the
    /// completion interrupt still reads it after this call returns.
    pub fn write_async(&mut self, buf: &'static [u8], notify: &'static dyn Notify) {
        self.ensure_selected();
        asynch::start(self, buf, notify);
    }

    /// Cancel an in-flight asynchronous write without notifying. Safe to
    /// call when nothing is in flight.
    pub fn abort_async(&mut self) {
        asynch::abort(self.bus);
        // Select bookkeeping resets so the next operation opens a clean
        // scope over the abandoned partial frame; the line itself stays
        // under close()'s control.
        self.cs_active = false;
    }

    /// Block until no asynchronous write is in flight on this bus.
    pub fn join_async(&self) {
        asynch::join(self.bus);
    }

    pub fn is_async_running(&self) -> bool {
        asynch::is_running(self.bus)
    }

    /// Change the transmit-first bit. On an active scope this flushes and
    /// releases select around the change; callers see at most a brief
    /// select pulse.
    pub fn set_bit_order(&mut self, order: BitOrder) {
        if self.bit_order != order {
            self.reopen();
            self.bit_order = order;
        }
    }

    /// Change clock polarity/phase; same select pulse rule as
    /// [`Transaction::set_bit_order`].
    pub fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            self.reopen();
            self.mode = mode;
            self.bus.instance.set_mode(mode);
        }
    }

    fn reopen(&mut self) {
        asynch::join(self.bus);
        self.release_selected();
    }

    pub fn bit_order(&self) -> BitOrder {
        self.bit_order
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The clock rate the divider actually achieves.
    pub fn actual_frequency(&self) -> u32 {
        self.divider.actual_hz
    }

    pub fn mapping(&self) -> &PinMapping {
        &self.mapping
    }

    /// Close the scope: drain in-flight work, release select, reverse pin
    /// routing, gate the controller clock off.
    pub fn close(mut self) {
        self.shutdown();
        core::mem::forget(self);
    }

    fn shutdown(&mut self) {
        asynch::join(self.bus);
        spin_while(|| self.bus.instance.busy());
        self.release_selected();
        pins::teardown(&mut self.mapping, self.bus.board.gpio, self.bus);
        self.bus.instance.gate_clock(false);
        self.bus.claimed.store(false, Ordering::Release);
    }
}

/// Leaked scopes still release the bus; `close` stays the intended path.
impl Drop for Transaction {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl hal::ErrorType for Transaction {
    type Error = Infallible;
}

impl hal::SpiBus for Transaction {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.read_buffer(words, EMPTY_READ_FILL);
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.write_buffer(words);
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        if read.len() >= write.len() {
            read[..write.len()].copy_from_slice(write);
            read[write.len()..].fill(EMPTY_READ_FILL);
            self.transfer_in_place(read)
        } else {
            read.copy_from_slice(&write[..read.len()]);
            self.transfer_in_place(read)?;
            self.write(&write[read.len()..])
        }
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.exchange_in_place(words);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        spin_while(|| self.bus.instance.busy());
        Ok(())
    }
}

/// Single-frame non-blocking variants. These drive the window registers
/// directly; do not interleave them with the buffered API without a
/// [`hal::SpiBus::flush`] in between.
impl hal_nb::FullDuplex<u8> for Transaction {
    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        if !self.has_window() {
            return Ok(self.soft_rx);
        }
        if self.bus.instance.busy() {
            return Err(nb::Error::WouldBlock);
        }
        let mut words = [0u32; 1];
        self.bus.instance.store_window(&mut words);
        let mut frame = [0u8; 1];
        transfer::unpack(&mut frame, &words, self.reverse_bits());
        Ok(frame[0])
    }

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        if self.is_async_running() {
            return Err(nb::Error::WouldBlock);
        }
        if !self.has_window() {
            self.ensure_selected();
            self.soft_rx = transfer::soft_exchange_byte(self, word);
            return Ok(());
        }
        if self.bus.instance.busy() {
            return Err(nb::Error::WouldBlock);
        }
        self.ensure_selected();
        let mut words = [0u32; 1];
        transfer::pack(&mut words, &[word], self.reverse_bits());
        self.bus.instance.load_window(&words, 8);
        self.bus.instance.start();
        Ok(())
    }
}

impl hal_nb::FullDuplex<u16> for Transaction {
    fn read(&mut self) -> nb::Result<u16, Self::Error> {
        if !self.has_window() {
            return Ok(self.soft_rx as u16);
        }
        if self.bus.instance.busy() {
            return Err(nb::Error::WouldBlock);
        }
        let mut words = [0u32; 1];
        self.bus.instance.store_window(&mut words);
        let mut bytes = [0u8; 2];
        transfer::unpack(&mut bytes, &words, self.reverse_bits());
        Ok(match self.bit_order {
            BitOrder::MsbFirst => u16::from_be_bytes(bytes),
            BitOrder::LsbFirst => u16::from_le_bytes(bytes),
        })
    }

    fn write(&mut self, word: u16) -> nb::Result<(), Self::Error> {
        if self.is_async_running() || self.bus.instance.busy() {
            return Err(nb::Error::WouldBlock);
        }
        if !self.has_window() {
            // The software path has no frame width; send both bytes.
            self.ensure_selected();
            let bytes = match self.bit_order {
                BitOrder::MsbFirst => word.to_be_bytes(),
                BitOrder::LsbFirst => word.to_le_bytes(),
            };
            transfer::soft_write(self, &bytes);
            return Ok(());
        }
        self.ensure_selected();
        let bytes = match self.bit_order {
            BitOrder::MsbFirst => word.to_be_bytes(),
            BitOrder::LsbFirst => word.to_le_bytes(),
        };
        let mut words = [0u32; 1];
        transfer::pack(&mut words, &bytes, self.reverse_bits());
        self.bus.instance.load_window(&words, 16);
        self.bus.instance.start();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::mock::{self, GpioEvent};
    use embedded_hal::spi::SpiBus;
    use std::vec::Vec;

    fn select_levels(events: &[GpioEvent]) -> Vec<bool> {
        events
            .iter()
            .filter_map(|event| match event {
                GpioEvent::Level(15, high) => Some(*high),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn select_asserted_once_per_scope() {
        let _guard = mock::exclusive();
        let (bus, _, gpio) = mock::bus(Capabilities::HARDWARE_WINDOW);
        let mut transaction = bus.configure(1_000_000, PinRequest::default());
        transaction.send(0x01);
        transaction.write_buffer(&[0x02, 0x03, 0x04]);
        transaction.write_repeated(0xFF, 10);
        transaction.close();
        // Parked high at install, low on the first transfer, high on close.
        assert_eq!(select_levels(&gpio.events()), std::vec![true, false, true]);
    }

    #[test]
    fn mode_change_pulses_select() {
        let _guard = mock::exclusive();
        let (bus, _, gpio) = mock::bus(Capabilities::HARDWARE_WINDOW);
        let mut transaction = bus.configure(1_000_000, PinRequest::default());
        transaction.send(0x01);
        transaction.set_mode(Mode::Mode3);
        transaction.send(0x02);
        transaction.close();
        assert_eq!(
            select_levels(&gpio.events()),
            std::vec![true, false, true, false, true]
        );
        // Setting the same mode again is not a pulse.
        let (bus, _, gpio) = mock::bus(Capabilities::HARDWARE_WINDOW);
        let mut transaction = bus.configure(1_000_000, PinRequest::default());
        transaction.send(0x01);
        transaction.set_mode(Mode::Mode0);
        transaction.close();
        assert_eq!(select_levels(&gpio.events()), std::vec![true, false, true]);
    }

    #[test]
    fn close_releases_the_bus_claim() {
        let _guard = mock::exclusive();
        let (bus, _, _) = mock::bus(Capabilities::HARDWARE_WINDOW);
        let transaction = bus.configure(1_000_000, PinRequest::default());
        transaction.close();
        let transaction = bus.configure(2_000_000, PinRequest::default());
        transaction.close();
    }

    #[test]
    #[should_panic(expected = "BusBusy")]
    fn nested_configure_is_fatal() {
        let _guard = mock::exclusive();
        let (bus, _, _) = mock::bus(Capabilities::HARDWARE_WINDOW);
        let _outer = bus.configure(1_000_000, PinRequest::default());
        let _inner = bus.configure(1_000_000, PinRequest::default());
    }

    #[test]
    fn single_frames_round_trip_through_loopback() {
        let _guard = mock::exclusive();
        let (bus, instance, _) = mock::bus(Capabilities::HARDWARE_WINDOW);
        let mut transaction = bus.configure(1_000_000, PinRequest::default());
        assert_eq!(transaction.receive(0x5A), 0x5A);
        assert_eq!(transaction.receive_word(0xBEEF), 0xBEEF);
        transaction.send_word(0x1234);
        assert_eq!(instance.starts().last().unwrap(), &std::vec![0x12, 0x34]);

        transaction.set_bit_order(BitOrder::LsbFirst);
        assert_eq!(transaction.receive_word(0xBEEF), 0xBEEF);
        transaction.send_word(0x1234);
        // Low byte leads and each byte is bit-reversed on the way into the
        // window: 0x34 -> 0x2C, 0x12 -> 0x48.
        assert_eq!(instance.starts().last().unwrap(), &std::vec![0x2C, 0x48]);
        transaction.close();
    }

    #[test]
    fn nonblocking_frames_round_trip() {
        let _guard = mock::exclusive();
        let (bus, _, _) = mock::bus(Capabilities::HARDWARE_WINDOW);
        let mut transaction = bus.configure(1_000_000, PinRequest::default());
        nb::block!(hal_nb::FullDuplex::<u8>::write(&mut transaction, 0xC3)).unwrap();
        let frame = nb::block!(hal_nb::FullDuplex::<u8>::read(&mut transaction)).unwrap();
        assert_eq!(frame, 0xC3);
        nb::block!(hal_nb::FullDuplex::<u16>::write(&mut transaction, 0xA55A)).unwrap();
        let frame = nb::block!(hal_nb::FullDuplex::<u16>::read(&mut transaction)).unwrap();
        assert_eq!(frame, 0xA55A);
        transaction.close();
    }

    #[test]
    fn hal_transfer_pads_the_longer_side() {
        let _guard = mock::exclusive();
        let (bus, instance, _) = mock::bus(Capabilities::HARDWARE_WINDOW);
        let mut transaction = bus.configure(1_000_000, PinRequest::default());
        let mut read = [0u8; 4];
        transaction.transfer(&mut read, &[0x10, 0x20]).unwrap();
        assert_eq!(read, [0x10, 0x20, EMPTY_READ_FILL, EMPTY_READ_FILL]);

        let mut read = [0u8; 1];
        transaction.transfer(&mut read, &[0x30, 0x40, 0x50]).unwrap();
        assert_eq!(read, [0x30]);
        let flat: Vec<u8> = instance.starts().into_iter().flatten().collect();
        assert!(flat.ends_with(&[0x30, 0x40, 0x50]));
        transaction.close();
    }
}
