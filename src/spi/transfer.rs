//! Synchronous transfer engine.
//!
//! Two realities live here: packing a byte stream through the controller's
//! fixed-size window, and the software-timed per-bit path for controllers
//! without one. Both honor the configured bit order; the reverse-or-direct
//! copy decision is made once per call, never per byte.

use crate::board::Fault;
use crate::spin_while;

use super::{transaction::Transaction, BitOrder};

/// Window scratch capacity. Families declare their actual window size in
/// [`super::FamilyConfig::window_bytes`], up to this ceiling.
pub(crate) const WINDOW_WORDS_MAX: usize = 16;
pub(crate) const WINDOW_BYTES_MAX: usize = WINDOW_WORDS_MAX * 4;

/// Pack bytes into window words, little-endian byte significance.
pub(crate) fn pack(words: &mut [u32], bytes: &[u8], reverse: bool) {
    for (slot, chunk) in words.iter_mut().zip(bytes.chunks(4)) {
        let mut quad = [0u8; 4];
        for (dst, src) in quad.iter_mut().zip(chunk) {
            *dst = if reverse { src.reverse_bits() } else { *src };
        }
        *slot = u32::from_le_bytes(quad);
    }
}

/// Unpack window words back into bytes.
pub(crate) fn unpack(bytes: &mut [u8], words: &[u32], reverse: bool) {
    for (chunk, slot) in bytes.chunks_mut(4).zip(words) {
        let quad = slot.to_le_bytes();
        for (dst, src) in chunk.iter_mut().zip(quad.iter()) {
            *dst = if reverse { src.reverse_bits() } else { *src };
        }
    }
}

fn run_window(transaction: &Transaction, words: &[u32], bits: u32) {
    let instance = transaction.bus.instance;
    instance.load_window(words, bits);
    instance.start();
    spin_while(|| instance.busy());
}

/// Stream `buf` through the window, one full window per hardware transfer.
pub(crate) fn write_chunked(transaction: &Transaction, buf: &[u8]) {
    let reverse = transaction.reverse_bits();
    let window = transaction.bus.config.window_bytes;
    let mut words = [0u32; WINDOW_WORDS_MAX];
    for chunk in buf.chunks(window) {
        pack(&mut words, chunk, reverse);
        run_window(transaction, &words[..chunk.len().div_ceil(4)], chunk.len() as u32 * 8);
    }
}

/// Full-duplex exchange in place.
pub(crate) fn exchange_chunked(transaction: &Transaction, buf: &mut [u8]) {
    let reverse = transaction.reverse_bits();
    let window = transaction.bus.config.window_bytes;
    let instance = transaction.bus.instance;
    let mut words = [0u32; WINDOW_WORDS_MAX];
    for chunk in buf.chunks_mut(window) {
        pack(&mut words, chunk, reverse);
        run_window(transaction, &words[..chunk.len().div_ceil(4)], chunk.len() as u32 * 8);
        instance.store_window(&mut words[..chunk.len().div_ceil(4)]);
        unpack(chunk, &words, reverse);
    }
}

/// Clock `buf.len()` fill frames out and capture what comes back.
///
/// A mapping with no data-in pin still needs the clock pulses, so it
/// degrades to [`write_repeated`] with the fill value.
pub(crate) fn read_chunked(transaction: &Transaction, buf: &mut [u8], fill: u8) {
    if transaction.mapping.miso.is_none() {
        write_repeated(transaction, fill, buf.len());
        return;
    }
    let reverse = transaction.reverse_bits();
    let window = transaction.bus.config.window_bytes;
    let instance = transaction.bus.instance;
    let mut words = [0u32; WINDOW_WORDS_MAX];
    let fill_byte = if reverse { fill.reverse_bits() } else { fill };
    words.fill(u32::from_le_bytes([fill_byte; 4]));
    for chunk in buf.chunks_mut(window) {
        run_window(transaction, &words[..chunk.len().div_ceil(4)], chunk.len() as u32 * 8);
        instance.store_window(&mut words[..chunk.len().div_ceil(4)]);
        unpack(chunk, &words, reverse);
        // The fill pattern survives in the tail of every word we did not
        // overwrite, but the next pass reloads the full window anyway.
        words.fill(u32::from_le_bytes([fill_byte; 4]));
    }
}

/// Clock the same frame out `count` times; the window is packed once.
pub(crate) fn write_repeated(transaction: &Transaction, value: u8, count: usize) {
    let reverse = transaction.reverse_bits();
    let window = transaction.bus.config.window_bytes;
    let byte = if reverse { value.reverse_bits() } else { value };
    let mut words = [0u32; WINDOW_WORDS_MAX];
    words.fill(u32::from_le_bytes([byte; 4]));
    let mut remaining = count;
    while remaining > 0 {
        let len = remaining.min(window);
        run_window(transaction, &words[..len.div_ceil(4)], len as u32 * 8);
        remaining -= len;
    }
}

// Software-timed path. No window, no shift register: every edge is a GPIO
// write and every half period a busy delay. Used only on buses without the
// HARDWARE_WINDOW capability.

fn half_period_us(hz: u32) -> u32 {
    (500_000 / hz.max(1)).max(1)
}

/// Exchange one byte on the software-timed path.
pub(crate) fn soft_exchange_byte(transaction: &Transaction, out: u8) -> u8 {
    let mapping = &transaction.mapping;
    let (Some(sclk), Some(mosi)) = (mapping.sclk, mapping.mosi) else {
        transaction.bus.board.beacon.fatal(Fault::Unsupported);
    };
    let gpio = transaction.bus.board.gpio;
    let delay = transaction.bus.board.delay;
    let idle = transaction.mode.idle_high();
    let second_edge = transaction.mode.sample_second_edge();
    let half = half_period_us(transaction.divider.actual_hz);

    let mut input = 0u8;
    for index in 0..8 {
        let bit = match transaction.bit_order {
            BitOrder::MsbFirst => out & (0x80 >> index) != 0,
            BitOrder::LsbFirst => out & (1 << index) != 0,
        };
        let sampled = if second_edge {
            // Shift on the leading edge, latch on the trailing edge.
            gpio.write_level(sclk.pin, !idle);
            gpio.write_level(mosi.pin, bit);
            delay.delay_us(half);
            gpio.write_level(sclk.pin, idle);
            let sampled = mapping.miso.map(|miso| gpio.read_level(miso.pin));
            delay.delay_us(half);
            sampled
        } else {
            // Data valid before the leading (latch) edge.
            gpio.write_level(mosi.pin, bit);
            delay.delay_us(half);
            gpio.write_level(sclk.pin, !idle);
            let sampled = mapping.miso.map(|miso| gpio.read_level(miso.pin));
            delay.delay_us(half);
            gpio.write_level(sclk.pin, idle);
            sampled
        };
        let sampled = sampled.unwrap_or(false);
        match transaction.bit_order {
            BitOrder::MsbFirst => input = input << 1 | sampled as u8,
            BitOrder::LsbFirst => input |= (sampled as u8) << index,
        }
    }
    input
}

pub(crate) fn soft_write(transaction: &Transaction, buf: &[u8]) {
    for &byte in buf {
        soft_exchange_byte(transaction, byte);
    }
}

pub(crate) fn soft_read(transaction: &Transaction, buf: &mut [u8], fill: u8) {
    for byte in buf.iter_mut() {
        *byte = soft_exchange_byte(transaction, fill);
    }
}

pub(crate) fn soft_exchange(transaction: &Transaction, buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        *byte = soft_exchange_byte(transaction, *byte);
    }
}

pub(crate) fn soft_repeated(transaction: &Transaction, value: u8, count: usize) {
    for _ in 0..count {
        soft_exchange_byte(transaction, value);
    }
}
