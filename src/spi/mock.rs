//! Simulated controller and recording collaborators for the unit tests.
//!
//! The controller records every window latch and DMA chain walk, loops
//! data-out back into the receive window, and queues completion flags so
//! tests pump `interrupt_handler` by hand. Completion is synchronous: the
//! busy flags are never set, which keeps the engines' spin loops trivial.

use std::boxed::Box;
use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::vec::Vec;

use crate::board::{Beacon, Board, Delay, Direction, Fault, Gpio, PinRole};

use super::{
    asynch, pins, Bus, Capabilities, ClockDivider, Descriptor, FamilyConfig, FastRouting,
    Instance, Mode,
};

/// An 80 MHz family with a 64-byte window, 4092-byte descriptors and two
/// fast-routable controllers.
pub(crate) static TEST_FAMILY: FamilyConfig = FamilyConfig {
    base_clock_hz: 80_000_000,
    divider_counter_bits: 6,
    divider_prescale_bits: 13,
    window_bytes: 64,
    max_descriptor_bytes: 4092,
    dma_threshold: 64,
    max_open_buses: 3,
    default_bus: 2,
    fast_routing: &[
        FastRouting {
            bus: 2,
            sclk: 14,
            miso: 12,
            mosi: 13,
            cs: 15,
        },
        FastRouting {
            bus: 3,
            sclk: 18,
            miso: 19,
            mosi: 23,
            cs: 5,
        },
    ],
};

static EXCLUSIVE: StdMutex<()> = StdMutex::new(());

/// Serialize tests that touch the process-wide resolver mask or the async
/// owner token, and reset both so panicking tests cannot leak state.
pub(crate) fn exclusive() -> MutexGuard<'static, ()> {
    let guard = EXCLUSIVE.lock().unwrap_or_else(PoisonError::into_inner);
    pins::reset_for_tests();
    asynch::reset_for_tests();
    guard
}

pub(crate) fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

#[derive(Default)]
struct InstanceState {
    window: Vec<u32>,
    bits: u32,
    rx: Vec<u32>,
    starts: Vec<Vec<u8>>,
    irq_enabled: bool,
    pending_irq: u32,
    dma_runs: Vec<Vec<u8>>,
    dma_chain_lens: Vec<Vec<usize>>,
}

pub(crate) struct MockInstance {
    state: StdMutex<InstanceState>,
}

impl MockInstance {
    fn new() -> Self {
        Self {
            state: StdMutex::new(InstanceState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes latched by each transfer start, in order.
    pub(crate) fn starts(&self) -> Vec<Vec<u8>> {
        self.lock().starts.clone()
    }

    /// Bytes gathered by each DMA chain walk.
    pub(crate) fn dma_runs(&self) -> Vec<Vec<u8>> {
        self.lock().dma_runs.clone()
    }

    /// Descriptor payload lengths of each DMA chain.
    pub(crate) fn dma_chain_lens(&self) -> Vec<Vec<usize>> {
        self.lock().dma_chain_lens.clone()
    }

    /// Queue a completion flag that no transfer produced.
    pub(crate) fn force_irq(&self) {
        self.lock().pending_irq += 1;
    }
}

impl Instance for MockInstance {
    fn reset(&self) {
        *self.lock() = InstanceState::default();
    }

    fn gate_clock(&self, _enabled: bool) {}

    fn set_divider(&self, _divider: &ClockDivider) {}

    fn set_mode(&self, _mode: Mode) {}

    fn load_window(&self, words: &[u32], bits: u32) {
        let mut state = self.lock();
        state.window = words.to_vec();
        state.bits = bits;
    }

    fn store_window(&self, words: &mut [u32]) {
        let state = self.lock();
        for (dst, src) in words.iter_mut().zip(&state.rx) {
            *dst = *src;
        }
    }

    fn start(&self) {
        let mut state = self.lock();
        let bytes = (state.bits / 8) as usize;
        let latched: Vec<u8> = (0..bytes)
            .map(|i| (state.window[i / 4] >> (8 * (i % 4))) as u8)
            .collect();
        state.starts.push(latched);
        // Loopback: whatever went out comes straight back.
        state.rx = state.window.clone();
        if state.irq_enabled {
            state.pending_irq += 1;
        }
    }

    fn busy(&self) -> bool {
        false
    }

    fn set_irq_enabled(&self, enabled: bool) {
        self.lock().irq_enabled = enabled;
    }

    fn take_irq(&self) -> bool {
        let mut state = self.lock();
        if state.pending_irq > 0 {
            state.pending_irq -= 1;
            true
        } else {
            false
        }
    }

    fn dma_reset(&self) {}

    fn dma_start(&self, head: *const Descriptor, _bits: u32) {
        let mut lens = Vec::new();
        let mut bytes = Vec::new();
        let mut cursor = head;
        while !cursor.is_null() {
            // Safety: the blocking driver keeps the chain and the buffers
            // it points into alive for the duration of this call.
            let descriptor = unsafe { &*cursor };
            lens.push(descriptor.len());
            // Safety: as above.
            bytes.extend_from_slice(unsafe {
                core::slice::from_raw_parts(descriptor.buffer(), descriptor.len())
            });
            if descriptor.is_last() {
                break;
            }
            cursor = descriptor.next();
        }
        let mut state = self.lock();
        state.dma_chain_lens.push(lens);
        state.dma_runs.push(bytes);
    }

    fn dma_busy(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GpioEvent {
    Direction(u8, Direction),
    Level(u8, bool),
    RouteFixed(u8, u8, PinRole),
    RouteMatrix(u8, u8, PinRole),
    Unroute(u8),
}

#[derive(Default)]
struct GpioState {
    events: Vec<GpioEvent>,
    levels: HashMap<u8, bool>,
    /// reader pin -> pin whose level it reflects (loopback wiring).
    wires: HashMap<u8, u8>,
}

pub(crate) struct RecorderGpio {
    state: StdMutex<GpioState>,
}

impl RecorderGpio {
    fn new() -> Self {
        Self {
            state: StdMutex::new(GpioState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GpioState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn events(&self) -> Vec<GpioEvent> {
        self.lock().events.clone()
    }

    pub(crate) fn clear_events(&self) {
        self.lock().events.clear();
    }

    /// Make reads of `reader` reflect the level last written to `source`.
    pub(crate) fn wire(&self, reader: u8, source: u8) {
        self.lock().wires.insert(reader, source);
    }
}

impl Gpio for RecorderGpio {
    fn set_direction(&self, pin: u8, direction: Direction) {
        self.lock().events.push(GpioEvent::Direction(pin, direction));
    }

    fn write_level(&self, pin: u8, high: bool) {
        let mut state = self.lock();
        state.events.push(GpioEvent::Level(pin, high));
        state.levels.insert(pin, high);
    }

    fn read_level(&self, pin: u8) -> bool {
        let state = self.lock();
        let source = state.wires.get(&pin).copied().unwrap_or(pin);
        state.levels.get(&source).copied().unwrap_or(false)
    }

    fn route_fixed(&self, pin: u8, bus: u8, role: PinRole) {
        self.lock().events.push(GpioEvent::RouteFixed(pin, bus, role));
    }

    fn route_matrix(&self, pin: u8, bus: u8, role: PinRole) {
        self.lock().events.push(GpioEvent::RouteMatrix(pin, bus, role));
    }

    fn unroute(&self, pin: u8) {
        self.lock().events.push(GpioEvent::Unroute(pin));
    }
}

struct NoDelay;

impl Delay for NoDelay {
    fn delay_us(&self, _us: u32) {}
}

static NO_DELAY: NoDelay = NoDelay;

struct PanicBeacon;

impl Beacon for PanicBeacon {
    fn fatal(&self, fault: Fault) -> ! {
        panic!("fatal fault: {fault:?}");
    }
}

static PANIC_BEACON: PanicBeacon = PanicBeacon;

pub(crate) fn bus_with_index(
    index: u8,
    caps: Capabilities,
) -> (&'static Bus, &'static MockInstance, &'static RecorderGpio) {
    let instance = leak(MockInstance::new());
    let gpio = leak(RecorderGpio::new());
    let board = Board {
        gpio,
        delay: &NO_DELAY,
        beacon: &PANIC_BEACON,
    };
    let bus = leak(Bus::new(index, caps, instance, &TEST_FAMILY, board));
    (bus, instance, gpio)
}

pub(crate) fn bus(
    caps: Capabilities,
) -> (&'static Bus, &'static MockInstance, &'static RecorderGpio) {
    bus_with_index(TEST_FAMILY.default_bus, caps)
}

pub(crate) fn async_bus() -> (&'static Bus, &'static MockInstance, &'static RecorderGpio) {
    bus(Capabilities::HARDWARE_WINDOW | Capabilities::ASYNC)
}

pub(crate) fn async_bus_with_index(
    index: u8,
) -> (&'static Bus, &'static MockInstance, &'static RecorderGpio) {
    bus_with_index(index, Capabilities::HARDWARE_WINDOW | Capabilities::ASYNC)
}
