//! SPI transport core.
//!
//! A [`Bus`] is the process-wide handle for one physical controller: the
//! register-access object ([`Instance`]), the capability flags, the family's
//! const configuration, the board collaborators, the per-bus async slot and
//! the DMA descriptor pool. Boards create one `static Bus` per controller
//! (`Bus::new` is `const`), call [`begin`] once at startup, then open
//! transaction scopes with [`configure`] or [`Bus::configure`].

// # Dispatch
//
// Callers never talk to an `Instance` directly. Every transfer goes through
// a `Transaction`, which picks the DMA path (large, aligned payloads on
// DMA-capable buses), the hardware-window path, or the software-timed path
// based on the capability flags and the payload.

use core::sync::atomic::AtomicBool;

use bitflags::bitflags;

use crate::board::Board;

mod asynch;
mod clock;
mod dma;
mod futures;
#[cfg(test)]
pub(crate) mod mock;
mod pins;
mod transaction;
mod transfer;

pub use asynch::{interrupt_handler, Notify};
pub use clock::ClockDivider;
pub use dma::{Descriptor, Ownership};
pub use pins::PinMapping;
pub use transaction::Transaction;

bitflags! {
    /// Static capability flags of one physical controller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        /// Has a fixed-size hardware transmit/receive window.
        const HARDWARE_WINDOW = 1;
        /// Has a descriptor-chained DMA engine.
        const DMA = 1 << 1;
        /// Can raise a transfer-complete interrupt.
        const ASYNC = 1 << 2;
    }
}

/// Transmit-first bit of each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

/// Clock idle polarity and sampling edge (CPOL/CPHA).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

impl Mode {
    /// Clock level between transactions.
    pub fn idle_high(self) -> bool {
        matches!(self, Mode::Mode2 | Mode::Mode3)
    }

    /// Data is latched on the second clock edge instead of the first.
    pub fn sample_second_edge(self) -> bool {
        matches!(self, Mode::Mode1 | Mode::Mode3)
    }
}

/// Register access for one physical controller.
///
/// Implementations are per target family and own the exact bit layout; the
/// core only expresses intent. All methods are infallible: a controller that
/// cannot honor them is a miswired build, which the core reports through the
/// board beacon before ever reaching this trait.
pub trait Instance: Sync {
    /// Put the controller into its power-on state.
    fn reset(&self);
    /// Gate the module clock on or off.
    fn gate_clock(&self, enabled: bool);
    /// Apply synthesized divider fields to the clock register.
    fn set_divider(&self, divider: &ClockDivider);
    /// Apply clock polarity and phase.
    fn set_mode(&self, mode: Mode);
    /// Copy packed words into the transmit window and latch the frame
    /// length. `bits` never exceeds the family's window capacity.
    fn load_window(&self, words: &[u32], bits: u32);
    /// Copy the receive window out after a completed transfer.
    fn store_window(&self, words: &mut [u32]);
    /// Start the latched transfer.
    fn start(&self);
    /// Transfer-in-progress flag.
    fn busy(&self) -> bool;
    /// Enable or disable the transfer-complete interrupt.
    fn set_irq_enabled(&self, enabled: bool);
    /// Acknowledge the transfer-complete flag. Returns `false` when the flag
    /// was not pending, in which case the interrupt was not ours.
    fn take_irq(&self) -> bool;
    /// Reset the DMA channel serving this controller and point it at the
    /// controller's data register.
    fn dma_reset(&self);
    /// Hand a descriptor chain head to the DMA engine and start it.
    fn dma_start(&self, head: *const Descriptor, bits: u32);
    /// DMA round-trip still in flight.
    fn dma_busy(&self) -> bool;
}

/// Fixed fast-routing pin set of one controller.
///
/// These are hardware facts: the pins with a dedicated fixed-function path
/// to the controller's signals. Any other pin reaches the controller through
/// the slower any-pin matrix.
#[derive(Debug, Clone, Copy)]
pub struct FastRouting {
    pub bus: u8,
    pub sclk: u8,
    pub miso: u8,
    pub mosi: u8,
    pub cs: u8,
}

/// Const per-family configuration injected into the resolver and engines.
///
/// One value of this struct describes a target family; it is data, not code,
/// so a single build of the core serves every family.
#[derive(Debug, Clone, Copy)]
pub struct FamilyConfig {
    /// Peripheral base clock feeding the dividers.
    pub base_clock_hz: u32,
    /// Width of the counter / phase register fields.
    pub divider_counter_bits: u32,
    /// Width of the pre-divider register field.
    pub divider_prescale_bits: u32,
    /// Hardware window capacity in bytes; the packing scratch caps this
    /// at 64.
    pub window_bytes: usize,
    /// Per-descriptor payload ceiling of the DMA engine.
    pub max_descriptor_bytes: usize,
    /// Payloads at or below this length skip DMA setup entirely.
    pub dma_threshold: usize,
    /// How many buses the hardware can have configured at once.
    pub max_open_buses: u32,
    /// Bus index used when no requested pin selects one.
    pub default_bus: u8,
    /// Fast-routing pin sets, one entry per routable controller.
    pub fast_routing: &'static [FastRouting],
}

/// Requested pin assignment for [`configure`]. `None` means "no preference":
/// all-`None` resolves to the default bus's complete fast-routing set.
#[derive(Debug, Default, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PinRequest {
    pub sclk: Option<u8>,
    pub miso: Option<u8>,
    pub mosi: Option<u8>,
    pub cs: Option<u8>,
}

impl PinRequest {
    pub fn is_empty(&self) -> bool {
        self.sclk.is_none() && self.miso.is_none() && self.mosi.is_none() && self.cs.is_none()
    }
}

/// Process-wide handle for one physical controller.
pub struct Bus {
    pub(crate) index: u8,
    pub(crate) caps: Capabilities,
    pub(crate) instance: &'static dyn Instance,
    pub(crate) config: &'static FamilyConfig,
    pub(crate) board: Board,
    /// Transaction scope claim; configure/close pairs nest 1:1 per bus.
    pub(crate) claimed: AtomicBool,
    pub(crate) slot: asynch::AsyncSlot,
    pub(crate) pool: dma::DescriptorPool,
}

impl Bus {
    /// Create the handle for one controller. Call once per controller and
    /// store the result in a `static`; the DMA descriptor pool lives inside
    /// the handle, so boards with DMA address-range rules place the `static`
    /// accordingly. `index` doubles as a bit position in the configured-bus
    /// mask and must stay below 32.
    pub const fn new(
        index: u8,
        caps: Capabilities,
        instance: &'static dyn Instance,
        config: &'static FamilyConfig,
        board: Board,
    ) -> Self {
        Self {
            index,
            caps,
            instance,
            config,
            board,
            claimed: AtomicBool::new(false),
            slot: asynch::AsyncSlot::new(),
            pool: dma::DescriptorPool::new(),
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }
}

/// One interrupt-table entry to install at [`begin`] time.
///
/// The handler is a board-written shim that calls [`interrupt_handler`] with
/// its bus, e.g. `unsafe fn spi2_irq() { spi::interrupt_handler(&BUS2) }`.
#[derive(Clone, Copy)]
pub struct IrqBinding {
    pub source: u16,
    pub handler: unsafe fn(),
}

/// One-time process init: reset every controller, gate its clock off, and
/// install the completion-interrupt bindings.
pub fn begin(
    buses: &[&'static Bus],
    bindings: &[IrqBinding],
    interrupts: &dyn crate::board::InterruptTable,
) {
    for bus in buses {
        bus.instance.reset();
        bus.instance.gate_clock(false);
    }
    for binding in bindings {
        interrupts.install(binding.source, binding.handler);
    }
}

/// Open a transaction scope, resolving the bus from the requested pins.
///
/// `buses` must hold every controller registered at [`begin`]; resolving to
/// a controller that is not in the list is a fatal configuration fault.
pub fn configure(
    buses: &[&'static Bus],
    max_freq_hz: u32,
    request: PinRequest,
) -> Transaction {
    let config = buses[0].config;
    let index = pins::select_bus(config, &request);
    match buses.iter().find(|bus| bus.index == index) {
        Some(bus) => bus.configure(max_freq_hz, request),
        None => buses[0].board.beacon.fatal(crate::board::Fault::NoSuchBus),
    }
}
