//! Board-provided primitives the transport consumes.
//!
//! The transport never touches pin-mode registers, delay timers, the vector
//! table, or the diagnostic signaling hardware directly; a board hands in one
//! `static` implementation of each trait here. All receivers are `&self`
//! because the implementations are shared statics that are also reached from
//! interrupt context.

/// Pin direction installed by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Input,
    Output,
}

/// The four signal roles a resolved pin can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinRole {
    Sclk,
    Miso,
    Mosi,
    Cs,
}

/// Pin-mode and pin-routing primitives.
///
/// `route_fixed` attaches a pin to a controller signal through the fast
/// fixed-function path; `route_matrix` goes through the any-pin crossbar.
/// The resolver decides which one applies, the board only executes it.
pub trait Gpio: Sync {
    fn set_direction(&self, pin: u8, direction: Direction);
    fn write_level(&self, pin: u8, high: bool);
    fn read_level(&self, pin: u8) -> bool;
    fn route_fixed(&self, pin: u8, bus: u8, role: PinRole);
    fn route_matrix(&self, pin: u8, bus: u8, role: PinRole);
    /// Detach `pin` from whatever controller signal it was routed to.
    fn unroute(&self, pin: u8);
}

/// Busy-delay primitive for the software-timed transfer path.
pub trait Delay: Sync {
    fn delay_us(&self, us: u32);
}

/// Vectored interrupt registration.
///
/// Mirrors a static interrupt descriptor table: the board maps an interrupt
/// `source` number to a handler function. Handlers are `unsafe fn()` because
/// they must only ever run from the interrupt entry path.
pub trait InterruptTable: Sync {
    fn install(&self, source: u16, handler: unsafe fn());
}

/// Unrecoverable configuration faults.
///
/// None of these have a runtime recovery path: the firmware was built or
/// wired for hardware it does not have. They are signaled, not returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fault {
    /// More concurrently configured buses than the hardware has.
    BusLimit,
    /// A bus was configured again before the previous scope closed.
    BusBusy,
    /// The requested pins resolve to a controller that is not registered.
    NoSuchBus,
    /// The operation needs a capability this controller does not have.
    Unsupported,
    /// An asynchronous transfer was started while another was in flight.
    AsyncConflict,
    /// Asked to reverse pin routing that was already torn down.
    Teardown,
}

/// Diagnostic beacon for fatal faults.
///
/// Production implementations signal the code (beeper, LED pattern) and halt
/// in an infinite loop; a misconfigured build must never silently proceed.
/// The test implementation panics instead so faults stay assertable.
pub trait Beacon: Sync {
    fn fatal(&self, fault: Fault) -> !;
}

/// The collaborator set a [`crate::spi::Bus`] carries.
#[derive(Clone, Copy)]
pub struct Board {
    pub gpio: &'static dyn Gpio,
    pub delay: &'static dyn Delay,
    pub beacon: &'static dyn Beacon,
}
