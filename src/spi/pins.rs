//! Pin/bus resolution and reversible routing.
//!
//! Four optional pin requests resolve to one controller: a bus whose fixed
//! fast-routing set contains any requested pin wins, otherwise the family's
//! default bus takes the request through the any-pin matrix. The resolver
//! installs pin direction and routing through the board's [`Gpio`] and
//! records exactly what it installed so `close` can reverse it.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::board::{Direction, Fault, Gpio, PinRole};

use super::{Bus, FamilyConfig, FastRouting, PinRequest};

/// Bitmask of concurrently configured bus indices, process-wide.
static CONFIGURED: AtomicU32 = AtomicU32::new(0);

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    CONFIGURED.store(0, Ordering::SeqCst);
}

/// One installed pin: where it routes and through which path.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct RoutedPin {
    pub(crate) pin: u8,
    pub(crate) fast: bool,
}

/// Resolved routing for one transaction scope.
///
/// Owns the routing state it installed; [`teardown`] reverses it exactly
/// once, and reversing a mapping that is no longer installed is a fatal
/// fault.
pub struct PinMapping {
    pub(crate) bus_index: u8,
    pub(crate) sclk: Option<RoutedPin>,
    pub(crate) miso: Option<RoutedPin>,
    pub(crate) mosi: Option<RoutedPin>,
    pub(crate) cs: Option<u8>,
    pub(crate) installed: bool,
}

impl PinMapping {
    pub fn bus_index(&self) -> u8 {
        self.bus_index
    }

    /// True when at least one role went through the fast fixed-function path.
    pub fn uses_fast_routing(&self) -> bool {
        [self.sclk, self.miso, self.mosi]
            .iter()
            .any(|role| role.is_some_and(|routed| routed.fast))
    }

    pub fn cs_pin(&self) -> Option<u8> {
        self.cs
    }
}

/// Pick the bus index serving `request`: first fast-routing entry containing
/// any requested pin, else the family default.
pub(crate) fn select_bus(config: &FamilyConfig, request: &PinRequest) -> u8 {
    if request.is_empty() {
        return config.default_bus;
    }
    for entry in config.fast_routing {
        if matches_any(entry, request) {
            return entry.bus;
        }
    }
    config.default_bus
}

fn matches_any(entry: &FastRouting, request: &PinRequest) -> bool {
    request.sclk == Some(entry.sclk)
        || request.miso == Some(entry.miso)
        || request.mosi == Some(entry.mosi)
        || request.cs == Some(entry.cs)
}

/// Install direction and routing for `request` on `bus`.
///
/// An all-unset request takes the bus's complete fast-routing set. Exceeding
/// the family's concurrent-bus limit is a fatal configuration fault.
pub(crate) fn install(bus: &Bus, request: PinRequest) -> PinMapping {
    let config = bus.config;
    let beacon = bus.board.beacon;

    let mask = CONFIGURED.fetch_or(1 << bus.index, Ordering::AcqRel) | 1 << bus.index;
    if mask.count_ones() > config.max_open_buses {
        beacon.fatal(Fault::BusLimit);
    }

    let fast = config.fast_routing.iter().find(|entry| entry.bus == bus.index);
    let request = if request.is_empty() {
        match fast {
            Some(entry) => PinRequest {
                sclk: Some(entry.sclk),
                miso: Some(entry.miso),
                mosi: Some(entry.mosi),
                cs: Some(entry.cs),
            },
            // A family whose default bus has no fixed pin set cannot supply
            // a default mapping; the build asked for pins it never named.
            None => beacon.fatal(Fault::NoSuchBus),
        }
    } else {
        request
    };

    let gpio = bus.board.gpio;
    let route = |pin: Option<u8>, role: PinRole, direction: Direction| -> Option<RoutedPin> {
        let pin = pin?;
        let fast_pin = fast.map(|entry| match role {
            PinRole::Sclk => entry.sclk,
            PinRole::Miso => entry.miso,
            PinRole::Mosi => entry.mosi,
            PinRole::Cs => entry.cs,
        });
        let fast = fast_pin == Some(pin);
        gpio.set_direction(pin, direction);
        if fast {
            gpio.route_fixed(pin, bus.index, role);
        } else {
            gpio.route_matrix(pin, bus.index, role);
        }
        Some(RoutedPin { pin, fast })
    };

    let sclk = route(request.sclk, PinRole::Sclk, Direction::Output);
    let miso = route(request.miso, PinRole::Miso, Direction::Input);
    let mosi = route(request.mosi, PinRole::Mosi, Direction::Output);

    // Chip-select stays a plain output under scope-manager control; it is
    // never handed to the controller's own select logic.
    let cs = request.cs;
    if let Some(pin) = cs {
        gpio.set_direction(pin, Direction::Output);
        gpio.write_level(pin, true);
    }

    PinMapping {
        bus_index: bus.index,
        sclk,
        miso,
        mosi,
        cs,
        installed: true,
    }
}

/// Reverse everything [`install`] did for this mapping.
pub(crate) fn teardown(mapping: &mut PinMapping, gpio: &dyn Gpio, bus: &Bus) {
    if !mapping.installed {
        bus.board.beacon.fatal(Fault::Teardown);
    }
    for routed in [mapping.sclk, mapping.miso, mapping.mosi].into_iter().flatten() {
        gpio.unroute(routed.pin);
        gpio.set_direction(routed.pin, Direction::Input);
    }
    if let Some(pin) = mapping.cs {
        gpio.write_level(pin, true);
        gpio.set_direction(pin, Direction::Input);
    }
    CONFIGURED.fetch_and(!(1 << mapping.bus_index), Ordering::AcqRel);
    mapping.installed = false;
}
