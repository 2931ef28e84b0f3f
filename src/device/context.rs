//! Per-guest transient device state
//!
//! Each device carries a context matching the guest it is attached to.
//! The started/stopped axis is driven by a state machine; link state and
//! IPv6 state are plain fields updated independently of it.

use std::fmt;

use state_machines::state_machine;

use crate::guest::GuestType;

/// Routing table id reported while no IPv6 state is set
pub const INVALID_TABLE_ID: i32 = -1;

state_machine! {
    name: DeviceMachine,
    dynamic: true,
    initial: NotStarted,
    states: [NotStarted, Started],
    events {
        start {
            transition: { from: NotStarted, to: Started }
        }
        stop {
            transition: { from: Started, to: NotStarted }
        }
    }
}

/// Start/stop lifecycle shared by every context variant
pub struct Lifecycle {
    machine: DynamicDeviceMachine<()>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            machine: DeviceMachine::new(()).into_dynamic(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.machine.current_state() == "Started"
    }

    /// Move to the requested state, returning whether anything changed
    pub fn set_started(&mut self, started: bool) -> bool {
        if self.is_started() == started {
            return false;
        }
        let event = if started {
            DeviceMachineEvent::Start
        } else {
            DeviceMachineEvent::Stop
        };
        self.machine.handle(event).is_ok()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.machine.current_state())
            .finish()
    }
}

/// Context for ARC container devices
#[derive(Debug, Default)]
pub struct ArcContext {
    lifecycle: Lifecycle,
    link_up: bool,
    /// Routing table id, present only while IPv6 is configured
    routing_table: Option<i32>,
    routing_table_attempts: u32,
}

impl ArcContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.lifecycle.is_started()
    }

    pub fn set_started(&mut self, started: bool) -> bool {
        self.lifecycle.set_started(started)
    }

    /// Guest-side link state as last reported by netlink
    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    /// Record the guest-side link state, returning whether it changed
    pub fn set_link_up(&mut self, link_up: bool) -> bool {
        let changed = self.link_up != link_up;
        self.link_up = link_up;
        changed
    }

    pub fn has_ipv6(&self) -> bool {
        self.routing_table.is_some()
    }

    /// Routing table id, or [`INVALID_TABLE_ID`] without IPv6
    pub fn routing_table_id(&self) -> i32 {
        self.routing_table.unwrap_or(INVALID_TABLE_ID)
    }

    /// Return the attempt count so far and count one more attempt
    pub fn routing_table_attempts(&mut self) -> u32 {
        let attempts = self.routing_table_attempts;
        self.routing_table_attempts = attempts.saturating_add(1);
        attempts
    }

    /// Attempt count without recording a new attempt
    pub fn attempts_made(&self) -> u32 {
        self.routing_table_attempts
    }

    /// Mark IPv6 as configured on `table_id`
    ///
    /// Negative ids are rejected and leave the context untouched.
    pub fn set_has_ipv6(&mut self, table_id: i32) -> bool {
        if table_id < 0 {
            return false;
        }
        self.routing_table = Some(table_id);
        true
    }

    /// Drop IPv6 state; the table id goes back to [`INVALID_TABLE_ID`]
    pub fn clear_ipv6(&mut self) {
        self.routing_table = None;
    }

    /// Back to the unstarted state with the link down and no IPv6
    ///
    /// The attempt counter keeps counting across restarts.
    pub fn reset(&mut self) {
        self.lifecycle.set_started(false);
        self.link_up = false;
        self.clear_ipv6();
    }
}

/// Context for devices of VM guests, attached through a TAP
#[derive(Debug, Default)]
pub struct VmContext {
    lifecycle: Lifecycle,
}

impl VmContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.lifecycle.is_started()
    }

    pub fn set_started(&mut self, started: bool) -> bool {
        self.lifecycle.set_started(started)
    }
}

/// Guest-specific device state, chosen when the device is built
#[derive(Debug)]
pub enum Context {
    Arc(ArcContext),
    Vm(VmContext),
}

impl Context {
    /// Context variant for devices of the given guest
    pub fn for_guest(guest: GuestType) -> Self {
        if guest.is_vm() {
            Context::Vm(VmContext::new())
        } else {
            Context::Arc(ArcContext::new())
        }
    }

    pub fn is_started(&self) -> bool {
        match self {
            Context::Arc(ctx) => ctx.is_started(),
            Context::Vm(ctx) => ctx.is_started(),
        }
    }

    pub fn set_started(&mut self, started: bool) -> bool {
        match self {
            Context::Arc(ctx) => ctx.set_started(started),
            Context::Vm(ctx) => ctx.set_started(started),
        }
    }

    pub fn as_arc(&self) -> Option<&ArcContext> {
        match self {
            Context::Arc(ctx) => Some(ctx),
            Context::Vm(_) => None,
        }
    }

    pub fn as_arc_mut(&mut self) -> Option<&mut ArcContext> {
        match self {
            Context::Arc(ctx) => Some(ctx),
            Context::Vm(_) => None,
        }
    }
}
