//! Helper-process half of the remote plugin proxy: opcode dispatch against
//! a [`rplugin_plugin::HostedPlugin`], the watchdog that guards the
//! realtime dispatch thread, and the drop-oldest parameter notification
//! ring bound for the host's UI side channel.

pub mod endpoint;
pub mod notify;
pub mod watchdog;

pub use endpoint::{ControlDispatcher, RingDispatcher, ServerEndpoint};
pub use notify::NotifyRing;
pub use watchdog::{raise_to_realtime_priority, Heartbeat, RING_DISPATCH_SCHED_PRIORITY};
