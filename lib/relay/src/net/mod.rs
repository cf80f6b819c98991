//! The forwarding data plane: packet arena, timers, tunnel state machine,
//! per-protocol services, and the reactor that drives them all.

pub mod arena;
pub mod shared;
pub mod slab;
pub mod timer;
pub mod target;
pub mod tunnel;
pub mod tcp;
pub mod udp;
pub mod reactor;
