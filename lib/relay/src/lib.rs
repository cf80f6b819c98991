//! `relay` is a user-space L4 port forwarder: it accepts TCP and UDP
//! traffic on configured endpoints and shuttles bytes to a configured
//! target until either side closes or the tunnel times out. One reactor
//! thread owns every socket; a shared packet arena backs all in-flight
//! data.

pub mod config;
pub mod logging;
pub mod net;
pub mod stats;
