use crate::net::arena::{PacketArena, PacketBlock};
use crate::net::shared::{interest, Direction, NetworkResult};
use crate::net::timer::{EntryId, TimeoutClass};
use mio::net::TcpStream;
use mio::{PollOpt, Token};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};

/// Lifecycle of a tunnel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TunnelState {
    Closed,
    Allocated,
    Initialized,
    Connect,
    Established,
    Broken,
}

/// Legal transitions, indexed `[from][to]`. Staying in place is always
/// allowed; everything else is a programming error.
#[rustfmt::skip]
const LEGAL: [[bool; 6]; 6] = [
    // to: Closed Alloc  Init   Conn   Estab  Broken
    [true,  true,  false, false, false, false], // Closed
    [false, true,  true,  false, false, false], // Allocated
    [false, false, true,  true,  false, true ], // Initialized
    [false, false, false, true,  true,  true ], // Connect
    [false, false, false, false, true,  true ], // Established
    [true,  false, false, false, false, true ], // Broken
];

impl TunnelState {
    #[inline]
    fn index(self) -> usize {
        match self {
            TunnelState::Closed => 0,
            TunnelState::Allocated => 1,
            TunnelState::Initialized => 2,
            TunnelState::Connect => 3,
            TunnelState::Established => 4,
            TunnelState::Broken => 5,
        }
    }

    #[inline]
    pub fn label(self) -> &'static str {
        match self {
            TunnelState::Closed => "closed",
            TunnelState::Allocated => "allocated",
            TunnelState::Initialized => "initialized",
            TunnelState::Connect => "connect",
            TunnelState::Established => "established",
            TunnelState::Broken => "broken",
        }
    }
}

/// Checks a state transition against the legality table and returns the new
/// state. Panics on an illegal transition.
#[inline]
pub fn transition(from: TunnelState, to: TunnelState) -> TunnelState {
    if !LEGAL[from.index()][to.index()] {
        panic!(
            "illegal tunnel state transition: {} -> {}",
            from.label(),
            to.label()
        );
    }
    to
}

/// Membership of a tunnel in one of its service's timer lists.
#[derive(Debug, Copy, Clone)]
pub struct TimerEntry {
    pub class: TimeoutClass,
    pub id: EntryId,
}

/// One side of a TCP tunnel: a non-blocking stream plus its send queue.
///
/// The queue is the only owner of its blocks and `queued_bytes` is kept
/// exactly equal to the unsent bytes across them. Receive-side EOF
/// (`rx_closed`) is tracked separately from `valid`, which only a fatal
/// socket error clears: a half-closed peer can still be sent to.
pub struct Endpoint {
    pub direction: Direction,
    stream: Option<TcpStream>,
    pub remote: Option<SocketAddr>,
    pub valid: bool,
    pub stop_recv: bool,
    pub rx_closed: bool,
    /// Peer EOF must be forwarded with a write shutdown once the queue
    /// drains.
    pub shutdown_pending: bool,
    pub shutdown_done: bool,
    registered: bool,
    queue: VecDeque<PacketBlock>,
    queued_bytes: usize,
}

impl Endpoint {
    pub fn new(direction: Direction) -> Endpoint {
        Endpoint {
            direction,
            stream: None,
            remote: None,
            valid: false,
            stop_recv: false,
            rx_closed: false,
            shutdown_pending: false,
            shutdown_done: false,
            registered: false,
            queue: VecDeque::new(),
            queued_bytes: 0,
        }
    }

    /// Binds the endpoint to a live stream.
    pub fn attach(&mut self, stream: TcpStream, remote: SocketAddr) {
        assert!(self.stream.is_none(), "endpoint already holds a stream");

        self.stream = Some(stream);
        self.remote = Some(remote);
        self.valid = true;
    }

    #[inline]
    pub fn stream(&self) -> &TcpStream {
        self.stream.as_ref().expect("endpoint must hold a stream")
    }

    #[inline]
    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    #[inline]
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    #[inline]
    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Appends a block to the send queue.
    #[inline]
    pub fn push_block(&mut self, block: PacketBlock) {
        self.queued_bytes += block.remaining();
        self.queue.push_back(block);
    }

    /// Returns every queued block to the arena.
    pub fn drain_queue(&mut self, arena: &mut PacketArena) {
        for block in self.queue.drain(..) {
            arena.release(block);
        }
        self.queued_bytes = 0;
    }

    pub fn register(
        &mut self,
        poll: &mio::Poll,
        token: Token,
        read: bool,
        write: bool,
    ) -> NetworkResult<()> {
        poll.register(self.stream(), token, interest(read, write), PollOpt::edge())?;
        self.registered = true;
        Ok(())
    }

    pub fn reregister(
        &mut self,
        poll: &mio::Poll,
        token: Token,
        read: bool,
        write: bool,
    ) -> NetworkResult<()> {
        poll.reregister(self.stream(), token, interest(read, write), PollOpt::edge())?;
        Ok(())
    }

    /// Deregisters from the poller. Must precede dropping the stream so a
    /// late event cannot refer to a closed descriptor.
    pub fn deregister(&mut self, poll: &mio::Poll) {
        if self.registered {
            if let Some(stream) = self.stream.as_ref() {
                let _ = poll.deregister(stream);
            }
            self.registered = false;
        }
    }

    /// Sends queued blocks until the socket would block, the queue runs dry,
    /// or the send fails. Fully sent blocks go back to the arena. A drained
    /// queue also forwards a pending peer EOF as a write shutdown.
    pub fn flush(&mut self, arena: &mut PacketArena) -> FlushOutcome {
        let mut outcome = FlushOutcome {
            sent: 0,
            released: false,
            error: None,
        };

        let mut stream = self.stream.as_ref().expect("endpoint must hold a stream");

        loop {
            let block = match self.queue.front_mut() {
                Some(block) => block,
                None => break,
            };

            match stream.write(arena.pending(block)) {
                Ok(0) => {
                    outcome.error = Some(io::ErrorKind::WriteZero.into());
                    break;
                }
                Ok(count) => {
                    block.advance(count);
                    self.queued_bytes -= count;
                    outcome.sent += count;

                    if block.is_sent() {
                        let done = self.queue.pop_front().expect("queue has a head block");
                        arena.release(done);
                        outcome.released = true;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    outcome.error = Some(err);
                    break;
                }
            }
        }

        if outcome.error.is_none() && self.queue.is_empty() {
            self.forward_shutdown();
        }

        outcome
    }

    /// Propagates a peer EOF once the queue has drained: the wire sees the
    /// same FIN ordering the client produced.
    pub fn forward_shutdown(&mut self) {
        if self.shutdown_pending && !self.shutdown_done && self.valid && self.queue.is_empty() {
            if let Some(stream) = self.stream.as_ref() {
                let _ = stream.shutdown(Shutdown::Write);
            }
            self.shutdown_done = true;
        }
    }
}

/// Result of draining an endpoint's send queue.
pub struct FlushOutcome {
    pub sent: usize,
    pub released: bool,
    pub error: Option<io::Error>,
}

/// A bound pair of endpoints with shared state. The tunnel owns both
/// endpoints; everything else refers to them through registry handles.
pub struct Tunnel {
    pub state: TunnelState,
    pub south: Endpoint,
    pub north: Endpoint,
    pub timer: Option<TimerEntry>,
}

impl Tunnel {
    pub fn new() -> Tunnel {
        Tunnel {
            state: TunnelState::Closed,
            south: Endpoint::new(Direction::South),
            north: Endpoint::new(Direction::North),
            timer: None,
        }
    }

    /// Moves the tunnel to `next`, asserting the transition is legal.
    #[inline]
    pub fn set_state(&mut self, next: TunnelState) {
        self.state = transition(self.state, next);
    }

    #[inline]
    pub fn endpoint(&self, direction: Direction) -> &Endpoint {
        match direction {
            Direction::North => &self.north,
            Direction::South => &self.south,
        }
    }

    #[inline]
    pub fn endpoint_mut(&mut self, direction: Direction) -> &mut Endpoint {
        match direction {
            Direction::North => &mut self.north,
            Direction::South => &mut self.south,
        }
    }

    /// The endpoint for `direction` and its peer, both mutable.
    #[inline]
    pub fn pair_mut(&mut self, direction: Direction) -> (&mut Endpoint, &mut Endpoint) {
        match direction {
            Direction::North => (&mut self.north, &mut self.south),
            Direction::South => (&mut self.south, &mut self.north),
        }
    }

    /// True once both directions have seen EOF from their peers.
    #[inline]
    pub fn both_rx_closed(&self) -> bool {
        self.south.rx_closed && self.north.rx_closed
    }

    /// Teardown gate for BROKEN tunnels: each side must be either dead or
    /// fully flushed.
    #[inline]
    pub fn drained(&self) -> bool {
        (!self.north.valid || !self.north.has_queued())
            && (!self.south.valid || !self.south.has_queued())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_lifecycle_is_legal() {
        let mut tunnel = Tunnel::new();

        tunnel.set_state(TunnelState::Allocated);
        tunnel.set_state(TunnelState::Initialized);
        tunnel.set_state(TunnelState::Connect);
        tunnel.set_state(TunnelState::Established);
        tunnel.set_state(TunnelState::Broken);
        tunnel.set_state(TunnelState::Closed);
    }

    #[test]
    fn test_self_transitions_are_legal() {
        for state in &[
            TunnelState::Closed,
            TunnelState::Allocated,
            TunnelState::Initialized,
            TunnelState::Connect,
            TunnelState::Established,
            TunnelState::Broken,
        ] {
            assert_eq!(transition(*state, *state), *state);
        }
    }

    #[test]
    #[should_panic(expected = "illegal tunnel state transition")]
    fn test_established_cannot_regress_to_connect() {
        transition(TunnelState::Established, TunnelState::Connect);
    }

    #[test]
    #[should_panic(expected = "illegal tunnel state transition")]
    fn test_closed_cannot_jump_to_established() {
        transition(TunnelState::Closed, TunnelState::Established);
    }

    #[test]
    #[should_panic(expected = "illegal tunnel state transition")]
    fn test_initialized_cannot_close_directly() {
        transition(TunnelState::Initialized, TunnelState::Closed);
    }

    #[test]
    fn test_drained_gate() {
        use crate::stats::ArenaGauges;
        use std::sync::Arc;

        let mut arena = PacketArena::new(4096, Arc::new(ArenaGauges::new()));
        let mut tunnel = Tunnel::new();

        // Fresh endpoints are invalid with empty queues.
        assert!(tunnel.drained());

        tunnel.north.valid = true;
        tunnel.south.valid = true;
        assert!(tunnel.drained());

        arena.reserve(10).unwrap();
        tunnel.north.push_block(arena.commit(10));
        assert_eq!(tunnel.north.queued_bytes(), 10);
        assert!(!tunnel.drained());

        tunnel.north.valid = false;
        assert!(tunnel.drained());

        tunnel.north.drain_queue(&mut arena);
        assert_eq!(tunnel.north.queued_bytes(), 0);
        assert_eq!(arena.in_use_blocks(), 0);
    }
}
