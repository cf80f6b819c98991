use crate::net::slab::Handle;
use mio::unix::UnixReady;
use mio::{Ready, Token};
use std::fmt;
use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    PeerClosed,
    ConnectFailed,
    Exhausted,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetworkError::Wait => write!(f, "operation would block"),
            NetworkError::Fatal(err) => write!(f, "fatal network error: {:?}", err),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Which peer an endpoint faces: north is the configured target, south the
/// initiating client.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Direction {
    North,
    South,
}

impl Direction {
    #[inline]
    pub fn opposite(self) -> Direction {
        match self {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::North => write!(f, "north"),
            Direction::South => write!(f, "south"),
        }
    }
}

// Token layout, low to high: tunnel index (24 bits, all-ones marks the
// service listener), direction (1 bit), service index (8 bits), slot
// generation (30 bits).
const IDX_MASK: usize = 0x00ff_ffff;
const LISTENER_IDX: usize = IDX_MASK;
const DIR_BIT: usize = 1 << 24;
const SVC_SHIFT: usize = 25;
const SVC_MASK: usize = 0xff;
const GEN_SHIFT: usize = 33;

/// Generation counters wrap below this bound so a full generation always
/// survives the round-trip through a poller token.
pub const GEN_LIMIT: u32 = 1 << 30;

/// Upper bound on the number of services one reactor can own.
pub const MAX_SERVICES: usize = SVC_MASK + 1;

/// Identity of the socket behind a poller event. Packed into a `mio::Token`
/// on registration and unpacked on dispatch; the embedded generation is
/// validated against the tunnel registry before any state is touched.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EndpointKey {
    pub service: usize,
    pub target: EventTarget,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventTarget {
    /// The service's own listening/bound socket.
    Listener,
    /// One side of a tunnel.
    Endpoint { tunnel: Handle, direction: Direction },
}

impl EndpointKey {
    #[inline]
    pub fn listener(service: usize) -> EndpointKey {
        EndpointKey {
            service,
            target: EventTarget::Listener,
        }
    }

    #[inline]
    pub fn endpoint(service: usize, tunnel: Handle, direction: Direction) -> EndpointKey {
        EndpointKey {
            service,
            target: EventTarget::Endpoint { tunnel, direction },
        }
    }

    pub fn token(&self) -> Token {
        debug_assert!(self.service <= SVC_MASK);

        let bits = match self.target {
            EventTarget::Listener => LISTENER_IDX,
            EventTarget::Endpoint { tunnel, direction } => {
                debug_assert!((tunnel.index as usize) < LISTENER_IDX);
                debug_assert!(tunnel.gen < GEN_LIMIT);

                let dir = match direction {
                    Direction::North => DIR_BIT,
                    Direction::South => 0,
                };

                (tunnel.index as usize & IDX_MASK) | dir | ((tunnel.gen as usize) << GEN_SHIFT)
            }
        };

        Token(bits | ((self.service & SVC_MASK) << SVC_SHIFT))
    }

    pub fn from_token(token: Token) -> EndpointKey {
        let bits = token.0;
        let service = (bits >> SVC_SHIFT) & SVC_MASK;
        let index = bits & IDX_MASK;

        if index == LISTENER_IDX {
            return EndpointKey::listener(service);
        }

        let direction = match bits & DIR_BIT {
            0 => Direction::South,
            _ => Direction::North,
        };
        let gen = ((bits >> GEN_SHIFT) as u32) & (GEN_LIMIT - 1);

        EndpointKey::endpoint(
            service,
            Handle {
                index: index as u32,
                gen,
            },
            direction,
        )
    }
}

/// Composes a poller interest set. Hangup interest is always included so
/// half-closed peers surface as events rather than silent stalls.
#[inline]
pub fn interest(read: bool, write: bool) -> Ready {
    let mut ready = Ready::from(UnixReady::hup());

    if read {
        ready |= Ready::readable();
    }
    if write {
        ready |= Ready::writable();
    }

    ready
}

#[inline]
pub fn is_error_event(ready: Ready) -> bool {
    UnixReady::from(ready).is_error()
}

#[inline]
pub fn is_hup_event(ready: Ready) -> bool {
    UnixReady::from(ready).is_hup()
}
