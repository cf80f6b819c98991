//! End-to-end forwarding scenarios over loopback: a real reactor thread,
//! std-socket clients and targets.

use relay::config::{ServiceSpec, Timeouts, Tuning};
use relay::logging;
use relay::net::reactor::Reactor;
use relay::net::shared::Protocol;
use relay::stats::{ArenaGauges, ServiceStats};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Forwarder {
    addrs: Vec<SocketAddr>,
    stats: Vec<Arc<ServiceStats>>,
    gauges: Arc<ArenaGauges>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Forwarder {
    fn start(specs: Vec<ServiceSpec>, tuning: Tuning) -> Forwarder {
        let stats: Vec<Arc<ServiceStats>> = specs
            .iter()
            .map(|spec| ServiceStats::new(spec.label.clone(), spec.protocol))
            .collect();
        let gauges = Arc::new(ArenaGauges::new());
        let stop = Arc::new(AtomicBool::new(false));

        let mut reactor = Reactor::new(
            &specs,
            &tuning,
            &stats,
            gauges.clone(),
            stop.clone(),
            logging::discard(),
        )
        .expect("reactor setup failed");

        let addrs = reactor.local_addrs();
        let thread = thread::spawn(move || {
            reactor.run().expect("reactor failed");
        });

        Forwarder {
            addrs,
            stats,
            gauges,
            stop,
            thread: Some(thread),
        }
    }

    fn active_tunnels(&self, service: usize) -> u64 {
        self.stats[service].active_tunnels.load(Ordering::Relaxed)
    }

    fn arena_in_use(&self) -> u64 {
        self.gauges.in_use_bytes.load(Ordering::Relaxed)
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn tuning() -> Tuning {
    Tuning {
        timeouts: Timeouts {
            connect: Duration::from_secs(5),
            established: Duration::from_secs(60),
            broken: Duration::from_secs(5),
            idle: Duration::from_secs(60),
        },
        arena_bytes: 4 * 1024 * 1024,
        session_limit: 1024 * 1024,
    }
}

fn spec(protocol: Protocol, target: SocketAddr) -> ServiceSpec {
    ServiceSpec {
        protocol,
        listen: "127.0.0.1:0".parse().unwrap(),
        targets: vec![target],
        label: format!("test-{}", protocol),
    }
}

fn wait_until<F: Fn() -> bool>(limit: Duration, cond: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

/// Echo server that serves connections until the test process exits.
fn start_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        while let Ok((mut conn, _)) = listener.accept() {
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match conn.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(count) => {
                            if conn.write_all(&buf[..count]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn test_tcp_echo_roundtrip() {
    let echo = start_tcp_echo();
    let forwarder = Forwarder::start(vec![spec(Protocol::Tcp, echo)], tuning());

    let mut client = TcpStream::connect(forwarder.addrs[0]).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    client.write_all(b"PING\n").unwrap();

    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"PING\n");

    drop(client);

    // The tunnel unwinds and every block returns to the arena.
    assert!(wait_until(Duration::from_secs(5), || {
        forwarder.active_tunnels(0) == 0
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        forwarder.arena_in_use() == 0
    }));
}

#[test]
fn test_tcp_half_close_flushes_response() {
    const UPLOAD: usize = 1 << 20;
    const RESPONSE: usize = 1 << 19;

    // Target that consumes the whole upload, answers, then closes.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let target = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();

        let mut total = 0usize;
        let mut buf = [0u8; 8192];
        loop {
            match conn.read(&mut buf) {
                Ok(0) => break,
                Ok(count) => total += count,
                Err(err) => panic!("target read failed: {}", err),
            }
        }
        assert_eq!(total, UPLOAD);

        conn.write_all(&patterned(RESPONSE)).unwrap();
    });

    let forwarder = Forwarder::start(vec![spec(Protocol::Tcp, target)], tuning());

    let mut client = TcpStream::connect(forwarder.addrs[0]).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    client.write_all(&patterned(UPLOAD)).unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    // The EOF reaches the target only through the forwarder; the response
    // must come back complete before the tunnel closes.
    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    assert_eq!(response.len(), RESPONSE);
    assert_eq!(response, patterned(RESPONSE));

    assert!(wait_until(Duration::from_secs(5), || {
        forwarder.active_tunnels(0) == 0 && forwarder.arena_in_use() == 0
    }));
}

#[test]
fn test_tcp_connect_failure_closes_client_and_accept_survives() {
    // A port with nothing listening behind it.
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let forwarder = Forwarder::start(vec![spec(Protocol::Tcp, dead)], tuning());

    for _ in 0..2 {
        let mut client = TcpStream::connect(forwarder.addrs[0]).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut buf = [0u8; 1];
        match client.read(&mut buf) {
            Ok(0) => {}
            Ok(_) => panic!("unexpected data from a dead target"),
            Err(err) => assert!(
                err.kind() == ErrorKind::ConnectionReset || err.kind() == ErrorKind::WouldBlock,
                "unexpected error: {}",
                err
            ),
        }
    }

    assert!(wait_until(Duration::from_secs(5), || {
        forwarder.active_tunnels(0) == 0
    }));
    assert!(forwarder.stats[0].accepted.load(Ordering::Relaxed) >= 2);
}

#[test]
fn test_tcp_slow_consumer_backpressures_without_starving_others() {
    const CHUNK: usize = 16 * 1024;

    // Target A accepts and never reads; target B echoes.
    let frozen_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let frozen = frozen_listener.local_addr().unwrap();
    thread::spawn(move || {
        let conns: Vec<_> = frozen_listener.incoming().take(1).collect();
        thread::sleep(Duration::from_secs(60));
        drop(conns);
    });

    let echo = start_tcp_echo();

    let mut tuning = tuning();
    tuning.arena_bytes = 256 * 1024;
    tuning.session_limit = 64 * 1024;

    let forwarder = Forwarder::start(
        vec![spec(Protocol::Tcp, frozen), spec(Protocol::Tcp, echo)],
        tuning,
    );

    // Fill flow A until back-pressure stalls the writes.
    let stalled = TcpStream::connect(forwarder.addrs[0]).unwrap();
    stalled.set_nonblocking(true).unwrap();
    let payload = patterned(CHUNK);
    let mut wrote = 0usize;
    let mut blocked_rounds = 0;
    while blocked_rounds < 20 {
        match (&stalled).write(&payload) {
            Ok(count) => {
                wrote += count;
                blocked_rounds = 0;
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                blocked_rounds += 1;
                thread::sleep(Duration::from_millis(20));
            }
            Err(err) => panic!("write failed: {}", err),
        }
        // Safety valve: back-pressure must kick in long before this.
        assert!(wrote < 64 * 1024 * 1024, "writes never blocked");
    }

    // Flow B still makes progress at full payload integrity.
    let mut client = TcpStream::connect(forwarder.addrs[1]).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    for _ in 0..4 {
        let sent = patterned(CHUNK);
        client.write_all(&sent).unwrap();

        let mut reply = vec![0u8; CHUNK];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, sent);
    }
}

/// Echo target for datagrams, one reply per request.
fn start_udp_echo() -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = sock.local_addr().unwrap();

    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while let Ok((count, peer)) = sock.recv_from(&mut buf) {
            if sock.send_to(&buf[..count], peer).is_err() {
                break;
            }
        }
    });

    addr
}

#[test]
fn test_udp_ping_pong_two_sources() {
    let echo = start_udp_echo();
    let forwarder = Forwarder::start(vec![spec(Protocol::Udp, echo)], tuning());
    let service = forwarder.addrs[0];

    let first = UdpSocket::bind("127.0.0.1:0").unwrap();
    first
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let second = UdpSocket::bind("127.0.0.1:0").unwrap();
    second
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    first.send_to(b"alpha", service).unwrap();
    let mut buf = [0u8; 64];
    let (count, from) = first.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..count], b"alpha");
    assert_eq!(from, service);

    // A second source gets its own flow and its own reply path.
    second.send_to(b"beta", service).unwrap();
    let (count, from) = second.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..count], b"beta");
    assert_eq!(from, service);

    assert!(wait_until(Duration::from_secs(5), || {
        forwarder.active_tunnels(0) == 2
    }));

    // Replies stay per-source under interleaving.
    first.send_to(b"alpha-2", service).unwrap();
    second.send_to(b"beta-2", service).unwrap();
    let (count, _) = first.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..count], b"alpha-2");
    let (count, _) = second.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..count], b"beta-2");
}

#[test]
fn test_udp_idle_flow_is_reaped() {
    let echo = start_udp_echo();

    let mut tuning = tuning();
    tuning.timeouts.idle = Duration::from_secs(1);

    let forwarder = Forwarder::start(vec![spec(Protocol::Udp, echo)], tuning);
    let service = forwarder.addrs[0];

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    client.send_to(b"ping", service).unwrap();
    let mut buf = [0u8; 64];
    let (count, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..count], b"ping");

    assert!(wait_until(Duration::from_secs(2), || {
        forwarder.active_tunnels(0) == 1
    }));

    // No further traffic: the flow must be reaped and its memory returned.
    assert!(wait_until(Duration::from_secs(8), || {
        forwarder.active_tunnels(0) == 0
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        forwarder.arena_in_use() == 0
    }));

    // A fresh datagram builds a fresh flow.
    client.send_to(b"again", service).unwrap();
    let (count, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..count], b"again");
}
