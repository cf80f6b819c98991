use crate::config::{ServiceSpec, Tuning};
use crate::logging::{debug, error, info, o, Logger};
use crate::net::arena::PacketArena;
use crate::net::shared::{
    EndpointKey, ErrorType, EventTarget, NetworkError, NetworkResult, Protocol, MAX_SERVICES,
};
use crate::net::tcp::TcpService;
use crate::net::udp::UdpService;
use crate::stats::{ArenaGauges, ServiceStats};
use indexmap::IndexSet;
use mio::{Events, Poll, Ready};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const EVENT_CAPACITY: usize = 1024;
const TICK: Duration = Duration::from_secs(1);

/// Shared pieces every service callback needs: the poller for registration
/// changes, the one arena, and the wake-up's timestamp.
pub struct Ctx<'a> {
    pub poll: &'a Poll,
    pub arena: &'a mut PacketArena,
    pub now: Instant,
}

/// A forwarding service of either protocol.
pub enum Service {
    Tcp(TcpService),
    Udp(UdpService),
}

impl Service {
    fn handle_event(&mut self, ctx: &mut Ctx, target: EventTarget, ready: Ready) {
        match self {
            Service::Tcp(service) => service.handle_event(ctx, target, ready),
            Service::Udp(service) => service.handle_event(ctx, target, ready),
        }
    }

    fn post_process(&mut self, ctx: &mut Ctx) {
        match self {
            Service::Tcp(service) => service.post_process(ctx),
            Service::Udp(service) => service.post_process(ctx),
        }
    }

    fn scan_timeout(&mut self, ctx: &mut Ctx) {
        match self {
            Service::Tcp(service) => service.scan_timeout(ctx),
            Service::Udp(service) => service.scan_timeout(ctx),
        }
    }

    fn shutdown(&mut self, ctx: &mut Ctx) {
        match self {
            Service::Tcp(service) => service.shutdown(ctx),
            Service::Udp(service) => service.shutdown(ctx),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Service::Tcp(service) => service.local_addr(),
            Service::Udp(service) => service.local_addr(),
        }
    }
}

/// The data plane: one poller owning every socket, dispatching readiness to
/// the services, and running the per-second timeout ticks.
pub struct Reactor {
    poll: Poll,
    events: Events,
    arena: PacketArena,
    services: Vec<Service>,
    active: IndexSet<usize>,
    stop: Arc<AtomicBool>,
    log: Logger,
}

impl Reactor {
    /// Binds every service and carves the shared arena. Any failure here is
    /// a startup (or rebuild) failure; nothing is left registered.
    pub fn new(
        specs: &[ServiceSpec],
        tuning: &Tuning,
        stats: &[Arc<ServiceStats>],
        gauges: Arc<ArenaGauges>,
        stop: Arc<AtomicBool>,
        log: Logger,
    ) -> NetworkResult<Reactor> {
        assert_eq!(specs.len(), stats.len(), "one stats block per spec");

        if specs.len() > MAX_SERVICES {
            return Err(NetworkError::Fatal(ErrorType::Exhausted));
        }

        let poll = Poll::new()?;
        let arena = PacketArena::new(tuning.arena_bytes, gauges);

        let mut services = Vec::with_capacity(specs.len());
        for (index, (spec, stats)) in specs.iter().zip(stats).enumerate() {
            // Rebuilds start from zero live tunnels.
            stats.active_tunnels.store(0, Ordering::Relaxed);

            let service_log = log.new(o!("service" => spec.label.clone()));
            let service = match spec.protocol {
                Protocol::Tcp => Service::Tcp(TcpService::open(
                    index,
                    spec,
                    tuning,
                    &poll,
                    stats.clone(),
                    service_log,
                )?),
                Protocol::Udp => Service::Udp(UdpService::open(
                    index,
                    spec,
                    tuning,
                    &poll,
                    stats.clone(),
                    service_log,
                )?),
            };
            services.push(service);
        }

        Ok(Reactor {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            arena,
            services,
            active: IndexSet::new(),
            stop,
            log,
        })
    }

    /// Bound addresses, in spec order. Useful when services were bound to
    /// ephemeral ports.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.services
            .iter()
            .filter_map(|service| service.local_addr().ok())
            .collect()
    }

    /// The main loop. Returns `Ok` after an observed stop flag and an
    /// orderly teardown; returns `Err` on a poller failure so the caller can
    /// rebuild the data plane.
    pub fn run(&mut self) -> NetworkResult<()> {
        info!(self.log, "reactor running"; "services" => self.services.len());

        let mut last_tick = Instant::now();

        while !self.stop.load(Ordering::Relaxed) {
            match self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(self.log, "poller failed"; "error" => %err);
                    return Err(err.into());
                }
            }

            let now = Instant::now();

            for event in &self.events {
                let key = EndpointKey::from_token(event.token());

                if let Some(service) = self.services.get_mut(key.service) {
                    let mut ctx = Ctx {
                        poll: &self.poll,
                        arena: &mut self.arena,
                        now,
                    };
                    service.handle_event(&mut ctx, key.target, event.readiness());
                    self.active.insert(key.service);
                }
            }

            // Deferred teardown for services that saw events, after the
            // whole batch has been consumed.
            if !self.active.is_empty() {
                let touched: Vec<usize> = self.active.drain(..).collect();
                for index in touched {
                    let mut ctx = Ctx {
                        poll: &self.poll,
                        arena: &mut self.arena,
                        now,
                    };
                    self.services[index].post_process(&mut ctx);
                }
            }

            if now.duration_since(last_tick) >= TICK {
                last_tick = now;
                for service in &mut self.services {
                    let mut ctx = Ctx {
                        poll: &self.poll,
                        arena: &mut self.arena,
                        now,
                    };
                    service.post_process(&mut ctx);
                    service.scan_timeout(&mut ctx);
                }
            }
        }

        debug!(self.log, "stop flag observed");
        self.close_all();

        Ok(())
    }

    /// Ordered teardown: services close their tunnels, tunnels return their
    /// blocks to the arena.
    fn close_all(&mut self) {
        let now = Instant::now();

        for service in &mut self.services {
            let mut ctx = Ctx {
                poll: &self.poll,
                arena: &mut self.arena,
                now,
            };
            service.shutdown(&mut ctx);
        }

        info!(self.log, "reactor stopped";
              "arena_in_use" => self.arena.in_use_bytes());
    }
}
