use crate::config::{ServiceSpec, Timeouts, Tuning};
use crate::logging::{debug, error, info, trace, Logger};
use crate::net::reactor::Ctx;
use crate::net::shared::{
    interest, is_error_event, is_hup_event, Direction, EndpointKey, ErrorType, ErrorUtils,
    EventTarget, NetworkError, NetworkResult,
};
use crate::net::slab::{Handle, Registry};
use crate::net::target::TargetSelector;
use crate::net::timer::{TimeoutClass, TimerSet};
use crate::net::tunnel::{TimerEntry, Tunnel, TunnelState};
use crate::stats::ServiceStats;
use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};
use mio::{PollOpt, Ready};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// Read chunk reserved from the arena per recv call.
const RECV_HINT: usize = 1 << 16;
/// Live-tunnel budget per service; the accept loop rejects beyond it.
const MAX_TUNNELS: usize = 10240;

/// TCP forwarding service: accepts south streams, connects a north stream
/// per tunnel, and shuttles bytes both ways through arena-backed queues.
pub struct TcpService {
    index: usize,
    listener: TcpListener,
    tunnels: Registry<Tunnel>,
    timers: TimerSet,
    /// Tunnels touched this wake-up that need a teardown decision.
    pending: IndexSet<Handle>,
    /// Readers stopped by arena exhaustion, resumed in post-processing.
    starved: IndexSet<(Handle, Direction)>,
    selector: TargetSelector,
    timeouts: Timeouts,
    high_water: usize,
    low_water: usize,
    stats: Arc<ServiceStats>,
    log: Logger,
}

impl TcpService {
    pub fn open(
        index: usize,
        spec: &ServiceSpec,
        tuning: &Tuning,
        poll: &mio::Poll,
        stats: Arc<ServiceStats>,
        log: Logger,
    ) -> NetworkResult<TcpService> {
        let listener = TcpListener::bind(&spec.listen)?;

        poll.register(
            &listener,
            EndpointKey::listener(index).token(),
            interest(true, true),
            PollOpt::edge(),
        )?;

        let addr = listener.local_addr()?;
        info!(log, "tcp service listening";
              "addr" => %addr,
              "targets" => spec.targets.len());

        Ok(TcpService {
            index,
            listener,
            tunnels: Registry::new(MAX_TUNNELS),
            timers: TimerSet::new(),
            pending: IndexSet::new(),
            starved: IndexSet::new(),
            selector: TargetSelector::new(spec.targets.clone()),
            timeouts: tuning.timeouts,
            high_water: tuning.session_limit,
            low_water: tuning.session_limit / 2,
            stats,
            log,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle_event(&mut self, ctx: &mut Ctx, target: EventTarget, ready: Ready) {
        match target {
            EventTarget::Listener => {
                if ready.is_readable() {
                    self.accept_ready(ctx);
                }
            }
            EventTarget::Endpoint { tunnel, direction } => {
                self.tunnel_event(ctx, tunnel, direction, ready);
            }
        }
    }

    /// Accepts until the listener would block. Tunnels that cannot be built
    /// reject the client by closing the accepted socket.
    fn accept_ready(&mut self, ctx: &mut Ctx) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    ServiceStats::bump(&self.stats.accepted, 1);

                    if let Err(err) = self.begin_tunnel(ctx, stream, peer) {
                        ServiceStats::bump(&self.stats.rejected, 1);
                        debug!(self.log, "rejected client"; "peer" => %peer, "reason" => %err);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn begin_tunnel(
        &mut self,
        ctx: &mut Ctx,
        south_stream: TcpStream,
        peer: SocketAddr,
    ) -> NetworkResult<()> {
        let mut tunnel = Tunnel::new();
        tunnel.set_state(TunnelState::Allocated);
        tunnel.south.attach(south_stream, peer);
        tunnel.set_state(TunnelState::Initialized);

        let target = self.selector.next();
        match TcpStream::connect(&target) {
            Ok(north_stream) => {
                tunnel.north.attach(north_stream, target);
            }
            Err(err) => {
                self.selector.report_failure(target);
                return Err(err.into());
            }
        }
        tunnel.set_state(TunnelState::Connect);

        let handle = match self.tunnels.insert(tunnel) {
            Some(handle) => handle,
            None => return Err(NetworkError::Fatal(ErrorType::Exhausted)),
        };

        let north_token = EndpointKey::endpoint(self.index, handle, Direction::North).token();
        let tunnel = self.tunnels.get_mut(handle).expect("tunnel just inserted");

        // Writable-only until the connect completes.
        if tunnel.north.register(ctx.poll, north_token, false, true).has_failed() {
            drop(self.tunnels.remove(handle));
            return Err(NetworkError::Fatal(ErrorType::Exhausted));
        }

        let id = self
            .timers
            .list_mut(TimeoutClass::Connect)
            .push_back(ctx.now, handle);
        tunnel.timer = Some(TimerEntry {
            class: TimeoutClass::Connect,
            id,
        });

        self.stats.active_tunnels.fetch_add(1, Ordering::Relaxed);
        debug!(self.log, "tunnel opened";
               "tunnel" => handle.index,
               "peer" => %peer,
               "target" => %target);

        Ok(())
    }

    fn tunnel_event(&mut self, ctx: &mut Ctx, handle: Handle, direction: Direction, ready: Ready) {
        // A stale token (recycled slot) resolves to nothing and is dropped.
        let state = match self.tunnels.get(handle) {
            Some(tunnel) => tunnel.state,
            None => return,
        };

        if state == TunnelState::Connect {
            if direction == Direction::North {
                self.finish_connect(ctx, handle, ready);
            }
            return;
        }

        if ready.is_readable() {
            self.read_ready(ctx, handle, direction);
            // Push what was just queued before waiting for a writable event.
            self.write_ready(ctx, handle, direction.opposite());
        }

        if ready.is_writable() {
            self.write_ready(ctx, handle, direction);
        }

        if is_error_event(ready) {
            if let Some(tunnel) = self.tunnels.get_mut(handle) {
                tunnel.endpoint_mut(direction).valid = false;
            }
            self.mark_broken(ctx.now, handle);
        }
    }

    /// North became writable while connecting: either the handshake failed
    /// (error/hup flags or a pending socket error) or the tunnel goes
    /// ESTABLISHED and both sides start forwarding.
    fn finish_connect(&mut self, ctx: &mut Ctx, handle: Handle, ready: Ready) {
        let north_token = EndpointKey::endpoint(self.index, handle, Direction::North).token();
        let south_token = EndpointKey::endpoint(self.index, handle, Direction::South).token();

        let tunnel = match self.tunnels.get_mut(handle) {
            Some(tunnel) => tunnel,
            None => return,
        };
        let target = tunnel.north.remote.expect("north endpoint has a target");

        let failed = is_error_event(ready)
            || is_hup_event(ready)
            || match tunnel.north.stream().take_error() {
                Ok(None) => false,
                _ => true,
            };

        if failed {
            debug!(self.log, "connect to target failed";
                   "tunnel" => handle.index,
                   "target" => %target);
            tunnel.north.valid = false;
            self.selector.report_failure(target);
            self.mark_broken(ctx.now, handle);
            return;
        }

        if tunnel
            .north
            .reregister(ctx.poll, north_token, true, true)
            .has_failed()
            || tunnel
                .south
                .register(ctx.poll, south_token, true, true)
                .has_failed()
        {
            error!(self.log, "tunnel registration failed"; "tunnel" => handle.index);
            self.mark_broken(ctx.now, handle);
            return;
        }

        tunnel.set_state(TunnelState::Established);

        if let Some(entry) = tunnel.timer.take() {
            self.timers.list_mut(entry.class).erase(entry.id);
        }
        let id = self
            .timers
            .list_mut(TimeoutClass::Established)
            .push_back(ctx.now, handle);
        tunnel.timer = Some(TimerEntry {
            class: TimeoutClass::Established,
            id,
        });

        debug!(self.log, "tunnel established"; "tunnel" => handle.index, "target" => %target);
    }

    /// Drains the readable endpoint into its peer's send queue until the
    /// socket would block, the peer's queue hits the high-water mark, or the
    /// arena runs out.
    fn read_ready(&mut self, ctx: &mut Ctx, handle: Handle, direction: Direction) {
        let src_token = EndpointKey::endpoint(self.index, handle, direction).token();
        let high_water = self.high_water;

        let tunnel = match self.tunnels.get_mut(handle) {
            Some(tunnel) => tunnel,
            None => return,
        };

        match tunnel.state {
            TunnelState::Established => {}
            TunnelState::Broken => {
                self.pending.insert(handle);
                return;
            }
            _ => return,
        }

        let (src, dst) = tunnel.pair_mut(direction);

        if !src.valid || src.rx_closed || src.stop_recv {
            return;
        }
        if !dst.valid {
            // Nowhere to forward to; let post-processing settle the tunnel.
            self.pending.insert(handle);
            return;
        }

        let mut bytes = 0usize;
        let mut eof = false;
        let mut starved = false;
        let mut failure = None;

        loop {
            if dst.queued_bytes() >= high_water {
                trace!(self.log, "peer queue at high water, pausing reads";
                       "tunnel" => handle.index, "direction" => %direction);
                src.stop_recv = true;
                break;
            }

            let view = match ctx.arena.reserve(RECV_HINT) {
                Some(view) => view,
                None => {
                    trace!(self.log, "arena exhausted, pausing reads"; "tunnel" => handle.index);
                    src.stop_recv = true;
                    starved = true;
                    break;
                }
            };

            let result = {
                let mut stream = src.stream();
                stream.read(view)
            };

            match result {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(count) => {
                    dst.push_block(ctx.arena.commit(count));
                    bytes += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if eof {
            debug!(self.log, "peer closed";
                   "tunnel" => handle.index,
                   "direction" => %direction);
            src.rx_closed = true;
            src.stop_recv = true;
            let _ = src.reregister(ctx.poll, src_token, false, true);
            // The EOF travels on once everything queued ahead of it is out.
            dst.shutdown_pending = true;
            dst.forward_shutdown();
        }

        if let Some(err) = failure {
            debug!(self.log, "recv failed";
                   "tunnel" => handle.index,
                   "direction" => %direction,
                   "error" => %err);
            src.valid = false;
        }

        let both_closed = tunnel.both_rx_closed();
        let failed = !tunnel.endpoint(direction).valid;

        if bytes > 0 {
            let counter = match direction {
                Direction::South => &self.stats.bytes_south_north,
                Direction::North => &self.stats.bytes_north_south,
            };
            ServiceStats::bump(counter, bytes as u64);
            self.refresh_established(ctx.now, handle);
        }

        if starved {
            self.starved.insert((handle, direction));
        }

        if failed || (eof && both_closed) {
            self.mark_broken(ctx.now, handle);
        }
    }

    /// Flushes an endpoint's send queue and handles the bookkeeping a drain
    /// implies: resuming a back-pressured peer, waking arena-starved
    /// readers, and settling BROKEN tunnels that just finished flushing.
    fn write_ready(&mut self, ctx: &mut Ctx, handle: Handle, direction: Direction) {
        let peer_token = EndpointKey::endpoint(self.index, handle, direction.opposite()).token();
        let low_water = self.low_water;

        let tunnel = match self.tunnels.get_mut(handle) {
            Some(tunnel) => tunnel,
            None => return,
        };

        let state = tunnel.state;
        match state {
            TunnelState::Established | TunnelState::Broken => {}
            _ => return,
        }

        let (ep, peer) = tunnel.pair_mut(direction);

        if !ep.valid || !ep.has_stream() || !ep.has_queued() {
            ep.forward_shutdown();
            return;
        }

        let outcome = ep.flush(ctx.arena);

        if let Some(err) = &outcome.error {
            debug!(self.log, "send failed";
                   "tunnel" => handle.index,
                   "direction" => %direction,
                   "error" => %err);
            ep.valid = false;
        }

        // A released block means the queue shrank: the peer that was paused
        // for filling it may read again.
        if outcome.released
            && state == TunnelState::Established
            && peer.stop_recv
            && peer.valid
            && !peer.rx_closed
            && ep.queued_bytes() <= low_water
        {
            peer.stop_recv = false;
            if peer.reregister(ctx.poll, peer_token, true, true).has_failed() {
                peer.valid = false;
            }
        }

        let drained = !ep.has_queued();
        let failed = !ep.valid;

        if outcome.sent > 0 {
            let counter = match direction {
                Direction::North => &self.stats.bytes_south_north,
                Direction::South => &self.stats.bytes_north_south,
            };
            ServiceStats::bump(counter, outcome.sent as u64);
            self.refresh_established(ctx.now, handle);
        }

        if outcome.released {
            self.starved.remove(&(handle, direction.opposite()));
        }

        if failed {
            self.mark_broken(ctx.now, handle);
        } else if state == TunnelState::Broken && drained {
            self.pending.insert(handle);
        }
    }

    /// Deferred per-tunnel work: teardown decisions for tunnels touched this
    /// wake-up, then resumption of arena-starved readers once space exists.
    pub fn post_process(&mut self, ctx: &mut Ctx) {
        if !self.pending.is_empty() {
            let batch: Vec<Handle> = self.pending.drain(..).collect();
            for handle in batch {
                self.settle(ctx, handle);
            }
        }

        if !self.starved.is_empty() && ctx.arena.free_bytes() > 0 {
            let waiting: Vec<(Handle, Direction)> = self.starved.drain(..).collect();
            for (handle, direction) in waiting {
                let token = EndpointKey::endpoint(self.index, handle, direction).token();
                if let Some(tunnel) = self.tunnels.get_mut(handle) {
                    if tunnel.state != TunnelState::Established {
                        continue;
                    }
                    let ep = tunnel.endpoint_mut(direction);
                    if ep.valid && ep.stop_recv && !ep.rx_closed {
                        ep.stop_recv = false;
                        // MOD re-arms the edge; pending data produces a
                        // fresh readable event.
                        let _ = ep.reregister(ctx.poll, token, true, true);
                    }
                }
            }
        }
    }

    /// Decides one pending tunnel: release it, or keep it write-only until
    /// the surviving side finishes flushing.
    fn settle(&mut self, ctx: &mut Ctx, handle: Handle) {
        let state = match self.tunnels.get(handle) {
            Some(tunnel) => tunnel.state,
            None => return,
        };

        match state {
            TunnelState::Initialized => {
                self.release_tunnel(ctx, handle);
                return;
            }
            TunnelState::Connect | TunnelState::Established => {
                self.to_broken(ctx.now, handle);
            }
            TunnelState::Broken => {}
            TunnelState::Closed | TunnelState::Allocated => return,
        }

        let drained = self
            .tunnels
            .get(handle)
            .map(|tunnel| tunnel.drained())
            .unwrap_or(false);

        if drained {
            self.release_tunnel(ctx, handle);
            return;
        }

        // Queued data remains: hold the tunnel open write-only so it can
        // flush, and look at it again next pass.
        for direction in &[Direction::North, Direction::South] {
            let token = EndpointKey::endpoint(self.index, handle, *direction).token();
            if let Some(tunnel) = self.tunnels.get_mut(handle) {
                let ep = tunnel.endpoint_mut(*direction);
                if ep.valid && ep.has_queued() {
                    let _ = ep.reregister(ctx.poll, token, false, true);
                }
            }
        }
        self.pending.insert(handle);
    }

    /// Expires tunnels per timeout class. CONNECT and ESTABLISHED expiries
    /// break the tunnel and grant it the broken-class flush grace; a broken
    /// expiry ends the grace and drops whatever is left.
    pub fn scan_timeout(&mut self, ctx: &mut Ctx) {
        let mut expired = Vec::new();

        for class in &[
            TimeoutClass::Connect,
            TimeoutClass::Established,
            TimeoutClass::Broken,
        ] {
            let cutoff = match ctx.now.checked_sub(self.timeouts.for_class(*class)) {
                Some(cutoff) => cutoff,
                None => continue,
            };

            expired.clear();
            self.timers.list_mut(*class).drain_expired(cutoff, &mut expired);

            for handle in &expired {
                let handle = *handle;

                match self.tunnels.get_mut(handle) {
                    Some(tunnel) => tunnel.timer = None,
                    None => continue,
                }

                ServiceStats::bump(self.stats.timeout_counter(*class), 1);
                debug!(self.log, "tunnel timed out";
                       "tunnel" => handle.index,
                       "class" => class.label());

                if *class == TimeoutClass::Broken {
                    // Flush grace over.
                    if let Some(tunnel) = self.tunnels.get_mut(handle) {
                        tunnel.north.valid = false;
                        tunnel.south.valid = false;
                    }
                } else {
                    self.to_broken(ctx.now, handle);
                }

                self.pending.insert(handle);
            }
        }
    }

    /// Tears down every tunnel and withdraws the listener.
    pub fn shutdown(&mut self, ctx: &mut Ctx) {
        for handle in self.tunnels.handles() {
            self.release_tunnel(ctx, handle);
        }

        let _ = ctx.poll.deregister(&self.listener);
        info!(self.log, "tcp service closed");
    }

    fn to_broken(&mut self, now: Instant, handle: Handle) {
        let tunnel = match self.tunnels.get_mut(handle) {
            Some(tunnel) => tunnel,
            None => return,
        };

        match tunnel.state {
            TunnelState::Initialized | TunnelState::Connect | TunnelState::Established => {
                tunnel.set_state(TunnelState::Broken);

                if let Some(entry) = tunnel.timer.take() {
                    self.timers.list_mut(entry.class).erase(entry.id);
                }
                let id = self
                    .timers
                    .list_mut(TimeoutClass::Broken)
                    .push_back(now, handle);
                tunnel.timer = Some(TimerEntry {
                    class: TimeoutClass::Broken,
                    id,
                });
            }
            _ => {}
        }
    }

    fn mark_broken(&mut self, now: Instant, handle: Handle) {
        self.to_broken(now, handle);
        self.pending.insert(handle);
    }

    fn refresh_established(&mut self, now: Instant, handle: Handle) {
        if let Some(tunnel) = self.tunnels.get_mut(handle) {
            if let Some(entry) = tunnel.timer {
                if entry.class == TimeoutClass::Established {
                    self.timers.list_mut(entry.class).refresh(now, entry.id);
                }
            }
        }
    }

    /// Invalidate, deregister, return the blocks, close. In that order, so
    /// nothing delivered later in this wake-up can reach freed state.
    fn release_tunnel(&mut self, ctx: &mut Ctx, handle: Handle) {
        let mut tunnel = match self.tunnels.remove(handle) {
            Some(tunnel) => tunnel,
            None => return,
        };

        if let Some(entry) = tunnel.timer.take() {
            self.timers.list_mut(entry.class).erase(entry.id);
        }

        tunnel.south.valid = false;
        tunnel.north.valid = false;
        tunnel.south.deregister(ctx.poll);
        tunnel.north.deregister(ctx.poll);
        tunnel.south.drain_queue(ctx.arena);
        tunnel.north.drain_queue(ctx.arena);

        match tunnel.state {
            TunnelState::Initialized | TunnelState::Connect | TunnelState::Established => {
                tunnel.set_state(TunnelState::Broken);
                tunnel.set_state(TunnelState::Closed);
            }
            TunnelState::Broken => tunnel.set_state(TunnelState::Closed),
            _ => {}
        }

        self.starved.remove(&(handle, Direction::North));
        self.starved.remove(&(handle, Direction::South));
        self.pending.remove(&handle);
        self.stats.active_tunnels.fetch_sub(1, Ordering::Relaxed);

        debug!(self.log, "tunnel closed"; "tunnel" => handle.index);
    }
}
