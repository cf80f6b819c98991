use crate::config::{ServiceSpec, Tuning};
use crate::logging::{debug, error, info, trace, Logger};
use crate::net::arena::PacketBlock;
use crate::net::reactor::Ctx;
use crate::net::shared::{
    interest, is_error_event, Direction, EndpointKey, EventTarget, NetworkResult,
};
use crate::net::slab::{Handle, Registry};
use crate::net::target::TargetSelector;
use crate::net::timer::{EntryId, TimerList};
use crate::net::tunnel::{transition, TunnelState};
use crate::stats::ServiceStats;
use hashbrown::HashMap;
use indexmap::IndexSet;
use mio::net::UdpSocket;
use mio::{PollOpt, Ready};
use nix::sys::socket::{setsockopt, sockopt};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Largest datagram the service will move; reservations use this hint.
const MAX_DATAGRAM: usize = 1 << 16;
/// Receive buffer requested for the service socket, to absorb bursts.
const SERVICE_RCVBUF: usize = 1 << 22;
/// Live-flow budget per service.
const MAX_FLOWS: usize = 10240;

/// One demultiplexed UDP flow: the connected north socket for a single
/// south source address. Reverse-path datagrams ride the service socket's
/// queue, labelled with `south`, so the flow itself only queues northbound.
struct UdpFlow {
    state: TunnelState,
    sock: UdpSocket,
    valid: bool,
    registered: bool,
    south: SocketAddr,
    target: SocketAddr,
    queue: VecDeque<PacketBlock>,
    queued_bytes: usize,
    timer: Option<EntryId>,
}

impl UdpFlow {
    #[inline]
    fn push_block(&mut self, block: PacketBlock) {
        self.queued_bytes += block.remaining();
        self.queue.push_back(block);
    }
}

/// UDP forwarding service: one bound socket, one flow per south source.
pub struct UdpService {
    index: usize,
    sock: UdpSocket,
    valid: bool,
    /// Reverse-path send queue of the service socket; blocks carry their
    /// south destination.
    queue: VecDeque<PacketBlock>,
    queued_bytes: usize,
    flows: Registry<UdpFlow>,
    by_addr: HashMap<SocketAddr, Handle>,
    idle: TimerList,
    pending: IndexSet<Handle>,
    /// Flows whose north reads stopped on arena exhaustion.
    starved: IndexSet<Handle>,
    service_starved: bool,
    selector: TargetSelector,
    idle_timeout: Duration,
    stats: Arc<ServiceStats>,
    log: Logger,
}

impl UdpService {
    pub fn open(
        index: usize,
        spec: &ServiceSpec,
        tuning: &Tuning,
        poll: &mio::Poll,
        stats: Arc<ServiceStats>,
        log: Logger,
    ) -> NetworkResult<UdpService> {
        let sock = UdpSocket::bind(&spec.listen)?;

        // Bursts arrive faster than a 100 ms poll slice can drain.
        if let Err(err) = setsockopt(sock.as_raw_fd(), sockopt::RcvBuf, &SERVICE_RCVBUF) {
            debug!(log, "could not enlarge receive buffer"; "error" => %err);
        }

        poll.register(
            &sock,
            EndpointKey::listener(index).token(),
            interest(true, true),
            PollOpt::edge(),
        )?;

        let addr = sock.local_addr()?;
        info!(log, "udp service bound";
              "addr" => %addr,
              "targets" => spec.targets.len());

        Ok(UdpService {
            index,
            sock,
            valid: true,
            queue: VecDeque::new(),
            queued_bytes: 0,
            flows: Registry::new(MAX_FLOWS),
            by_addr: HashMap::new(),
            idle: TimerList::new(),
            pending: IndexSet::new(),
            starved: IndexSet::new(),
            service_starved: false,
            selector: TargetSelector::new(spec.targets.clone()),
            idle_timeout: tuning.timeouts.idle,
            stats,
            log,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn handle_event(&mut self, ctx: &mut Ctx, target: EventTarget, ready: Ready) {
        match target {
            EventTarget::Listener => self.service_event(ctx, ready),
            EventTarget::Endpoint { tunnel, .. } => self.flow_event(ctx, tunnel, ready),
        }
    }

    fn service_event(&mut self, ctx: &mut Ctx, ready: Ready) {
        if is_error_event(ready) {
            error!(self.log, "service socket error");
            self.valid = false;
            return;
        }

        if ready.is_readable() {
            self.south_read(ctx);
        }
        if ready.is_writable() {
            self.south_send(ctx);
        }
    }

    fn flow_event(&mut self, ctx: &mut Ctx, handle: Handle, ready: Ready) {
        if self.flows.get(handle).is_none() {
            return;
        }

        if is_error_event(ready) {
            if let Some(flow) = self.flows.get_mut(handle) {
                flow.valid = false;
            }
            self.pending.insert(handle);
            return;
        }

        if ready.is_readable() {
            self.north_read(ctx, handle);
        }
        if ready.is_writable() {
            self.north_send(ctx, handle);
        }
    }

    /// Drains inbound datagrams off the service socket, demultiplexing each
    /// one to its flow by source address.
    fn south_read(&mut self, ctx: &mut Ctx) {
        loop {
            let received = {
                let view = match ctx.arena.reserve(MAX_DATAGRAM) {
                    Some(view) => view,
                    None => {
                        trace!(self.log, "arena exhausted, pausing service reads");
                        self.service_starved = true;
                        return;
                    }
                };
                self.sock.recv_from(view)
            };

            match received {
                Ok((0, _)) => {
                    trace!(self.log, "skipping empty datagram");
                }
                Ok((count, addr)) => {
                    let handle = match self.flow_for(ctx, addr) {
                        Some(handle) => handle,
                        None => continue,
                    };

                    let usable = match self.flows.get(handle) {
                        Some(flow) => flow.valid,
                        None => false,
                    };
                    if !usable {
                        trace!(self.log, "dropping datagram for dead flow"; "source" => %addr);
                        continue;
                    }

                    let block = ctx.arena.commit(count);
                    self.flows
                        .get_mut(handle)
                        .expect("flow checked above")
                        .push_block(block);

                    self.north_send(ctx, handle);
                    self.refresh_idle(ctx, handle);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(self.log, "service recv failed"; "error" => %err);
                    self.valid = false;
                    break;
                }
            }
        }
    }

    /// Finds the flow for a south source, creating one with a fresh
    /// connected north socket on first sight.
    fn flow_for(&mut self, ctx: &mut Ctx, south: SocketAddr) -> Option<Handle> {
        if let Some(handle) = self.by_addr.get(&south) {
            return Some(*handle);
        }

        let target = self.selector.next();

        let sock = match open_north_sock(target) {
            Ok(sock) => sock,
            Err(err) => {
                debug!(self.log, "north socket setup failed";
                       "target" => %target,
                       "error" => %err);
                self.selector.report_failure(target);
                return None;
            }
        };

        let mut state = transition(TunnelState::Closed, TunnelState::Allocated);
        state = transition(state, TunnelState::Initialized);
        state = transition(state, TunnelState::Connect);

        let flow = UdpFlow {
            state,
            sock,
            valid: true,
            registered: false,
            south,
            target,
            queue: VecDeque::new(),
            queued_bytes: 0,
            timer: None,
        };

        let handle = match self.flows.insert(flow) {
            Some(handle) => handle,
            None => {
                debug!(self.log, "flow budget exhausted"; "source" => %south);
                ServiceStats::bump(&self.stats.rejected, 1);
                return None;
            }
        };

        let token = EndpointKey::endpoint(self.index, handle, Direction::North).token();
        let flow = self.flows.get_mut(handle).expect("flow just inserted");

        if let Err(err) = ctx
            .poll
            .register(&flow.sock, token, interest(true, true), PollOpt::edge())
        {
            error!(self.log, "flow registration failed"; "error" => %err);
            drop(self.flows.remove(handle));
            return None;
        }
        flow.registered = true;

        // A connected datagram socket is ready the moment connect returns.
        flow.state = transition(flow.state, TunnelState::Established);
        flow.timer = Some(self.idle.push_back(ctx.now, handle));

        self.by_addr.insert(south, handle);
        ServiceStats::bump(&self.stats.accepted, 1);
        self.stats.active_tunnels.fetch_add(1, Ordering::Relaxed);

        debug!(self.log, "flow opened";
               "flow" => handle.index,
               "source" => %south,
               "target" => %target);

        Some(handle)
    }

    /// Sends a flow's queued datagrams north. A fatal send error drops the
    /// flow along with everything still queued; datagrams are droppable.
    fn north_send(&mut self, ctx: &mut Ctx, handle: Handle) {
        let flow = match self.flows.get_mut(handle) {
            Some(flow) => flow,
            None => return,
        };

        if !flow.valid {
            return;
        }

        let mut sent = 0u64;
        let mut failed = false;

        loop {
            let result = {
                let block = match flow.queue.front() {
                    Some(block) => block,
                    None => break,
                };
                flow.sock.send(ctx.arena.filled(block))
            };

            match result {
                Ok(count) => {
                    let block = flow.queue.pop_front().expect("queue has a head block");
                    flow.queued_bytes -= block.remaining();
                    sent += count as u64;
                    ctx.arena.release(block);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(self.log, "north send failed";
                           "flow" => handle.index,
                           "error" => %err);
                    flow.valid = false;
                    failed = true;
                    // Datagrams, not a stream: drop the backlog.
                    while let Some(block) = flow.queue.pop_front() {
                        ctx.arena.release(block);
                    }
                    flow.queued_bytes = 0;
                    break;
                }
            }
        }

        if sent > 0 {
            ServiceStats::bump(&self.stats.bytes_south_north, sent);
        }
        if failed {
            self.pending.insert(handle);
        }
    }

    /// Drains a flow's north socket. Datagrams from anyone but the
    /// connected target are dropped; the rest are labelled with the south
    /// address and queued on the service socket.
    fn north_read(&mut self, ctx: &mut Ctx, handle: Handle) {
        let mut transited = false;
        let mut failed = false;

        loop {
            let flow = match self.flows.get_mut(handle) {
                Some(flow) => flow,
                None => return,
            };
            if !flow.valid {
                break;
            }

            let received = {
                let view = match ctx.arena.reserve(MAX_DATAGRAM) {
                    Some(view) => view,
                    None => {
                        trace!(self.log, "arena exhausted, pausing flow reads"; "flow" => handle.index);
                        self.starved.insert(handle);
                        break;
                    }
                };
                flow.sock.recv_from(view)
            };

            match received {
                Ok((0, _)) => {
                    trace!(self.log, "skipping empty datagram");
                }
                Ok((count, source)) => {
                    if source != flow.target {
                        trace!(self.log, "dropping foreign datagram"; "source" => %source);
                        continue;
                    }

                    let mut block = ctx.arena.commit(count);
                    block.dest = Some(flow.south);

                    self.queued_bytes += block.remaining();
                    self.queue.push_back(block);
                    transited = true;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(self.log, "north recv failed";
                           "flow" => handle.index,
                           "error" => %err);
                    flow.valid = false;
                    failed = true;
                    break;
                }
            }
        }

        if transited {
            self.south_send(ctx);
            self.refresh_idle(ctx, handle);
        }
        if failed {
            self.pending.insert(handle);
        }
    }

    /// Drains the service socket's reverse-path queue with `send_to` toward
    /// each block's labelled south address.
    fn south_send(&mut self, ctx: &mut Ctx) {
        if !self.valid {
            return;
        }

        let mut sent = 0u64;
        let mut released = false;

        loop {
            let result = {
                let block = match self.queue.front() {
                    Some(block) => block,
                    None => break,
                };
                let dest = block.dest.expect("reverse-path block is labelled");
                self.sock.send_to(ctx.arena.filled(block), &dest)
            };

            match result {
                Ok(count) => {
                    let block = self.queue.pop_front().expect("queue has a head block");
                    self.queued_bytes -= block.remaining();
                    sent += count as u64;
                    ctx.arena.release(block);
                    released = true;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(self.log, "service send failed"; "error" => %err);
                    self.valid = false;
                    break;
                }
            }
        }

        if sent > 0 {
            ServiceStats::bump(&self.stats.bytes_north_south, sent);
        }

        if released && self.service_starved {
            self.service_starved = false;
            let token = EndpointKey::listener(self.index).token();
            let _ = ctx
                .poll
                .reregister(&self.sock, token, interest(true, true), PollOpt::edge());
        }
    }

    /// Releases pending flows, then re-arms arena-starved readers once
    /// space exists.
    pub fn post_process(&mut self, ctx: &mut Ctx) {
        if !self.pending.is_empty() {
            let batch: Vec<Handle> = self.pending.drain(..).collect();
            for handle in batch {
                self.release_flow(ctx, handle);
            }
        }

        if ctx.arena.free_bytes() > 0 {
            if self.service_starved {
                self.service_starved = false;
                let token = EndpointKey::listener(self.index).token();
                let _ = ctx
                    .poll
                    .reregister(&self.sock, token, interest(true, true), PollOpt::edge());
            }

            if !self.starved.is_empty() {
                let waiting: Vec<Handle> = self.starved.drain(..).collect();
                for handle in waiting {
                    let token = EndpointKey::endpoint(self.index, handle, Direction::North).token();
                    if let Some(flow) = self.flows.get(handle) {
                        if flow.valid {
                            let _ = ctx.poll.reregister(
                                &flow.sock,
                                token,
                                interest(true, true),
                                PollOpt::edge(),
                            );
                        }
                    }
                }
            }
        }
    }

    /// Reaps flows idle past the configured interval.
    pub fn scan_timeout(&mut self, ctx: &mut Ctx) {
        let cutoff = match ctx.now.checked_sub(self.idle_timeout) {
            Some(cutoff) => cutoff,
            None => return,
        };

        let mut expired = Vec::new();
        self.idle.drain_expired(cutoff, &mut expired);

        for handle in expired {
            let flow = match self.flows.get_mut(handle) {
                Some(flow) => flow,
                None => continue,
            };
            flow.timer = None;

            ServiceStats::bump(&self.stats.timeout_idle, 1);
            debug!(self.log, "flow idle timeout"; "flow" => handle.index);
            self.pending.insert(handle);
        }
    }

    /// Tears down every flow and withdraws the service socket.
    pub fn shutdown(&mut self, ctx: &mut Ctx) {
        for handle in self.flows.handles() {
            self.release_flow(ctx, handle);
        }

        for block in self.queue.drain(..) {
            ctx.arena.release(block);
        }
        self.queued_bytes = 0;

        let _ = ctx.poll.deregister(&self.sock);
        info!(self.log, "udp service closed");
    }

    fn refresh_idle(&mut self, ctx: &Ctx, handle: Handle) {
        if let Some(flow) = self.flows.get(handle) {
            if let Some(timer) = flow.timer {
                self.idle.refresh(ctx.now, timer);
            }
        }
    }

    fn release_flow(&mut self, ctx: &mut Ctx, handle: Handle) {
        let mut flow = match self.flows.remove(handle) {
            Some(flow) => flow,
            None => return,
        };

        if let Some(timer) = flow.timer.take() {
            self.idle.erase(timer);
        }

        flow.valid = false;
        if flow.registered {
            let _ = ctx.poll.deregister(&flow.sock);
        }
        for block in flow.queue.drain(..) {
            ctx.arena.release(block);
        }

        flow.state = transition(flow.state, TunnelState::Broken);
        flow.state = transition(flow.state, TunnelState::Closed);

        self.by_addr.remove(&flow.south);
        self.starved.remove(&handle);
        self.pending.remove(&handle);
        self.stats.active_tunnels.fetch_sub(1, Ordering::Relaxed);

        debug!(self.log, "flow closed"; "flow" => handle.index, "source" => %flow.south);
    }
}

/// An unbound datagram socket of the target's family, connected to it.
fn open_north_sock(target: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = match target.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };

    let sock = UdpSocket::bind(&local)?;
    sock.connect(target)?;
    Ok(sock)
}
