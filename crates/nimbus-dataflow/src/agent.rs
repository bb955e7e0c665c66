//! The dataflow agent: registration, routing, and the wait loop.
//!
//! Connection model: one reader task per socket decodes chunks and
//! forwards them over a single mpsc channel into the owner task; write
//! halves stay with the owner. All agent state is therefore touched by
//! exactly one task — the cooperative event-loop discipline the whole
//! core relies on for correctness.
//!
//! Routing policy for `send_op`: a message whose destination agent is
//! the local agent bypasses the network entirely (the loopback queue);
//! otherwise it leaves through the local router when one was detected
//! at registration, or a uniformly random router when not.

use std::collections::VecDeque;

use rand::Rng;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use nimbus_core::chunk::{read_chunk, CodecError};
use nimbus_core::wire::{self, Destination, MsgCode, WireError};
use nimbus_core::{net, Chunk};

use crate::table::OperatorTable;
use crate::{
    NSTAT_AGENT, STAT_OPERANDS_LOCAL, STAT_OPERANDS_TOTAL, STAT_OPS_LOCAL, STAT_OPS_TOTAL,
};

#[derive(Debug, thiserror::Error)]
pub enum DataflowError {
    #[error("lost connection to controller")]
    ControllerLost,

    #[error("registration refused by controller")]
    Refused,

    #[error("event channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Where an incoming chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Controller,
    Router(usize),
}

#[derive(Debug)]
pub enum Event {
    Msg(Source, Chunk),
    Eof(Source),
    Bad(Source, CodecError),
}

/// How a client's wait loop ended.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The operand addressed to the awaited operator ID.
    Operand(Chunk),
    /// A flush broadcast preempted the operation.
    Flushed,
    /// Kill received; the process should exit cleanly.
    Killed,
}

/// GC involvement of this agent, mirrored on workers and clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Idle,
    /// This worker asked the controller for a collection.
    Requested,
    /// GC_START arrived mid-operation; run it when the wait ends.
    Defer,
    Active,
}

/// Parameters for joining the fleet.
pub struct AgentSetup {
    pub is_client: bool,
    pub controller_host: String,
    pub controller_port: u16,
    /// Prefer a router bound to a local interface when one exists.
    pub try_local_router: bool,
}

pub struct Agent {
    pub own_agent: u16,
    pub nworkers: u16,
    pub is_client: bool,
    pub gc_state: GcState,
    pub gc_generation: u32,
    pub table: OperatorTable,
    pub stats: [u64; NSTAT_AGENT],

    controller_wr: OwnedWriteHalf,
    routers: Vec<OwnedWriteHalf>,
    local_router: Option<usize>,
    events: mpsc::Receiver<Event>,
    loopback: VecDeque<Chunk>,
    seq: u64,
    self_route: bool,
}

fn spawn_reader(rd: OwnedReadHalf, source: Source, tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let mut rd = rd;
        loop {
            match read_chunk(&mut rd).await {
                Ok(Some(msg)) => {
                    if tx.send(Event::Msg(source, msg)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = tx.send(Event::Eof(source)).await;
                    return;
                }
                Err(e) => {
                    let _ = tx.send(Event::Bad(source, e)).await;
                    return;
                }
            }
        }
    });
}

impl Agent {
    /// Register with the controller, collect the router map, connect
    /// and identify to every router, and (for workers) report READY.
    pub async fn join(setup: AgentSetup) -> Result<Agent, DataflowError> {
        let stream = net::connect(&setup.controller_host, setup.controller_port).await?;
        let (mut ctl_rd, mut ctl_wr) = stream.into_split();

        let register = if setup.is_client {
            wire::register_client()
        } else {
            wire::register_worker()
        };
        nimbus_core::chunk::write_chunk(&mut ctl_wr, &register).await?;
        tracing::debug!(client = setup.is_client, "sent registration to controller");

        // The ACK carries our agent ID, the worker count, and the
        // router map, split across chunks when the map is large.
        let mut own_agent = 0u16;
        let mut nworkers = 0u16;
        let mut expected = 0usize;
        let mut router_addrs: Vec<(u32, u16)> = Vec::new();
        let mut first = true;
        loop {
            let msg = read_chunk(&mut ctl_rd)
                .await?
                .ok_or(DataflowError::ControllerLost)?;
            let h = msg.word_checked(0).ok_or(WireError::TooShort {
                got: msg.len(),
                need: 1,
            })?;
            match MsgCode::try_from(wire::header_code(h))? {
                MsgCode::AckAgent => {
                    if first {
                        own_agent = wire::header_agent(h);
                        nworkers = wire::header_workercount(h);
                        expected = wire::header_wordcount(h) as usize;
                        first = false;
                        tracing::info!(agent = own_agent, workers = nworkers, routers = expected, "acknowledged by controller");
                    }
                    for i in 1..msg.len() {
                        if let Some(w) = msg.word_checked(i) {
                            router_addrs.push((wire::header_ip(w), wire::header_port(w)));
                        }
                    }
                    if router_addrs.len() >= expected {
                        break;
                    }
                }
                MsgCode::Nack => return Err(DataflowError::Refused),
                other => {
                    tracing::warn!(?other, "unexpected message while awaiting router map");
                }
            }
        }

        let (tx, events) = mpsc::channel(1024);
        let mut routers = Vec::with_capacity(router_addrs.len());
        let mut local_router = None;
        let identify = wire::register_agent(own_agent);
        for (idx, (ip, port)) in router_addrs.iter().enumerate() {
            let stream = net::connect_ip(*ip, *port).await.map_err(|e| {
                tracing::error!(ip, port, %e, "cannot reach router");
                e
            })?;
            let (rd, mut wr) = stream.into_split();
            nimbus_core::chunk::write_chunk(&mut wr, &identify).await?;
            if setup.try_local_router && local_router.is_none() && net::is_local_ipv4(*ip) {
                tracing::debug!(router = idx, "designated local router");
                local_router = Some(idx);
            }
            spawn_reader(rd, Source::Router(idx), tx.clone());
            routers.push(wr);
        }
        tracing::info!(count = routers.len(), "all routers connected");

        if !setup.is_client {
            let ready = wire::worker_ready(own_agent);
            nimbus_core::chunk::write_chunk(&mut ctl_wr, &ready).await?;
        }
        spawn_reader(ctl_rd, Source::Controller, tx);

        Ok(Agent {
            own_agent,
            nworkers,
            is_client: setup.is_client,
            gc_state: GcState::Idle,
            gc_generation: 0,
            table: OperatorTable::new(),
            stats: [0; NSTAT_AGENT],
            controller_wr: ctl_wr,
            routers,
            local_router,
            events,
            loopback: VecDeque::new(),
            seq: 0,
            self_route: true,
        })
    }

    /// Fresh operator ID: own agent over an exclusive 48-bit sequence.
    pub fn new_operator_id(&mut self) -> u64 {
        let id = wire::operator_id(self.own_agent, self.seq);
        self.seq = self.seq.wrapping_add(1);
        id
    }

    /// A destination addressed to this agent's own wait loop.
    pub fn own_destination(&mut self) -> Destination {
        let id = self.new_operator_id();
        Destination::new(self.own_agent, id, 0)
    }

    pub async fn send_to_controller(&mut self, msg: &Chunk) -> Result<(), DataflowError> {
        nimbus_core::chunk::write_chunk(&mut self.controller_wr, msg).await?;
        Ok(())
    }

    /// Route an operator or operand. Self-addressed messages go to the
    /// loopback queue (the local receive handler) with no network hop.
    pub async fn send_op(&mut self, msg: Chunk) -> Result<(), DataflowError> {
        let h = msg.word(0);
        let agent = wire::header_agent(h);
        let code = wire::header_code(h);
        let id = msg.word(1);

        if code == MsgCode::Operation as u8 {
            self.stats[STAT_OPS_TOTAL] += 1;
            if self.self_route && agent == self.own_agent {
                self.stats[STAT_OPS_LOCAL] += 1;
                tracing::trace!(id = format_args!("{id:#x}"), "self-routed operator");
                self.loopback.push_back(msg);
                return Ok(());
            }
        } else if code == MsgCode::Operand as u8 {
            self.stats[STAT_OPERANDS_TOTAL] += 1;
            if self.self_route && agent == self.own_agent && !self.is_client {
                self.stats[STAT_OPERANDS_LOCAL] += 1;
                tracing::trace!(id = format_args!("{id:#x}"), "self-routed operand");
                self.loopback.push_back(msg);
                return Ok(());
            }
        }

        let idx = match self.local_router {
            Some(idx) => idx,
            None => rand::thread_rng().gen_range(0..self.routers.len()),
        };
        tracing::trace!(id = format_args!("{id:#x}"), router = idx, "routing message");
        let wr = &mut self.routers[idx];
        nimbus_core::chunk::write_chunk(wr, &msg).await?;
        Ok(())
    }

    /// Next self-routed message, drained before any socket traffic.
    pub fn pop_loopback(&mut self) -> Option<Chunk> {
        self.loopback.pop_front()
    }

    /// Next event from any connection. `None` means every reader task
    /// is gone, which only happens during shutdown.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Already-queued event, if any. Lets a client absorb control
    /// traffic between operations without blocking.
    pub fn try_next_event(&mut self) -> Option<Event> {
        self.events.try_recv().ok()
    }

    /// Client-only: send an operator and run a restricted event loop
    /// until the operand addressed to `expect_id` arrives. Controller
    /// flush/kill preempt the wait; GC start is deferred until the
    /// caller finishes the operation and calls its undefer path.
    pub async fn fire_and_wait(
        &mut self,
        msg: Chunk,
        expect_id: u64,
    ) -> Result<WaitOutcome, DataflowError> {
        self.send_op(msg).await?;
        loop {
            let event = self.next_event().await.ok_or(DataflowError::ChannelClosed)?;
            match event {
                Event::Msg(Source::Controller, msg) => match wire::code_of(&msg) {
                    Ok(MsgCode::Kill) => return Ok(WaitOutcome::Killed),
                    Ok(MsgCode::DoFlush) => return Ok(WaitOutcome::Flushed),
                    Ok(MsgCode::GcStart) => {
                        tracing::debug!("deferring GC start until operation completes");
                        self.gc_state = GcState::Defer;
                    }
                    Ok(MsgCode::GcFinish) => {
                        tracing::warn!("unexpected GC finish while waiting for operand");
                    }
                    Ok(other) => {
                        tracing::warn!(?other, "unexpected controller message during wait");
                    }
                    Err(e) => {
                        tracing::warn!(%e, "undecodable controller message, dropped");
                    }
                },
                Event::Msg(Source::Router(_), msg) => match wire::code_of(&msg) {
                    Ok(MsgCode::Operand) => {
                        let Some(id) = msg.word_checked(1) else {
                            tracing::warn!("operand without ID word, dropped");
                            continue;
                        };
                        if id == expect_id {
                            return Ok(WaitOutcome::Operand(msg));
                        }
                        tracing::warn!(
                            got = format_args!("{id:#x}"),
                            want = format_args!("{expect_id:#x}"),
                            "operand for unexpected operator, dropped"
                        );
                    }
                    Ok(MsgCode::Operation) => {
                        tracing::warn!("unexpected operator at client, dropped");
                    }
                    Ok(other) => {
                        tracing::warn!(?other, "unexpected router message during wait");
                    }
                    Err(e) => {
                        tracing::warn!(%e, "undecodable router message, dropped");
                    }
                },
                Event::Eof(Source::Controller) => return Err(DataflowError::ControllerLost),
                Event::Eof(Source::Router(idx)) => {
                    tracing::warn!(router = idx, "router connection lost");
                }
                Event::Bad(source, e) => {
                    tracing::warn!(?source, %e, "undecodable chunk");
                    if source == Source::Controller {
                        return Err(DataflowError::ControllerLost);
                    }
                }
            }
        }
    }

    /// Worker-side: ask the controller for a collection of the next
    /// generation. No-op unless currently idle.
    pub async fn request_gc(&mut self) -> Result<(), DataflowError> {
        if self.gc_state != GcState::Idle {
            tracing::debug!(state = ?self.gc_state, "GC request suppressed");
            return Ok(());
        }
        let gen = self.gc_generation + 1;
        let msg = wire::gc_request(gen);
        self.send_to_controller(&msg).await?;
        tracing::debug!(generation = gen, "requested garbage collection");
        self.gc_state = GcState::Requested;
        Ok(())
    }

    /// Fold the agent counters into the head of a full stat array.
    pub fn fill_stats(&mut self, out: &mut [u64]) {
        self.stats[crate::STAT_TABLE_BYTE_PEAK] = self.table.byte_peak;
        out[..NSTAT_AGENT].copy_from_slice(&self.stats);
    }
}
