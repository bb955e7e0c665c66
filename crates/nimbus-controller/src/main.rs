//! nimbus-controller — registry and lifecycle manager.
//!
//! Admission runs leaves-first: routers register until the configured
//! count is reached, then workers receive their agent IDs and the
//! router map, and only after every worker reports READY are clients
//! admitted. The controller also relays flush/kill/CLIOP traffic,
//! folds worker statistics into min/max/sum summaries, and drives the
//! three-phase garbage-collection state machine.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use nimbus_core::chunk::{read_chunk, write_chunk, CodecError};
use nimbus_core::wire::{self, MsgCode, MAX_MAP_ENTRIES};
use nimbus_core::{net, Chunk};

#[derive(Parser, Debug)]
#[command(name = "nimbus-controller", about = "nimbus fleet controller")]
struct Args {
    /// Listening port.
    #[arg(short = 'p', long, default_value_t = wire::CONTROLLER_PORT)]
    port: u16,

    /// Number of routers to wait for.
    #[arg(short = 'r', long, default_value_t = 1)]
    routers: u16,

    /// Number of workers to wait for.
    #[arg(short = 'w', long, default_value_t = 1)]
    workers: u16,

    /// Maximum number of clients.
    #[arg(short = 'c', long, default_value_t = 1024)]
    clients: u16,

    /// Run without an interactive console. The controller is always
    /// console-less; accepted for command-line compatibility.
    #[arg(short = 'C', long)]
    no_console: bool,
}

type ConnId = usize;

enum Event {
    Accepted(TcpStream, u32),
    Msg(ConnId, Chunk),
    Eof(ConnId),
    Bad(ConnId, CodecError),
}

/// Garbage-collection phases.
enum GcPhase {
    Ready,
    WaitWorkerStart { need: usize },
    WaitClient { need: HashSet<ConnId> },
    WaitWorkerFinish { need: usize },
}

struct GlobalOp {
    id: u16,
    client: ConnId,
    acks: u16,
}

struct Controller {
    next_agent: u16,
    worker_cnt: u16,
    max_clients: u16,
    need_routers: u16,
    need_workers: u16,

    router_addrs: Vec<u64>,
    writers: HashMap<ConnId, OwnedWriteHalf>,
    new_conns: HashMap<ConnId, u32>,
    routers: HashSet<ConnId>,
    workers: HashSet<ConnId>,
    clients: HashSet<ConnId>,
    /// Clients whose registration arrived while GC was underway.
    defer_clients: HashSet<ConnId>,

    stat_messages: Vec<Chunk>,
    flush_requestor: Option<ConnId>,
    global_ops: Vec<GlobalOp>,

    gc: GcPhase,
    gc_generation: u32,
}

fn spawn_conn_reader(rd: OwnedReadHalf, id: ConnId, tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let mut rd = rd;
        loop {
            match read_chunk(&mut rd).await {
                Ok(Some(msg)) => {
                    if tx.send(Event::Msg(id, msg)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = tx.send(Event::Eof(id)).await;
                    return;
                }
                Err(e) => {
                    let _ = tx.send(Event::Bad(id, e)).await;
                    return;
                }
            }
        }
    });
}

/// What the event handler asks the main loop to do next.
enum Flow {
    Continue,
    /// Clean shutdown requested by a client kill.
    Shutdown,
    /// A worker died; the fleet cannot continue.
    Fatal(String),
}

impl Controller {
    fn new(args: &Args) -> Self {
        Controller {
            next_agent: 0,
            worker_cnt: args.workers,
            max_clients: args.clients,
            need_routers: args.routers,
            need_workers: args.workers,
            router_addrs: Vec::new(),
            writers: HashMap::new(),
            new_conns: HashMap::new(),
            routers: HashSet::new(),
            workers: HashSet::new(),
            clients: HashSet::new(),
            defer_clients: HashSet::new(),
            stat_messages: Vec::new(),
            flush_requestor: None,
            global_ops: Vec::new(),
            gc: GcPhase::Ready,
            gc_generation: 0,
        }
    }

    async fn send_to(&mut self, conn: ConnId, msg: &Chunk) {
        if let Some(wr) = self.writers.get_mut(&conn) {
            if let Err(e) = write_chunk(wr, msg).await {
                tracing::warn!(conn, %e, "send failed");
            }
        }
    }

    async fn broadcast(&mut self, conns: &[ConnId], msg: &Chunk) {
        for &conn in conns {
            self.send_to(conn, msg).await;
        }
    }

    fn worker_conns(&self) -> Vec<ConnId> {
        self.workers.iter().copied().collect()
    }

    fn client_conns(&self) -> Vec<ConnId> {
        self.clients.iter().copied().collect()
    }

    /// Assign the next agent ID and ship the router map, split across
    /// chunks when it exceeds the per-chunk cap.
    async fn add_agent(&mut self, conn: ConnId) {
        if self.next_agent >= self.worker_cnt + self.max_clients {
            tracing::info!(conn, "client limit exceeded, refusing");
            let msg = wire::nack();
            self.send_to(conn, &msg).await;
            return;
        }
        let agent = self.next_agent;
        self.next_agent += 1;

        let mut remaining = self.router_addrs.len();
        let mut sent = 0usize;
        while remaining > 0 || sent == 0 {
            let block = remaining.min(MAX_MAP_ENTRIES);
            let mut msg = Chunk::new(block + 1);
            msg.overwrite(
                wire::ack_agent_header(agent, remaining as u16, self.worker_cnt),
                0,
            );
            for i in 0..block {
                msg.overwrite(wire::router_map_word(self.router_addrs[sent + i]), i + 1);
            }
            self.send_to(conn, &msg).await;
            sent += block;
            remaining -= block;
        }
        tracing::info!(agent, conn, "agent admitted");
    }

    /// Accumulate one worker STAT message; once all workers reported,
    /// compute per-field min/max/sum and answer the flush requestor.
    async fn add_stat_message(&mut self, msg: Chunk) {
        self.stat_messages.push(msg);
        if self.stat_messages.len() < self.worker_cnt as usize {
            return;
        }
        let nstat = self.stat_messages[0].len().saturating_sub(1);
        let mut summary = vec![0u64; nstat * 3];
        for i in 0..nstat {
            let mut minv = u64::MAX;
            let mut maxv = 0u64;
            let mut sum = 0u64;
            for msg in &self.stat_messages {
                let v = msg.word_checked(i + 1).unwrap_or(0);
                minv = minv.min(v);
                maxv = maxv.max(v);
                sum = sum.wrapping_add(v);
            }
            summary[3 * i] = minv;
            summary[3 * i + 1] = maxv;
            summary[3 * i + 2] = sum;
            tracing::info!(
                field = i,
                min = minv,
                max = maxv,
                sum,
                avg = format_args!("{:.2}", sum as f64 / self.worker_cnt as f64),
                "worker statistics"
            );
        }
        if let Some(conn) = self.flush_requestor.take() {
            let msg = wire::stat(self.worker_cnt, &summary);
            self.send_to(conn, &msg).await;
        }
        self.stat_messages.clear();
    }

    /// Broadcast a flush, remember who asked, and abort any GC.
    async fn do_flush(&mut self, requestor: Option<ConnId>) {
        self.flush_requestor = requestor;
        self.stat_messages.clear();
        let msg = wire::flush();
        let targets: Vec<ConnId> = self.worker_conns().into_iter().chain(self.client_conns()).collect();
        self.broadcast(&targets, &msg).await;
        self.global_ops.clear();
        if !matches!(self.gc, GcPhase::Ready) {
            tracing::info!("flush aborts in-progress garbage collection");
            self.gc = GcPhase::Ready;
            self.admit_deferred_clients().await;
        }
    }

    /// Begin a collection: notify workers, await their start acks.
    async fn start_collection(&mut self) {
        let msg = wire::gc_start();
        let workers = self.worker_conns();
        self.broadcast(&workers, &msg).await;
        tracing::debug!("GC waiting for workers to start");
        self.gc = GcPhase::WaitWorkerStart {
            need: workers.len(),
        };
    }

    async fn admit_deferred_clients(&mut self) {
        let deferred: Vec<ConnId> = self.defer_clients.drain().collect();
        for conn in deferred {
            if !self.writers.contains_key(&conn) {
                continue;
            }
            self.clients.insert(conn);
            tracing::info!(conn, "admitting client deferred during GC");
            if self.need_workers == 0 {
                self.add_agent(conn).await;
            }
        }
    }

    /// The GC state machine. `generation` only matters for GC_REQUEST.
    async fn handle_gc(&mut self, code: MsgCode, generation: u32, conn: ConnId, is_client: bool) {
        match &mut self.gc {
            GcPhase::Ready => {
                if is_client && code == MsgCode::GcStart {
                    tracing::debug!(conn, "GC requested by client");
                    self.start_collection().await;
                } else if !is_client && code == MsgCode::GcRequest {
                    if generation == self.gc_generation + 1 {
                        tracing::debug!(conn, generation, "GC requested by worker");
                        self.start_collection().await;
                    } else {
                        tracing::debug!(
                            conn,
                            generation,
                            current = self.gc_generation,
                            "stale GC request dropped"
                        );
                    }
                } else {
                    tracing::warn!(?code, conn, "unexpected GC message in READY");
                }
            }
            GcPhase::WaitWorkerStart { need } => {
                if !is_client && code == MsgCode::GcStart {
                    *need -= 1;
                    if *need == 0 {
                        let msg = wire::gc_start();
                        let clients = self.client_conns();
                        self.broadcast(&clients, &msg).await;
                        let need: HashSet<ConnId> = clients.into_iter().collect();
                        tracing::debug!("GC waiting for clients to finish marking");
                        self.gc = GcPhase::WaitClient { need };
                        self.maybe_finish_clients().await;
                    }
                } else if code == MsgCode::GcRequest {
                    tracing::debug!(conn, "GC request while starting, ignored");
                } else {
                    tracing::warn!(?code, conn, "unexpected GC message while workers start");
                }
            }
            GcPhase::WaitClient { need } => {
                if is_client && code == MsgCode::GcFinish {
                    if !need.remove(&conn) {
                        tracing::warn!(conn, "GC finish from client not in the wait set");
                        return;
                    }
                    self.maybe_finish_clients().await;
                } else if code == MsgCode::GcRequest {
                    tracing::debug!(conn, "GC request while waiting on clients, ignored");
                } else {
                    tracing::warn!(?code, conn, "unexpected GC message while clients mark");
                }
            }
            GcPhase::WaitWorkerFinish { need } => {
                if !is_client && code == MsgCode::GcFinish {
                    *need -= 1;
                    if *need == 0 {
                        let msg = wire::gc_finish();
                        let clients = self.client_conns();
                        self.broadcast(&clients, &msg).await;
                        self.admit_deferred_clients().await;
                        self.gc_generation += 1;
                        self.gc = GcPhase::Ready;
                        tracing::info!(generation = self.gc_generation, "GC completed");
                    }
                } else if code == MsgCode::GcRequest {
                    tracing::debug!(conn, "GC request while workers finish, ignored");
                } else {
                    tracing::warn!(?code, conn, "unexpected GC message while workers finish");
                }
            }
        }
    }

    /// In WAIT_CLIENT with an empty wait set, move on to the worker
    /// finish phase. Also handles the zero-client fleet.
    async fn maybe_finish_clients(&mut self) {
        let done = matches!(&self.gc, GcPhase::WaitClient { need } if need.is_empty());
        if done {
            let msg = wire::gc_finish();
            let workers = self.worker_conns();
            self.broadcast(&workers, &msg).await;
            tracing::debug!("GC waiting for workers to finish");
            self.gc = GcPhase::WaitWorkerFinish {
                need: workers.len(),
            };
        }
    }

    /// Broadcast kill to everything we know about.
    async fn kill_all(&mut self) {
        let msg = wire::kill();
        let conns: Vec<ConnId> = self.writers.keys().copied().collect();
        self.broadcast(&conns, &msg).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let (listener, port) = net::listen(args.port)
        .await
        .with_context(|| format!("cannot set up server on port {}", args.port))?;
    tracing::info!(
        port,
        routers = args.routers,
        workers = args.workers,
        "controller listening"
    );

    let (tx, mut events) = mpsc::channel::<Event>(1024);
    {
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "accepted connection");
                        let ip = net::peer_ipv4(&stream);
                        if tx.send(Event::Accepted(stream, ip)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(%e, "accept failed"),
                }
            }
        });
    }

    let mut ctl = Controller::new(&args);
    let mut next_conn: ConnId = 0;

    while let Some(event) = events.recv().await {
        match handle_event(&mut ctl, event, &mut next_conn, &tx).await {
            Flow::Continue => {}
            Flow::Shutdown => {
                ctl.kill_all().await;
                tracing::info!("controller shut down");
                return Ok(());
            }
            Flow::Fatal(reason) => {
                ctl.kill_all().await;
                anyhow::bail!(reason);
            }
        }
    }
    Ok(())
}

async fn handle_event(
    ctl: &mut Controller,
    event: Event,
    next_conn: &mut ConnId,
    tx: &mpsc::Sender<Event>,
) -> Flow {
    match event {
        Event::Accepted(stream, ip) => {
            let id = *next_conn;
            *next_conn += 1;
            let (rd, wr) = stream.into_split();
            ctl.writers.insert(id, wr);
            ctl.new_conns.insert(id, ip);
            spawn_conn_reader(rd, id, tx.clone());
            Flow::Continue
        }
        Event::Msg(conn, msg) => handle_msg(ctl, conn, msg).await,
        Event::Eof(conn) | Event::Bad(conn, _) => handle_gone(ctl, conn).await,
    }
}

async fn handle_msg(ctl: &mut Controller, conn: ConnId, msg: Chunk) -> Flow {
    let Some(h) = msg.word_checked(0) else {
        tracing::warn!(conn, "empty message, dropped");
        return Flow::Continue;
    };
    let code = match MsgCode::try_from(wire::header_code(h)) {
        Ok(code) => code,
        Err(e) => {
            tracing::warn!(conn, %e, "unknown message code, dropped");
            return Flow::Continue;
        }
    };

    // First message on a fresh connection must be a registration.
    if let Some(ip) = ctl.new_conns.get(&conn).copied() {
        match code {
            MsgCode::RegisterRouter => {
                if ctl.need_routers == 0 {
                    tracing::warn!(conn, "unexpected router registration, closing");
                    ctl.new_conns.remove(&conn);
                    ctl.writers.remove(&conn);
                    return Flow::Continue;
                }
                ctl.new_conns.remove(&conn);
                let port = wire::header_port(h);
                ctl.router_addrs.push(wire::node_id(port, ip));
                ctl.routers.insert(conn);
                ctl.need_routers -= 1;
                tracing::info!(conn, port, ip = format_args!("{ip:#x}"), "router registered");
                if ctl.need_routers == 0 {
                    tracing::info!("all routers connected");
                    let pending = ctl.worker_conns();
                    for worker in pending {
                        ctl.add_agent(worker).await;
                    }
                }
            }
            MsgCode::RegisterWorker => {
                if ctl.workers.len() >= ctl.worker_cnt as usize {
                    tracing::warn!(conn, "unexpected worker registration, closing");
                    ctl.new_conns.remove(&conn);
                    ctl.writers.remove(&conn);
                    return Flow::Continue;
                }
                ctl.new_conns.remove(&conn);
                ctl.workers.insert(conn);
                tracing::info!(conn, "worker registered");
                if ctl.need_routers == 0 {
                    ctl.add_agent(conn).await;
                }
            }
            MsgCode::RegisterClient => {
                ctl.new_conns.remove(&conn);
                if matches!(ctl.gc, GcPhase::Ready) {
                    ctl.clients.insert(conn);
                    tracing::info!(conn, "client registered");
                    if ctl.need_workers == 0 {
                        ctl.add_agent(conn).await;
                    }
                } else {
                    tracing::info!(conn, "client registration deferred until GC completes");
                    ctl.defer_clients.insert(conn);
                }
            }
            other => {
                tracing::warn!(conn, ?other, "unexpected code from new connection, dropped");
            }
        }
        return Flow::Continue;
    }

    if ctl.workers.contains(&conn) {
        match code {
            MsgCode::ReadyWorker => {
                if ctl.need_workers == 0 {
                    tracing::warn!(conn, "unexpected worker ready, ignored");
                    return Flow::Continue;
                }
                ctl.need_workers -= 1;
                if ctl.need_workers == 0 {
                    tracing::info!("all workers ready");
                    let pending = ctl.client_conns();
                    for client in pending {
                        ctl.add_agent(client).await;
                    }
                }
            }
            MsgCode::Stat => ctl.add_stat_message(msg).await,
            MsgCode::CliopAck => {
                let id = wire::header_agent(h);
                let mut done_client = None;
                if let Some(pos) = ctl.global_ops.iter().position(|op| op.id == id) {
                    ctl.global_ops[pos].acks += 1;
                    if ctl.global_ops[pos].acks >= ctl.worker_cnt {
                        done_client = Some(ctl.global_ops.swap_remove(pos).client);
                    }
                } else {
                    tracing::warn!(id, "ack for unknown global operation");
                }
                if let Some(client) = done_client {
                    ctl.send_to(client, &msg).await;
                    tracing::trace!(id, "global operation acknowledged to client");
                }
            }
            MsgCode::GcStart | MsgCode::GcFinish => {
                ctl.handle_gc(code, 0, conn, false).await;
            }
            MsgCode::GcRequest => {
                let gen = wire::header_generation(h);
                ctl.handle_gc(code, gen, conn, false).await;
            }
            other => {
                tracing::warn!(conn, ?other, "unexpected message from worker, dropped");
            }
        }
        return Flow::Continue;
    }

    if ctl.clients.contains(&conn) {
        match code {
            MsgCode::Kill => {
                tracing::info!(conn, "remote request to kill system");
                return Flow::Shutdown;
            }
            MsgCode::DoFlush => {
                ctl.do_flush(Some(conn)).await;
            }
            MsgCode::CliopData => {
                let id = wire::header_agent(h);
                ctl.global_ops.push(GlobalOp {
                    id,
                    client: conn,
                    acks: 0,
                });
                let workers = ctl.worker_conns();
                ctl.broadcast(&workers, &msg).await;
                tracing::trace!(id, "global operation broadcast to workers");
            }
            MsgCode::CliopAck => {
                // Client-side completion: fan the finish out to workers.
                let workers = ctl.worker_conns();
                ctl.broadcast(&workers, &msg).await;
            }
            MsgCode::GcStart | MsgCode::GcFinish => {
                ctl.handle_gc(code, 0, conn, true).await;
            }
            other => {
                tracing::warn!(conn, ?other, "unexpected message from client, dropped");
            }
        }
        return Flow::Continue;
    }

    if ctl.routers.contains(&conn) {
        tracing::warn!(conn, ?code, "unexpected message from router, dropped");
        return Flow::Continue;
    }
    tracing::warn!(conn, ?code, "message from unknown connection, dropped");
    Flow::Continue
}

async fn handle_gone(ctl: &mut Controller, conn: ConnId) -> Flow {
    ctl.writers.remove(&conn);
    if ctl.new_conns.remove(&conn).is_some() {
        tracing::warn!(conn, "EOF from unregistered connection");
        return Flow::Continue;
    }
    if ctl.workers.remove(&conn) {
        return Flow::Fatal(format!("worker on connection {conn} disconnected"));
    }
    if ctl.clients.remove(&conn) {
        tracing::info!(conn, "client disconnected");
        // A client dying mid-GC counts as its GC finish.
        let in_wait = matches!(&ctl.gc, GcPhase::WaitClient { need } if need.contains(&conn));
        if in_wait {
            tracing::info!(conn, "removing dead client from GC wait set");
            ctl.handle_gc(MsgCode::GcFinish, 0, conn, true).await;
        }
        return Flow::Continue;
    }
    if ctl.routers.remove(&conn) {
        tracing::warn!(conn, "router disconnected; routing degraded");
        return Flow::Continue;
    }
    ctl.defer_clients.remove(&conn);
    Flow::Continue
}
