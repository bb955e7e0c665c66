//! nimbus-router — the message switch.
//!
//! A router listens on an OS-assigned port, registers that port with
//! the controller, and then forwards operator/operand chunks between
//! the agents that identify themselves on accepted connections. It
//! keeps a single outbound FIFO and, per drain round, sends at most
//! one queued message to each of at most 25 distinct destinations, so
//! a chatty destination cannot starve the rest.

use std::collections::{HashMap, VecDeque};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use nimbus_core::chunk::{read_chunk, write_chunk, CodecError};
use nimbus_core::wire::{self, MsgCode};
use nimbus_core::{net, Chunk};

#[derive(Parser, Debug)]
#[command(name = "nimbus-router", about = "nimbus message router")]
struct Args {
    /// Controller host.
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// Controller port.
    #[arg(short = 'P', long, default_value_t = wire::CONTROLLER_PORT)]
    port: u16,

    /// Outbound buffering (Nagle) on accepted connections: 1 on, 0 off.
    #[arg(short = 'b', long, default_value_t = 1)]
    buffering: u8,
}

/// Distinct destinations served per outbound drain round.
const DRAIN_DESTS: usize = 25;

type ConnId = usize;

enum Event {
    Accepted(TcpStream),
    Msg(ConnId, Chunk),
    Eof(ConnId),
    Bad(ConnId, CodecError),
    CtlMsg(Chunk),
    CtlGone,
}

struct Router {
    /// agent → connection holding that agent.
    routing: HashMap<u16, ConnId>,
    /// connection → identified agent.
    inverse: HashMap<ConnId, u16>,
    writers: HashMap<ConnId, OwnedWriteHalf>,
    outq: VecDeque<(u16, Chunk)>,
    next_conn: ConnId,
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

impl Router {
    fn new() -> Self {
        Router {
            routing: HashMap::new(),
            inverse: HashMap::new(),
            writers: HashMap::new(),
            outq: VecDeque::new(),
            next_conn: 0,
        }
    }

    fn identify(&mut self, conn: ConnId, agent: u16) {
        self.routing.insert(agent, conn);
        self.inverse.insert(conn, agent);
        tracing::debug!(agent, conn, "routing table entry created");
    }

    fn disconnect(&mut self, conn: ConnId) {
        self.writers.remove(&conn);
        if let Some(agent) = self.inverse.remove(&conn) {
            self.routing.remove(&agent);
            tracing::info!(agent, conn, "agent disconnected");
        } else {
            tracing::debug!(conn, "unidentified connection closed");
        }
    }

    /// Queue a routing request by its destination agent. Unknown
    /// destinations are dropped after logging.
    fn enqueue(&mut self, msg: Chunk) {
        let Some(h) = msg.word_checked(0) else {
            tracing::warn!("routing request without header, dropped");
            return;
        };
        if msg.word_checked(1).is_none() {
            tracing::warn!("routing request without operator ID, dropped");
            return;
        }
        let agent = wire::header_agent(h);
        if !self.routing.contains_key(&agent) {
            tracing::warn!(agent, "message for unknown destination agent, dropped");
            return;
        }
        self.outq.push_back((agent, msg));
    }

    /// Drain the outbound queue: rounds of one message per distinct
    /// destination, at most `DRAIN_DESTS` destinations per round.
    async fn drain(&mut self) {
        while !self.outq.is_empty() {
            let mut served: Vec<u16> = Vec::new();
            let mut kept: VecDeque<(u16, Chunk)> = VecDeque::new();
            let mut round: Vec<(u16, Chunk)> = Vec::new();
            while let Some((agent, msg)) = self.outq.pop_front() {
                if served.len() >= DRAIN_DESTS || served.contains(&agent) {
                    kept.push_back((agent, msg));
                    continue;
                }
                served.push(agent);
                round.push((agent, msg));
            }
            self.outq = kept;
            if round.is_empty() {
                return;
            }
            for (agent, msg) in round {
                let Some(&conn) = self.routing.get(&agent) else {
                    tracing::warn!(agent, "destination vanished before send, dropped");
                    continue;
                };
                let Some(wr) = self.writers.get_mut(&conn) else {
                    tracing::warn!(agent, conn, "no writer for destination, dropped");
                    continue;
                };
                if let Err(e) = write_chunk(wr, &msg).await {
                    tracing::warn!(agent, %e, "send failed, message dropped");
                } else {
                    tracing::trace!(agent, id = format_args!("{:#x}", msg.word(1)), "routed");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let (listener, my_port) = net::listen(0).await.context("cannot set up listener")?;
    tracing::info!(port = my_port, "router listening");

    let controller = net::connect(&args.host, args.port)
        .await
        .with_context(|| format!("cannot reach controller at {}:{}", args.host, args.port))?;
    let (ctl_rd, mut ctl_wr) = controller.into_split();
    write_chunk(&mut ctl_wr, &wire::register_router(my_port))
        .await
        .context("could not register with controller")?;
    tracing::info!("registered with controller");

    let (tx, mut events) = mpsc::channel::<Event>(1024);

    // Listener task: hand accepted sockets to the owner loop.
    {
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "accepted connection");
                        if tx.send(Event::Accepted(stream)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%e, "accept failed");
                    }
                }
            }
        });
    }

    // Controller reader task.
    {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut rd = ctl_rd;
            loop {
                match read_chunk(&mut rd).await {
                    Ok(Some(msg)) => {
                        if tx.send(Event::CtlMsg(msg)).await.is_err() {
                            return;
                        }
                    }
                    _ => {
                        let _ = tx.send(Event::CtlGone).await;
                        return;
                    }
                }
            }
        });
    }

    let buffering = args.buffering == 1;
    let mut router = Router::new();

    // Owner loop: absorb every event already pending, then run one
    // outbound drain. Bursts therefore hit the fairness rounds instead
    // of being sent one by one.
    while let Some(event) = events.recv().await {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            if handle_event(&mut router, event, buffering, &tx)? {
                tracing::info!("kill received, shutting down");
                return Ok(());
            }
            next = events.try_recv().ok();
        }
        router.drain().await;
    }
    Ok(())
}

/// Apply one event to the router state. Returns true on kill.
fn handle_event(
    router: &mut Router,
    event: Event,
    buffering: bool,
    tx: &mpsc::Sender<Event>,
) -> Result<bool> {
    match event {
        Event::Accepted(stream) => {
            let _ = stream.set_nodelay(!buffering);
            let id = router.next_conn;
            router.next_conn += 1;
            let (rd, wr) = stream.into_split();
            router.writers.insert(id, wr);
            spawn_conn_reader(rd, id, tx.clone());
        }
        Event::Msg(conn, msg) => {
            let Some(h) = msg.word_checked(0) else {
                tracing::warn!(conn, "empty chunk, dropped");
                return Ok(false);
            };
            match MsgCode::try_from(wire::header_code(h)) {
                Ok(MsgCode::RegisterAgent) if !router.inverse.contains_key(&conn) => {
                    router.identify(conn, wire::header_agent(h));
                }
                Ok(MsgCode::Operation) | Ok(MsgCode::Operand)
                    if router.inverse.contains_key(&conn) =>
                {
                    router.enqueue(msg);
                }
                Ok(code) => {
                    tracing::warn!(conn, ?code, "unexpected message code, dropped");
                }
                Err(e) => {
                    tracing::warn!(conn, %e, "unknown message code, dropped");
                }
            }
        }
        Event::Eof(conn) => {
            router.disconnect(conn);
        }
        Event::Bad(conn, e) => {
            tracing::warn!(conn, %e, "connection failed");
            router.disconnect(conn);
        }
        Event::CtlMsg(msg) => match wire::code_of(&msg) {
            Ok(MsgCode::Kill) => return Ok(true),
            Ok(code) => {
                tracing::warn!(?code, "unexpected controller message, ignored");
            }
            Err(e) => {
                tracing::warn!(%e, "undecodable controller message, ignored");
            }
        },
        Event::CtlGone => {
            anyhow::bail!("lost connection to controller");
        }
    }
    Ok(false)
}
