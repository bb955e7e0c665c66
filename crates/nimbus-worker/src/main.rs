//! nimbus-worker — executes dataflow operators over one BDD shard.

mod worker;

use anyhow::{bail, Context, Result};
use clap::Parser;

use nimbus_core::wire::{self, MsgCode, OPER_HEADER_LEN, OP_HEADER_LEN};
use nimbus_core::Chunk;
use nimbus_dataflow::{Agent, AgentSetup, Event, Source};

use worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "nimbus-worker", about = "nimbus BDD worker")]
struct Args {
    /// Controller host.
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// Controller port.
    #[arg(short = 'P', long, default_value_t = wire::CONTROLLER_PORT)]
    port: u16,

    /// Prefer a router on a local interface.
    #[arg(short = 'r', long)]
    local_router: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    // Refuse to start with a mismatched hash-signature width; routing
    // derives from it and must agree fleet-wide.
    nimbus_core::NimbusConfig::load().context("configuration invalid")?;

    let agent = Agent::join(AgentSetup {
        is_client: false,
        controller_host: args.host.clone(),
        controller_port: args.port,
        try_local_router: args.local_router,
    })
    .await
    .with_context(|| format!("cannot join fleet at {}:{}", args.host, args.port))?;
    tracing::info!(agent = agent.own_agent, workers = agent.nworkers, "worker ready");

    run(Worker::new(agent)).await
}

async fn run(mut w: Worker) -> Result<()> {
    loop {
        // Self-routed messages drain ahead of any socket traffic.
        while let Some(msg) = w.agent.pop_loopback() {
            dispatch(&mut w, msg).await?;
        }
        let Some(event) = w.agent.next_event().await else {
            return Ok(());
        };
        match event {
            Event::Msg(Source::Controller, msg) => {
                if handle_controller(&mut w, msg).await? {
                    tracing::info!("kill received, worker exiting");
                    return Ok(());
                }
            }
            Event::Msg(Source::Router(_), msg) => dispatch(&mut w, msg).await?,
            Event::Eof(Source::Controller) => bail!("unexpected EOF from controller"),
            Event::Bad(Source::Controller, e) => bail!("controller connection failed: {e}"),
            Event::Eof(Source::Router(idx)) => {
                tracing::warn!(router = idx, "router connection lost, continuing");
            }
            Event::Bad(Source::Router(idx), e) => {
                tracing::warn!(router = idx, %e, "router connection failed, continuing");
            }
        }
    }
}

/// Route an operator/operand through the join tables and fire anything
/// that saturates.
async fn dispatch(w: &mut Worker, msg: Chunk) -> Result<()> {
    match wire::code_of(&msg) {
        Ok(MsgCode::Operation) => {
            if msg.len() < OP_HEADER_LEN {
                tracing::warn!(len = msg.len(), "malformed operator, dropped");
                return Ok(());
            }
            if let Some(ready) = w.agent.table.receive_operation(msg) {
                w.fire(ready).await?;
            }
        }
        Ok(MsgCode::Operand) => {
            if msg.len() < OPER_HEADER_LEN {
                tracing::warn!(len = msg.len(), "malformed operand, dropped");
                return Ok(());
            }
            if let Some(ready) = w.agent.table.receive_operand(msg) {
                w.fire(ready).await?;
            }
        }
        Ok(code) => {
            tracing::warn!(?code, "unexpected message from router, dropped");
        }
        Err(e) => {
            tracing::warn!(%e, "undecodable message from router, dropped");
        }
    }
    Ok(())
}

/// Controller traffic: lifecycle, flush, global operations, GC.
/// Returns true when the worker should exit.
async fn handle_controller(w: &mut Worker, msg: Chunk) -> Result<bool> {
    let code = match wire::code_of(&msg) {
        Ok(code) => code,
        Err(e) => {
            tracing::warn!(%e, "undecodable controller message, ignored");
            return Ok(false);
        }
    };
    match code {
        MsgCode::Kill => return Ok(true),
        MsgCode::DoFlush => w.flush().await?,
        MsgCode::CliopData => {
            let h = msg.word(0);
            let client = wire::header_agent(h);
            let opcode = wire::header_opcode(h);
            let data: Vec<u64> = (1..msg.len()).filter_map(|i| msg.word_checked(i)).collect();
            w.uop_start(client, opcode, &data);
            let ack = wire::cliop_ack(client);
            w.agent.send_to_controller(&ack).await?;
        }
        MsgCode::CliopAck => {
            let client = wire::header_agent(msg.word(0));
            w.uop_finish(client);
        }
        MsgCode::GcStart => w.gc_start().await?,
        MsgCode::GcFinish => w.gc_finish().await?,
        other => {
            tracing::warn!(?other, "unexpected controller message, ignored");
        }
    }
    Ok(false)
}
