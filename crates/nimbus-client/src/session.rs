//! A client session against the nimbus fleet.
//!
//! Every high-level operation injects the root operator of a dataflow
//! graph and waits for the operand reply. ITE-family operations go
//! through the distributed ITE operators; value-typed unary operations
//! (density, restrict, equant, shift, GC marking) start a fleet-wide
//! traversal with a CLIOP broadcast and then drive it root by root;
//! set-valued support and reach walk the diagram from the client side
//! through RETRIEVE_LOOKUP.

use std::collections::HashSet;

use nimbus_bdd::mgr::{ite_hash, ite_local, IteNorm};
use nimbus_bdd::ops::{self, owner_of_hash};
use nimbus_bdd::refs::Ref;
use nimbus_bdd::stats::{self, NSTAT};
use nimbus_bdd::uop::UopKind;
use nimbus_core::config::ConjunctConfig;
use nimbus_core::wire::{self, MsgCode, OPER_HEADER_LEN};
use nimbus_core::Chunk;
use nimbus_dataflow::{Agent, AgentSetup, DataflowError, Event, GcState, Source, WaitOutcome};

use crate::conjunct::{self, ConjunctEngine, ConjunctOutcome};
use crate::roots::RootTable;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("operation aborted by system flush")]
    Aborted,

    #[error("kill received")]
    Killed,

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    #[error(transparent)]
    Dataflow(#[from] DataflowError),
}

pub struct Session {
    pub agent: Agent,
    pub roots: RootTable,
    conjunct_cfg: ConjunctConfig,
    /// Variables created through this client; the count universe.
    nvars: u32,
    uop_seq: u32,
    /// Last statistics summary from a flush, for display.
    pub last_summary: Option<Vec<u64>>,
}

impl Session {
    pub async fn connect(
        host: &str,
        port: u16,
        try_local_router: bool,
        conjunct_cfg: ConjunctConfig,
    ) -> Result<Session, ClientError> {
        let agent = Agent::join(AgentSetup {
            is_client: true,
            controller_host: host.to_string(),
            controller_port: port,
            try_local_router,
        })
        .await?;
        tracing::info!(agent = agent.own_agent, workers = agent.nworkers, "client session open");
        Ok(Session {
            agent,
            roots: RootTable::new(),
            conjunct_cfg,
            nvars: 0,
            uop_seq: 0,
            last_summary: None,
        })
    }

    // ── Core dataflow plumbing ───────────────────────────────────────────────

    /// Send an operator and wait for its one-word reply.
    async fn fire_for_word(&mut self, op: Chunk, expect_id: u64) -> Result<u64, ClientError> {
        match self.agent.fire_and_wait(op, expect_id).await? {
            WaitOutcome::Operand(reply) => reply
                .word_checked(OPER_HEADER_LEN)
                .ok_or(ClientError::Protocol("empty operand reply")),
            WaitOutcome::Flushed => {
                self.on_flush_broadcast();
                Err(ClientError::Aborted)
            }
            WaitOutcome::Killed => Err(ClientError::Killed),
        }
    }

    async fn fire_for_ref(&mut self, op: Chunk, expect_id: u64) -> Result<Ref, ClientError> {
        Ok(Ref::from_word(self.fire_for_word(op, expect_id).await?))
    }

    /// Run any garbage collection that arrived mid-operation.
    pub async fn undefer(&mut self) -> Result<(), ClientError> {
        if self.agent.gc_state == GcState::Defer {
            self.run_gc_participation().await?;
        }
        Ok(())
    }

    /// A flush broadcast wipes every distributed root this session
    /// holds; only the permanent constants survive.
    fn on_flush_broadcast(&mut self) {
        tracing::info!("flush broadcast: resetting named roots");
        self.roots.reset();
        self.nvars = 0;
    }

    // ── BDD operations ───────────────────────────────────────────────────────

    pub async fn var(&mut self) -> Result<Ref, ClientError> {
        let dest = self.agent.own_destination();
        let id = self.agent.new_operator_id();
        let op = ops::build_var(0, id, dest);
        let r = self.fire_for_ref(op, dest.operator_id).await?;
        self.nvars += 1;
        self.undefer().await?;
        Ok(r)
    }

    pub async fn ite(&mut self, i: Ref, t: Ref, e: Ref) -> Result<Ref, ClientError> {
        let r = match ite_local(i, t, e) {
            IteNorm::Done(r) => r,
            IteNorm::Recurse { negate, i, t, e } => {
                let dest = self.agent.own_destination();
                let id = self.agent.new_operator_id();
                let worker = owner_of_hash(ite_hash(i, t, e), self.agent.nworkers);
                let op = ops::build_ite_lookup(worker, id, dest, i, t, e, negate);
                self.fire_for_ref(op, dest.operator_id).await?
            }
        };
        self.undefer().await?;
        Ok(r)
    }

    pub async fn and(&mut self, a: Ref, b: Ref) -> Result<Ref, ClientError> {
        self.ite(a, b, Ref::ZERO).await
    }

    pub async fn or(&mut self, a: Ref, b: Ref) -> Result<Ref, ClientError> {
        self.ite(a, Ref::ONE, b).await
    }

    pub async fn xor(&mut self, a: Ref, b: Ref) -> Result<Ref, ClientError> {
        self.ite(a, b.negate(), b).await
    }

    /// Children of a node, resolved remotely when necessary.
    pub async fn deref(&mut self, r: Ref) -> Result<(Ref, Ref), ClientError> {
        if let Some((_, hi, lo)) = nimbus_bdd::mgr::deref_local(r) {
            return Ok((hi, lo));
        }
        let dest = self.agent.own_destination();
        let id = self.agent.new_operator_id();
        let worker = owner_of_hash(r.hash_sig(), self.agent.nworkers);
        let op = ops::build_retrieve_lookup(worker, id, dest, r);
        match self.agent.fire_and_wait(op, dest.operator_id).await? {
            WaitOutcome::Operand(reply) => {
                let hi = reply
                    .word_checked(OPER_HEADER_LEN)
                    .ok_or(ClientError::Protocol("truncated retrieve reply"))?;
                let lo = reply
                    .word_checked(OPER_HEADER_LEN + 1)
                    .ok_or(ClientError::Protocol("truncated retrieve reply"))?;
                // The owning worker dereferences the signed ref, so the
                // negation is already pushed onto these children.
                Ok((Ref::from_word(hi), Ref::from_word(lo)))
            }
            WaitOutcome::Flushed => {
                self.on_flush_broadcast();
                Err(ClientError::Aborted)
            }
            WaitOutcome::Killed => Err(ClientError::Killed),
        }
    }

    // ── Client-side traversals (set-valued results) ──────────────────────────

    /// Variables in the support of `roots`.
    pub async fn support(&mut self, roots: &[Ref]) -> Result<HashSet<Ref>, ClientError> {
        let mut vars = HashSet::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<Ref> = roots.to_vec();
        while let Some(r) = stack.pop() {
            if r.is_const() || !seen.insert(r) {
                continue;
            }
            vars.insert(Ref::variable(r.var_index()));
            let (hi, lo) = self.deref(r).await?;
            stack.push(hi);
            stack.push(lo);
        }
        Ok(vars)
    }

    /// Non-constant nodes (absolute) reachable from `roots` — the same
    /// universe a mark traversal covers.
    pub async fn reach(&mut self, roots: &[Ref]) -> Result<HashSet<Ref>, ClientError> {
        let mut nodes = HashSet::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<Ref> = roots.to_vec();
        while let Some(r) = stack.pop() {
            if r.is_const() || !seen.insert(r) {
                continue;
            }
            nodes.insert(r.absval());
            let (hi, lo) = self.deref(r).await?;
            stack.push(hi);
            stack.push(lo);
        }
        Ok(nodes)
    }

    /// Node count of one function's diagram, constants included.
    pub async fn size(&mut self, r: Ref) -> Result<usize, ClientError> {
        if r.is_const() {
            return Ok(1);
        }
        Ok(self.reach(&[r]).await?.len())
    }

    // ── Distributed unary operations ─────────────────────────────────────────

    /// Start a fleet-wide unary traversal: broadcast its kind and aux
    /// data to every worker, wait for the aggregated acknowledgement.
    async fn start_uop(&mut self, kind: UopKind, aux: &[u64]) -> Result<u64, ClientError> {
        // The uid, the aux words, and the header must fit one chunk.
        if aux.len() + 2 > nimbus_core::CHUNK_MAX_LEN {
            return Err(ClientError::Protocol("too many literals for one operation"));
        }
        let uid = ((self.agent.own_agent as u64) << 32) | self.uop_seq as u64;
        self.uop_seq += 1;
        let mut data = Vec::with_capacity(aux.len() + 1);
        data.push(uid);
        data.extend_from_slice(aux);
        let msg = wire::cliop_data(self.agent.own_agent, kind as u8, &data);
        self.agent.send_to_controller(&msg).await?;

        // Wait for the controller-aggregated worker acks.
        loop {
            let event = self
                .agent
                .next_event()
                .await
                .ok_or(DataflowError::ChannelClosed)?;
            match event {
                Event::Msg(Source::Controller, msg) => match wire::code_of(&msg).ok() {
                    Some(MsgCode::CliopAck) => return Ok(uid),
                    Some(MsgCode::Kill) => return Err(ClientError::Killed),
                    Some(MsgCode::DoFlush) => {
                        self.on_flush_broadcast();
                        return Err(ClientError::Aborted);
                    }
                    Some(MsgCode::GcStart) => {
                        tracing::debug!("deferring GC start during global operation");
                        self.agent.gc_state = GcState::Defer;
                    }
                    other => {
                        tracing::warn!(?other, "unexpected controller message during global op");
                    }
                },
                Event::Msg(Source::Router(_), _) => {
                    tracing::warn!("unexpected router traffic during global op, dropped");
                }
                Event::Eof(Source::Controller) | Event::Bad(Source::Controller, _) => {
                    return Err(ClientError::Dataflow(DataflowError::ControllerLost));
                }
                Event::Eof(Source::Router(idx)) | Event::Bad(Source::Router(idx), _) => {
                    tracing::warn!(router = idx, "router lost during global op");
                }
            }
        }
    }

    /// Signal completion; the controller fans it out to the workers,
    /// which drop the traversal state.
    async fn finish_uop(&mut self) -> Result<(), ClientError> {
        let msg = wire::cliop_ack(self.agent.own_agent);
        self.agent.send_to_controller(&msg).await?;
        Ok(())
    }

    /// Value of one root under an active traversal. Callers resolve
    /// constant roots locally, so this always reaches a worker.
    async fn uop_value(&mut self, uid: u64, r: Ref) -> Result<u64, ClientError> {
        if r.is_const() {
            return Ok(r.word());
        }
        let dest = self.agent.own_destination();
        let id = self.agent.new_operator_id();
        let worker = owner_of_hash(r.absval().hash_sig(), self.agent.nworkers);
        let op = ops::build_uop_down(worker, id, dest, uid, r);
        self.fire_for_word(op, dest.operator_id).await
    }

    async fn run_value_uop(
        &mut self,
        kind: UopKind,
        aux: &[u64],
        r: Ref,
    ) -> Result<u64, ClientError> {
        let uid = self.start_uop(kind, aux).await?;
        let val = self.uop_value(uid, r).await;
        self.finish_uop().await?;
        let val = val?;
        self.undefer().await?;
        Ok(val)
    }

    /// Cofactor by a literal set.
    pub async fn restrict(&mut self, f: Ref, lits: &[Ref]) -> Result<Ref, ClientError> {
        if f.is_const() {
            return Ok(f);
        }
        let aux: Vec<u64> = lits.iter().map(|l| l.word()).collect();
        let val = self.run_value_uop(UopKind::Cofactor, &aux, f).await?;
        Ok(Ref::from_word(val))
    }

    /// Existential quantification over a variable set.
    pub async fn equant(&mut self, f: Ref, vars: &[Ref]) -> Result<Ref, ClientError> {
        if f.is_const() {
            return Ok(f);
        }
        let aux: Vec<u64> = vars.iter().map(|v| v.word()).collect();
        let val = self.run_value_uop(UopKind::Equant, &aux, f).await?;
        Ok(Ref::from_word(val))
    }

    /// Universal quantification: negate in and out around equant.
    pub async fn uquant(&mut self, f: Ref, vars: &[Ref]) -> Result<Ref, ClientError> {
        let q = self.equant(f.negate(), vars).await?;
        Ok(q.negate())
    }

    /// Variable shift along an order-preserving old → new map.
    pub async fn shift(&mut self, f: Ref, vmap: &[(Ref, Ref)]) -> Result<Ref, ClientError> {
        if f.is_const() {
            return Ok(f);
        }
        let mut aux = Vec::with_capacity(vmap.len() * 2);
        for (old, new) in vmap {
            aux.push(old.word());
            aux.push(new.word());
        }
        let val = self.run_value_uop(UopKind::Shift, &aux, f).await?;
        Ok(Ref::from_word(val))
    }

    /// Fraction of assignments satisfying `f`.
    pub async fn density(&mut self, f: Ref) -> Result<f64, ClientError> {
        if f == Ref::ONE {
            return Ok(1.0);
        }
        if f == Ref::ZERO {
            return Ok(0.0);
        }
        let val = self.run_value_uop(UopKind::Density, &[], f).await?;
        Ok(f64::from_bits(val))
    }

    /// Satisfying assignments over this session's variable universe.
    pub async fn count(&mut self, f: Ref) -> Result<u64, ClientError> {
        let d = self.density(f).await?;
        Ok((d * 2f64.powi(self.nvars as i32)).round() as u64)
    }

    // ── Garbage collection ───────────────────────────────────────────────────

    /// Ask the controller for a collection and see the cycle through.
    pub async fn collect(&mut self) -> Result<(), ClientError> {
        let msg = wire::gc_start();
        self.agent.send_to_controller(&msg).await?;
        self.await_gc_cycle().await
    }

    /// GC_START already arrived (possibly deferred): mark our roots,
    /// report finish, and wait for the fleet to return to ready.
    async fn run_gc_participation(&mut self) -> Result<(), ClientError> {
        self.agent.gc_state = GcState::Active;
        self.mark_roots().await?;
        let msg = wire::gc_finish();
        self.agent.send_to_controller(&msg).await?;
        self.wait_gc_finish().await
    }

    /// Drive a MARK traversal over every live named root so each
    /// worker's keep-set covers our reachable nodes.
    async fn mark_roots(&mut self) -> Result<(), ClientError> {
        let roots: Vec<Ref> = self.roots.function_roots().into_iter().collect();
        tracing::info!(roots = roots.len(), "marking roots for GC");
        let uid = self.start_uop(UopKind::Mark, &[]).await?;
        for r in &roots {
            self.uop_value(uid, *r).await?;
        }
        self.finish_uop().await
    }

    /// Event loop for a full cycle we initiated: the controller will
    /// send GC_START (mark phase) and later GC_FINISH.
    async fn await_gc_cycle(&mut self) -> Result<(), ClientError> {
        loop {
            let event = self
                .agent
                .next_event()
                .await
                .ok_or(DataflowError::ChannelClosed)?;
            match event {
                Event::Msg(Source::Controller, msg) => match wire::code_of(&msg).ok() {
                    Some(MsgCode::GcStart) => {
                        self.agent.gc_state = GcState::Active;
                        self.mark_roots().await?;
                        let msg = wire::gc_finish();
                        self.agent.send_to_controller(&msg).await?;
                    }
                    Some(MsgCode::GcFinish) => {
                        self.finish_gc_cycle();
                        return Ok(());
                    }
                    Some(MsgCode::Kill) => return Err(ClientError::Killed),
                    Some(MsgCode::DoFlush) => {
                        self.on_flush_broadcast();
                        return Err(ClientError::Aborted);
                    }
                    other => tracing::warn!(?other, "unexpected controller message during GC"),
                },
                Event::Msg(Source::Router(_), _) => {
                    tracing::warn!("router traffic during GC, dropped");
                }
                Event::Eof(Source::Controller) | Event::Bad(Source::Controller, _) => {
                    return Err(ClientError::Dataflow(DataflowError::ControllerLost));
                }
                Event::Eof(Source::Router(idx)) | Event::Bad(Source::Router(idx), _) => {
                    tracing::warn!(router = idx, "router lost during GC");
                }
            }
        }
    }

    /// After our GC_FINISH went out: wait for the controller's.
    async fn wait_gc_finish(&mut self) -> Result<(), ClientError> {
        loop {
            let event = self
                .agent
                .next_event()
                .await
                .ok_or(DataflowError::ChannelClosed)?;
            match event {
                Event::Msg(Source::Controller, msg) => match wire::code_of(&msg).ok() {
                    Some(MsgCode::GcFinish) => {
                        self.finish_gc_cycle();
                        return Ok(());
                    }
                    Some(MsgCode::Kill) => return Err(ClientError::Killed),
                    Some(MsgCode::DoFlush) => {
                        self.on_flush_broadcast();
                        return Err(ClientError::Aborted);
                    }
                    other => tracing::warn!(?other, "unexpected controller message during GC"),
                },
                Event::Msg(Source::Router(_), _) => {
                    tracing::warn!("router traffic during GC, dropped");
                }
                Event::Eof(Source::Controller) | Event::Bad(Source::Controller, _) => {
                    return Err(ClientError::Dataflow(DataflowError::ControllerLost));
                }
                Event::Eof(Source::Router(idx)) | Event::Bad(Source::Router(idx), _) => {
                    tracing::warn!(router = idx, "router lost during GC");
                }
            }
        }
    }

    fn finish_gc_cycle(&mut self) {
        self.agent.gc_state = GcState::Idle;
        self.agent.gc_generation += 1;
        tracing::info!(generation = self.agent.gc_generation, "GC cycle complete");
    }

    /// Absorb any control traffic that arrived between operations.
    pub async fn pump_control(&mut self) -> Result<(), ClientError> {
        while let Some(event) = self.agent.try_next_event() {
            match event {
                Event::Msg(Source::Controller, msg) => match wire::code_of(&msg).ok() {
                    Some(MsgCode::Kill) => return Err(ClientError::Killed),
                    Some(MsgCode::DoFlush) => self.on_flush_broadcast(),
                    Some(MsgCode::GcStart) => {
                        // Another client triggered a collection.
                        self.run_gc_participation().await?;
                    }
                    Some(MsgCode::GcFinish) => {
                        tracing::warn!("stray GC finish, ignored");
                    }
                    Some(MsgCode::Stat) => {
                        self.record_summary(&msg);
                    }
                    other => tracing::warn!(?other, "unexpected controller message, ignored"),
                },
                Event::Msg(Source::Router(_), _) => {
                    tracing::warn!("unsolicited router traffic, dropped");
                }
                Event::Eof(Source::Controller) | Event::Bad(Source::Controller, _) => {
                    return Err(ClientError::Dataflow(DataflowError::ControllerLost));
                }
                Event::Eof(Source::Router(idx)) | Event::Bad(Source::Router(idx), _) => {
                    tracing::warn!(router = idx, "router connection lost");
                }
            }
        }
        Ok(())
    }

    // ── Flush, kill, status ──────────────────────────────────────────────────

    /// Flush the fleet and collect the aggregated statistics summary.
    pub async fn flush(&mut self) -> Result<(), ClientError> {
        let msg = wire::flush();
        self.agent.send_to_controller(&msg).await?;
        loop {
            let event = self
                .agent
                .next_event()
                .await
                .ok_or(DataflowError::ChannelClosed)?;
            match event {
                Event::Msg(Source::Controller, msg) => match wire::code_of(&msg).ok() {
                    Some(MsgCode::DoFlush) => self.on_flush_broadcast(),
                    Some(MsgCode::Stat) => {
                        self.record_summary(&msg);
                        return Ok(());
                    }
                    Some(MsgCode::Kill) => return Err(ClientError::Killed),
                    other => tracing::warn!(?other, "unexpected controller message during flush"),
                },
                Event::Msg(Source::Router(_), _) => {
                    tracing::warn!("router traffic during flush, dropped");
                }
                Event::Eof(Source::Controller) | Event::Bad(Source::Controller, _) => {
                    return Err(ClientError::Dataflow(DataflowError::ControllerLost));
                }
                Event::Eof(Source::Router(idx)) | Event::Bad(Source::Router(idx), _) => {
                    tracing::warn!(router = idx, "router lost during flush");
                }
            }
        }
    }

    fn record_summary(&mut self, msg: &Chunk) {
        let words: Vec<u64> = (0..msg.len()).filter_map(|i| msg.word_checked(i)).collect();
        let workers = wire::header_workercount(msg.word(0)).max(1);
        for i in 0..NSTAT {
            if let Some((minv, maxv, sum)) = stats::summary_triple(&words, i) {
                tracing::info!(
                    "{}: min {} max {} avg {:.2} sum {}",
                    stats::STAT_NAMES[i],
                    minv,
                    maxv,
                    sum as f64 / workers as f64,
                    sum
                );
            }
        }
        self.last_summary = Some(words);
    }

    /// Ask the controller to shut the whole system down.
    pub async fn kill(&mut self) -> Result<(), ClientError> {
        let msg = wire::kill();
        self.agent.send_to_controller(&msg).await?;
        Ok(())
    }

    /// Conjunction of named arguments with the configured heuristics.
    pub async fn conjunct(&mut self, args: Vec<Ref>) -> Result<ConjunctOutcome, ClientError> {
        let cfg = self.conjunct_cfg.clone();
        conjunct::conjunct(self, &cfg, args).await
    }
}

impl ConjunctEngine for Session {
    type Error = ClientError;

    async fn and(&mut self, a: Ref, b: Ref) -> Result<Ref, ClientError> {
        Session::and(self, a, b).await
    }

    async fn size(&mut self, r: Ref) -> Result<usize, ClientError> {
        Session::size(self, r).await
    }

    async fn support_vars(&mut self, r: Ref) -> Result<Vec<u16>, ClientError> {
        let mut vars: Vec<u16> = self
            .support(&[r])
            .await?
            .into_iter()
            .map(|v| v.var_index())
            .collect();
        vars.sort_unstable();
        Ok(vars)
    }
}
