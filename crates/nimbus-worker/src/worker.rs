//! Worker state and the distributed BDD operator handlers.
//!
//! A worker owns one shard of BDD state: the ref manager (unique table
//! plus ITE cache), the deferred-ITE fan-in lists, the unary-operation
//! states created by client CLIOP broadcasts, and the keep-set that
//! mark traversals populate between GC start and finish. Handlers are
//! functions of the fired operator chunk; their only side effects are
//! updates to this state and calls to `send_op`.

use std::collections::{HashMap, HashSet};

use nimbus_bdd::mgr::{
    canonize_local, deref_local, ite_hash, ite_local, split_variable, utable_hash, BddError,
    Canonize, IteNorm, RefMgr,
};
use nimbus_bdd::ops::{self, owner_of_hash, ARG0};
use nimbus_bdd::refs::Ref;
use nimbus_bdd::stats::{self, NSTAT};
use nimbus_bdd::uop::{UopAux, UopKind, UopRun};
use nimbus_core::wire::{self, Destination};
use nimbus_core::Chunk;
use nimbus_dataflow::table::op_insert_word;
use nimbus_dataflow::{Agent, DataflowError, GcState, NSTAT_AGENT};

/// Unique-table size that makes the worker ask for a collection, once
/// the table has also doubled since the last one.
const GC_NODE_THRESHOLD: usize = 1 << 18;

/// One distributed unary traversal on this worker's shard.
pub struct UopState {
    pub run: UopRun,
    /// Consumers waiting on a ref whose value is still in flight.
    pub pending: HashMap<Ref, Vec<Destination>>,
}

pub struct Worker {
    pub agent: Agent,
    pub mgr: RefMgr,
    /// ITE triples being computed here, with the consumers that asked
    /// for the same triple before the first computation finished.
    pub deferred_ite: HashMap<[Ref; 3], Vec<(Destination, bool)>>,
    /// Active unary traversals, keyed by `(client_agent << 32) | seq`.
    pub uops: HashMap<u64, UopState>,
    /// Marked keep-set for the collection in progress.
    pub gc_roots: HashSet<Ref>,
    last_gc_size: usize,
}

impl Worker {
    pub fn new(agent: Agent) -> Self {
        Worker {
            agent,
            mgr: RefMgr::new(),
            deferred_ite: HashMap::new(),
            uops: HashMap::new(),
            gc_roots: HashSet::new(),
            last_gc_size: 0,
        }
    }

    fn own(&self) -> u16 {
        self.agent.own_agent
    }

    async fn send_ref(&mut self, dest: Destination, r: Ref) -> Result<(), DataflowError> {
        tracing::trace!(%r, agent = dest.agent, id = format_args!("{:#x}", dest.operator_id), "sending ref result");
        self.agent.send_op(wire::value_operand(dest, r.word())).await
    }

    async fn send_value(&mut self, dest: Destination, val: u64) -> Result<(), DataflowError> {
        self.agent.send_op(wire::value_operand(dest, val)).await
    }

    /// Dispatch a fired operator to its handler. Unknown opcodes and
    /// short chunks are protocol violations: logged, dropped.
    pub async fn fire(&mut self, op: Chunk) -> anyhow::Result<()> {
        let opcode = wire::header_opcode(op.word(0));
        let id = op.word(1);
        tracing::trace!(opcode, id = format_args!("{id:#x}"), "firing operator");
        let outcome = match opcode {
            ops::OP_VAR => self.do_var(&op).await,
            ops::OP_CANONIZE => self.do_canonize(&op).await,
            ops::OP_CANONIZE_LOOKUP => self.do_canonize_lookup(&op).await,
            ops::OP_RETRIEVE_LOOKUP => self.do_retrieve_lookup(&op).await,
            ops::OP_ITE_LOOKUP => self.do_ite_lookup(&op).await,
            ops::OP_ITE_RECURSE => self.do_ite_recurse(&op).await,
            ops::OP_ITE_STORE => self.do_ite_store(&op).await,
            ops::OP_UOP_DOWN => self.do_uop_down(&op).await,
            ops::OP_UOP_UP => self.do_uop_up(&op).await,
            ops::OP_UOP_STORE => self.do_uop_store(&op).await,
            other => {
                tracing::warn!(opcode = other, "unknown opcode, operator dropped");
                Ok(())
            }
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(WorkerError::Dropped(reason)) => {
                tracing::warn!(opcode, id = format_args!("{id:#x}"), reason, "operator dropped");
                Ok(())
            }
            Err(WorkerError::Fatal(e)) => {
                tracing::error!(%e, "fatal engine error");
                Err(anyhow::Error::new(e))
            }
            Err(WorkerError::Dataflow(e)) => Err(e.into()),
        }
    }

    // ── BDD operators ────────────────────────────────────────────────────────

    async fn do_var(&mut self, op: &Chunk) -> Result<(), WorkerError> {
        let dest = checked_dest(op, ARG0)?;
        let r = self.mgr.new_variable().map_err(WorkerError::Fatal)?;
        tracing::debug!(%r, "allocated variable");
        self.send_ref(dest, r).await?;
        Ok(())
    }

    async fn do_canonize(&mut self, op: &Chunk) -> Result<(), WorkerError> {
        let dest = checked_dest(op, ARG0)?;
        let v = checked_ref(op, ARG0 + 2)?;
        let hi = checked_ref(op, ARG0 + 3)?;
        let lo = checked_ref(op, ARG0 + 4)?;
        match canonize_local(v, hi, lo).map_err(WorkerError::drop)? {
            Canonize::Done(r) => self.send_ref(dest, r).await?,
            Canonize::Lookup { negate, v, hi, lo } => {
                let hash = utable_hash(v, hi, lo);
                let worker = owner_of_hash(hash, self.agent.nworkers);
                let id = self.agent.new_operator_id();
                let lookup =
                    ops::build_canonize_lookup(worker, id, dest, hash, v, hi, lo, negate);
                self.agent.send_op(lookup).await?;
            }
        }
        Ok(())
    }

    async fn do_canonize_lookup(&mut self, op: &Chunk) -> Result<(), WorkerError> {
        let dest = checked_dest(op, ARG0)?;
        let hash = checked_word(op, ARG0 + 2)?;
        let v = checked_ref(op, ARG0 + 3)?;
        let hi = checked_ref(op, ARG0 + 4)?;
        let lo = checked_ref(op, ARG0 + 5)?;
        let negate = checked_word(op, ARG0 + 6)? != 0;
        // Uniquifier exhaustion is fatal: the normal form cannot be
        // maintained once a bucket runs out of distinct IDs.
        let r = match self.mgr.canonize_lookup(hash, v, hi, lo) {
            Ok(r) => r,
            Err(e @ BddError::UniquifierOverflow { .. }) => return Err(WorkerError::Fatal(e)),
            Err(e) => return Err(WorkerError::drop(e)),
        };
        self.send_ref(dest, r.negate_if(negate)).await?;
        self.gc_pressure_check().await?;
        Ok(())
    }

    async fn do_retrieve_lookup(&mut self, op: &Chunk) -> Result<(), WorkerError> {
        let dest = checked_dest(op, ARG0)?;
        let r = checked_ref(op, ARG0 + 2)?;
        let (_, hi, lo) = self.mgr.deref(r).map_err(WorkerError::drop)?;
        let mut oper = wire::new_operand(dest, wire::OPER_HEADER_LEN + 2);
        oper.overwrite(hi.word(), wire::OPER_HEADER_LEN);
        oper.overwrite(lo.word(), wire::OPER_HEADER_LEN + 1);
        self.agent.send_op(oper).await?;
        Ok(())
    }

    async fn do_ite_lookup(&mut self, op: &Chunk) -> Result<(), WorkerError> {
        let dest = checked_dest(op, ARG0)?;
        let i = checked_ref(op, ARG0 + 2)?;
        let t = checked_ref(op, ARG0 + 3)?;
        let e = checked_ref(op, ARG0 + 4)?;
        let negate = checked_word(op, ARG0 + 5)? != 0;

        if let Some(hit) = self.mgr.ite_cache_lookup(i, t, e) {
            self.send_ref(dest, hit.negate_if(negate)).await?;
            return Ok(());
        }
        // A computation for this triple is already in flight here:
        // join the fan-in list instead of recomputing.
        if let Some(consumers) = self.deferred_ite.get_mut(&[i, t, e]) {
            consumers.push((dest, negate));
            tracing::debug!(%i, %t, %e, "deferred duplicate ITE");
            return Ok(());
        }
        self.deferred_ite.insert([i, t, e], Vec::new());

        let var = split_variable(i, t, e);
        let store_id = self.agent.new_operator_id();
        let store = ops::build_ite_store(self.own(), store_id, dest, i, t, e, negate);
        let store_slot = wire::operator_slot(&store, ops::STORE_REF_SLOT);

        let recurse_id = self.agent.new_operator_id();
        let mut recurse =
            ops::build_ite_recurse(self.own(), recurse_id, store_slot, Ref::variable(var));

        for (arg, hi_slot) in [
            (i, ops::RECURSE_IHI_SLOT),
            (t, ops::RECURSE_THI_SLOT),
            (e, ops::RECURSE_EHI_SLOT),
        ] {
            if arg.var_index() == var {
                if let Some((_, hi, lo)) = deref_local(arg) {
                    op_insert_word(&mut recurse, hi.word(), hi_slot as usize);
                    op_insert_word(&mut recurse, lo.word(), hi_slot as usize + 1);
                } else {
                    // The cofactors live on the argument's owner; a
                    // two-word retrieve fills both slots at once.
                    let ndest = wire::operator_slot(&recurse, hi_slot);
                    let worker = owner_of_hash(arg.hash_sig(), self.agent.nworkers);
                    let id = self.agent.new_operator_id();
                    let retrieve = ops::build_retrieve_lookup(worker, id, ndest, arg);
                    self.agent.send_op(retrieve).await?;
                }
            } else {
                op_insert_word(&mut recurse, arg.word(), hi_slot as usize);
                op_insert_word(&mut recurse, arg.word(), hi_slot as usize + 1);
            }
        }
        self.agent.send_op(store).await?;
        self.agent.send_op(recurse).await?;
        Ok(())
    }

    async fn do_ite_recurse(&mut self, op: &Chunk) -> Result<(), WorkerError> {
        self.mgr.stats[stats::STAT_ITE_NEW_CNT] += 1;
        let dest = checked_dest(op, ARG0)?;
        let v = checked_ref(op, ARG0 + 2)?;
        let ihi = checked_ref(op, ARG0 + 3)?;
        let ilo = checked_ref(op, ARG0 + 4)?;
        let thi = checked_ref(op, ARG0 + 5)?;
        let tlo = checked_ref(op, ARG0 + 6)?;
        let ehi = checked_ref(op, ARG0 + 7)?;
        let elo = checked_ref(op, ARG0 + 8)?;

        let canon_id = self.agent.new_operator_id();
        let mut canon = ops::build_canonize(self.own(), canon_id, dest, v);

        for (triple, slot) in [
            ((ihi, thi, ehi), ops::CANONIZE_HI_SLOT),
            ((ilo, tlo, elo), ops::CANONIZE_LO_SLOT),
        ] {
            self.mgr.stats[stats::STAT_ITE_CNT] += 1;
            match ite_local(triple.0, triple.1, triple.2) {
                IteNorm::Done(r) => {
                    self.mgr.stats[stats::STAT_ITE_LOCAL_CNT] += 1;
                    op_insert_word(&mut canon, r.word(), slot as usize);
                }
                IteNorm::Recurse { negate, i, t, e } => {
                    let child_dest = wire::operator_slot(&canon, slot);
                    let worker = owner_of_hash(ite_hash(i, t, e), self.agent.nworkers);
                    let id = self.agent.new_operator_id();
                    let lookup = ops::build_ite_lookup(worker, id, child_dest, i, t, e, negate);
                    self.agent.send_op(lookup).await?;
                }
            }
        }
        self.agent.send_op(canon).await?;
        Ok(())
    }

    async fn do_ite_store(&mut self, op: &Chunk) -> Result<(), WorkerError> {
        let dest = checked_dest(op, ARG0)?;
        let i = checked_ref(op, ARG0 + 2)?;
        let t = checked_ref(op, ARG0 + 3)?;
        let e = checked_ref(op, ARG0 + 4)?;
        let r = checked_ref(op, ops::STORE_REF_SLOT as usize)?;
        let negate = checked_word(op, ARG0 + 6)? != 0;

        self.mgr.ite_cache_store(i, t, e, r);
        self.send_ref(dest, r.negate_if(negate)).await?;
        if let Some(consumers) = self.deferred_ite.remove(&[i, t, e]) {
            for (cdest, cneg) in consumers {
                tracing::debug!(%i, %t, %e, agent = cdest.agent, "delivering deferred ITE result");
                self.send_ref(cdest, r.negate_if(cneg)).await?;
            }
        }
        Ok(())
    }

    // ── Unary propagation ────────────────────────────────────────────────────

    async fn do_uop_down(&mut self, op: &Chunk) -> Result<(), WorkerError> {
        let dest = checked_dest(op, ARG0)?;
        let uid = checked_word(op, ARG0 + 2)?;
        let r = checked_ref(op, ARG0 + 3)?;

        let Some(state) = self.uops.get_mut(&uid) else {
            return Err(WorkerError::Dropped("unary operation not started"));
        };
        if let Some(&val) = state.run.memo.get(&r) {
            self.mgr.stats[stats::STAT_UOP_HIT_CNT] += 1;
            self.send_value(dest, val).await?;
            return Ok(());
        }
        if r.is_const() {
            let val = state.run.leaf_value(r);
            state.run.memo.insert(r, val);
            self.mgr.stats[stats::STAT_UOP_STORE_CNT] += 1;
            self.send_value(dest, val).await?;
            return Ok(());
        }
        if let Some(waiting) = state.pending.get_mut(&r) {
            waiting.push(dest);
            tracing::trace!(%r, uid = format_args!("{uid:#x}"), "joined in-flight unary value");
            return Ok(());
        }
        state.pending.insert(r, Vec::new());

        let (hi, lo) = match self.mgr.deref(r) {
            Ok((_, hi, lo)) => (hi, lo),
            Err(e) => {
                if let Some(state) = self.uops.get_mut(&uid) {
                    state.pending.remove(&r);
                }
                return Err(WorkerError::drop(e));
            }
        };
        let up_id = self.agent.new_operator_id();
        let mut up = ops::build_uop_up(self.own(), up_id, dest, uid, r);
        let mut downs = Vec::new();
        for (child, slot) in [(hi, ops::UOP_UP_HI_SLOT), (lo, ops::UOP_UP_LO_SLOT)] {
            let state = self.uops.get_mut(&uid).ok_or(WorkerError::Dropped("unary state vanished"))?;
            if child.is_const() {
                op_insert_word(&mut up, state.run.leaf_value(child), slot as usize);
            } else if let Some(&val) = state.run.memo.get(&child) {
                self.mgr.stats[stats::STAT_UOP_HIT_CNT] += 1;
                op_insert_word(&mut up, val, slot as usize);
            } else {
                let cdest = wire::operator_slot(&up, slot);
                let worker = owner_of_hash(child.absval().hash_sig(), self.agent.nworkers);
                let id = self.agent.new_operator_id();
                downs.push(ops::build_uop_down(worker, id, cdest, uid, child));
            }
        }
        self.agent.send_op(up).await?;
        for down in downs {
            self.agent.send_op(down).await?;
        }
        Ok(())
    }

    async fn do_uop_up(&mut self, op: &Chunk) -> Result<(), WorkerError> {
        let dest = checked_dest(op, ARG0)?;
        let uid = checked_word(op, ARG0 + 2)?;
        let r = checked_ref(op, ARG0 + 3)?;
        let hival = checked_word(op, ops::UOP_UP_HI_SLOT as usize)?;
        let loval = checked_word(op, ops::UOP_UP_LO_SLOT as usize)?;

        let Some(state) = self.uops.get(&uid) else {
            return Err(WorkerError::Dropped("unary operation not started"));
        };
        let vr = Ref::variable(r.var_index());
        match state.run.kind {
            UopKind::Mark => {
                self.gc_roots.insert(r.absval());
                self.complete_uop(uid, r, 1, dest).await
            }
            UopKind::Support => {
                if let Some(state) = self.uops.get_mut(&uid) {
                    state.run.marked.insert(vr);
                }
                self.complete_uop(uid, r, 1, dest).await
            }
            UopKind::Density => {
                let val = ((f64::from_bits(hival) + f64::from_bits(loval)) / 2.0).to_bits();
                self.complete_uop(uid, r, val, dest).await
            }
            UopKind::Cofactor => {
                let (pin_hi, pin_lo) = match &state.run.aux {
                    UopAux::Lits(set) => (set.contains(&vr), set.contains(&vr.negate())),
                    _ => (false, false),
                };
                if pin_hi {
                    self.complete_uop(uid, r, hival, dest).await
                } else if pin_lo {
                    self.complete_uop(uid, r, loval, dest).await
                } else {
                    self.finish_with_canonize(uid, r, dest, vr, hival, loval).await
                }
            }
            UopKind::Equant => {
                let quantified = matches!(&state.run.aux, UopAux::Vars(set) if set.contains(&vr));
                if quantified {
                    // or(hi, lo), possibly spanning workers.
                    match ite_local(Ref::from_word(hival), Ref::ONE, Ref::from_word(loval)) {
                        IteNorm::Done(res) => self.complete_uop(uid, r, res.word(), dest).await,
                        IteNorm::Recurse { negate, i, t, e } => {
                            let store_id = self.agent.new_operator_id();
                            let store = ops::build_uop_store(self.own(), store_id, dest, uid, r);
                            let val_slot = wire::operator_slot(&store, ops::UOP_STORE_VAL_SLOT);
                            let worker = owner_of_hash(ite_hash(i, t, e), self.agent.nworkers);
                            let id = self.agent.new_operator_id();
                            let lookup =
                                ops::build_ite_lookup(worker, id, val_slot, i, t, e, negate);
                            self.agent.send_op(store).await?;
                            self.agent.send_op(lookup).await?;
                            Ok(())
                        }
                    }
                } else {
                    self.finish_with_canonize(uid, r, dest, vr, hival, loval).await
                }
            }
            UopKind::Shift => {
                let nv = match &state.run.aux {
                    UopAux::VarMap(map) => {
                        map.get(&r.var_index()).copied().unwrap_or(r.var_index())
                    }
                    _ => r.var_index(),
                };
                self.finish_with_canonize(uid, r, dest, Ref::variable(nv), hival, loval)
                    .await
            }
        }
    }

    /// Combine step `canonize(v, hi, lo)` for value-typed unary ops:
    /// resolve locally when the rules allow, otherwise wire the lookup
    /// result into a UOP_STORE value slot.
    async fn finish_with_canonize(
        &mut self,
        uid: u64,
        r: Ref,
        dest: Destination,
        v: Ref,
        hival: u64,
        loval: u64,
    ) -> Result<(), WorkerError> {
        match canonize_local(v, Ref::from_word(hival), Ref::from_word(loval))
            .map_err(WorkerError::drop)?
        {
            Canonize::Done(res) => self.complete_uop(uid, r, res.word(), dest).await,
            Canonize::Lookup { negate, v, hi, lo } => {
                let store_id = self.agent.new_operator_id();
                let store = ops::build_uop_store(self.own(), store_id, dest, uid, r);
                let val_slot = wire::operator_slot(&store, ops::UOP_STORE_VAL_SLOT);
                let hash = utable_hash(v, hi, lo);
                let worker = owner_of_hash(hash, self.agent.nworkers);
                let id = self.agent.new_operator_id();
                let lookup = ops::build_canonize_lookup(worker, id, val_slot, hash, v, hi, lo, negate);
                self.agent.send_op(store).await?;
                self.agent.send_op(lookup).await?;
                Ok(())
            }
        }
    }

    async fn do_uop_store(&mut self, op: &Chunk) -> Result<(), WorkerError> {
        let dest = checked_dest(op, ARG0)?;
        let uid = checked_word(op, ARG0 + 2)?;
        let r = checked_ref(op, ARG0 + 3)?;
        let val = checked_word(op, ops::UOP_STORE_VAL_SLOT as usize)?;
        self.complete_uop(uid, r, val, dest).await
    }

    /// Memoize a finished unary value and deliver it to the original
    /// requester plus every consumer that joined while it was in
    /// flight.
    async fn complete_uop(
        &mut self,
        uid: u64,
        r: Ref,
        val: u64,
        dest: Destination,
    ) -> Result<(), WorkerError> {
        let waiting = match self.uops.get_mut(&uid) {
            Some(state) => {
                state.run.memo.insert(r, val);
                state.pending.remove(&r).unwrap_or_default()
            }
            None => Vec::new(),
        };
        self.mgr.stats[stats::STAT_UOP_STORE_CNT] += 1;
        self.send_value(dest, val).await?;
        for d in waiting {
            self.send_value(d, val).await?;
        }
        Ok(())
    }

    // ── Global operations (CLIOP) ────────────────────────────────────────────

    /// A client's CLIOP_DATA broadcast: start a unary traversal. The
    /// opcode byte is the unary kind; the payload is the uid followed
    /// by the aux words.
    pub fn uop_start(&mut self, client: u16, opcode: u8, data: &[u64]) {
        let Ok(kind) = UopKind::try_from(opcode) else {
            tracing::warn!(opcode, "unknown unary kind, ignored");
            return;
        };
        let Some(&uid) = data.first() else {
            tracing::warn!("unary start without uid, ignored");
            return;
        };
        let aux = match kind {
            UopKind::Cofactor => UopAux::Lits(data[1..].iter().map(|&w| Ref::from_word(w)).collect()),
            UopKind::Equant => UopAux::Vars(data[1..].iter().map(|&w| Ref::from_word(w)).collect()),
            UopKind::Shift => {
                let mut map = HashMap::new();
                for pair in data[1..].chunks_exact(2) {
                    map.insert(
                        Ref::from_word(pair[0]).var_index(),
                        Ref::from_word(pair[1]).var_index(),
                    );
                }
                UopAux::VarMap(map)
            }
            _ => UopAux::None,
        };
        tracing::debug!(client, ?kind, uid = format_args!("{uid:#x}"), "unary operation started");
        self.mgr.stats[stats::STAT_UOP_CNT] += 1;
        self.uops.insert(
            uid,
            UopState {
                run: UopRun::new(kind, aux),
                pending: HashMap::new(),
            },
        );
    }

    /// The client's finish broadcast: drop its traversal states.
    pub fn uop_finish(&mut self, client: u16) {
        let before = self.uops.len();
        self.uops.retain(|uid, _| (*uid >> 32) as u16 != client);
        tracing::debug!(client, dropped = before - self.uops.len(), "unary operations finished");
    }

    // ── GC and flush ─────────────────────────────────────────────────────────

    /// Controller told us a collection is beginning: reset the keep-set
    /// and ack so the mark phase can start.
    pub async fn gc_start(&mut self) -> Result<(), DataflowError> {
        tracing::info!("GC starting");
        self.gc_roots.clear();
        self.agent.gc_state = GcState::Active;
        let msg = wire::gc_start();
        self.agent.send_to_controller(&msg).await
    }

    /// All clients have marked: rebuild the shard from the keep-set.
    pub async fn gc_finish(&mut self) -> Result<(), DataflowError> {
        let (before, after) = self.mgr.collect(&self.gc_roots);
        self.deferred_ite.clear();
        self.uops.clear();
        self.gc_roots.clear();
        self.last_gc_size = after;
        self.agent.gc_state = GcState::Idle;
        self.agent.gc_generation += 1;
        tracing::info!(before, after, generation = self.agent.gc_generation, "GC finished");
        let msg = wire::gc_finish();
        self.agent.send_to_controller(&msg).await
    }

    /// Ask for a collection when the shard has grown enough.
    async fn gc_pressure_check(&mut self) -> Result<(), WorkerError> {
        let size = self.mgr.unique_len();
        if size >= GC_NODE_THRESHOLD && size >= 2 * self.last_gc_size.max(1) {
            self.agent.request_gc().await?;
        }
        Ok(())
    }

    /// Flush: report statistics, then reset every table to a fresh
    /// state. The GC generation survives so stale-request filtering
    /// stays aligned with the controller.
    pub async fn flush(&mut self) -> Result<(), DataflowError> {
        let mut values = [0u64; NSTAT];
        values[NSTAT_AGENT..].copy_from_slice(&self.mgr.stats[NSTAT_AGENT..]);
        self.agent.fill_stats(&mut values[..NSTAT_AGENT]);
        let msg = wire::stat(1, &values);
        self.agent.send_to_controller(&msg).await?;
        tracing::info!("flushed worker state");

        self.mgr = RefMgr::new();
        self.deferred_ite.clear();
        self.uops.clear();
        self.gc_roots.clear();
        self.last_gc_size = 0;
        self.agent.table.clear();
        Ok(())
    }
}

/// Handler-internal error discipline: most failures drop the message
/// and keep the worker alive; only engine-invariant violations kill it.
enum WorkerError {
    Dropped(&'static str),
    Fatal(BddError),
    Dataflow(DataflowError),
}

impl WorkerError {
    fn drop(e: BddError) -> Self {
        match e {
            BddError::InvalidLevels { .. } => WorkerError::Dropped("invalid levels"),
            BddError::MissingNode(_) => WorkerError::Dropped("missing unique-table entry"),
            BddError::BadDeref(_) => WorkerError::Dropped("bad dereference"),
            other => WorkerError::Fatal(other),
        }
    }
}

impl From<DataflowError> for WorkerError {
    fn from(e: DataflowError) -> Self {
        WorkerError::Dataflow(e)
    }
}

fn checked_word(op: &Chunk, at: usize) -> Result<u64, WorkerError> {
    op.word_checked(at)
        .ok_or(WorkerError::Dropped("missing argument slot"))
}

fn checked_ref(op: &Chunk, at: usize) -> Result<Ref, WorkerError> {
    checked_word(op, at).map(Ref::from_word)
}

fn checked_dest(op: &Chunk, at: usize) -> Result<Destination, WorkerError> {
    let w0 = checked_word(op, at)?;
    let w1 = checked_word(op, at + 1)?;
    Ok(Destination::unpack(w0, w1))
}

#[cfg(test)]
mod tests {
    use nimbus_bdd::stats;
    use nimbus_dataflow as dataflow;

    #[test]
    fn agent_and_engine_stat_indices_agree() {
        // The worker splices agent counters into the head of the full
        // stat array; the two crates must number them identically.
        assert_eq!(dataflow::NSTAT_AGENT, stats::NSTAT_AGENT);
        assert_eq!(dataflow::STAT_TABLE_BYTE_PEAK, stats::STAT_TABLE_BYTE_PEAK);
        assert_eq!(dataflow::STAT_OPS_TOTAL, stats::STAT_OPS_TOTAL);
        assert_eq!(dataflow::STAT_OPS_LOCAL, stats::STAT_OPS_LOCAL);
        assert_eq!(dataflow::STAT_OPERANDS_TOTAL, stats::STAT_OPERANDS_TOTAL);
        assert_eq!(dataflow::STAT_OPERANDS_LOCAL, stats::STAT_OPERANDS_LOCAL);
    }
}
