//! nimbus wire format — header layouts and message builders.
//!
//! These layouts ARE the protocol. Header words pack fields MSB→LSB as
//! documented on each accessor; hash-derived routing (`worker = hash
//! mod W`) and agent addressing both depend on every process agreeing
//! on them, so nothing here may change without a fleet-wide flag day.
//!
//! Single-word headers carry `agent` in bits 63..48 and the message
//! code in bits 7..0. Operators and operands use a double-word header:
//! word 0 holds agent/opcode-or-offset/code, word 1 holds the 64-bit
//! operator ID `(agent << 48) | sequence`.

use crate::chunk::{Chunk, CHUNK_MAX_LEN};

/// Default controller port.
pub const CONTROLLER_PORT: u16 = 6616;

/// Words of header in an operator chunk: header, operator ID, valid mask.
pub const OP_HEADER_LEN: usize = 3;

/// Words of header in an operand chunk: the two destination words.
pub const OPER_HEADER_LEN: usize = 2;

/// Router-map entries that fit in one ACK_AGENT chunk.
pub const MAX_MAP_ENTRIES: usize = CHUNK_MAX_LEN - 1;

const MASK8: u64 = 0xff;
const MASK16: u64 = 0xffff;
const MASK32: u64 = 0xffff_ffff;

/// Message codes, the low byte of every header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgCode {
    /// Dataflow operator.
    Operation = 0,
    /// Dataflow operand.
    Operand = 1,
    RegisterRouter = 2,
    RegisterClient = 3,
    RegisterWorker = 4,
    /// Controller → agent: agent ID, worker count, router map.
    AckAgent = 5,
    /// Agent → router: identify this connection.
    RegisterAgent = 6,
    ReadyWorker = 7,
    Stat = 8,
    DoFlush = 9,
    Kill = 10,
    Nack = 11,
    /// Client-initiated global operation payload.
    CliopData = 12,
    CliopAck = 13,
    GcRequest = 14,
    GcStart = 15,
    GcFinish = 16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown message code {0}")]
    UnknownCode(u8),

    #[error("message too short: {got} words, need {need}")]
    TooShort { got: usize, need: usize },
}

impl TryFrom<u8> for MsgCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MsgCode::*;
        Ok(match value {
            0 => Operation,
            1 => Operand,
            2 => RegisterRouter,
            3 => RegisterClient,
            4 => RegisterWorker,
            5 => AckAgent,
            6 => RegisterAgent,
            7 => ReadyWorker,
            8 => Stat,
            9 => DoFlush,
            10 => Kill,
            11 => Nack,
            12 => CliopData,
            13 => CliopAck,
            14 => GcRequest,
            15 => GcStart,
            16 => GcFinish,
            other => return Err(WireError::UnknownCode(other)),
        })
    }
}

// ── Single-word header accessors ──────────────────────────────────────────────

pub fn header_code(h: u64) -> u8 {
    (h & MASK8) as u8
}

pub fn header_agent(h: u64) -> u16 {
    ((h >> 48) & MASK16) as u16
}

pub fn header_opcode(h: u64) -> u8 {
    ((h >> 8) & MASK8) as u8
}

pub fn header_offset(h: u64) -> u8 {
    ((h >> 8) & MASK8) as u8
}

/// Port field of REGISTER_ROUTER and router-map words.
pub fn header_port(h: u64) -> u16 {
    ((h >> 48) & MASK16) as u16
}

/// IP field of router-map words.
pub fn header_ip(h: u64) -> u32 {
    ((h >> 16) & MASK32) as u32
}

/// Word count of ACK_AGENT (number of router-map entries overall).
pub fn header_wordcount(h: u64) -> u16 {
    ((h >> 32) & MASK16) as u16
}

/// Worker count of ACK_AGENT and STAT.
pub fn header_workercount(h: u64) -> u16 {
    ((h >> 16) & MASK16) as u16
}

/// Generation field of GC_REQUEST.
pub fn header_generation(h: u64) -> u32 {
    ((h >> 8) & MASK32) as u32
}

// ── Destinations ─────────────────────────────────────────────────────────────

/// Address of one slot of one operator on one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub agent: u16,
    pub operator_id: u64,
    pub offset: u8,
}

impl Destination {
    pub fn new(agent: u16, operator_id: u64, offset: u8) -> Self {
        Destination {
            agent,
            operator_id,
            offset,
        }
    }

    /// Pack into the two destination words (code bits left clear).
    pub fn pack(&self) -> (u64, u64) {
        let w0 = ((self.agent as u64) << 48) | ((self.offset as u64) << 8);
        (w0, self.operator_id)
    }

    /// Read a destination from the double-word header of a chunk.
    pub fn unpack(w0: u64, w1: u64) -> Self {
        Destination {
            agent: header_agent(w0),
            operator_id: w1,
            offset: header_offset(w0),
        }
    }

}

/// Build a fresh operator ID. Agents each own an exclusive 48-bit
/// sequence space under their 16-bit ID, so IDs are globally unique.
pub fn operator_id(agent: u16, seq: u64) -> u64 {
    ((agent as u64) << 48) | (seq & ((1u64 << 48) - 1))
}

// ── Message builders ─────────────────────────────────────────────────────────

/// Empty operator: double-word header, valid-mask word, `len - 3`
/// argument slots. The initial mask covers only the header words.
pub fn new_operator(opcode: u8, agent: u16, operator_id: u64, len: usize) -> Chunk {
    debug_assert!(len <= CHUNK_MAX_LEN);
    let mut c = Chunk::new(len);
    let h0 = ((agent as u64) << 48) | ((opcode as u64) << 8) | MsgCode::Operation as u64;
    c.overwrite(h0, 0);
    c.overwrite(operator_id, 1);
    c.overwrite(0x7, 2);
    c
}

/// Destination pointing at `offset` of an existing operator.
pub fn operator_slot(op: &Chunk, offset: u8) -> Destination {
    Destination {
        agent: header_agent(op.word(0)),
        operator_id: op.word(1),
        offset,
    }
}

/// Empty operand addressed to `dest`, with `len` total words.
pub fn new_operand(dest: Destination, len: usize) -> Chunk {
    let mut c = Chunk::new(len);
    let (w0, w1) = dest.pack();
    c.overwrite(w0 | MsgCode::Operand as u64, 0);
    c.overwrite(w1, 1);
    c
}

/// One-word operand carrying a single value.
pub fn value_operand(dest: Destination, value: u64) -> Chunk {
    let mut c = new_operand(dest, OPER_HEADER_LEN + 1);
    c.overwrite(value, OPER_HEADER_LEN);
    c
}

fn code_only(code: MsgCode) -> Chunk {
    let mut c = Chunk::new(1);
    c.overwrite(code as u64, 0);
    c
}

pub fn register_router(port: u16) -> Chunk {
    let mut c = Chunk::new(1);
    c.overwrite(
        ((port as u64) << 48) | MsgCode::RegisterRouter as u64,
        0,
    );
    c
}

pub fn register_client() -> Chunk {
    code_only(MsgCode::RegisterClient)
}

pub fn register_worker() -> Chunk {
    code_only(MsgCode::RegisterWorker)
}

pub fn register_agent(agent: u16) -> Chunk {
    let mut c = Chunk::new(1);
    c.overwrite(((agent as u64) << 48) | MsgCode::RegisterAgent as u64, 0);
    c
}

pub fn worker_ready(agent: u16) -> Chunk {
    let mut c = Chunk::new(1);
    c.overwrite(((agent as u64) << 48) | MsgCode::ReadyWorker as u64, 0);
    c
}

pub fn nack() -> Chunk {
    code_only(MsgCode::Nack)
}

pub fn kill() -> Chunk {
    code_only(MsgCode::Kill)
}

pub fn flush() -> Chunk {
    code_only(MsgCode::DoFlush)
}

pub fn gc_start() -> Chunk {
    code_only(MsgCode::GcStart)
}

pub fn gc_finish() -> Chunk {
    code_only(MsgCode::GcFinish)
}

pub fn gc_request(generation: u32) -> Chunk {
    let mut c = Chunk::new(1);
    c.overwrite(
        ((generation as u64) << 8) | MsgCode::GcRequest as u64,
        0,
    );
    c
}

/// Worker statistics: header plus one word per counter.
pub fn stat(nworkers: u16, values: &[u64]) -> Chunk {
    let mut c = Chunk::new(values.len() + 1);
    c.overwrite(((nworkers as u64) << 16) | MsgCode::Stat as u64, 0);
    for (i, v) in values.iter().enumerate() {
        c.overwrite(*v, i + 1);
    }
    c
}

/// Global client operation payload. `opcode` is interpreted by the
/// worker-side global handler; `data` rides in the remaining slots.
pub fn cliop_data(agent: u16, opcode: u8, data: &[u64]) -> Chunk {
    let mut c = Chunk::new(data.len() + 1);
    let h = ((agent as u64) << 48) | ((opcode as u64) << 8) | MsgCode::CliopData as u64;
    c.overwrite(h, 0);
    for (i, v) in data.iter().enumerate() {
        c.overwrite(*v, i + 1);
    }
    c
}

pub fn cliop_ack(agent: u16) -> Chunk {
    let mut c = Chunk::new(1);
    c.overwrite(((agent as u64) << 48) | MsgCode::CliopAck as u64, 0);
    c
}

/// Node ID for the router address set: `port (16) ‖ ip (32)`.
pub fn node_id(port: u16, ip: u32) -> u64 {
    ((port as u64) << 32) | ip as u64
}

/// A router-map word inside ACK_AGENT: node ID shifted so the port
/// lands at bits 63..48 and the IP at 47..16, where `header_port` and
/// `header_ip` find them.
pub fn router_map_word(node: u64) -> u64 {
    node << 16
}

/// ACK_AGENT header for one map block.
pub fn ack_agent_header(agent: u16, remaining_entries: u16, workers: u16) -> u64 {
    ((agent as u64) << 48)
        | ((remaining_entries as u64) << 32)
        | ((workers as u64) << 16)
        | MsgCode::AckAgent as u64
}

/// Decode the code byte of a received chunk.
pub fn code_of(msg: &Chunk) -> Result<MsgCode, WireError> {
    let h = msg.word_checked(0).ok_or(WireError::TooShort {
        got: msg.len(),
        need: 1,
    })?;
    MsgCode::try_from(header_code(h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for raw in 0u8..=16 {
            let code = MsgCode::try_from(raw).unwrap();
            assert_eq!(code as u8, raw);
        }
        assert!(MsgCode::try_from(17).is_err());
        assert!(MsgCode::try_from(0xff).is_err());
    }

    #[test]
    fn operator_header_fields() {
        let id = operator_id(7, 99);
        let op = new_operator(3, 7, id, 8);
        assert_eq!(header_agent(op.word(0)), 7);
        assert_eq!(header_opcode(op.word(0)), 3);
        assert_eq!(header_code(op.word(0)), MsgCode::Operation as u8);
        assert_eq!(op.word(1), id);
        assert_eq!(op.word(2), 0x7);
    }

    #[test]
    fn operator_id_space() {
        let id = operator_id(0xabcd, (1u64 << 48) + 5);
        assert_eq!(header_agent(id), 0xabcd);
        // Sequence wraps inside its 48-bit field without touching the agent.
        assert_eq!(id & ((1u64 << 48) - 1), 5);
    }

    #[test]
    fn destination_round_trip() {
        let d = Destination::new(12, operator_id(12, 4), 6);
        let (w0, w1) = d.pack();
        assert_eq!(Destination::unpack(w0, w1), d);
    }

    #[test]
    fn operand_carries_destination_and_code() {
        let d = Destination::new(3, operator_id(3, 1), 5);
        let oper = value_operand(d, 0x1234);
        assert_eq!(code_of(&oper).unwrap(), MsgCode::Operand);
        let got = Destination::unpack(oper.word(0), oper.word(1));
        assert_eq!(got, d);
        assert_eq!(oper.word(OPER_HEADER_LEN), 0x1234);
    }

    #[test]
    fn operator_slot_clears_opcode() {
        let op = new_operator(9, 2, operator_id(2, 0), 6);
        let d = operator_slot(&op, 4);
        assert_eq!(d.agent, 2);
        assert_eq!(d.offset, 4);
        let (w0, _) = d.pack();
        assert_eq!(header_code(w0), 0);
    }

    #[test]
    fn router_map_word_layout() {
        let n = node_id(9000, 0x7f00_0001);
        let w = router_map_word(n);
        assert_eq!(header_port(w), 9000);
        assert_eq!(header_ip(w), 0x7f00_0001);
    }

    #[test]
    fn ack_agent_layout() {
        let h = ack_agent_header(0x11, 5, 3);
        assert_eq!(header_agent(h), 0x11);
        assert_eq!(header_wordcount(h), 5);
        assert_eq!(header_workercount(h), 3);
        assert_eq!(header_code(h), MsgCode::AckAgent as u8);
    }

    #[test]
    fn gc_request_generation() {
        let c = gc_request(41);
        assert_eq!(header_generation(c.word(0)), 41);
        assert_eq!(code_of(&c).unwrap(), MsgCode::GcRequest);
    }
}
