//! The unit of replicated state change: a sealed header plus payload blobs
//! and the RPC code that routes the payload to the right app handler.

use crate::base::{Ballot, Decree, Gpid};
use crate::utils::ReplicoreError;

use get_size::GetSize;
use serde::{Deserialize, Serialize};

/// RPC code for the empty no-op write a new primary emits to fill holes in
/// its prepare window.
pub const RPC_WRITE_EMPTY: u32 = 0;

/// Fixed metadata identifying a mutation. Two mutations with the same decree
/// but different ballots may coexist transiently during failover; the higher
/// ballot wins.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    GetSize,
    Default,
)]
pub struct MutationHeader {
    pub gpid: Gpid,
    pub ballot: Ballot,
    pub decree: Decree,
    /// Global log offset assigned at append time; zero until logged.
    pub log_offset: u64,
    /// The proposer's committed decree when this mutation was sealed; lets
    /// receivers piggyback commit advancement.
    pub last_committed_decree: Decree,
    pub timestamp_ms: u64,
    pub client_request_id: u64,
}

/// One proposed state-machine update. Immutable once sealed; shared between
/// the prepare list, outstanding prepare RPCs, and the log writer.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize,
)]
pub struct Mutation {
    pub header: MutationHeader,
    /// Serialized app requests; at most one today (no write batching).
    pub updates: Vec<Vec<u8>>,
    pub rpc_code: u32,
}

impl Mutation {
    pub fn new(header: MutationHeader, rpc_code: u32, payload: Vec<u8>) -> Self {
        Mutation {
            header,
            updates: vec![payload],
            rpc_code,
        }
    }

    /// An empty write used to re-prepare holes under a new ballot.
    pub fn new_empty(header: MutationHeader) -> Self {
        Mutation {
            header,
            updates: Vec::new(),
            rpc_code: RPC_WRITE_EMPTY,
        }
    }

    pub fn is_empty_write(&self) -> bool {
        self.rpc_code == RPC_WRITE_EMPTY
    }

    /// Identifying name, `<ballot>.<decree>`.
    pub fn name(&self) -> String {
        format!("{}.{}", self.header.ballot, self.header.decree)
    }

    /// Appends the length-prefixed MessagePack encoding of this mutation to
    /// `buf`. The framing is what log blocks and learner cache blobs carry.
    pub fn serialize_into(
        &self,
        buf: &mut Vec<u8>,
    ) -> Result<(), ReplicoreError> {
        let body = rmp_serde::to_vec(self)?;
        let len = u32::try_from(body.len()).map_err(|_| {
            ReplicoreError::msg("mutation encoding exceeds u32 length")
        })?;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(())
    }

    /// Parses the next length-prefixed mutation starting at `*pos`, advancing
    /// `*pos` past it. Returns `Ok(None)` exactly at end of input; a partial
    /// frame is an error.
    pub fn parse_next(
        buf: &[u8],
        pos: &mut usize,
    ) -> Result<Option<Mutation>, ReplicoreError> {
        if *pos == buf.len() {
            return Ok(None);
        }
        if *pos + 4 > buf.len() {
            return Err(ReplicoreError::msg(
                "truncated mutation length prefix",
            ));
        }
        let len = u32::from_le_bytes(
            buf[*pos..*pos + 4].try_into().expect("4-byte slice"),
        ) as usize;
        let body_start = *pos + 4;
        let body_end = body_start + len;
        if body_end > buf.len() {
            return Err(ReplicoreError::msg("truncated mutation body"));
        }

        let mu: Mutation = rmp_serde::from_slice(&buf[body_start..body_end])?;
        *pos = body_end;
        Ok(Some(mu))
    }

    /// Parses a whole buffer of consecutive mutation frames.
    pub fn parse_all(buf: &[u8]) -> Result<Vec<Mutation>, ReplicoreError> {
        let mut pos = 0;
        let mut out = Vec::new();
        while let Some(mu) = Mutation::parse_next(buf, &mut pos)? {
            out.push(mu);
        }
        Ok(out)
    }
}
