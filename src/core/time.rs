//! Wall-clock timestamps and time-ordered id generation.
//!
//! Resource timestamps are unix seconds. Generated ids are flake ids:
//! a millisecond timestamp relative to [`FLAKE_EPOCH_MS`], a node id, and a
//! per-millisecond sequence, rendered as a decimal string so they sort by
//! creation time when compared numerically.

use parking_lot::Mutex;

/// Flake epoch: 2020-01-01T00:00:00Z in unix milliseconds.
pub const FLAKE_EPOCH_MS: u64 = 1_577_836_800_000;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_NODE_ID: u16 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

/// Current unix time in whole seconds.
pub fn unix_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current unix time in milliseconds.
pub fn unix_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Next update timestamp for a resource last updated at `previous`.
///
/// Never returns a value at or below `previous`, so an update always moves
/// `update_time` forward even when two writes land in the same second.
pub fn next_update_time(previous: i64) -> i64 {
    unix_seconds().max(previous.saturating_add(1))
}

#[derive(Debug)]
struct FlakeState {
    last_ms: u64,
    sequence: u16,
}

/// Generator for time-ordered unique ids.
#[derive(Debug)]
pub struct IdGenerator {
    node_id: u16,
    state: Mutex<FlakeState>,
}

impl IdGenerator {
    /// Create a generator for the given node id (masked to 10 bits).
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id: node_id & MAX_NODE_ID,
            state: Mutex::new(FlakeState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    /// Node id embedded in generated ids.
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Produce the next id as a decimal string.
    pub fn next_id(&self) -> String {
        self.next_raw().to_string()
    }

    /// Produce the next id as an integer.
    ///
    /// If the wall clock steps backwards the generator keeps issuing ids
    /// from its last observed millisecond, and when the sequence for a
    /// millisecond is exhausted it borrows the following millisecond.
    pub fn next_raw(&self) -> u64 {
        let now = unix_millis().saturating_sub(FLAKE_EPOCH_MS);
        let mut state = self.state.lock();

        if now > state.last_ms {
            state.last_ms = now;
            state.sequence = 0;
        } else if state.sequence >= MAX_SEQUENCE {
            state.last_ms += 1;
            state.sequence = 0;
        } else {
            state.sequence += 1;
        }

        (state.last_ms << (NODE_BITS + SEQUENCE_BITS))
            | ((self.node_id as u64) << SEQUENCE_BITS)
            | state.sequence as u64
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}
