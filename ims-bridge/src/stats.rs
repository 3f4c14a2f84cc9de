//! Bridge statistics
//!
//! Counters are striped across a fixed number of cache-line aligned shards.
//! Each thread picks a shard once and only ever bumps its own slot, so hot-path
//! increments never bounce a shared cache line between cores. Reads sum every
//! shard and are therefore only approximately consistent, which is fine for
//! diagnostics.
//!
//! # Example
//!
//! ```
//! use ims_bridge::stats::{BridgeStats, Counter};
//!
//! let stats = BridgeStats::new();
//! stats.inc(Counter::PktsToCp);
//! stats.add(Counter::FragCreate, 3);
//! assert_eq!(stats.get(Counter::FragCreate), 3);
//!
//! let snapshot = stats.snapshot();
//! assert_eq!(snapshot.get(Counter::PktsToCp), 1);
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::handover::SimStatus;

/// Number of counter stripes
const SHARDS: usize = 16;

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_INDEX: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % SHARDS;
}

/// Every failure and success class the bridge counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Flow insert ignored because the same entry exists
    FlowDuplicated,
    /// Flow insert failed because the pool was exhausted
    FlowAllocFail,
    /// No free transmit block
    TransportGetFail,
    /// Receive on a channel failed
    TransportReceiveFail,
    /// Handing a block to the peer failed
    TransportSendFail,
    /// Tuple could not be resolved for a packet
    ConntrackGetFail,
    /// Tuple resolved by parsing the raw packet
    ConntrackSlowPath,
    /// Complete packets received from CP
    PktsFromCp,
    /// Packets relayed to CP
    PktsToCp,
    /// Stolen packet that could not be relayed
    RelayFail,
    /// Packets that needed fragmenting
    FragCreate,
    /// Packets fully fragmented and sent
    FragOk,
    /// Packets whose fragmentation failed part-way
    FragFail,
    /// Reassembly contexts started
    ReasmRequest,
    /// Reassembly contexts completed
    ReasmOk,
    /// Fragments or contexts dropped
    ReasmFail,
    /// Control messages received
    ControlRx,
    /// Control messages sent
    ControlTx,
    /// Control messages with a malformed header
    ControlInvalid,
    /// Control messages naming no registered command
    ControlUnknown,
}

impl Counter {
    /// Number of counters
    pub const COUNT: usize = 20;

    /// All counters, in reporting order
    pub const ALL: [Counter; Self::COUNT] = [
        Self::FlowDuplicated,
        Self::FlowAllocFail,
        Self::TransportGetFail,
        Self::TransportReceiveFail,
        Self::TransportSendFail,
        Self::ConntrackGetFail,
        Self::ConntrackSlowPath,
        Self::PktsFromCp,
        Self::PktsToCp,
        Self::RelayFail,
        Self::FragCreate,
        Self::FragOk,
        Self::FragFail,
        Self::ReasmRequest,
        Self::ReasmOk,
        Self::ReasmFail,
        Self::ControlRx,
        Self::ControlTx,
        Self::ControlInvalid,
        Self::ControlUnknown,
    ];

    /// Stable name used in snapshots and logs
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FlowDuplicated => "flow_duplicated",
            Self::FlowAllocFail => "flow_alloc_fail",
            Self::TransportGetFail => "transport_get_fail",
            Self::TransportReceiveFail => "transport_receive_fail",
            Self::TransportSendFail => "transport_send_fail",
            Self::ConntrackGetFail => "nfct_get_fail",
            Self::ConntrackSlowPath => "nfct_slow_path",
            Self::PktsFromCp => "pkts_fromcp",
            Self::PktsToCp => "pkts_tocp",
            Self::RelayFail => "relay_fail",
            Self::FragCreate => "frag_create",
            Self::FragOk => "frag_ok",
            Self::FragFail => "frag_fail",
            Self::ReasmRequest => "reasm_request",
            Self::ReasmOk => "reasm_ok",
            Self::ReasmFail => "reasm_fail",
            Self::ControlRx => "ctrl_rx",
            Self::ControlTx => "ctrl_tx",
            Self::ControlInvalid => "ctrl_invalid",
            Self::ControlUnknown => "ctrl_unknown",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

#[repr(align(64))]
struct Shard([AtomicU64; Counter::COUNT]);

impl Shard {
    fn new() -> Self {
        Self(std::array::from_fn(|_| AtomicU64::new(0)))
    }
}

/// Striped bridge counters
pub struct BridgeStats {
    shards: Box<[Shard]>,
}

impl BridgeStats {
    /// Create a zeroed counter set
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Shard::new()).collect(),
        }
    }

    /// Increment a counter by one
    #[inline]
    pub fn inc(&self, counter: Counter) {
        self.add(counter, 1);
    }

    /// Increment a counter by `n`
    #[inline]
    pub fn add(&self, counter: Counter, n: u64) {
        let shard = SHARD_INDEX.with(|idx| *idx);
        self.shards[shard].0[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    /// Current value of a counter summed across all stripes
    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.0[counter.index()].load(Ordering::Relaxed))
            .sum()
    }

    /// Take a serializable copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = Counter::ALL
            .iter()
            .map(|c| (c.name().to_string(), self.get(*c)))
            .collect();
        StatsSnapshot {
            counters,
            sims: Vec::new(),
        }
    }
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BridgeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for counter in Counter::ALL {
            map.entry(&counter.name(), &self.get(counter));
        }
        map.finish()
    }
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Counter values keyed by counter name
    pub counters: BTreeMap<String, u64>,

    /// Per-SIM call and handover state, filled in by the bridge
    #[serde(default)]
    pub sims: Vec<SimStatus>,
}

impl StatsSnapshot {
    /// Value of a counter in this snapshot
    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters.get(counter.name()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counter_table_is_complete() {
        for (i, counter) in Counter::ALL.iter().enumerate() {
            assert_eq!(counter.index(), i);
        }
        let names: std::collections::HashSet<_> = Counter::ALL.iter().map(|c| c.name()).collect();
        assert_eq!(names.len(), Counter::COUNT);
    }

    #[test]
    fn test_increment_and_snapshot() {
        let stats = BridgeStats::new();
        stats.inc(Counter::PktsFromCp);
        stats.inc(Counter::PktsFromCp);
        stats.add(Counter::ReasmFail, 5);

        assert_eq!(stats.get(Counter::PktsFromCp), 2);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.get(Counter::ReasmFail), 5);
        assert_eq!(snapshot.get(Counter::FragOk), 0);
        assert_eq!(snapshot.counters.len(), Counter::COUNT);
    }

    #[test]
    fn test_concurrent_increments_sum() {
        let stats = Arc::new(BridgeStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.inc(Counter::PktsToCp);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.get(Counter::PktsToCp), 8000);
    }

    #[test]
    fn test_snapshot_serializes_by_name() {
        let stats = BridgeStats::new();
        stats.inc(Counter::FlowDuplicated);
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"flow_duplicated\":1"));
    }
}
