//! Concurrent flow table
//!
//! A fixed array of hash buckets, each an immutable `Vec<Arc<Flow>>` behind an
//! [`ArcSwap`]. Lookups load the current bucket snapshot without taking any
//! lock and walk it front to back. Writers serialize on one coarse mutex,
//! build a new bucket vector and swap it in. A replaced vector, and any flow
//! that only it referenced, is dropped when the last reader holding the old
//! snapshot releases its guard, which returns the flow's pool slot.
//!
//! # Ordering
//!
//! New flows are inserted at the head of their bucket, so the most recent
//! registration wins when several stored tuples match a packet.

use std::hash::BuildHasher;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::pool::{FlowPool, PoolSlot};
use super::tuple::{AddressFamily, FlowMeta, FlowType, LinkType, MediaType, SocketType, Tuple};
use crate::error::FlowError;
use crate::stats::{BridgeStats, Counter};

/// Default number of hash buckets
pub const DEFAULT_BUCKETS: usize = 512;

/// A registered flow
#[derive(Debug)]
pub struct Flow {
    tuple: Tuple,
    flow_type: FlowType,
    meta: FlowMeta,
    _slot: PoolSlot,
}

impl Flow {
    /// Stored tuple (ports may be wildcards)
    #[must_use]
    pub fn tuple(&self) -> &Tuple {
        &self.tuple
    }

    /// Which side registered the flow
    #[must_use]
    pub fn flow_type(&self) -> FlowType {
        self.flow_type
    }

    /// Routing metadata
    #[must_use]
    pub fn meta(&self) -> &FlowMeta {
        &self.meta
    }

    fn info(&self) -> FlowInfo {
        FlowInfo {
            kind: self.flow_type.label().to_string(),
            family: self.tuple.family(),
            protocol: self.tuple.protocol,
            src: self.tuple.src,
            src_port: self.tuple.src_port,
            dst: self.tuple.dst,
            dst_port: self.tuple.dst_port,
            media_type: self.meta.media_type,
            sim_card: self.meta.sim_card,
            link_type: self.meta.link_type,
            socket_type: self.meta.socket_type,
        }
    }
}

/// Result of [`FlowTable::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new entry was inserted
    Added,
    /// An identical entry already existed; nothing changed
    Duplicate,
}

/// Serializable description of a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowInfo {
    /// `cptuple` or `aptuple`
    pub kind: String,
    pub family: AddressFamily,
    pub protocol: u8,
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
    pub media_type: MediaType,
    pub sim_card: u8,
    pub link_type: LinkType,
    pub socket_type: SocketType,
}

type Bucket = Vec<Arc<Flow>>;

fn contains(bucket: &Bucket, tuple: &Tuple, flow_type: FlowType) -> bool {
    bucket
        .iter()
        .any(|f| f.flow_type == flow_type && f.tuple == *tuple)
}

/// Concurrent tuple → flow map with lock-free reads
pub struct FlowTable {
    buckets: Box<[ArcSwap<Bucket>]>,
    writer: Mutex<()>,
    hasher: ahash::RandomState,
    pool: Arc<FlowPool>,
    pool_wait: Duration,
    len: AtomicUsize,
    stats: Arc<BridgeStats>,
}

impl FlowTable {
    /// Create a table
    ///
    /// The bucket hash is seeded randomly per table.
    #[must_use]
    pub fn new(
        bucket_count: usize,
        pool_capacity: usize,
        pool_wait: Duration,
        stats: Arc<BridgeStats>,
    ) -> Self {
        let bucket_count = bucket_count.max(1);
        let buckets = (0..bucket_count)
            .map(|_| ArcSwap::from_pointee(Vec::new()))
            .collect();
        let hasher = ahash::RandomState::with_seeds(
            rand::random(),
            rand::random(),
            rand::random(),
            rand::random(),
        );

        Self {
            buckets,
            writer: Mutex::new(()),
            hasher,
            pool: FlowPool::new(pool_capacity),
            pool_wait,
            len: AtomicUsize::new(0),
            stats,
        }
    }

    #[inline]
    fn bucket(&self, tuple: &Tuple) -> &ArcSwap<Bucket> {
        let hash = self.hasher.hash_one(tuple.bucket_key());
        &self.buckets[(hash % self.buckets.len() as u64) as usize]
    }

    /// Register a flow
    ///
    /// An existing entry with the same tuple and flow type makes this a no-op
    /// that bumps the `flow_duplicated` counter.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::PoolExhausted` if no flow slot became free within
    /// the configured wait. A duplicate never waits for a slot.
    pub fn add(
        &self,
        tuple: Tuple,
        flow_type: FlowType,
        meta: FlowMeta,
    ) -> Result<AddOutcome, FlowError> {
        let bucket = self.bucket(&tuple);
        if contains(&bucket.load(), &tuple, flow_type) {
            return Ok(self.duplicate(&tuple, flow_type));
        }

        // The slot wait happens outside the writer lock so deletes can free one
        let Some(slot) = self.pool.acquire(self.pool_wait) else {
            self.stats.inc(Counter::FlowAllocFail);
            warn!(%tuple, "Flow pool exhausted, {} slots in use", self.pool.capacity());
            return Err(FlowError::PoolExhausted {
                capacity: self.pool.capacity(),
            });
        };

        let _writer = self.writer.lock();

        // Re-check: another writer may have added it while we waited
        let current = bucket.load_full();
        if contains(&current, &tuple, flow_type) {
            return Ok(self.duplicate(&tuple, flow_type));
        }

        let flow = Arc::new(Flow {
            tuple,
            flow_type,
            meta,
            _slot: slot,
        });
        let mut next = Vec::with_capacity(current.len() + 1);
        next.push(flow);
        next.extend(current.iter().cloned());
        bucket.store(Arc::new(next));
        self.len.fetch_add(1, Ordering::AcqRel);

        debug!(%tuple, kind = flow_type.label(), ?meta, "Flow added");
        Ok(AddOutcome::Added)
    }

    fn duplicate(&self, tuple: &Tuple, flow_type: FlowType) -> AddOutcome {
        self.stats.inc(Counter::FlowDuplicated);
        warn!(%tuple, kind = flow_type.label(), "Duplicate flow ignored");
        AddOutcome::Duplicate
    }

    /// Remove the entry with exactly this tuple and flow type
    ///
    /// Returns whether an entry was removed.
    pub fn del(&self, tuple: &Tuple, flow_type: FlowType) -> bool {
        let bucket = self.bucket(tuple);
        let _writer = self.writer.lock();

        let current = bucket.load_full();
        let Some(pos) = current
            .iter()
            .position(|f| f.flow_type == flow_type && f.tuple == *tuple)
        else {
            debug!(%tuple, kind = flow_type.label(), "Flow not found for delete");
            return false;
        };

        let mut next: Bucket = current.as_ref().clone();
        next.remove(pos);
        bucket.store(Arc::new(next));
        self.len.fetch_sub(1, Ordering::AcqRel);

        debug!(%tuple, kind = flow_type.label(), "Flow deleted");
        true
    }

    /// Run `f` on the first flow matching `tuple`, regardless of flow type
    ///
    /// Never blocks. The flow reference is only valid inside `f`.
    #[inline]
    pub fn with_match<R>(&self, tuple: &Tuple, f: impl FnOnce(&Flow) -> R) -> Option<R> {
        let bucket = self.bucket(tuple).load();
        bucket.iter().find(|flow| flow.tuple.matches(tuple)).map(|flow| f(flow))
    }

    /// First flow matching `tuple`, regardless of flow type
    #[must_use]
    pub fn find(&self, tuple: &Tuple) -> Option<Arc<Flow>> {
        let bucket = self.bucket(tuple).load();
        bucket.iter().find(|flow| flow.tuple.matches(tuple)).cloned()
    }

    /// Remove every flow of `flow_type` registered for `sim_card`
    ///
    /// `quiet` suppresses the summary log line. Returns the number removed.
    pub fn reset(&self, flow_type: FlowType, sim_card: u8, quiet: bool) -> usize {
        let removed =
            self.retain_where(|f| !(f.flow_type == flow_type && f.meta.sim_card == sim_card));
        if !quiet {
            info!(kind = flow_type.label(), sim_card, "Reset {} flows", removed);
        }
        removed
    }

    /// Remove every flow
    pub fn clear(&self) -> usize {
        self.retain_where(|_| false)
    }

    fn retain_where(&self, keep: impl Fn(&Flow) -> bool) -> usize {
        let _writer = self.writer.lock();
        let mut removed = 0;
        for bucket in self.buckets.iter() {
            let current = bucket.load();
            if current.iter().all(|f| keep(f)) {
                continue;
            }
            let next: Bucket = current.iter().filter(|f| keep(f)).cloned().collect();
            removed += current.len() - next.len();
            bucket.store(Arc::new(next));
        }
        self.len.fetch_sub(removed, Ordering::AcqRel);
        removed
    }

    /// Number of registered flows
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the table holds no flows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free flow slots
    #[must_use]
    pub fn pool_available(&self) -> usize {
        self.pool.available()
    }

    /// Every flow, in bucket order
    #[must_use]
    pub fn snapshot(&self) -> Vec<FlowInfo> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.load().iter().map(|f| f.info()).collect::<Vec<_>>())
            .collect()
    }
}

impl std::fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowTable")
            .field("buckets", &self.buckets.len())
            .field("len", &self.len())
            .field("pool", &self.pool)
            .finish()
    }
}
