//! ESP sequence side table
//!
//! Tracks the highest ESP sequence number seen for a handful of watched
//! SPIs, so IPsec replay windows can be handed to the CP when the AP enters
//! low power. Slots are atomics: the packet path updates sequence numbers
//! without locking, while adds and deletes are serialized.
//!
//! Records go over the control channel as `count:u32le` followed by `count`
//! entries of `{spi:u32le, seq:u32le}`.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ApiError;

/// Number of SPIs that can be watched at once
pub const ESP_SLOTS: usize = 8;

/// One tracked SPI and its sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EspRecord {
    pub spi: u32,
    pub seq: u32,
}

impl EspRecord {
    /// Encoded length of one record
    pub const WIRE_LEN: usize = 8;
}

#[derive(Debug, Default)]
struct EspSlot {
    spi: AtomicU32,
    seq: AtomicU32,
}

/// Fixed-capacity SPI table
#[derive(Debug, Default)]
pub struct EspTable {
    slots: [EspSlot; ESP_SLOTS],
    writer: Mutex<()>,
}

impl EspTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching `spi`
    ///
    /// # Errors
    ///
    /// Returns `ApiError` if `spi` is zero, already watched, or every slot
    /// is taken.
    pub fn add(&self, spi: u32) -> Result<(), ApiError> {
        if spi == 0 {
            return Err(ApiError::InvalidSpi(spi));
        }
        let _guard = self.writer.lock();
        if self.position(spi).is_some() {
            return Err(ApiError::SpiExists(spi));
        }
        let slot = self
            .slots
            .iter()
            .find(|slot| slot.spi.load(Ordering::Acquire) == 0)
            .ok_or(ApiError::EspTableFull(ESP_SLOTS))?;

        slot.seq.store(0, Ordering::Relaxed);
        slot.spi.store(spi, Ordering::Release);
        info!(spi = format_args!("{spi:#010x}"), "Watching ESP SPI");
        Ok(())
    }

    /// Stop watching `spi`
    ///
    /// # Errors
    ///
    /// Returns `ApiError` if `spi` is zero or not watched.
    pub fn del(&self, spi: u32) -> Result<(), ApiError> {
        if spi == 0 {
            return Err(ApiError::InvalidSpi(spi));
        }
        let _guard = self.writer.lock();
        let index = self.position(spi).ok_or(ApiError::SpiNotFound(spi))?;
        let slot = &self.slots[index];
        slot.spi.store(0, Ordering::Release);
        slot.seq.store(0, Ordering::Relaxed);
        info!(spi = format_args!("{spi:#010x}"), "Stopped watching ESP SPI");
        Ok(())
    }

    /// Record a sequence number seen on the wire
    ///
    /// Only raises the stored value. Returns whether `spi` is watched.
    pub fn observe(&self, spi: u32, seq: u32) -> bool {
        match self.position(spi) {
            Some(index) => {
                self.slots[index].seq.fetch_max(seq, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Overwrite sequence numbers with values supplied by the peer
    ///
    /// Unknown SPIs are skipped. Returns how many records were applied.
    pub fn sync_from_peer(&self, records: &[EspRecord]) -> usize {
        let mut applied = 0;
        for record in records {
            if let Some(index) = self.position(record.spi) {
                self.slots[index].seq.store(record.seq, Ordering::Relaxed);
                applied += 1;
            } else {
                debug!(spi = format_args!("{:#010x}", record.spi), "Peer synced unknown SPI");
            }
        }
        applied
    }

    /// Every watched SPI with its sequence number
    #[must_use]
    pub fn records(&self) -> Vec<EspRecord> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let spi = slot.spi.load(Ordering::Acquire);
                (spi != 0).then(|| EspRecord {
                    spi,
                    seq: slot.seq.load(Ordering::Relaxed),
                })
            })
            .collect()
    }

    fn position(&self, spi: u32) -> Option<usize> {
        if spi == 0 {
            return None;
        }
        self.slots
            .iter()
            .position(|slot| slot.spi.load(Ordering::Acquire) == spi)
    }
}

/// Encode records as a sync payload
#[must_use]
pub fn encode_records(records: &[EspRecord]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + records.len() * EspRecord::WIRE_LEN);
    // At most ESP_SLOTS records
    buf.put_u32_le(records.len() as u32);
    for record in records {
        buf.put_u32_le(record.spi);
        buf.put_u32_le(record.seq);
    }
    buf
}

/// Decode a sync payload
///
/// The declared count is clamped to the records actually present.
#[must_use]
pub fn decode_records(payload: &[u8]) -> Vec<EspRecord> {
    let count = crate::control::read_u32(payload) as usize;
    payload
        .get(4..)
        .unwrap_or_default()
        .chunks_exact(EspRecord::WIRE_LEN)
        .take(count)
        .map(|raw| EspRecord {
            spi: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            seq: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        })
        .collect()
}
