//! Control channel protocol
//!
//! Named commands with small payloads travel one per control block in both
//! directions. [`ControlSender`] builds and sends them; the dispatcher in
//! [`dispatch`] decodes what the CP sends and routes each command through a
//! static registry.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ims_bridge::channel::MemoryChannel;
//! use ims_bridge::control::{commands, ControlSender};
//! use ims_bridge::stats::BridgeStats;
//!
//! let (ap, _cp) = MemoryChannel::pair("control", 256, 8);
//! let sender = ControlSender::new(Arc::new(ap), Arc::new(BridgeStats::new()));
//! sender.send_u32(commands::HO_FINISH, 0).unwrap();
//! ```

pub mod dispatch;
pub mod message;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::BlockChannel;
use crate::error::{BridgeError, ProtocolError};
use crate::ratelimit::LogLimiter;
use crate::stats::{BridgeStats, Counter};

pub use dispatch::ControlDispatcher;
pub use message::{read_u32, ControlMessage, COMMAND_SIZE, CONTROL_HEADER_LEN, CONTROL_VERSION};

/// Command names on the control channel
pub mod commands {
    pub const HO_LTE2WIFI: &str = "ho-lte2wifi";
    pub const HO_WIFI2LTE: &str = "ho-wifi2lte";
    pub const HO_FINISH: &str = "ho-finish";

    pub const CPTUPLE_ADD: &str = "cptuple-add";
    pub const CPTUPLE_DEL: &str = "cptuple-del";
    pub const CPTUPLE_RESET: &str = "cptuple-reset";
    pub const CP_RESET: &str = "cp-reset";
    pub const CP_SYNC_ESP: &str = "cp-sync-esp";

    pub const ECHO_PING: &str = "echo-ping";
    pub const ECHO_PONG: &str = "echo-pong";

    pub const APTUPLE_ADD: &str = "aptuple-add";
    pub const APTUPLE_DEL: &str = "aptuple-del";
    pub const APTUPLE_RESET: &str = "aptuple-reset";

    pub const VOWIFI_CALL: &str = "vowifi-call";
    pub const VOLTE_CALL: &str = "volte-call";
    pub const CALL_END: &str = "call-end";

    pub const LTEVIDEO_APSK: &str = "ltevideo-apsk";
    pub const LP_STATE: &str = "lp-state";
    pub const AP_SYNC_ESP: &str = "ap-sync-esp";
    pub const LOCAL_MAC: &str = "local-mac";
    pub const REMOTE_MAC: &str = "remote-mac";
    pub const SPI_ADD: &str = "spi-add";
    pub const SPI_DEL: &str = "spi-del";
}

/// Builds control messages into blocks and sends them
pub struct ControlSender {
    channel: Arc<dyn BlockChannel>,
    stats: Arc<BridgeStats>,
    error_log: LogLimiter,
}

impl ControlSender {
    #[must_use]
    pub fn new(channel: Arc<dyn BlockChannel>, stats: Arc<BridgeStats>) -> Self {
        Self {
            channel,
            stats,
            error_log: LogLimiter::default(),
        }
    }

    /// Largest payload one control block can carry
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.channel.block_size().saturating_sub(CONTROL_HEADER_LEN)
    }

    /// Send `command` with `payload`
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the message does not fit a block, or
    /// `TransportError` if no block is free or the send fails. Nothing is
    /// sent on error.
    pub fn send(&self, command: &str, payload: &[u8]) -> Result<(), BridgeError> {
        // Validate before taking a block so a bad message never holds one
        if payload.len() > self.max_payload() {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload(),
            }
            .into());
        }

        let mut block = self.channel.get().map_err(|e| {
            self.stats.inc(Counter::TransportGetFail);
            e
        })?;
        ControlMessage::encode(command, payload, self.max_payload(), block.buf_mut())?;

        self.channel.send(block).map_err(|e| {
            self.stats.inc(Counter::TransportSendFail);
            BridgeError::from(e)
        })?;

        self.stats.inc(Counter::ControlTx);
        debug!(command, len = payload.len(), "Sent control message");
        Ok(())
    }

    /// Send `command` with a single little-endian u32 payload
    ///
    /// # Errors
    ///
    /// See [`ControlSender::send`].
    pub fn send_u32(&self, command: &str, value: u32) -> Result<(), BridgeError> {
        self.send(command, &value.to_le_bytes())
    }

    /// Send and absorb failure into a rate-limited log line
    ///
    /// Returns whether the message went out.
    pub fn notify(&self, command: &str, payload: &[u8]) -> bool {
        match self.send(command, payload) {
            Ok(()) => true,
            Err(e) => {
                if self.error_log.allow() {
                    warn!(command, "Failed to notify peer: {}", e);
                }
                false
            }
        }
    }

    /// [`ControlSender::notify`] with a u32 payload
    pub fn notify_u32(&self, command: &str, value: u32) -> bool {
        self.notify(command, &value.to_le_bytes())
    }
}

impl std::fmt::Debug for ControlSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSender")
            .field("channel", &self.channel.name())
            .field("max_payload", &self.max_payload())
            .finish_non_exhaustive()
    }
}
