//! Bridge orchestration
//!
//! [`ImsBridge`] owns every component, starts one receive task per channel
//! and exposes the management operations the control plane drives.
//!
//! # Architecture
//!
//! ```text
//!                   ┌──────────── ImsBridge ─────────────┐
//! management API ─► │ BridgeState (flows, handover, ESP) │
//!                   │      ▲               ▲             │
//! host hooks ─────► │   Router ◄── DataHandler ◄─ data ──┼── CP
//!                   │      │                             │
//!                   │      └──► PacketCodec ──── data ───┼─► CP
//!                   │ ControlDispatcher ◄──── control ───┼── CP
//!                   │ ControlSender ───────── control ───┼─► CP
//!                   └────────────────────────────────────┘
//! ```
//!
//! Every management mutation is applied locally before the peer is told
//! about it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ims_bridge::bridge::ImsBridge;
//! use ims_bridge::channel::MemoryChannel;
//! use ims_bridge::config::Config;
//! use ims_bridge::handover::CallState;
//! use ims_bridge::router::ChannelHostStack;
//!
//! # async fn example() -> Result<(), ims_bridge::BridgeError> {
//! let (control, _cp_control) = MemoryChannel::pair("control", 256, 64);
//! let (data, _cp_data) = MemoryChannel::pair("data", 1600, 128);
//! let (host, _deliveries) = ChannelHostStack::new();
//!
//! let bridge = ImsBridge::new(
//!     &Config::default_config(),
//!     Arc::new(control),
//!     Arc::new(data),
//!     Arc::new(host),
//! );
//! bridge.start();
//! bridge.set_call_state(CallState::VoLte, 0)?;
//! bridge.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod data;
mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{BlockChannel, ChannelWorker};
use crate::config::Config;
use crate::control::{commands, ControlDispatcher};
use crate::error::BridgeError;
use crate::esp::encode_records;
use crate::flow::{FlowInfo, FlowType, TupleRecord};
use crate::handover::{CallState, HandoverEvent, HandoverState};
use crate::packet::PacketCodec;
use crate::router::{HostStack, Router};
use crate::stats::{BridgeStats, StatsSnapshot};

use data::DataHandler;

pub use state::{BridgeState, LowPowerState};

/// The packet bridge
pub struct ImsBridge {
    state: Arc<BridgeState>,
    codec: Arc<PacketCodec>,
    router: Arc<Router>,
    control_channel: Arc<dyn BlockChannel>,
    data_channel: Arc<dyn BlockChannel>,
    backoff: Duration,
    shutdown_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ImsBridge {
    /// Assemble a bridge over the two channels
    ///
    /// Nothing runs until [`ImsBridge::start`].
    #[must_use]
    pub fn new(
        config: &Config,
        control: Arc<dyn BlockChannel>,
        data: Arc<dyn BlockChannel>,
        host: Arc<dyn HostStack>,
    ) -> Self {
        let stats = Arc::new(BridgeStats::new());
        let state = Arc::new(BridgeState::new(
            config,
            Arc::clone(&control),
            Arc::clone(&stats),
        ));
        let codec = Arc::new(PacketCodec::new(
            Arc::clone(&data),
            config.codec.frag_size,
            stats,
        ));
        let router = Arc::new(Router::new(Arc::clone(&state), Arc::clone(&codec), host));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            state,
            codec,
            router,
            control_channel: control,
            data_channel: data,
            backoff: config.transport.retry_backoff(),
            shutdown_tx,
            stopped: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the control and data receive tasks
    ///
    /// Must be called inside a Tokio runtime. Calling it again while the
    /// tasks run does nothing.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!("Bridge already started");
            return;
        }

        let control = ChannelWorker::new(
            Arc::clone(&self.control_channel),
            Arc::new(ControlDispatcher::new(Arc::clone(&self.state))),
            Arc::clone(self.state.stats()),
            self.backoff,
        );
        let data = ChannelWorker::new(
            Arc::clone(&self.data_channel),
            Arc::new(DataHandler::new(
                Arc::clone(&self.codec),
                Arc::clone(&self.router),
            )),
            Arc::clone(self.state.stats()),
            self.backoff,
        );

        workers.push(control.spawn(self.shutdown_tx.subscribe()));
        workers.push(data.spawn(self.shutdown_tx.subscribe()));
        info!(
            frag_size = self.codec.frag_size(),
            sim_count = self.state.settings().sim_count,
            "IMS bridge started"
        );
    }

    /// Stop the receive tasks and drop every flow
    ///
    /// Flows are removed quietly.
    pub async fn shutdown(&self) {
        // Set before the broadcast so a late subscriber that checks
        // `is_stopped` after subscribing cannot miss it
        self.stopped.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                warn!("Receive task ended abnormally: {}", e);
            }
        }

        let sims = self.state.settings().sim_count;
        for sim in 0..sims {
            for flow_type in [FlowType::Cp, FlowType::Ap] {
                let _ = self.state.reset(flow_type, sim, true);
            }
        }
        info!("IMS bridge stopped");
    }

    /// Receiver that fires once [`ImsBridge::shutdown`] begins
    ///
    /// Check [`ImsBridge::is_stopped`] after subscribing to catch a shutdown
    /// that already happened.
    #[must_use]
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Whether [`ImsBridge::shutdown`] has been called
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// The packet interception entry points
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Shared state
    #[must_use]
    pub fn state(&self) -> &Arc<BridgeState> {
        &self.state
    }

    /// Report a call state change on `sim`
    ///
    /// # Errors
    ///
    /// Returns `ApiError::InvalidSimCard` if `sim` is out of range.
    pub fn set_call_state(&self, call: CallState, sim: u32) -> Result<HandoverState, BridgeError> {
        let control = self.state.control();
        let next = self.state.handover().set_call_state(call, sim, |event| {
            if let Some(command) = event.command() {
                control.notify_u32(command, event.sim());
            }
            if let HandoverEvent::Handover { state, .. } = event {
                debug!(sim, ?state, "Handover trigger sent");
            }
        })?;
        Ok(next)
    }

    /// Register an AP flow in both directions and tell the peer
    ///
    /// # Errors
    ///
    /// Returns `ApiError` for an invalid record, or `FlowError` if the flow
    /// pool is exhausted.
    pub fn add_tuple(&self, record: &TupleRecord) -> Result<(), BridgeError> {
        self.state.register(record, FlowType::Ap)?;
        self.state
            .control()
            .notify(commands::APTUPLE_ADD, &record.encode());
        Ok(())
    }

    /// Remove an AP flow in both directions and tell the peer
    ///
    /// Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns `ApiError` for an invalid record.
    pub fn del_tuple(&self, record: &TupleRecord) -> Result<bool, BridgeError> {
        let removed = self.state.unregister(record, FlowType::Ap)?;
        self.state
            .control()
            .notify(commands::APTUPLE_DEL, &record.encode());
        Ok(removed)
    }

    /// Remove every AP flow on `sim` and tell the peer
    ///
    /// # Errors
    ///
    /// Returns `ApiError::InvalidSimCard` if `sim` is out of range.
    pub fn reset_tuples(&self, sim: u32) -> Result<usize, BridgeError> {
        let removed = self.state.reset(FlowType::Ap, sim, false)?;
        self.state.control().notify_u32(commands::APTUPLE_RESET, sim);
        Ok(removed)
    }

    /// Push the local MAC address to the peer
    ///
    /// # Errors
    ///
    /// Returns `BridgeError` if the message could not be sent.
    pub fn send_local_mac(&self, mac: [u8; 6]) -> Result<(), BridgeError> {
        self.state.control().send(commands::LOCAL_MAC, &mac)
    }

    /// Push the remote (gateway) MAC address to the peer
    ///
    /// # Errors
    ///
    /// Returns `BridgeError` if the message could not be sent.
    pub fn send_remote_mac(&self, mac: [u8; 6]) -> Result<(), BridgeError> {
        self.state.control().send(commands::REMOTE_MAC, &mac)
    }

    /// Enter or leave low power
    ///
    /// Entering low power first hands every tracked ESP sequence number to
    /// the peer, then announces the new state.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::InvalidLowPowerState` for `Unspec`.
    pub fn set_low_power(&self, state: LowPowerState) -> Result<(), BridgeError> {
        if state == LowPowerState::Unspec {
            return Err(crate::error::ApiError::InvalidLowPowerState("unspec".into()).into());
        }
        self.state.store_low_power(state);
        info!(?state, "Low-power state changed");

        let control = self.state.control();
        if state == LowPowerState::Start {
            let records = self.state.esp().records();
            control.notify(commands::AP_SYNC_ESP, &encode_records(&records));
        }
        control.notify_u32(commands::LP_STATE, state.wire_value());
        Ok(())
    }

    /// Start tracking ESP sequence numbers for `spi` and tell the peer
    ///
    /// # Errors
    ///
    /// Returns `ApiError` if the SPI is zero, tracked already, or the table
    /// is full.
    pub fn add_spi(&self, spi: u32) -> Result<(), BridgeError> {
        self.state.esp().add(spi)?;
        self.state.control().notify_u32(commands::SPI_ADD, spi);
        Ok(())
    }

    /// Stop tracking `spi` and tell the peer
    ///
    /// # Errors
    ///
    /// Returns `ApiError` if the SPI is zero or not tracked.
    pub fn del_spi(&self, spi: u32) -> Result<(), BridgeError> {
        self.state.esp().del(spi)?;
        self.state.control().notify_u32(commands::SPI_DEL, spi);
        Ok(())
    }

    /// Send a liveness probe; the peer answers with `echo-pong`
    ///
    /// # Errors
    ///
    /// Returns `BridgeError` if the message does not fit or cannot be sent.
    pub fn echo_ping(&self, text: &str) -> Result<(), BridgeError> {
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
        self.state.control().send(commands::ECHO_PING, &payload)
    }

    /// Every registered flow
    #[must_use]
    pub fn flows(&self) -> Vec<FlowInfo> {
        self.state.flows().snapshot()
    }

    /// Counters plus per-SIM call state
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.state.stats().snapshot();
        snapshot.sims = self.state.handover().status();
        snapshot
    }
}

impl std::fmt::Debug for ImsBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImsBridge")
            .field("state", &self.state)
            .field("workers", &self.workers.lock().len())
            .finish_non_exhaustive()
    }
}
