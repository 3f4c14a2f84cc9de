//! State shared by every bridge component
//!
//! One [`BridgeState`] is built at startup and handed by `Arc` to the router,
//! the control dispatcher and the management API. Nothing lives in statics.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::BlockChannel;
use crate::config::{BridgeConfig, Config};
use crate::control::ControlSender;
use crate::error::{ApiError, BridgeError};
use crate::esp::EspTable;
use crate::flow::{AddOutcome, FlowTable, FlowType, TupleRecord};
use crate::handover::HandoverStateMachine;
use crate::stats::BridgeStats;

/// Low-power state pushed by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum LowPowerState {
    Unspec = 0,
    /// AP is entering low power; the CP takes over every egress packet
    Start = 1,
    /// AP is back
    End = 2,
}

impl LowPowerState {
    /// Parse the value carried by `lp-state`
    ///
    /// # Errors
    ///
    /// Returns `ApiError::InvalidLowPowerState` for `Unspec` and unknown values.
    pub fn from_wire(value: u32) -> Result<Self, ApiError> {
        match value {
            1 => Ok(Self::Start),
            2 => Ok(Self::End),
            other => Err(ApiError::InvalidLowPowerState(other.to_string())),
        }
    }

    /// Value carried by `lp-state`
    #[must_use]
    pub const fn wire_value(self) -> u32 {
        self as u32
    }
}

impl std::str::FromStr for LowPowerState {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "end" | "stop" => Ok(Self::End),
            _ => Err(ApiError::InvalidLowPowerState(s.to_string())),
        }
    }
}

/// Flow table, call state, ESP table and control sender of one bridge
#[derive(Debug)]
pub struct BridgeState {
    settings: BridgeConfig,
    flows: FlowTable,
    handover: HandoverStateMachine,
    esp: EspTable,
    control: ControlSender,
    stats: Arc<BridgeStats>,
    low_power: AtomicU32,
}

impl BridgeState {
    /// Build state from configuration, sending control messages on `control`
    #[must_use]
    pub fn new(config: &Config, control: Arc<dyn BlockChannel>, stats: Arc<BridgeStats>) -> Self {
        Self {
            settings: config.bridge.clone(),
            flows: FlowTable::new(
                config.flows.buckets,
                config.flows.pool_capacity,
                config.flows.pool_wait(),
                Arc::clone(&stats),
            ),
            handover: HandoverStateMachine::new(config.bridge.sim_count),
            esp: EspTable::new(),
            control: ControlSender::new(control, Arc::clone(&stats)),
            stats,
            low_power: AtomicU32::new(LowPowerState::Unspec.wire_value()),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &BridgeConfig {
        &self.settings
    }

    #[must_use]
    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    #[must_use]
    pub fn handover(&self) -> &HandoverStateMachine {
        &self.handover
    }

    #[must_use]
    pub fn esp(&self) -> &EspTable {
        &self.esp
    }

    #[must_use]
    pub fn control(&self) -> &ControlSender {
        &self.control
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }

    /// Current low-power state
    #[must_use]
    pub fn low_power(&self) -> LowPowerState {
        LowPowerState::from_wire(self.low_power.load(Ordering::Acquire))
            .unwrap_or(LowPowerState::Unspec)
    }

    /// Whether egress traffic is being forced to the CP
    #[inline]
    #[must_use]
    pub fn is_low_power(&self) -> bool {
        self.low_power.load(Ordering::Acquire) == LowPowerState::Start.wire_value()
    }

    pub(crate) fn store_low_power(&self, state: LowPowerState) {
        self.low_power.store(state.wire_value(), Ordering::Release);
    }

    /// Check a SIM index against the configured SIM count
    ///
    /// # Errors
    ///
    /// Returns `ApiError::InvalidSimCard` if out of range.
    pub fn check_sim(&self, sim: u32) -> Result<u8, ApiError> {
        if sim < self.settings.sim_count {
            // sim_count never exceeds u8::MAX
            Ok(sim as u8)
        } else {
            Err(ApiError::InvalidSimCard {
                sim,
                count: self.settings.sim_count,
            })
        }
    }

    /// Register `record` in both directions
    ///
    /// If the reverse direction cannot be added, a forward entry created by
    /// this call is removed again.
    ///
    /// # Errors
    ///
    /// Returns `ApiError` if the record is invalid, or `FlowError` if the
    /// flow pool is exhausted.
    pub fn register(&self, record: &TupleRecord, flow_type: FlowType) -> Result<(), BridgeError> {
        record.validate(self.settings.sim_count)?;
        let tuple = record.tuple();
        let meta = record.meta();

        let forward = self.flows.add(tuple, flow_type, meta)?;
        if let Err(e) = self.flows.add(tuple.inverted(), flow_type, meta) {
            if forward == AddOutcome::Added {
                self.flows.del(&tuple, flow_type);
            }
            return Err(e.into());
        }
        debug!(%tuple, kind = flow_type.label(), "Registered both directions");
        Ok(())
    }

    /// Remove both directions of `record`
    ///
    /// Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns `ApiError` if the record is invalid.
    pub fn unregister(&self, record: &TupleRecord, flow_type: FlowType) -> Result<bool, ApiError> {
        record.validate(self.settings.sim_count)?;
        let tuple = record.tuple();
        let forward = self.flows.del(&tuple, flow_type);
        let reverse = self.flows.del(&tuple.inverted(), flow_type);
        Ok(forward || reverse)
    }

    /// Remove every flow of `flow_type` on `sim`
    ///
    /// # Errors
    ///
    /// Returns `ApiError::InvalidSimCard` if `sim` is out of range.
    pub fn reset(&self, flow_type: FlowType, sim: u32, quiet: bool) -> Result<usize, ApiError> {
        let sim = self.check_sim(sim)?;
        Ok(self.flows.reset(flow_type, sim, quiet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::error::FlowError;
    use crate::flow::{ip_proto, LinkType, MediaType, SocketType, Tuple};

    fn state_with(config: &Config) -> (BridgeState, MemoryChannel) {
        let (ap, cp) = MemoryChannel::pair("control", 256, 16);
        let state = BridgeState::new(config, Arc::new(ap), Arc::new(BridgeStats::new()));
        (state, cp)
    }

    fn record(sim_card: u8) -> TupleRecord {
        TupleRecord {
            local_addr: "10.0.0.5".parse().unwrap(),
            local_port: 5000,
            peer_addr: "1.2.3.4".parse().unwrap(),
            peer_port: 6000,
            protocol: ip_proto::UDP,
            media_type: MediaType::RtpAudio,
            link_type: LinkType::Cp,
            socket_type: SocketType::Cp,
            sim_card,
        }
    }

    #[test]
    fn test_register_both_directions() {
        let (state, _cp) = state_with(&Config::default_config());
        state.register(&record(0), FlowType::Cp).unwrap();
        assert_eq!(state.flows().len(), 2);

        let reverse = Tuple::new(
            ip_proto::UDP,
            "1.2.3.4".parse().unwrap(),
            6000,
            "10.0.0.5".parse().unwrap(),
            5000,
        );
        assert!(state.flows().find(&reverse).is_some());

        assert!(state.unregister(&record(0), FlowType::Cp).unwrap());
        assert!(state.flows().is_empty());
        assert!(!state.unregister(&record(0), FlowType::Cp).unwrap());
    }

    #[test]
    fn test_register_rejects_invalid() {
        let (state, _cp) = state_with(&Config::default_config());
        let err = state.register(&record(5), FlowType::Ap).unwrap_err();
        assert!(matches!(err, BridgeError::Api(ApiError::InvalidSimCard { sim: 5, .. })));

        let mut unspec = record(0);
        unspec.media_type = MediaType::Unspec;
        assert!(state.register(&unspec, FlowType::Ap).is_err());
        assert!(state.flows().is_empty());
    }

    #[test]
    fn test_register_rolls_back_on_exhaustion() {
        let mut config = Config::default_config();
        config.flows.pool_capacity = 1;
        config.flows.pool_wait_ms = 0;
        let (state, _cp) = state_with(&config);

        let err = state.register(&record(0), FlowType::Cp).unwrap_err();
        assert!(matches!(err, BridgeError::Flow(FlowError::PoolExhausted { .. })));
        assert!(state.flows().is_empty());
        assert_eq!(state.flows().pool_available(), 1);
    }

    #[test]
    fn test_reset_checks_sim() {
        let (state, _cp) = state_with(&Config::default_config());
        state.register(&record(1), FlowType::Ap).unwrap();
        assert_eq!(state.reset(FlowType::Cp, 1, true).unwrap(), 0);
        assert_eq!(state.reset(FlowType::Ap, 1, true).unwrap(), 2);
        assert!(state.reset(FlowType::Ap, 2, true).is_err());
    }

    #[test]
    fn test_low_power_flag() {
        let (state, _cp) = state_with(&Config::default_config());
        assert_eq!(state.low_power(), LowPowerState::Unspec);
        assert!(!state.is_low_power());
        state.store_low_power(LowPowerState::Start);
        assert!(state.is_low_power());
        state.store_low_power(LowPowerState::End);
        assert!(!state.is_low_power());

        assert!(LowPowerState::from_wire(0).is_err());
        assert_eq!("start".parse::<LowPowerState>().unwrap(), LowPowerState::Start);
    }
}
