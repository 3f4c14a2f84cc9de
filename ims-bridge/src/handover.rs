//! Per-SIM call and handover state
//!
//! Each SIM tracks the call type its current call started on (`init`), the
//! call type it is on now (`curr`), and the resulting handover state. Call
//! state events arrive from the control plane and drive the table below.
//!
//! | event | condition | result | handover |
//! |---|---|---|---|
//! | `End` | any | `init = curr = End` | `Finish` |
//! | `s` | `init == End` | `init = curr = s` | `Finish` |
//! | `s` | otherwise | `curr = s` | `Finish` if `curr == init`, else `Lte2Wifi` if `init == VoLte`, else `Wifi2Lte` |
//!
//! The first two rows always notify the peer of the call state. A handover
//! trigger is emitted only when the handover state changes.
//!
//! Transitions are serialized by one lock. The router reads handover state on
//! the packet path through a lock-free mirror.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::control::commands;
use crate::error::ApiError;

/// Call type reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No call
    End,
    /// Call over Wi-Fi
    #[serde(rename = "vowifi")]
    VoWifi,
    /// Call over LTE
    #[serde(rename = "volte")]
    VoLte,
}

impl CallState {
    /// Notification command for this call state
    #[must_use]
    pub const fn command(self) -> &'static str {
        match self {
            Self::End => commands::CALL_END,
            Self::VoWifi => commands::VOWIFI_CALL,
            Self::VoLte => commands::VOLTE_CALL,
        }
    }
}

impl std::str::FromStr for CallState {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "end" => Ok(Self::End),
            "vowifi" => Ok(Self::VoWifi),
            "volte" => Ok(Self::VoLte),
            _ => Err(ApiError::InvalidCallState(s.to_string())),
        }
    }
}

/// Handover progress of one SIM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HandoverState {
    Unspec = 0,
    /// Call moving from LTE to Wi-Fi
    #[serde(rename = "lte2wifi")]
    Lte2Wifi = 1,
    /// Call moving from Wi-Fi to LTE
    #[serde(rename = "wifi2lte")]
    Wifi2Lte = 2,
    /// No handover in progress
    Finish = 3,
}

impl HandoverState {
    /// Trigger command sent when entering this state
    #[must_use]
    pub const fn command(self) -> Option<&'static str> {
        match self {
            Self::Unspec => None,
            Self::Lte2Wifi => Some(commands::HO_LTE2WIFI),
            Self::Wifi2Lte => Some(commands::HO_WIFI2LTE),
            Self::Finish => Some(commands::HO_FINISH),
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Lte2Wifi,
            2 => Self::Wifi2Lte,
            3 => Self::Finish,
            _ => Self::Unspec,
        }
    }
}

/// Something the peer has to be told about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoverEvent {
    /// A call started or ended on `sim`
    CallState { state: CallState, sim: u32 },
    /// `sim` entered a new handover state
    Handover { state: HandoverState, sim: u32 },
}

impl HandoverEvent {
    /// Control command carrying this event
    #[must_use]
    pub fn command(&self) -> Option<&'static str> {
        match self {
            Self::CallState { state, .. } => Some(state.command()),
            Self::Handover { state, .. } => state.command(),
        }
    }

    /// The SIM index payload
    #[must_use]
    pub fn sim(&self) -> u32 {
        match self {
            Self::CallState { sim, .. } | Self::Handover { sim, .. } => *sim,
        }
    }
}

/// Introspection view of one SIM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimStatus {
    pub sim_card: u32,
    pub init_call: CallState,
    pub curr_call: CallState,
    pub handover: HandoverState,
}

#[derive(Debug, Clone, Copy)]
struct CallLegs {
    init: CallState,
    curr: CallState,
    handover: HandoverState,
}

impl Default for CallLegs {
    fn default() -> Self {
        Self {
            init: CallState::End,
            curr: CallState::End,
            handover: HandoverState::Finish,
        }
    }
}

/// Call/handover state for every SIM
#[derive(Debug)]
pub struct HandoverStateMachine {
    sims: Mutex<Vec<CallLegs>>,
    handover: Box<[AtomicU8]>,
}

impl HandoverStateMachine {
    /// Create state for `sim_count` SIMs, all idle
    #[must_use]
    pub fn new(sim_count: u32) -> Self {
        let count = sim_count as usize;
        Self {
            sims: Mutex::new(vec![CallLegs::default(); count]),
            handover: (0..count)
                .map(|_| AtomicU8::new(HandoverState::Finish as u8))
                .collect(),
        }
    }

    /// Number of SIMs tracked
    #[must_use]
    pub fn sim_count(&self) -> u32 {
        // Built from a u32 in `new`
        self.handover.len() as u32
    }

    /// Apply a call state event for `sim`
    ///
    /// `emit` is called, still under the state lock, for every message the
    /// peer must receive, in the order they must be sent. Returns the new
    /// handover state.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::InvalidSimCard` if `sim` is out of range.
    pub fn set_call_state(
        &self,
        state: CallState,
        sim: u32,
        mut emit: impl FnMut(HandoverEvent),
    ) -> Result<HandoverState, ApiError> {
        let index = self.check_sim(sim)?;
        let mut sims = self.sims.lock();
        let legs = &mut sims[index];

        let next = if state == CallState::End {
            legs.init = CallState::End;
            legs.curr = CallState::End;
            emit(HandoverEvent::CallState { state, sim });
            HandoverState::Finish
        } else if legs.init == CallState::End {
            legs.init = state;
            legs.curr = state;
            emit(HandoverEvent::CallState { state, sim });
            HandoverState::Finish
        } else {
            legs.curr = state;
            if legs.curr == legs.init {
                HandoverState::Finish
            } else if legs.init == CallState::VoLte {
                HandoverState::Lte2Wifi
            } else {
                HandoverState::Wifi2Lte
            }
        };

        if next != legs.handover {
            info!(sim, from = ?legs.handover, to = ?next, "Handover state changed");
            emit(HandoverEvent::Handover { state: next, sim });
            legs.handover = next;
            self.handover[index].store(next as u8, Ordering::Release);
        }

        Ok(next)
    }

    /// Current handover state of `sim`; `Unspec` if out of range
    #[must_use]
    pub fn handover_state(&self, sim: u8) -> HandoverState {
        self.handover
            .get(usize::from(sim))
            .map_or(HandoverState::Unspec, |state| {
                HandoverState::from_u8(state.load(Ordering::Acquire))
            })
    }

    /// Whether `sim` is handing over from LTE to Wi-Fi
    #[must_use]
    pub fn in_lte2wifi(&self, sim: u8) -> bool {
        self.handover_state(sim) == HandoverState::Lte2Wifi
    }

    /// Whether `sim` is handing over from Wi-Fi to LTE
    #[must_use]
    pub fn in_wifi2lte(&self, sim: u8) -> bool {
        self.handover_state(sim) == HandoverState::Wifi2Lte
    }

    /// Snapshot of every SIM
    #[must_use]
    pub fn status(&self) -> Vec<SimStatus> {
        self.sims
            .lock()
            .iter()
            .zip(0u32..)
            .map(|(legs, sim_card)| SimStatus {
                sim_card,
                init_call: legs.init,
                curr_call: legs.curr,
                handover: legs.handover,
            })
            .collect()
    }

    fn check_sim(&self, sim: u32) -> Result<usize, ApiError> {
        if sim < self.sim_count() {
            Ok(sim as usize)
        } else {
            Err(ApiError::InvalidSimCard {
                sim,
                count: self.sim_count(),
            })
        }
    }
}
