//! The remotely invocable action surface and its wire encoding.
//!
//! Every operation the runtime-support server exposes has a stable numeric
//! id; arguments are marshaled positionally as a bincode-encoded tuple. The
//! id, not the Rust enum layout, is the wire contract: adding a variant must
//! never renumber an existing one.
//!
//! Failures cross the wire as values ([`ActionResult::Error`]), never as a
//! serialized panic or exception.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Section;
use crate::error::ErrorKind;
use crate::types::{CounterInfo, Endpoints, Gid, LocalityId};

// ---------------------------------------------------------------------------
// Action ids
// ---------------------------------------------------------------------------

/// Stable wire id of an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(pub u32);

impl ActionId {
    /// `load_components`.
    pub const LOAD_COMPONENTS: Self = Self(1);
    /// `call_startup_functions`.
    pub const CALL_STARTUP_FUNCTIONS: Self = Self(2);
    /// `call_shutdown_functions`.
    pub const CALL_SHUTDOWN_FUNCTIONS: Self = Self(3);
    /// `shutdown`.
    pub const SHUTDOWN: Self = Self(4);
    /// `shutdown_all`.
    pub const SHUTDOWN_ALL: Self = Self(5);
    /// `terminate`.
    pub const TERMINATE: Self = Self(6);
    /// `terminate_all`.
    pub const TERMINATE_ALL: Self = Self(7);
    /// `get_config`.
    pub const GET_CONFIG: Self = Self(8);
    /// `garbage_collect`.
    pub const GARBAGE_COLLECT: Self = Self(9);
    /// `create_performance_counter`.
    pub const CREATE_PERFORMANCE_COUNTER: Self = Self(10);
    /// `remove_from_connection_cache`.
    pub const REMOVE_FROM_CONNECTION_CACHE: Self = Self(11);
    /// `dijkstra_termination`.
    pub const DIJKSTRA_TERMINATION: Self = Self(12);
    /// `set_event`.
    pub const SET_EVENT: Self = Self(13);
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "action#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// A remotely invocable operation of the runtime-support server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Run the component/plugin loader (first call only; later calls return
    /// the cached result).
    LoadComponents,
    /// Invoke the selected startup hook phase.
    CallStartupFunctions {
        /// True selects the pre-startup phase.
        pre_startup: bool,
    },
    /// Invoke the selected shutdown hook phase; per-hook failures are
    /// reported, not propagated.
    CallShutdownFunctions {
        /// True selects the pre-shutdown phase.
        pre_shutdown: bool,
    },
    /// Stop this locality and acknowledge to the initiator.
    Shutdown {
        /// Wall-clock drain budget in seconds; negative waits forever.
        timeout: f64,
        /// Event to signal once the locality has left the address space.
        respond_to: Option<Gid>,
    },
    /// Root-only: orchestrate the cluster-wide shutdown sequence.
    ShutdownAll {
        /// Per-locality drain budget in seconds.
        timeout: f64,
    },
    /// Abort this locality immediately after a synchronous acknowledgment.
    Terminate {
        /// Event to signal before aborting.
        respond_to: Option<Gid>,
    },
    /// Ordered abort of every locality.
    TerminateAll,
    /// Return the `application` configuration subtree.
    GetConfig,
    /// Delegate a garbage-collection pass to the addressing service.
    GarbageCollect,
    /// Instantiate a performance counter on this locality.
    CreatePerformanceCounter {
        /// Counter description.
        info: CounterInfo,
    },
    /// Evict a peer from the parcel-layer connection cache.
    RemoveFromConnectionCache {
        /// The peer being evicted.
        gid: Gid,
        /// Its transport endpoints.
        endpoints: Endpoints,
    },
    /// One step of the token-ring termination-detection protocol.
    DijkstraTermination {
        /// The locality that started the probe.
        initiator: LocalityId,
        /// Ring size.
        num_localities: u32,
        /// Color carried by the token.
        token_is_black: bool,
    },
    /// Signal a registered void event (acknowledgment LCO).
    SetEvent {
        /// The event to signal.
        event: Gid,
    },
}

impl Action {
    /// Returns the stable wire id of this action.
    #[must_use]
    pub const fn id(&self) -> ActionId {
        match self {
            Self::LoadComponents => ActionId::LOAD_COMPONENTS,
            Self::CallStartupFunctions { .. } => ActionId::CALL_STARTUP_FUNCTIONS,
            Self::CallShutdownFunctions { .. } => ActionId::CALL_SHUTDOWN_FUNCTIONS,
            Self::Shutdown { .. } => ActionId::SHUTDOWN,
            Self::ShutdownAll { .. } => ActionId::SHUTDOWN_ALL,
            Self::Terminate { .. } => ActionId::TERMINATE,
            Self::TerminateAll => ActionId::TERMINATE_ALL,
            Self::GetConfig => ActionId::GET_CONFIG,
            Self::GarbageCollect => ActionId::GARBAGE_COLLECT,
            Self::CreatePerformanceCounter { .. } => ActionId::CREATE_PERFORMANCE_COUNTER,
            Self::RemoveFromConnectionCache { .. } => ActionId::REMOVE_FROM_CONNECTION_CACHE,
            Self::DijkstraTermination { .. } => ActionId::DIJKSTRA_TERMINATION,
            Self::SetEvent { .. } => ActionId::SET_EVENT,
        }
    }
}

// ---------------------------------------------------------------------------
// ActionResult
// ---------------------------------------------------------------------------

/// Tagged result of executing an action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ActionResult {
    /// Void completion.
    Ack,
    /// Result of `load_components`: 0 success, -1 command-line failure,
    /// -2 duplicate plugin instance, 1 early exit requested.
    LoadComponents(i32),
    /// The `application` configuration subtree.
    Config(Section),
    /// Global id of a freshly created performance counter.
    Counter(Gid),
    /// The action failed; the kind/message pair is the portable rendition of
    /// the server-side error.
    Error {
        /// What went wrong.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },
}

impl From<crate::error::Error> for ActionResult {
    fn from(e: crate::error::Error) -> Self {
        Self::Error {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl ActionResult {
    /// Returns true for any non-error result.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        !matches!(self, Self::Error { .. })
    }
}

// ---------------------------------------------------------------------------
// Wire codec
// ---------------------------------------------------------------------------

/// Errors raised by the parcel codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(#[source] bincode::Error),
    /// Deserialization failed.
    #[error("decode failed: {0}")]
    Decode(#[source] bincode::Error),
    /// The wire carried an id this build does not know.
    #[error("unknown action id {0}")]
    UnknownAction(u32),
}

/// A wire-level message: one action addressed to one locality.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parcel {
    /// Destination locality.
    pub dest: LocalityId,
    /// The operation to invoke there.
    pub action: Action,
}

#[derive(Serialize, Deserialize)]
struct WireParcel {
    dest: LocalityId,
    action_id: u32,
    payload: Vec<u8>,
}

fn enc<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(value).map_err(CodecError::Encode)
}

fn dec<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(CodecError::Decode)
}

impl Parcel {
    /// Creates a parcel.
    #[must_use]
    pub const fn new(dest: LocalityId, action: Action) -> Self {
        Self { dest, action }
    }

    /// Encodes the parcel: destination, stable action id, positional
    /// argument tuple.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let payload = match &self.action {
            Action::LoadComponents
            | Action::TerminateAll
            | Action::GetConfig
            | Action::GarbageCollect => Vec::new(),
            Action::CallStartupFunctions { pre_startup } => enc(&(pre_startup,))?,
            Action::CallShutdownFunctions { pre_shutdown } => enc(&(pre_shutdown,))?,
            Action::Shutdown {
                timeout,
                respond_to,
            } => enc(&(timeout, respond_to))?,
            Action::ShutdownAll { timeout } => enc(&(timeout,))?,
            Action::Terminate { respond_to } => enc(&(respond_to,))?,
            Action::CreatePerformanceCounter { info } => enc(&(info,))?,
            Action::RemoveFromConnectionCache { gid, endpoints } => enc(&(gid, endpoints))?,
            Action::DijkstraTermination {
                initiator,
                num_localities,
                token_is_black,
            } => enc(&(initiator, num_localities, token_is_black))?,
            Action::SetEvent { event } => enc(&(event,))?,
        };
        enc(&WireParcel {
            dest: self.dest,
            action_id: self.action.id().0,
            payload,
        })
    }

    /// Decodes a parcel from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let wire: WireParcel = dec(bytes)?;
        let action = match ActionId(wire.action_id) {
            ActionId::LOAD_COMPONENTS => Action::LoadComponents,
            ActionId::CALL_STARTUP_FUNCTIONS => {
                let (pre_startup,): (bool,) = dec(&wire.payload)?;
                Action::CallStartupFunctions { pre_startup }
            }
            ActionId::CALL_SHUTDOWN_FUNCTIONS => {
                let (pre_shutdown,): (bool,) = dec(&wire.payload)?;
                Action::CallShutdownFunctions { pre_shutdown }
            }
            ActionId::SHUTDOWN => {
                let (timeout, respond_to): (f64, Option<Gid>) = dec(&wire.payload)?;
                Action::Shutdown {
                    timeout,
                    respond_to,
                }
            }
            ActionId::SHUTDOWN_ALL => {
                let (timeout,): (f64,) = dec(&wire.payload)?;
                Action::ShutdownAll { timeout }
            }
            ActionId::TERMINATE => {
                let (respond_to,): (Option<Gid>,) = dec(&wire.payload)?;
                Action::Terminate { respond_to }
            }
            ActionId::TERMINATE_ALL => Action::TerminateAll,
            ActionId::GET_CONFIG => Action::GetConfig,
            ActionId::GARBAGE_COLLECT => Action::GarbageCollect,
            ActionId::CREATE_PERFORMANCE_COUNTER => {
                let (info,): (CounterInfo,) = dec(&wire.payload)?;
                Action::CreatePerformanceCounter { info }
            }
            ActionId::REMOVE_FROM_CONNECTION_CACHE => {
                let (gid, endpoints): (Gid, Endpoints) = dec(&wire.payload)?;
                Action::RemoveFromConnectionCache { gid, endpoints }
            }
            ActionId::DIJKSTRA_TERMINATION => {
                let (initiator, num_localities, token_is_black): (LocalityId, u32, bool) =
                    dec(&wire.payload)?;
                Action::DijkstraTermination {
                    initiator,
                    num_localities,
                    token_is_black,
                }
            }
            ActionId::SET_EVENT => {
                let (event,): (Gid,) = dec(&wire.payload)?;
                Action::SetEvent { event }
            }
            ActionId(other) => return Err(CodecError::UnknownAction(other)),
        };
        Ok(Self {
            dest: wire.dest,
            action,
        })
    }
}

/// Encodes an [`ActionResult`] for the acknowledgment path.
pub fn encode_result(result: &ActionResult) -> Result<Vec<u8>, CodecError> {
    enc(result)
}

/// Decodes an [`ActionResult`] from acknowledgment bytes.
pub fn decode_result(bytes: &[u8]) -> Result<ActionResult, CodecError> {
    dec(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_actions() -> Vec<Action> {
        vec![
            Action::LoadComponents,
            Action::CallStartupFunctions { pre_startup: true },
            Action::CallShutdownFunctions {
                pre_shutdown: false,
            },
            Action::Shutdown {
                timeout: 2.5,
                respond_to: Some(Gid::new(LocalityId::CONSOLE, 1017)),
            },
            Action::ShutdownAll { timeout: -1.0 },
            Action::Terminate { respond_to: None },
            Action::TerminateAll,
            Action::GetConfig,
            Action::GarbageCollect,
            Action::CreatePerformanceCounter {
                info: CounterInfo {
                    name: "/threads/count/cumulative".to_string(),
                    helptext: "cumulative thread count".to_string(),
                },
            },
            Action::RemoveFromConnectionCache {
                gid: Gid::new(LocalityId::from_raw(2), 7),
                endpoints: Endpoints::new(vec!["tcp://10.0.0.2:7910".to_string()]),
            },
            Action::DijkstraTermination {
                initiator: LocalityId::CONSOLE,
                num_localities: 4,
                token_is_black: true,
            },
            Action::SetEvent {
                event: Gid::new(LocalityId::from_raw(1), 1001),
            },
        ]
    }

    #[test]
    fn every_action_round_trips() {
        for action in all_actions() {
            let parcel = Parcel::new(LocalityId::from_raw(3), action);
            let bytes = parcel.encode().expect("encode");
            let back = Parcel::decode(&bytes).expect("decode");
            assert_eq!(parcel, back);
        }
    }

    #[test]
    fn action_ids_are_stable() {
        let expected: Vec<u32> = (1..=13).collect();
        let actual: Vec<u32> = all_actions().iter().map(|a| a.id().0).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn unknown_id_is_rejected() {
        let wire = WireParcel {
            dest: LocalityId::CONSOLE,
            action_id: 9999,
            payload: Vec::new(),
        };
        let bytes = enc(&wire).expect("encode");
        let err = Parcel::decode(&bytes).expect_err("should reject");
        assert!(matches!(err, CodecError::UnknownAction(9999)));
    }

    #[test]
    fn results_round_trip() {
        let results = vec![
            ActionResult::Ack,
            ActionResult::LoadComponents(-2),
            ActionResult::Counter(Gid::new(LocalityId::CONSOLE, 55)),
            ActionResult::Error {
                kind: ErrorKind::InvalidStatus,
                message: "shutdown_all invoked off-root".to_string(),
            },
        ];
        for result in results {
            let bytes = encode_result(&result).expect("encode");
            let back = decode_result(&bytes).expect("decode");
            assert_eq!(result, back);
        }
    }
}
