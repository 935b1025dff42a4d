//! Core identifier and phase types.
//!
//! Localities are the participants of the cluster: one address-space instance
//! each, identified by a dense index. Locality 0 is the console (root). Global
//! ids ([`Gid`]) name individual entities registered with the addressing
//! service; the locality that owns an entity is encoded in the id's upper
//! half, so replies can be routed without a resolver round trip.

use core::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// LocalityId
// ---------------------------------------------------------------------------

/// Identifier for one locality (process) in the cluster.
///
/// Ids are dense in `[0, N)` for a run of `N` localities and are fixed for
/// the lifetime of the run.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LocalityId(u32);

impl LocalityId {
    /// The console (root) locality.
    pub const CONSOLE: Self = Self(0);

    /// Creates a locality id from a raw index.
    #[must_use]
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw index.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns true if this is the console (root) locality.
    #[must_use]
    pub const fn is_console(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LocalityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Gid
// ---------------------------------------------------------------------------

/// Global id of a distributed entity.
///
/// The upper 32 bits carry the owning locality, the lower 32 bits a
/// locality-unique sequence number. The fixed low values name the per-locality
/// system components that every locality registers at bootstrap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gid(u64);

/// Sequence number naming a locality itself.
pub const LOCALITY_SEQUENCE: u32 = 0;

/// Sequence number of the runtime-support server on each locality.
pub const RUNTIME_SUPPORT_SEQUENCE: u32 = 1;

/// Sequence number of the memory component on each locality.
pub const MEMORY_SEQUENCE: u32 = 2;

impl Gid {
    /// Creates a global id owned by `locality` with the given sequence number.
    #[must_use]
    pub const fn new(locality: LocalityId, sequence: u32) -> Self {
        Self(((locality.raw() as u64) << 32) | sequence as u64)
    }

    /// The gid naming the locality itself.
    #[must_use]
    pub const fn of_locality(locality: LocalityId) -> Self {
        Self::new(locality, LOCALITY_SEQUENCE)
    }

    /// The runtime-support server of the given locality.
    #[must_use]
    pub const fn runtime_support_of(locality: LocalityId) -> Self {
        Self::new(locality, RUNTIME_SUPPORT_SEQUENCE)
    }

    /// The memory component of the given locality.
    #[must_use]
    pub const fn memory_of(locality: LocalityId) -> Self {
        Self::new(locality, MEMORY_SEQUENCE)
    }

    /// Returns the locality that owns this id.
    #[must_use]
    pub const fn locality(self) -> LocalityId {
        LocalityId::from_raw((self.0 >> 32) as u32)
    }

    /// Returns the locality-unique sequence number.
    #[must_use]
    pub const fn sequence(self) -> u32 {
        self.0 as u32
    }

    /// Returns the raw 64-bit value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}}}", self.locality(), self.sequence())
    }
}

// ---------------------------------------------------------------------------
// RuntimeState
// ---------------------------------------------------------------------------

/// Lifecycle phase of the local runtime.
///
/// The hook registry drives the four hook phases through
/// [`RuntimeHandle::set_state`](crate::services::RuntimeHandle::set_state);
/// the stop machine reports the terminal transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RuntimeState {
    /// Pre-startup hooks are running.
    PreStartup,
    /// Startup hooks are running.
    Startup,
    /// Normal operation.
    Running,
    /// Pre-shutdown hooks are running.
    PreShutdown,
    /// Shutdown hooks are running.
    Shutdown,
    /// The locality has left the address space.
    Stopped,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PreStartup => "pre-startup",
            Self::Startup => "startup",
            Self::Running => "running",
            Self::PreShutdown => "pre-shutdown",
            Self::Shutdown => "shutdown",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Opaque transport endpoints of one locality.
///
/// Carried in connection-cache eviction requests; the parcel layer interprets
/// the strings, the control plane only ships them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints(Vec<String>);

impl Endpoints {
    /// Creates an endpoint set from transport address strings.
    #[must_use]
    pub fn new(addresses: Vec<String>) -> Self {
        Self(addresses)
    }

    /// Returns the endpoint address strings.
    #[must_use]
    pub fn addresses(&self) -> &[String] {
        &self.0
    }

    /// Returns true if no endpoints are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// CounterInfo
// ---------------------------------------------------------------------------

/// Description of a performance counter to instantiate locally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterInfo {
    /// Full counter name, e.g. `/threads/count/cumulative`.
    pub name: String,
    /// Human-readable description.
    pub helptext: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locality_display_and_console() {
        let console = LocalityId::CONSOLE;
        assert!(console.is_console());
        assert_eq!(console.to_string(), "L0");

        let other = LocalityId::from_raw(7);
        assert!(!other.is_console());
        assert_eq!(other.raw(), 7);
    }

    #[test]
    fn gid_encodes_owner() {
        let gid = Gid::new(LocalityId::from_raw(3), 42);
        assert_eq!(gid.locality(), LocalityId::from_raw(3));
        assert_eq!(gid.sequence(), 42);
        assert_eq!(gid.to_string(), "{L3, 42}");
    }

    #[test]
    fn fixed_components_are_distinct() {
        let here = LocalityId::from_raw(1);
        assert_ne!(Gid::runtime_support_of(here), Gid::memory_of(here));
        assert_eq!(Gid::runtime_support_of(here).locality(), here);
    }

    #[test]
    fn state_ordering_follows_lifecycle() {
        assert!(RuntimeState::PreStartup < RuntimeState::Startup);
        assert!(RuntimeState::Running < RuntimeState::PreShutdown);
        assert!(RuntimeState::Shutdown < RuntimeState::Stopped);
    }
}
