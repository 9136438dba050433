//! # cohort-types: Core types for `Cohort`
//!
//! This crate contains the identities shared by every layer of the stack:
//! - Process identity ([`ProcessId`]) and its handshake encoding
//! - Group views ([`ViewId`])
//! - Causal message identifiers ([`CausalId`], [`CausalRelation`])
//! - Member-list validation ([`find_duplicate`], [`ensure_unique`])

use std::{
    fmt::{Debug, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

mod error;
pub mod handshake;

pub use error::{TypesError, TypesResult};

// ============================================================================
// Process Identity
// ============================================================================

/// Identity of one process epoch: `(address, port, incarnation)`.
///
/// Two identities are equal only when all three fields match. The same
/// address and port with a different incarnation is a different epoch of the
/// process (it crashed and came back), and must never be confused with the
/// old one.
///
/// The derived ordering compares address, then port, then incarnation. It is
/// used for deterministic tie-breaking and canonical encoding.
///
/// # Examples
///
/// ```
/// # use cohort_types::ProcessId;
/// let pid: ProcessId = "10.0.0.1:7000:3".parse().unwrap();
/// assert_eq!(pid.port(), 7000);
/// assert_eq!(pid.incarnation(), 3);
/// assert_eq!(pid.to_string(), "10.0.0.1:7000:3");
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId {
    address: String,
    port: u16,
    incarnation: u32,
}

impl ProcessId {
    pub fn new(address: impl Into<String>, port: u16, incarnation: u32) -> Self {
        Self {
            address: address.into(),
            port,
            incarnation,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn incarnation(&self) -> u32 {
        self.incarnation
    }

    /// Returns a copy of this identity bound to another port.
    ///
    /// Used once the listener has resolved an ephemeral port.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            address: self.address.clone(),
            port,
            incarnation: self.incarnation,
        }
    }

    /// Returns true if both identities name the same endpoint, regardless
    /// of incarnation.
    pub fn same_endpoint(&self, other: &ProcessId) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Debug for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P({self})")
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.address, self.port, self.incarnation)
    }
}

impl FromStr for ProcessId {
    type Err = TypesError;

    /// Parses `host:port:incarnation`. The host may itself contain colons
    /// (IPv6), so the two numeric fields are split from the right.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TypesError::InvalidProcessId(s.to_string());

        let (rest, incarnation) = s.rsplit_once(':').ok_or_else(invalid)?;
        let (address, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if address.is_empty() {
            return Err(invalid());
        }

        let port = port.parse::<u16>().map_err(|_| invalid())?;
        let incarnation = incarnation.parse::<u32>().map_err(|_| invalid())?;

        Ok(Self::new(address, port, incarnation))
    }
}

// ============================================================================
// Views
// ============================================================================

/// Monotonic identifier of a group view.
///
/// The first agreed view is [`ViewId::ZERO`]; every successful membership
/// change moves to [`ViewId::next`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewId(u64);

impl ViewId {
    pub const ZERO: ViewId = ViewId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the id of the following view.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for ViewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for ViewId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ViewId> for u64 {
    fn from(id: ViewId) -> Self {
        id.0
    }
}

// ============================================================================
// Causal Message Identifiers
// ============================================================================

/// Identifier of a causally ordered message: the sender plus its per-sender
/// sequence number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CausalId {
    pub sender: ProcessId,
    pub sequence: u64,
}

/// Adjacency of two causal identifiers.
///
/// Only identifiers of the same sender are comparable; adjacency is what the
/// compact range bookkeeping needs to merge neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalRelation {
    /// `self` immediately precedes `other`.
    Predecessor,
    /// `self` immediately follows `other`.
    Successor,
    Equal,
    /// Different senders, or same sender but not adjacent.
    Incomparable,
}

impl CausalId {
    pub fn new(sender: ProcessId, sequence: u64) -> Self {
        Self { sender, sequence }
    }

    /// Returns the relation of `self` to `other`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use cohort_types::{CausalId, CausalRelation, ProcessId};
    /// let p = ProcessId::new("a", 1, 0);
    /// let first = CausalId::new(p.clone(), 4);
    /// let second = CausalId::new(p, 5);
    /// assert_eq!(first.relation(&second), CausalRelation::Predecessor);
    /// assert_eq!(second.relation(&first), CausalRelation::Successor);
    /// ```
    pub fn relation(&self, other: &CausalId) -> CausalRelation {
        if self.sender != other.sender {
            return CausalRelation::Incomparable;
        }
        if self.sequence == other.sequence {
            CausalRelation::Equal
        } else if self.sequence.checked_add(1) == Some(other.sequence) {
            CausalRelation::Predecessor
        } else if other.sequence.checked_add(1) == Some(self.sequence) {
            CausalRelation::Successor
        } else {
            CausalRelation::Incomparable
        }
    }
}

impl Display for CausalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.sender, self.sequence)
    }
}

// ============================================================================
// Member Lists
// ============================================================================

/// Returns the first process that appears more than once in `members`.
pub fn find_duplicate(members: &[ProcessId]) -> Option<&ProcessId> {
    members
        .iter()
        .enumerate()
        .find(|(i, pid)| members[..*i].contains(pid))
        .map(|(_, pid)| pid)
}

/// Fails with [`TypesError::DuplicateMember`] if `members` contains a
/// process twice.
pub fn ensure_unique(members: &[ProcessId]) -> TypesResult<()> {
    match find_duplicate(members) {
        Some(pid) => Err(TypesError::DuplicateMember(pid.clone())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn pid(address: &str, port: u16, incarnation: u32) -> ProcessId {
        ProcessId::new(address, port, incarnation)
    }

    #[test]
    fn equality_requires_all_fields() {
        assert_eq!(pid("a", 1, 0), pid("a", 1, 0));
        assert_ne!(pid("a", 1, 0), pid("a", 1, 1));
        assert_ne!(pid("a", 1, 0), pid("a", 2, 0));
        assert_ne!(pid("a", 1, 0), pid("b", 1, 0));
    }

    #[test]
    fn new_incarnation_is_same_endpoint_but_different_process() {
        let old = pid("host", 7000, 1);
        let new = pid("host", 7000, 2);
        assert!(old.same_endpoint(&new));
        assert_ne!(old, new);
    }

    #[test]
    fn ordering_is_address_then_port_then_incarnation() {
        let mut pids = vec![
            pid("b", 1, 0),
            pid("a", 2, 0),
            pid("a", 1, 5),
            pid("a", 1, 0),
        ];
        pids.sort();
        assert_eq!(
            pids,
            vec![pid("a", 1, 0), pid("a", 1, 5), pid("a", 2, 0), pid("b", 1, 0)]
        );
    }

    #[test_case("127.0.0.1:7000:0", "127.0.0.1", 7000, 0; "ipv4")]
    #[test_case("node-1.local:65535:4294967295", "node-1.local", 65535, u32::MAX; "max values")]
    #[test_case("::1:9000:2", "::1", 9000, 2; "ipv6 host")]
    fn parse_process_id(input: &str, address: &str, port: u16, incarnation: u32) {
        let parsed: ProcessId = input.parse().unwrap();
        assert_eq!(parsed, pid(address, port, incarnation));
        assert_eq!(parsed.to_string(), input);
    }

    #[test_case(""; "empty")]
    #[test_case("host:7000"; "missing incarnation")]
    #[test_case(":7000:1"; "missing host")]
    #[test_case("host:70000:1"; "port overflow")]
    #[test_case("host:7000:-1"; "negative incarnation")]
    fn parse_rejects_malformed(input: &str) {
        assert!(matches!(
            input.parse::<ProcessId>(),
            Err(TypesError::InvalidProcessId(_))
        ));
    }

    #[test]
    fn view_id_advances_by_one() {
        assert_eq!(ViewId::ZERO.next(), ViewId::new(1));
        assert_eq!(ViewId::new(41).next().as_u64(), 42);
        assert_eq!(ViewId::new(3).to_string(), "v3");
    }

    #[test]
    fn causal_relation() {
        let a = pid("a", 1, 0);
        let b = pid("b", 1, 0);

        let a0 = CausalId::new(a.clone(), 0);
        let a1 = CausalId::new(a.clone(), 1);
        let a7 = CausalId::new(a, 7);
        let b1 = CausalId::new(b, 1);

        assert_eq!(a0.relation(&a1), CausalRelation::Predecessor);
        assert_eq!(a1.relation(&a0), CausalRelation::Successor);
        assert_eq!(a1.relation(&a1.clone()), CausalRelation::Equal);
        assert_eq!(a1.relation(&a7), CausalRelation::Incomparable);
        assert_eq!(a1.relation(&b1), CausalRelation::Incomparable);
        assert!(a0 < a1 && a1 < a7);
    }

    #[test]
    fn causal_relation_at_sequence_limit() {
        let p = pid("a", 1, 0);
        let last = CausalId::new(p.clone(), u64::MAX);
        let first = CausalId::new(p, 0);
        assert_eq!(last.relation(&first), CausalRelation::Incomparable);
    }

    #[test]
    fn duplicate_detection() {
        let members = vec![pid("a", 1, 0), pid("b", 1, 0), pid("a", 1, 0)];
        assert_eq!(find_duplicate(&members), Some(&pid("a", 1, 0)));
        assert!(matches!(
            ensure_unique(&members),
            Err(TypesError::DuplicateMember(p)) if p == pid("a", 1, 0)
        ));

        // Different incarnations are different processes.
        let members = vec![pid("a", 1, 0), pid("a", 1, 1)];
        assert!(ensure_unique(&members).is_ok());
        assert!(ensure_unique(&[]).is_ok());
    }

    #[test]
    fn process_id_serde_roundtrip() {
        let original = pid("replica-3", 7003, 9);
        let bytes = postcard::to_allocvec(&original).unwrap();
        let decoded: ProcessId = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, original);
    }
}
