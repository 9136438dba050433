//! Duplicate-connection tie-break.
//!
//! When two processes open connections to each other at the same time, each
//! ends up with two connections for the same peer. Both sides must close the
//! same socket without talking to each other, so the decision is made on a
//! key that both ends of one socket compute identically: the unordered pair
//! of its endpoint addresses.

use std::cmp::Ordering;
use std::net::SocketAddr;

/// Endpoint addresses of one TCP connection as seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl ConnectionKey {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { local, remote }
    }

    /// Returns the endpoints in ascending order.
    ///
    /// The peer's key for the same socket has `local` and `remote` swapped,
    /// so both ends get the same canonical pair.
    pub fn canonical(&self) -> (SocketAddr, SocketAddr) {
        if self.local <= self.remote {
            (self.local, self.remote)
        } else {
            (self.remote, self.local)
        }
    }

    /// Returns the key as seen from the other end of the socket.
    pub fn mirrored(&self) -> Self {
        Self::new(self.remote, self.local)
    }

    pub fn is_self_loop(&self) -> bool {
        self.local == self.remote
    }
}

/// Outcome of comparing two connections to the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// Keep the first connection, close the second.
    KeepFirst,
    /// Keep the second connection, close the first.
    KeepSecond,
    /// No decision: a self-connection is involved, or both keys name the
    /// same socket. The caller must special-case it.
    Tied,
}

/// Decides which of two connections to the same peer survives.
///
/// The connection with the smaller canonical key wins. `None` stands for a
/// loopback connection, which has no socket.
///
/// # Examples
///
/// ```
/// # use cohort_net::{ConnectionKey, TieBreak, tie_break};
/// let a = ConnectionKey::new("127.0.0.1:7000".parse().unwrap(), "127.0.0.1:50001".parse().unwrap());
/// let b = ConnectionKey::new("127.0.0.1:50002".parse().unwrap(), "127.0.0.1:7001".parse().unwrap());
/// assert_eq!(tie_break(Some(&a), Some(&b)), TieBreak::KeepFirst);
/// assert_eq!(tie_break(Some(&b), Some(&a)), TieBreak::KeepSecond);
/// ```
pub fn tie_break(first: Option<&ConnectionKey>, second: Option<&ConnectionKey>) -> TieBreak {
    let (Some(first), Some(second)) = (first, second) else {
        return TieBreak::Tied;
    };
    if first.is_self_loop() || second.is_self_loop() {
        return TieBreak::Tied;
    }

    match first.canonical().cmp(&second.canonical()) {
        Ordering::Less => TieBreak::KeepFirst,
        Ordering::Greater => TieBreak::KeepSecond,
        Ordering::Equal => TieBreak::Tied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn canonical_is_orientation_free() {
        let key = ConnectionKey::new(addr(9000), addr(7000));
        assert_eq!(key.canonical(), (addr(7000), addr(9000)));
        assert_eq!(key.mirrored().canonical(), key.canonical());
    }

    #[test_case(None, None; "both loopback")]
    #[test_case(Some(ConnectionKey::new(addr(1), addr(2))), None; "second loopback")]
    #[test_case(Some(ConnectionKey::new(addr(3), addr(3))), Some(ConnectionKey::new(addr(1), addr(2))); "self loop key")]
    #[test_case(Some(ConnectionKey::new(addr(1), addr(2))), Some(ConnectionKey::new(addr(2), addr(1))); "same socket")]
    fn tied_cases(first: Option<ConnectionKey>, second: Option<ConnectionKey>) {
        assert_eq!(tie_break(first.as_ref(), second.as_ref()), TieBreak::Tied);
    }

    fn arb_addr() -> impl Strategy<Value = SocketAddr> {
        (any::<[u8; 4]>(), any::<u16>()).prop_map(|(ip, port)| SocketAddr::from((ip, port)))
    }

    proptest! {
        /// Property: swapping the arguments swaps the verdict.
        #[test]
        fn prop_tie_break_antisymmetric(
            a in (arb_addr(), arb_addr()),
            b in (arb_addr(), arb_addr()),
        ) {
            let a = ConnectionKey::new(a.0, a.1);
            let b = ConnectionKey::new(b.0, b.1);
            let forward = tie_break(Some(&a), Some(&b));
            let backward = tie_break(Some(&b), Some(&a));
            let expected = match forward {
                TieBreak::KeepFirst => TieBreak::KeepSecond,
                TieBreak::KeepSecond => TieBreak::KeepFirst,
                TieBreak::Tied => TieBreak::Tied,
            };
            prop_assert_eq!(backward, expected);
        }

        /// Property: both ends of the same two sockets keep the same socket.
        #[test]
        fn prop_tie_break_endpoint_consistent(
            a in (arb_addr(), arb_addr()),
            b in (arb_addr(), arb_addr()),
        ) {
            let here_a = ConnectionKey::new(a.0, a.1);
            let here_b = ConnectionKey::new(b.0, b.1);
            let there_a = here_a.mirrored();
            let there_b = here_b.mirrored();
            prop_assert_eq!(
                tie_break(Some(&here_a), Some(&here_b)),
                tie_break(Some(&there_a), Some(&there_b))
            );
        }
    }
}
