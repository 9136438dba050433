//! Scenario tests for the causal layer over a simulated network.
//!
//! Each (sender, receiver) link is FIFO like a TCP connection; the scheduler
//! picks which link delivers next.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bytes::Bytes;
use cohort_types::{CausalId, ProcessId};
use proptest::prelude::*;
use test_case::test_case;

use crate::causal::CausalOutput;
use crate::{CausalConfig, CausalError, CausalLayer, CausalPacket, OrderError};

// ============================================================================
// Helper Functions
// ============================================================================

fn pid(port: u16) -> ProcessId {
    ProcessId::new("127.0.0.1", port, 0)
}

fn group(n: u16) -> Vec<ProcessId> {
    (1..=n).map(pid).collect()
}

fn sent_ids(output: &CausalOutput) -> Vec<(ProcessId, CausalId)> {
    output
        .sends
        .iter()
        .filter_map(|s| match &s.packet {
            CausalPacket::Send { id, .. } => Some((s.destination.clone(), id.clone())),
            CausalPacket::Ack { .. } => None,
        })
        .collect()
}

struct Sim {
    layers: BTreeMap<ProcessId, CausalLayer>,
    links: BTreeMap<(ProcessId, ProcessId), VecDeque<CausalPacket>>,
    delivered: BTreeMap<ProcessId, Vec<Bytes>>,
    /// Payloads each message's sender had delivered when it called `send`.
    past: BTreeMap<Bytes, BTreeSet<Bytes>>,
    sent_counter: BTreeMap<ProcessId, usize>,
}

impl Sim {
    fn new(members: &[ProcessId]) -> Self {
        let mut layers = BTreeMap::new();
        for member in members {
            let mut layer = CausalLayer::new(member.clone(), CausalConfig::default());
            layer.init(members).unwrap();
            layers.insert(member.clone(), layer);
        }
        Self {
            layers,
            links: BTreeMap::new(),
            delivered: BTreeMap::new(),
            past: BTreeMap::new(),
            sent_counter: BTreeMap::new(),
        }
    }

    fn apply(&mut self, at: &ProcessId, output: CausalOutput) {
        for send in output.sends {
            self.links
                .entry((at.clone(), send.destination))
                .or_default()
                .push_back(send.packet);
        }
        self.delivered
            .entry(at.clone())
            .or_default()
            .extend(output.delivered.into_iter().map(|d| d.payload));
    }

    fn broadcast(&mut self, at: &ProcessId) {
        let n = self.sent_counter.entry(at.clone()).or_default();
        let payload = Bytes::from(format!("{}-{}", at.port(), *n));
        *n += 1;

        let past = self
            .delivered
            .get(at)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();
        self.past.insert(payload.clone(), past);

        let members: Vec<ProcessId> = self.layers.keys().cloned().collect();
        let output = self
            .layers
            .get_mut(at)
            .unwrap()
            .send(payload, &members)
            .unwrap();
        self.apply(at, output);
    }

    /// Delivers the head of one non-empty link. Returns false if the network
    /// is quiet.
    fn step(&mut self, choice: usize) -> bool {
        let busy: Vec<(ProcessId, ProcessId)> = self
            .links
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        if busy.is_empty() {
            return false;
        }
        let (from, to) = busy[choice % busy.len()].clone();
        let packet = self
            .links
            .get_mut(&(from.clone(), to.clone()))
            .unwrap()
            .pop_front()
            .unwrap();
        let output = self.layers.get_mut(&to).unwrap().deliver(&from, packet).unwrap();
        self.apply(&to, output);
        true
    }

    fn settle(&mut self) {
        let mut choice = 0;
        while self.step(choice) {
            choice += 1;
        }
    }
}

// ============================================================================
// Acknowledgement Gating
// ============================================================================

#[test]
fn second_send_waits_for_all_acks_of_the_first() {
    let members = group(3);
    let mut p1 = CausalLayer::new(pid(1), CausalConfig::default());
    p1.init(&members).unwrap();

    let first = p1
        .send(Bytes::from_static(b"m1"), &[pid(2), pid(3)])
        .unwrap();
    assert_eq!(
        sent_ids(&first),
        vec![(pid(2), CausalId::new(pid(1), 0)), (pid(3), CausalId::new(pid(1), 0))]
    );

    let second = p1.send(Bytes::from_static(b"m2"), &[pid(2), pid(3)]).unwrap();
    assert!(second.sends.is_empty(), "m2 must wait for m1's acks");
    assert_eq!(p1.queued_len(), 1);

    let m1 = CausalId::new(pid(1), 0);
    let after_p2 = p1.deliver(&pid(2), CausalPacket::Ack { id: m1.clone() }).unwrap();
    assert!(after_p2.sends.is_empty());
    assert_eq!(p1.awaiting(&m1), Some(&BTreeSet::from([pid(3)])));

    let after_p3 = p1.deliver(&pid(3), CausalPacket::Ack { id: m1.clone() }).unwrap();
    assert_eq!(after_p3.completed, vec![m1]);
    assert_eq!(
        sent_ids(&after_p3),
        vec![(pid(2), CausalId::new(pid(1), 1)), (pid(3), CausalId::new(pid(1), 1))]
    );
    assert_eq!(p1.queued_len(), 0);
}

#[test]
fn receiver_acks_every_other_participant() {
    let members = group(3);
    let mut p2 = CausalLayer::new(pid(2), CausalConfig::default());
    p2.init(&members).unwrap();

    let id = CausalId::new(pid(1), 0);
    let output = p2
        .deliver(
            &pid(1),
            CausalPacket::Send {
                id: id.clone(),
                destinations: vec![pid(2), pid(3)],
                payload: Bytes::from_static(b"m"),
            },
        )
        .unwrap();

    assert_eq!(output.delivered.len(), 1);
    assert_eq!(output.delivered[0].source, pid(1));
    let acked: BTreeSet<ProcessId> = output
        .sends
        .iter()
        .filter(|s| matches!(&s.packet, CausalPacket::Ack { id: acked } if *acked == id))
        .map(|s| s.destination.clone())
        .collect();
    assert_eq!(acked, BTreeSet::from([pid(1), pid(3)]));

    // Only the other destination acks back to P2; the sender is not one.
    assert_eq!(p2.awaiting(&id), Some(&BTreeSet::from([pid(3)])));
}

#[test]
fn early_ack_is_applied_when_the_message_arrives() {
    let mut p2 = CausalLayer::new(pid(2), CausalConfig::default());
    p2.init(&group(3)).unwrap();
    let id = CausalId::new(pid(1), 0);

    // P3 delivered first and its ack overtook the message.
    let output = p2.deliver(&pid(3), CausalPacket::Ack { id: id.clone() }).unwrap();
    assert!(output.is_empty());
    assert_eq!(p2.early_ack_len(), 1);

    p2.deliver(
        &pid(1),
        CausalPacket::Send {
            id: id.clone(),
            destinations: vec![pid(2), pid(3)],
            payload: Bytes::from_static(b"m"),
        },
    )
    .unwrap();
    assert_eq!(p2.awaiting(&id), None, "nothing left to wait for");
    assert_eq!(p2.early_ack_len(), 0);
    assert!(p2.has_capacity());
}

#[test]
fn self_delivery_is_synthesized() {
    let mut p1 = CausalLayer::new(pid(1), CausalConfig::default());
    p1.init(&group(2)).unwrap();

    let output = p1
        .send(Bytes::from_static(b"both"), &[pid(1), pid(2)])
        .unwrap();
    assert_eq!(output.delivered.len(), 1);
    assert_eq!(output.delivered[0].source, pid(1));

    // Send to P2 first, then the ack from the synthesized self-delivery.
    let kinds: Vec<(ProcessId, bool)> = output
        .sends
        .iter()
        .map(|s| (s.destination.clone(), matches!(s.packet, CausalPacket::Send { .. })))
        .collect();
    assert_eq!(kinds, vec![(pid(2), true), (pid(2), false)]);
    assert!(!output.sends.iter().any(|s| s.destination == pid(1)));
}

#[test]
fn send_to_self_only_completes_immediately_and_drains() {
    let mut p1 = CausalLayer::new(pid(1), CausalConfig::default());
    p1.init(&group(2)).unwrap();

    let output = p1.send(Bytes::from_static(b"a"), &[pid(1)]).unwrap();
    assert_eq!(output.completed, vec![CausalId::new(pid(1), 0)]);
    assert!(output.sends.is_empty());
    assert_eq!(p1.outstanding(), 0);

    let output = p1.send(Bytes::from_static(b"b"), &[pid(1)]).unwrap();
    assert_eq!(output.delivered.len(), 1);
}

#[test]
fn duplicate_send_is_ignored() {
    let mut p2 = CausalLayer::new(pid(2), CausalConfig::default());
    p2.init(&group(2)).unwrap();
    let packet = CausalPacket::Send {
        id: CausalId::new(pid(1), 0),
        destinations: vec![pid(2)],
        payload: Bytes::from_static(b"once"),
    };

    assert_eq!(p2.deliver(&pid(1), packet.clone()).unwrap().delivered.len(), 1);
    assert!(p2.deliver(&pid(1), packet).unwrap().is_empty());
    assert_eq!(p2.stats().duplicates, 1);
}

#[test]
fn window_full_hands_the_request_back() {
    let config = CausalConfig {
        max_outstanding: 2,
        early_ack_capacity: 16,
    };
    let mut p1 = CausalLayer::new(pid(1), config);
    p1.init(&group(2)).unwrap();

    p1.send(Bytes::from_static(b"1"), &[pid(2)]).unwrap();
    p1.send(Bytes::from_static(b"2"), &[pid(2)]).unwrap();
    assert!(!p1.has_capacity());

    let err = p1.send(Bytes::from_static(b"3"), &[pid(2)]).unwrap_err();
    assert!(err.is_window_full());
    let request = err.into_request().unwrap();
    assert_eq!(request.payload, Bytes::from_static(b"3"));
    assert_eq!(request.destinations, vec![pid(2)]);

    p1.deliver(&pid(2), CausalPacket::Ack { id: CausalId::new(pid(1), 0) })
        .unwrap();
    assert!(p1.has_capacity());
}

#[test_case(&[] => matches Err(CausalError::Order(OrderError::NoDestinations)) ; "no destinations")]
#[test_case(&[7] => matches Err(CausalError::Order(OrderError::UnknownProcess(_))) ; "unknown destination")]
#[test_case(&[2, 7] => matches Err(CausalError::Order(OrderError::UnknownProcess(_))) ; "one unknown among members")]
#[test_case(&[2] => matches Ok(_) ; "member destination")]
fn send_checks_destinations(ports: &[u16]) -> Result<CausalOutput, CausalError> {
    let mut p1 = CausalLayer::new(pid(1), CausalConfig::default());
    p1.init(&group(2)).unwrap();
    let destinations: Vec<ProcessId> = ports.iter().copied().map(pid).collect();
    p1.send(Bytes::new(), &destinations)
}

#[test]
fn uninitialized_layer_rejects_sends_and_double_init() {
    let mut p1 = CausalLayer::new(pid(1), CausalConfig::default());
    assert!(matches!(
        p1.send(Bytes::new(), &[pid(2)]),
        Err(CausalError::Order(OrderError::NotInitialized))
    ));

    p1.init(&group(2)).unwrap();
    assert_eq!(
        p1.init(&group(2)).unwrap_err(),
        OrderError::AlreadyInitialized
    );
}

#[test]
fn departed_member_no_longer_blocks_the_queue() {
    let mut p1 = CausalLayer::new(pid(1), CausalConfig::default());
    p1.init(&group(3)).unwrap();

    p1.send(Bytes::from_static(b"m1"), &[pid(2), pid(3)]).unwrap();
    p1.send(Bytes::from_static(b"m2"), &[pid(2)]).unwrap();
    p1.deliver(&pid(2), CausalPacket::Ack { id: CausalId::new(pid(1), 0) })
        .unwrap();
    assert_eq!(p1.queued_len(), 1);

    // P3 leaves without acking m1.
    let output = p1.apply_view(&[pid(1), pid(2)]).unwrap();
    assert_eq!(output.completed, vec![CausalId::new(pid(1), 0)]);
    assert_eq!(sent_ids(&output), vec![(pid(2), CausalId::new(pid(1), 1))]);
}

#[test]
fn send_from_a_stale_view_does_not_wait_for_removed_members() {
    let mut p2 = CausalLayer::new(pid(2), CausalConfig::default());
    p2.init(&group(3)).unwrap();
    p2.apply_view(&[pid(1), pid(2)]).unwrap();

    // P1 has not installed the view without P3 yet.
    let m1 = CausalId::new(pid(1), 0);
    p2.deliver(
        &pid(1),
        CausalPacket::Send {
            id: m1.clone(),
            destinations: group(3),
            payload: Bytes::from_static(b"m1"),
        },
    )
    .unwrap();
    p2.deliver(&pid(1), CausalPacket::Ack { id: m1.clone() })
        .unwrap();
    assert_eq!(p2.awaiting(&m1), None);
    assert_eq!(p2.pending_len(), 0);

    let next = p2.send(Bytes::from_static(b"m2"), &[pid(1)]).unwrap();
    assert_eq!(sent_ids(&next), vec![(pid(1), CausalId::new(pid(2), 0))]);
    assert_eq!(p2.queued_len(), 0);
}

// ============================================================================
// Happens-Before
// ============================================================================

#[derive(Debug, Clone)]
enum Action {
    Broadcast(usize),
    Step(usize),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0usize..3).prop_map(Action::Broadcast),
        any::<usize>().prop_map(Action::Step),
        any::<usize>().prop_map(Action::Step),
    ]
}

proptest! {
    /// Property: under any link scheduling, every process delivers every
    /// message after everything its sender had delivered before sending it,
    /// and the group eventually quiesces with everything delivered.
    #[test]
    fn prop_delivery_respects_happens_before(script in prop::collection::vec(action(), 1..80)) {
        let members = group(3);
        let mut sim = Sim::new(&members);
        let mut total = 0usize;

        for action in script {
            match action {
                Action::Broadcast(i) => {
                    sim.broadcast(&members[i]);
                    total += 1;
                }
                Action::Step(choice) => {
                    sim.step(choice);
                }
            }
        }
        sim.settle();

        for member in &members {
            let delivered = sim.delivered.get(member).cloned().unwrap_or_default();
            prop_assert_eq!(delivered.len(), total);

            let mut seen = BTreeSet::new();
            for payload in delivered {
                let past = &sim.past[&payload];
                prop_assert!(
                    past.is_subset(&seen),
                    "{} delivered {:?} before its causal past",
                    member,
                    payload
                );
                seen.insert(payload);
            }

            let layer = &sim.layers[member];
            prop_assert_eq!(layer.outstanding(), 0);
        }
    }
}
