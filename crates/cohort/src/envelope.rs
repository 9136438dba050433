//! The frame payload every layer's packets travel in.

use bytes::Bytes;
use cohort_membership::StateTransfer;
use cohort_order::{CausalPacket, FifoPacket};
use serde::{Deserialize, Serialize};

use crate::error::StackResult;

/// Tags a point-to-point packet with the layer it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    Fifo(FifoPacket),
    Causal(CausalPacket),
    State(StateTransfer),
}

impl Envelope {
    pub fn encode(&self) -> StackResult<Bytes> {
        Ok(Bytes::from(postcard::to_allocvec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> StackResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Short layer name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fifo(_) => "fifo",
            Self::Causal(_) => "causal",
            Self::State(_) => "state",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_types::{CausalId, ProcessId, ViewId};

    #[test]
    fn causal_send_survives_the_wire() {
        let sender = ProcessId::new("10.0.0.1", 7400, 2);
        let envelope = Envelope::Causal(CausalPacket::Send {
            id: CausalId::new(sender.clone(), 17),
            destinations: vec![sender, ProcessId::new("10.0.0.2", 7400, 0)],
            payload: Bytes::from_static(b"hello"),
        });

        let bytes = envelope.encode().unwrap();
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn state_transfer_survives_the_wire() {
        let joiner = ProcessId::new("10.0.0.3", 7400, 0);
        let envelope = Envelope::State(StateTransfer {
            view_id: ViewId::new(4),
            members: vec![ProcessId::new("10.0.0.1", 7400, 0), joiner.clone()],
            added: vec![joiner],
        });

        let bytes = envelope.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.kind(), "state");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Envelope::decode(&[0xff, 0xff, 0xff]).is_err());
        assert!(Envelope::decode(&[]).is_err());
    }
}
