//! RoundMessage encode/decode helpers for the node-to-node transport.
//!
//! Messages are serialized with bincode's standard configuration.

use mix_types::RoundMessage;

use crate::error::{Result, RoundError};

pub fn encode_message(msg: &RoundMessage) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| RoundError::Serialization(e.to_string()))
}

pub fn decode_message(data: &[u8]) -> Result<RoundMessage> {
    let (msg, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| RoundError::Serialization(e.to_string()))?;
    Ok(msg)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mix_types::{NodeId, PhaseTag, PhaseType, Slot};

    #[test]
    fn post_phase_keeps_tag_and_slots() {
        let msg = RoundMessage::PostPhase {
            round_id: 3,
            tag: PhaseTag::verification(PhaseType::PrecompShare),
            from: NodeId::from("n2"),
            begin: 0,
            slots: vec![Slot::new(1234)],
        };
        let decoded = decode_message(&encode_message(&msg).unwrap()).unwrap();
        match decoded {
            RoundMessage::PostPhase { tag, slots, .. } => {
                assert!(tag.verification);
                assert_eq!(slots, vec![Slot::new(1234)]);
            }
            other => panic!("wrong variant: {}", other.kind()),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            decode_message(&[0xff, 0xff, 0xff]),
            Err(RoundError::Serialization(_))
        ));
    }
}
