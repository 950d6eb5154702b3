use std::collections::HashMap;

use mix_types::{PhaseState, PhaseTag, PhaseType};

use crate::error::{Result, RoundError};

/// How a node reacts to one inbound phase tag.
///
/// `phase_lookup` is the local phase whose state gates the message;
/// `return_phase` is the phase the message is fed into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    phase_lookup: PhaseType,
    return_phase: PhaseType,
    expected_states: Vec<PhaseState>,
}

impl Response {
    pub fn new(phase_lookup: PhaseType, return_phase: PhaseType, expected: &[PhaseState]) -> Self {
        Self {
            phase_lookup,
            return_phase,
            expected_states: expected.to_vec(),
        }
    }

    /// Gate and target are the same phase.
    pub fn direct(phase: PhaseType, expected: &[PhaseState]) -> Self {
        Self::new(phase, phase, expected)
    }

    pub fn phase_lookup(&self) -> PhaseType {
        self.phase_lookup
    }

    pub fn return_phase(&self) -> PhaseType {
        self.return_phase
    }

    pub fn expected_states(&self) -> &[PhaseState] {
        &self.expected_states
    }

    pub fn check_state(&self, state: PhaseState) -> bool {
        self.expected_states.contains(&state)
    }

    /// The looked-up phase has not reached any acceptable state yet.
    pub fn is_behind(&self, state: PhaseState) -> bool {
        self.expected_states.iter().all(|e| state < *e)
    }
}

/// Inbound tag → [`Response`]. Keys are the tag's display form, so
/// `PrecompShareVerification` and `PrecompShare` are distinct entries.
#[derive(Debug, Clone, Default)]
pub struct ResponseMap {
    entries: HashMap<String, Response>,
}

impl ResponseMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: PhaseTag, response: Response) -> Option<Response> {
        self.entries.insert(tag.to_string(), response)
    }

    pub fn get(&self, tag: &PhaseTag) -> Result<&Response> {
        let key = tag.to_string();
        self.entries
            .get(&key)
            .ok_or(RoundError::MissingResponse { tag: key })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Response)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_tags_are_separate_keys() {
        let mut map = ResponseMap::new();
        map.insert(
            PhaseTag::new(PhaseType::PrecompShare),
            Response::direct(PhaseType::PrecompShare, &PhaseState::ACTIVE),
        );
        map.insert(
            PhaseTag::verification(PhaseType::PrecompShare),
            Response::direct(PhaseType::PrecompShare, &[PhaseState::Running]),
        );
        assert_eq!(map.len(), 2);
        let verify = map.get(&PhaseTag::verification(PhaseType::PrecompShare)).unwrap();
        assert_eq!(verify.expected_states(), &[PhaseState::Running]);
    }

    #[test]
    fn missing_tag_is_an_error() {
        let map = ResponseMap::new();
        let err = map.get(&PhaseTag::new(PhaseType::RealDecrypt)).unwrap_err();
        assert!(matches!(err, RoundError::MissingResponse { tag } if tag == "RealDecrypt"));
    }

    #[test]
    fn behind_versus_past() {
        let r = Response::direct(PhaseType::RealDecrypt, &PhaseState::ACTIVE);
        assert!(r.is_behind(PhaseState::Initialized));
        assert!(!r.is_behind(PhaseState::Queued));
        assert!(!r.is_behind(PhaseState::Finished));
        assert!(!r.check_state(PhaseState::Finished));
    }
}
