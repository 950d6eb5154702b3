// Phase list and response table a node uses for a round, by its position in
// the topology.
//
// Every multi-node phase runs around the ring first→…→last, and the last node
// hands its output back to the first node's next phase. Precomputation goes
// decrypt, permute, encrypt, reveal; realtime goes decrypt, permute, encrypt,
// with the last node's encrypt ending in identify.

use std::time::Duration;

use mix_engine::GraphGenerator;
use mix_types::{NodeId, PhaseState, PhaseTag, PhaseType, Topology};

use crate::error::Result;
use crate::phase::Phase;
use crate::response::{Response, ResponseMap};
use crate::streams::{decrypt, encrypt, generate, permute, reveal, share, PhaseGraph};
use crate::transmit::HandlerFactory;

/// Where a node sits in the round's chain. A single-node topology is both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub first: bool,
    pub last: bool,
}

impl Position {
    pub fn of(topology: &Topology, node: &NodeId) -> Self {
        Self {
            first: topology.is_first(node),
            last: topology.is_last(node),
        }
    }
}

fn graph_for(gen: &GraphGenerator, phase: PhaseType, position: Position) -> Result<PhaseGraph> {
    let graph = match phase {
        PhaseType::PrecompGeneration => generate::graph(gen),
        PhaseType::PrecompShare => share::graph(gen),
        PhaseType::PrecompDecrypt => decrypt::precomp_graph(gen),
        PhaseType::PrecompPermute => permute::precomp_graph(gen)?,
        PhaseType::PrecompEncrypt => encrypt::precomp_graph(gen),
        PhaseType::PrecompReveal => reveal::graph(gen),
        PhaseType::RealDecrypt => decrypt::realtime_graph(gen),
        PhaseType::RealPermute => permute::realtime_graph(gen)?,
        PhaseType::RealEncrypt if position.last => encrypt::identify_graph(gen),
        PhaseType::RealEncrypt => encrypt::realtime_graph(gen),
    };
    Ok(graph)
}

/// One unbuilt phase per [`PhaseType`], in execution order.
pub fn build_phases(
    gen: &GraphGenerator,
    position: Position,
    handlers: &dyn HandlerFactory,
    phase_timeout: Duration,
) -> Result<Vec<Phase>> {
    PhaseType::ALL
        .iter()
        .map(|&phase| {
            Ok(Phase::new(
                phase,
                graph_for(gen, phase, position)?,
                handlers.handler(phase),
                phase_timeout,
                phase == PhaseType::PrecompShare,
            ))
        })
        .collect()
}

/// Output the last node sends back, and the first node phase it feeds.
const RING_RETURNS: [(PhaseType, PhaseType); 5] = [
    (PhaseType::PrecompDecrypt, PhaseType::PrecompPermute),
    (PhaseType::PrecompPermute, PhaseType::PrecompEncrypt),
    (PhaseType::PrecompEncrypt, PhaseType::PrecompReveal),
    (PhaseType::RealDecrypt, PhaseType::RealPermute),
    (PhaseType::RealPermute, PhaseType::RealEncrypt),
];

pub fn build_responses(position: Position) -> ResponseMap {
    let active = &PhaseState::ACTIVE;
    let mut map = ResponseMap::new();
    let mut route = |tag: PhaseTag, phase: PhaseType, expected: &[PhaseState]| {
        map.insert(tag, Response::direct(phase, expected));
    };

    route(
        PhaseTag::verification(PhaseType::PrecompShare),
        PhaseType::PrecompShare,
        &[PhaseState::Running],
    );
    if position.first {
        route(PhaseTag::new(PhaseType::PrecompGeneration), PhaseType::PrecompShare, active);
        for (from, to) in RING_RETURNS {
            route(PhaseTag::new(from), to, active);
        }
    } else {
        for phase in PhaseType::ALL.into_iter().skip(1) {
            route(PhaseTag::new(phase), phase, active);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::transmit::{DiscardHandler, TransmissionHandler};

    struct Discard;

    impl HandlerFactory for Discard {
        fn handler(&self, _phase: PhaseType) -> Arc<dyn TransmissionHandler> {
            Arc::new(DiscardHandler)
        }
    }

    fn topology() -> Topology {
        Topology::new(vec!["a".into(), "b".into(), "c".into()]).unwrap()
    }

    #[test]
    fn positions() {
        let t = topology();
        assert_eq!(Position::of(&t, &"a".into()), Position { first: true, last: false });
        assert_eq!(Position::of(&t, &"b".into()), Position { first: false, last: false });
        assert_eq!(Position::of(&t, &"c".into()), Position { first: false, last: true });
    }

    #[test]
    fn first_node_routes_ring_returns_forward() {
        let map = build_responses(Position { first: true, last: false });
        let r = map.get(&PhaseTag::new(PhaseType::PrecompDecrypt)).unwrap();
        assert_eq!(r.return_phase(), PhaseType::PrecompPermute);
        let r = map.get(&PhaseTag::new(PhaseType::PrecompEncrypt)).unwrap();
        assert_eq!(r.return_phase(), PhaseType::PrecompReveal);
        let r = map.get(&PhaseTag::new(PhaseType::RealPermute)).unwrap();
        assert_eq!(r.return_phase(), PhaseType::RealEncrypt);
        assert!(map.get(&PhaseTag::new(PhaseType::PrecompShare)).is_err());
        assert!(map.get(&PhaseTag::new(PhaseType::PrecompReveal)).is_err());
        assert!(map.get(&PhaseTag::new(PhaseType::RealEncrypt)).is_err());
    }

    #[test]
    fn other_nodes_route_by_name() {
        let map = build_responses(Position { first: false, last: true });
        for phase in PhaseType::ALL.into_iter().skip(1) {
            assert_eq!(map.get(&PhaseTag::new(phase)).unwrap().return_phase(), phase);
        }
        let verify = map.get(&PhaseTag::verification(PhaseType::PrecompShare)).unwrap();
        assert_eq!(verify.expected_states(), &[PhaseState::Running]);
    }

    #[test]
    fn only_share_is_verified_and_last_node_identifies() {
        let gen = GraphGenerator::new(4, 1, 0, 0.0).unwrap();
        let last = Position { first: false, last: true };
        let phases = build_phases(&gen, last, &Discard, Duration::from_secs(1)).unwrap();
        assert_eq!(phases.len(), 9);
        for (p, expected) in phases.iter().zip(PhaseType::ALL) {
            assert_eq!(p.phase_type(), expected);
            assert_eq!(p.requires_verification(), expected == PhaseType::PrecompShare);
        }
        assert!(matches!(phases[8].graph(), PhaseGraph::RealIdentify(_)));
        assert_eq!(phases[8].graph().stream_name(), "RealIdentify");

        let interior = Position { first: false, last: false };
        let interior = build_phases(&gen, interior, &Discard, Duration::from_secs(1)).unwrap();
        assert!(matches!(interior[8].graph(), PhaseGraph::RealEncrypt(_)));
        assert_eq!(interior[8].graph().stream_name(), "RealEncrypt");
    }
}
