use crate::error::EngineError;
use crate::types::TransitionType;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::OnceLock;

/// The legal-successor table: which `TransitionType` may follow which.
/// Built once as a directed graph, the same shape the original compiler's
/// verifier used for its reachability checks, here applied to the much
/// smaller alphabet of transition kinds instead of IR nodes.
struct LegalSuccessors {
    graph: DiGraph<TransitionType, ()>,
    index: HashMap<TransitionType, NodeIndex>,
}

fn table() -> &'static LegalSuccessors {
    static TABLE: OnceLock<LegalSuccessors> = OnceLock::new();
    TABLE.get_or_init(|| {
        use TransitionType::*;
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for t in [Init, InitBranch, Step, Resume, Wait, Error, Cancelled, FinishBranch, Finish] {
            index.insert(t, graph.add_node(t));
        }
        let edges: &[(TransitionType, TransitionType)] = &[
            (Init, Wait),
            (Init, Step),
            (Init, Error),
            (Init, Cancelled),
            (InitBranch, Wait),
            (InitBranch, Step),
            (InitBranch, Error),
            (InitBranch, Cancelled),
            (Wait, Resume),
            (Wait, Step),
            (Wait, Error),
            (Wait, Cancelled),
            (Resume, Wait),
            (Resume, Step),
            (Resume, Error),
            (Resume, Cancelled),
            (Resume, Finish),
            (Resume, FinishBranch),
            (Step, Wait),
            (Step, Step),
            (Step, Error),
            (Step, Cancelled),
            (Step, Finish),
            (Step, FinishBranch),
        ];
        for (from, to) in edges {
            graph.add_edge(index[from], index[to], ());
        }
        LegalSuccessors { graph, index }
    })
}

/// Checks that `to` may legally follow `from` per the successor table,
/// rejecting anything else with `IllegalTransition`.
pub fn validate(from: TransitionType, to: TransitionType) -> Result<(), EngineError> {
    let t = table();
    let (Some(&from_idx), Some(&to_idx)) = (t.index.get(&from), t.index.get(&to)) else {
        return Err(EngineError::IllegalTransition { from: format!("{from:?}"), to: format!("{to:?}") });
    };
    if t.graph.find_edge(from_idx, to_idx).is_some() {
        Ok(())
    } else {
        Err(EngineError::IllegalTransition { from: format!("{from:?}"), to: format!("{to:?}") })
    }
}
