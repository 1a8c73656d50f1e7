use crate::memory::MemoryNode;
use crate::node::ScriptNode;
use crate::script::ScriptKind;
use std::sync::Arc;

/// `n` fresh in-memory nodes, plus the same nodes as trait objects.
pub(crate) fn memory_nodes(n: usize) -> (Vec<Arc<MemoryNode>>, Vec<Arc<dyn ScriptNode>>) {
    let nodes: Vec<Arc<MemoryNode>> = (0..n)
        .map(|i| Arc::new(MemoryNode::new(format!("node-{i}"))))
        .collect();
    let dyns = nodes
        .iter()
        .map(|n| Arc::clone(n) as Arc<dyn ScriptNode>)
        .collect();
    (nodes, dyns)
}

/// Calls of `kind` across `nodes` whose first arg (the owner id) is `owner`.
pub(crate) fn count_calls(nodes: &[Arc<MemoryNode>], kind: ScriptKind, owner: &str) -> usize {
    nodes
        .iter()
        .flat_map(|n| n.calls_of(kind))
        .filter(|c| c.args.first().is_some_and(|a| a == owner))
        .count()
}

/// Lets detached node tasks that are ready run to completion.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
