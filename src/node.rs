use crate::error::{Error, NodeError, ValidationError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Int(i64),
    Str(String),
    /// Any shape the scripts never produce (arrays, maps, ...).
    Unsupported(String),
}

/// Transport capability of a single storage node.
///
/// Keys and args are passed in wire form; the node must run a script
/// atomically with respect to every other script on that node.
#[async_trait]
pub trait ScriptNode: Send + Sync {
    /// Execute a script previously registered on the node, by its SHA-1.
    /// Answers `NodeError::ScriptNotFound` when the node does not know it.
    async fn eval_sha(
        &self,
        hash: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply, NodeError>;

    /// Execute (and register) a script from its source.
    async fn eval(
        &self,
        source: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply, NodeError>;

    fn name(&self) -> String {
        String::from("node")
    }
}

pub fn quorum(node_count: usize) -> usize {
    node_count / 2 + 1
}

/// Ordered, identity-unique set of storage nodes. Fixed after construction.
#[derive(Clone)]
pub struct NodeSet {
    nodes: Vec<Arc<dyn ScriptNode>>,
}

impl NodeSet {
    pub fn new(nodes: Vec<Arc<dyn ScriptNode>>) -> Result<Self, Error> {
        let mut seen = HashSet::with_capacity(nodes.len());
        let unique = nodes
            .iter()
            .all(|n| seen.insert(Arc::as_ptr(n).cast::<()>() as usize));

        if nodes.is_empty() || !unique {
            return Err(ValidationError::new("Expected not empty array of unique nodes").into());
        }

        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn quorum(&self) -> usize {
        quorum(self.nodes.len())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ScriptNode>> {
        self.nodes.iter()
    }

    pub fn as_slice(&self) -> &[Arc<dyn ScriptNode>] {
        &self.nodes
    }
}

impl fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.nodes.iter().map(|n| n.name()))
            .finish()
    }
}
