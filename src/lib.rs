//! Redlock-style mutual exclusion and counting semaphores over a set of
//! independent storage nodes.
//!
//! Every operation fans out to all nodes. Acquiring succeeds once a majority
//! of nodes (`n / 2 + 1`) agree; releasing requires every node to confirm.
//! Nodes enforce TTLs on their own, so entries left behind by a crashed
//! client or a failed attempt expire without help.
//!
//! ```no_run
//! use quorumlock::{Lock, MemoryNode, ScriptNode};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), quorumlock::Error> {
//! let nodes: Vec<Arc<dyn ScriptNode>> = (0..3)
//!     .map(|i| Arc::new(MemoryNode::new(format!("node-{i}"))) as Arc<dyn ScriptNode>)
//!     .collect();
//!
//! let lock = Lock::builder()
//!     .nodes(nodes)
//!     .resource_id("invoices")
//!     .expire_after_ms(5_000)
//!     .build()?;
//!
//! lock.lock().await?;
//! // critical section
//! lock.unlock().await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod error;
pub mod lock;
pub mod memory;
pub mod node;
pub mod quorum;
#[cfg(feature = "redis")]
pub mod redis_node;
pub mod retry;
pub mod script;
pub mod semaphore;
pub mod state;

#[cfg(test)]
mod testing;

pub use error::{Error, MaxRetryAttemptsError, MultiError, NodeError, ValidationError};
pub use lock::{Lock, LockBuilder};
pub use memory::MemoryNode;
pub use node::{NodeSet, Reply, ScriptNode, quorum};
pub use quorum::{bounded_for_each, race_to_first_n};
#[cfg(feature = "redis")]
pub use redis_node::RedisNode;
pub use retry::{Outcome, RetryPolicy, with_retries};
pub use semaphore::{Semaphore, SemaphoreBuilder};
pub use state::LockState;

/// Fresh owner id: 32 lowercase hex chars.
pub fn generate_owner_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
