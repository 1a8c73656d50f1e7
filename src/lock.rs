//! Distributed mutex.
//!
//! Acquisition needs a quorum of nodes, release needs every node. A failed
//! acquire attempt is rolled back on all nodes (best effort) before the
//! retry loop tries again; `try_lock` makes a single attempt and leaves any
//! partial entries to expire on their own.

use crate::error::{Error, MultiError, ValidationError};
use crate::node::{NodeSet, ScriptNode};
use crate::quorum::{bounded_for_each, race_to_first_n};
use crate::retry::{Outcome, RetryPolicy, with_retries};
use crate::script;
use crate::state::{LockState, StateCell};
use log::*;
use scopeguard::ScopeGuard;
use std::sync::Arc;

pub const DEFAULT_EXPIRE_AFTER_MS: u64 = 10_000;

#[derive(Debug)]
pub struct Lock {
    nodes: NodeSet,
    resource_id: Arc<str>,
    owner_id: Arc<str>,
    expire_after_ms: u64,
    retry: RetryPolicy,
    state: StateCell,
}

impl Lock {
    pub fn builder() -> LockBuilder {
        LockBuilder::default()
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Fencing token presented to every node.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn expire_after_ms(&self) -> u64 {
        self.expire_after_ms
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn quorum(&self) -> usize {
        self.nodes.quorum()
    }

    pub fn state(&self) -> LockState {
        self.state.get()
    }

    pub fn is_locked(&self) -> bool {
        self.state.get() == LockState::Locked
    }

    pub async fn lock(&self) -> Result<(), Error> {
        let policy = self.retry;
        self.lock_with(&policy).await
    }

    /// Acquires the lock, retrying per `policy`. Fails with
    /// `Error::MaxRetryAttempts` once the attempts run out.
    pub async fn lock_with(&self, policy: &RetryPolicy) -> Result<(), Error> {
        self.state.set(LockState::Acquiring);
        let reset = scopeguard::guard(&self.state, |s| s.set(LockState::Unlocked));

        if let Err(e) = with_retries(policy, move || self.attempt()).await {
            warn!(
                "lock failed: resource={}, owner={}: {e}",
                self.resource_id, self.owner_id
            );
            return Err(e);
        }

        ScopeGuard::into_inner(reset).set(LockState::Locked);
        info!(
            "lock acquired: resource={}, owner={}, ttl={}ms",
            self.resource_id, self.owner_id, self.expire_after_ms
        );
        Ok(())
    }

    /// Single quorum attempt. No retry and no rollback when it fails.
    pub async fn try_lock(&self) -> bool {
        self.state.set(LockState::Acquiring);
        let reset = scopeguard::guard(&self.state, |s| s.set(LockState::Unlocked));

        match self.acquire_quorum().await {
            Ok(()) => {
                ScopeGuard::into_inner(reset).set(LockState::Locked);
                info!(
                    "lock acquired: resource={}, owner={}, ttl={}ms",
                    self.resource_id, self.owner_id, self.expire_after_ms
                );
                true
            }
            Err(e) => {
                debug!("try_lock {}: {e} ({} node errors)", self.resource_id, e.errors.len());
                false
            }
        }
    }

    /// Releases the lock on every node. Any node that does not confirm the
    /// release fails the call with an aggregate error and leaves the handle
    /// `Releasing`.
    pub async fn unlock(&self) -> Result<(), Error> {
        let previous = self.state.swap(LockState::Releasing);
        // Some nodes may have let go already; stay `Releasing` until a call succeeds.
        let unfinished = match previous {
            LockState::Unlocked => LockState::Unlocked,
            _ => LockState::Releasing,
        };
        let restore = scopeguard::guard(&self.state, move |s| s.set(unfinished));

        let all = self.nodes.len();
        let released = race_to_first_n(self.nodes.iter(), all, |node| {
            release_on(Arc::clone(node), Arc::clone(&self.resource_id), Arc::clone(&self.owner_id))
        });
        if let Err(e) = released.await {
            warn!(
                "unlock failed: resource={}, owner={}: {} node errors",
                self.resource_id,
                self.owner_id,
                e.errors.len()
            );
            return Err(e.into());
        }

        ScopeGuard::into_inner(restore).set(LockState::Unlocked);
        info!("lock released: resource={}, owner={}", self.resource_id, self.owner_id);
        Ok(())
    }

    async fn attempt(&self) -> Outcome<()> {
        match self.acquire_quorum().await {
            Ok(()) => Outcome::Success(()),
            Err(e) => {
                debug!(
                    "{}: no quorum ({} node errors), rolling back",
                    self.resource_id,
                    e.errors.len()
                );
                self.rollback().await;
                Outcome::Retry
            }
        }
    }

    async fn acquire_quorum(&self) -> Result<(), MultiError> {
        race_to_first_n(self.nodes.iter(), self.nodes.quorum(), |node| {
            let node = Arc::clone(node);
            let resource_id = Arc::clone(&self.resource_id);
            let owner_id = Arc::clone(&self.owner_id);
            let ttl = self.expire_after_ms;
            async move {
                if script::try_acquire_lock(node.as_ref(), &resource_id, &owner_id, ttl).await? {
                    Ok(())
                } else {
                    Err(Error::Rejected(format!("{}: failed to acquire lock", node.name())))
                }
            }
        })
        .await
        .map(drop)
    }

    // Release failures here are ignored; leftovers expire with the TTL.
    async fn rollback(&self) {
        let nodes = self.nodes.as_slice();
        let swept = bounded_for_each(nodes, nodes.len(), |node| {
            release_on(Arc::clone(node), Arc::clone(&self.resource_id), Arc::clone(&self.owner_id))
        });
        if let Err(e) = swept.await {
            debug!("{}: rollback left {} node(s) untouched", self.resource_id, e.errors.len());
        }
    }
}

async fn release_on(
    node: Arc<dyn ScriptNode>,
    resource_id: Arc<str>,
    owner_id: Arc<str>,
) -> Result<(), Error> {
    if script::try_release_lock(node.as_ref(), &resource_id, &owner_id).await? {
        Ok(())
    } else {
        Err(Error::Rejected(format!("{}: failed to release lock", node.name())))
    }
}

#[derive(Default)]
pub struct LockBuilder {
    nodes: Vec<Arc<dyn ScriptNode>>,
    resource_id: String,
    owner_id: Option<String>,
    expire_after_ms: Option<u64>,
    retry: Option<RetryPolicy>,
}

impl LockBuilder {
    pub fn new() -> LockBuilder {
        LockBuilder::default()
    }

    pub fn nodes(mut self, nodes: impl IntoIterator<Item = Arc<dyn ScriptNode>>) -> LockBuilder {
        self.nodes.extend(nodes);
        self
    }

    pub fn node(mut self, node: Arc<dyn ScriptNode>) -> LockBuilder {
        self.nodes.push(node);
        self
    }

    pub fn resource_id(mut self, id: impl Into<String>) -> LockBuilder {
        self.resource_id = id.into();
        self
    }

    /// Defaults to a random UUIDv4.
    pub fn owner_id(mut self, id: impl Into<String>) -> LockBuilder {
        self.owner_id = Some(id.into());
        self
    }

    pub fn expire_after_ms(mut self, ms: u64) -> LockBuilder {
        self.expire_after_ms = Some(ms);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> LockBuilder {
        self.retry = Some(policy);
        self
    }

    pub fn build(self) -> Result<Lock, Error> {
        let nodes = NodeSet::new(self.nodes)?;
        let owner_id = self.owner_id.unwrap_or_else(crate::generate_owner_id);
        let expire_after_ms = self.expire_after_ms.unwrap_or(DEFAULT_EXPIRE_AFTER_MS);

        ValidationError::ensure(
            !self.resource_id.is_empty(),
            "Expected not empty string",
            "resource_id",
        )?;
        ValidationError::ensure(!owner_id.is_empty(), "Expected not empty string", "owner_id")?;
        ValidationError::ensure(
            expire_after_ms > 0,
            "Expected positive number",
            "expire_after_ms",
        )?;

        Ok(Lock {
            nodes,
            resource_id: self.resource_id.into(),
            owner_id: owner_id.into(),
            expire_after_ms,
            retry: self.retry.unwrap_or_default(),
            state: StateCell::new(),
        })
    }
}
