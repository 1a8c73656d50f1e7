//! Distributed counting semaphore.
//!
//! Same quorum shape as [`Lock`](crate::Lock), but every node keeps up to
//! `max_shared_resource_owners` owners per shared resource. Expiry on the
//! nodes is judged against this client's clock, sampled once per attempt.

use crate::clock::now_unix_ms;
use crate::error::{Error, MultiError, ValidationError};
use crate::lock::DEFAULT_EXPIRE_AFTER_MS;
use crate::node::{NodeSet, ScriptNode};
use crate::quorum::{bounded_for_each, race_to_first_n};
use crate::retry::{Outcome, RetryPolicy, with_retries};
use crate::script;
use crate::state::{LockState, StateCell};
use log::*;
use scopeguard::ScopeGuard;
use std::sync::Arc;

#[derive(Debug)]
pub struct Semaphore {
    nodes: NodeSet,
    shared_resource_id: Arc<str>,
    owner_id: Arc<str>,
    max_shared_resource_owners: u32,
    expire_after_ms: u64,
    retry: RetryPolicy,
    state: StateCell,
}

impl Semaphore {
    pub fn builder() -> SemaphoreBuilder {
        SemaphoreBuilder::default()
    }

    pub fn shared_resource_id(&self) -> &str {
        &self.shared_resource_id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn max_shared_resource_owners(&self) -> u32 {
        self.max_shared_resource_owners
    }

    pub fn expire_after_ms(&self) -> u64 {
        self.expire_after_ms
    }

    pub fn quorum(&self) -> usize {
        self.nodes.quorum()
    }

    pub fn state(&self) -> LockState {
        self.state.get()
    }

    pub async fn acquire(&self) -> Result<(), Error> {
        let policy = self.retry;
        self.acquire_with(&policy).await
    }

    pub async fn acquire_with(&self, policy: &RetryPolicy) -> Result<(), Error> {
        self.state.set(LockState::Acquiring);
        let reset = scopeguard::guard(&self.state, |s| s.set(LockState::Unlocked));

        if let Err(e) = with_retries(policy, move || self.attempt()).await {
            warn!(
                "acquire failed: resource={}, owner={}, max_owners={}: {e}",
                self.shared_resource_id, self.owner_id, self.max_shared_resource_owners
            );
            return Err(e);
        }

        ScopeGuard::into_inner(reset).set(LockState::Locked);
        info!(
            "permit acquired: resource={}, owner={}",
            self.shared_resource_id, self.owner_id
        );
        Ok(())
    }

    /// Single quorum attempt without retry or rollback.
    pub async fn try_acquire(&self) -> bool {
        self.state.set(LockState::Acquiring);
        let reset = scopeguard::guard(&self.state, |s| s.set(LockState::Unlocked));

        match self.increment_quorum().await {
            Ok(()) => {
                ScopeGuard::into_inner(reset).set(LockState::Locked);
                true
            }
            Err(e) => {
                debug!("try_acquire {}: {e}", self.shared_resource_id);
                false
            }
        }
    }

    /// Gives the permit back on every node; fails unless all of them confirm,
    /// leaving the handle `Releasing`.
    pub async fn release(&self) -> Result<(), Error> {
        let previous = self.state.swap(LockState::Releasing);
        // Some nodes may have let go already; stay `Releasing` until a call succeeds.
        let unfinished = match previous {
            LockState::Unlocked => LockState::Unlocked,
            _ => LockState::Releasing,
        };
        let restore = scopeguard::guard(&self.state, move |s| s.set(unfinished));

        let all = self.nodes.len();
        let released = race_to_first_n(self.nodes.iter(), all, |node| {
            decrement_on(
                Arc::clone(node),
                Arc::clone(&self.shared_resource_id),
                Arc::clone(&self.owner_id),
            )
        });
        if let Err(e) = released.await {
            warn!(
                "release failed: resource={}, owner={}: {} node errors",
                self.shared_resource_id,
                self.owner_id,
                e.errors.len()
            );
            return Err(e.into());
        }

        ScopeGuard::into_inner(restore).set(LockState::Unlocked);
        info!(
            "permit released: resource={}, owner={}",
            self.shared_resource_id, self.owner_id
        );
        Ok(())
    }

    async fn attempt(&self) -> Outcome<()> {
        match self.increment_quorum().await {
            Ok(()) => Outcome::Success(()),
            Err(e) => {
                debug!(
                    "{}: no quorum ({} node errors), rolling back",
                    self.shared_resource_id,
                    e.errors.len()
                );
                self.rollback().await;
                Outcome::Retry
            }
        }
    }

    async fn increment_quorum(&self) -> Result<(), MultiError> {
        let now = now_unix_ms();
        race_to_first_n(self.nodes.iter(), self.nodes.quorum(), |node| {
            let node = Arc::clone(node);
            let resource_id = Arc::clone(&self.shared_resource_id);
            let owner_id = Arc::clone(&self.owner_id);
            let max_owners = self.max_shared_resource_owners;
            let ttl = self.expire_after_ms;
            async move {
                let acquired = script::try_increment_counter(
                    node.as_ref(),
                    &resource_id,
                    &owner_id,
                    max_owners,
                    ttl,
                    now,
                )
                .await?;

                if acquired {
                    Ok(())
                } else {
                    Err(Error::Rejected(format!("{}: failed to increment counter", node.name())))
                }
            }
        })
        .await
        .map(drop)
    }

    async fn rollback(&self) {
        let nodes = self.nodes.as_slice();
        let swept = bounded_for_each(nodes, nodes.len(), |node| {
            decrement_on(
                Arc::clone(node),
                Arc::clone(&self.shared_resource_id),
                Arc::clone(&self.owner_id),
            )
        });
        if let Err(e) = swept.await {
            debug!(
                "{}: rollback left {} node(s) untouched",
                self.shared_resource_id,
                e.errors.len()
            );
        }
    }
}

async fn decrement_on(
    node: Arc<dyn ScriptNode>,
    shared_resource_id: Arc<str>,
    owner_id: Arc<str>,
) -> Result<(), Error> {
    if script::try_decrement_counter(node.as_ref(), &shared_resource_id, &owner_id).await? {
        Ok(())
    } else {
        Err(Error::Rejected(format!("{}: failed to decrement counter", node.name())))
    }
}

#[derive(Default)]
pub struct SemaphoreBuilder {
    nodes: Vec<Arc<dyn ScriptNode>>,
    shared_resource_id: String,
    max_shared_resource_owners: u32,
    owner_id: Option<String>,
    expire_after_ms: Option<u64>,
    retry: Option<RetryPolicy>,
}

impl SemaphoreBuilder {
    pub fn new() -> SemaphoreBuilder {
        SemaphoreBuilder::default()
    }

    pub fn nodes(
        mut self,
        nodes: impl IntoIterator<Item = Arc<dyn ScriptNode>>,
    ) -> SemaphoreBuilder {
        self.nodes.extend(nodes);
        self
    }

    pub fn node(mut self, node: Arc<dyn ScriptNode>) -> SemaphoreBuilder {
        self.nodes.push(node);
        self
    }

    pub fn shared_resource_id(mut self, id: impl Into<String>) -> SemaphoreBuilder {
        self.shared_resource_id = id.into();
        self
    }

    pub fn max_shared_resource_owners(mut self, n: u32) -> SemaphoreBuilder {
        self.max_shared_resource_owners = n;
        self
    }

    pub fn owner_id(mut self, id: impl Into<String>) -> SemaphoreBuilder {
        self.owner_id = Some(id.into());
        self
    }

    pub fn expire_after_ms(mut self, ms: u64) -> SemaphoreBuilder {
        self.expire_after_ms = Some(ms);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> SemaphoreBuilder {
        self.retry = Some(policy);
        self
    }

    pub fn build(self) -> Result<Semaphore, Error> {
        let nodes = NodeSet::new(self.nodes)?;
        let owner_id = self.owner_id.unwrap_or_else(crate::generate_owner_id);
        let expire_after_ms = self.expire_after_ms.unwrap_or(DEFAULT_EXPIRE_AFTER_MS);

        ValidationError::ensure(
            !self.shared_resource_id.is_empty(),
            "Expected not empty string",
            "shared_resource_id",
        )?;
        ValidationError::ensure(!owner_id.is_empty(), "Expected not empty string", "owner_id")?;
        ValidationError::ensure(
            self.max_shared_resource_owners > 0,
            "Expected positive number",
            "max_shared_resource_owners",
        )?;
        ValidationError::ensure(
            expire_after_ms > 0,
            "Expected positive number",
            "expire_after_ms",
        )?;

        Ok(Semaphore {
            nodes,
            shared_resource_id: self.shared_resource_id.into(),
            owner_id: owner_id.into(),
            max_shared_resource_owners: self.max_shared_resource_owners,
            expire_after_ms,
            retry: self.retry.unwrap_or_default(),
            state: StateCell::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptKind;
    use crate::testing::{count_calls, memory_nodes, settle};

    const RESOURCE: &str = "pool";

    fn semaphore(nodes: &[Arc<dyn ScriptNode>], owner: &str, max: u32, retries: u32) -> Semaphore {
        Semaphore::builder()
            .nodes(nodes.iter().cloned())
            .shared_resource_id(RESOURCE)
            .max_shared_resource_owners(max)
            .owner_id(owner)
            .retry_policy(RetryPolicy::none().max_retry_attempts(retries))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn acquire_and_release_one_permit() {
        let (mem, nodes) = memory_nodes(3);
        let sem = semaphore(&nodes, "a", 2, 0);

        sem.acquire().await.unwrap();
        assert_eq!(sem.state(), LockState::Locked);
        settle().await;

        for n in &mem {
            let calls = n.calls_of(ScriptKind::IncrementCounter);
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].keys, vec![RESOURCE.to_string()]);
            assert_eq!(&calls[0].args[..3], &["a", "2", "10000"]);
            assert_eq!(n.counter_owners(RESOURCE), vec!["a".to_string()]);
        }

        sem.release().await.unwrap();
        assert_eq!(sem.state(), LockState::Unlocked);
        assert_eq!(count_calls(&mem, ScriptKind::DecrementCounter, "a"), 3);
        assert!(mem.iter().all(|n| n.counter_owners(RESOURCE).is_empty()));
    }

    #[tokio::test]
    async fn one_attempt_shares_one_timestamp() {
        let (mem, nodes) = memory_nodes(3);
        let sem = semaphore(&nodes, "a", 1, 0);
        sem.acquire().await.unwrap();
        settle().await;

        let stamps: Vec<String> = mem
            .iter()
            .map(|n| n.calls_of(ScriptKind::IncrementCounter)[0].args[3].clone())
            .collect();
        assert!(stamps.iter().all(|s| s == &stamps[0]));
        let stamp: i64 = stamps[0].parse().unwrap();
        assert!((now_unix_ms() - stamp).abs() < 60_000);
    }

    #[tokio::test]
    async fn permits_are_bounded() {
        let (_mem, nodes) = memory_nodes(3);
        let a = semaphore(&nodes, "a", 2, 0);
        let b = semaphore(&nodes, "b", 2, 0);
        let c = semaphore(&nodes, "c", 2, 0);

        assert!(a.try_acquire().await);
        settle().await;
        assert!(b.try_acquire().await);
        settle().await;
        assert!(!c.try_acquire().await);
        assert_eq!(c.state(), LockState::Unlocked);

        a.release().await.unwrap();
        assert!(c.try_acquire().await);
    }

    #[tokio::test]
    async fn contender_fails_after_its_retry_budget() {
        let (mem, nodes) = memory_nodes(3);
        let first = semaphore(&nodes, "first", 1, 0);
        let second = semaphore(&nodes, "second", 1, 2);

        first.acquire().await.unwrap();
        settle().await;

        let err = second.acquire().await.unwrap_err();
        match err {
            Error::MaxRetryAttempts(e) => assert_eq!(e.total_retry_attempts, 2),
            other => panic!("unexpected {other:?}"),
        }
        settle().await;

        // One decrement per node for each of the three failed attempts.
        for n in &mem {
            let decrements = n
                .calls_of(ScriptKind::DecrementCounter)
                .into_iter()
                .filter(|c| c.args[0] == "second")
                .count();
            assert_eq!(decrements, 3);
            assert_eq!(n.counter_owners(RESOURCE), vec!["first".to_string()]);
        }
        assert_eq!(count_calls(&mem, ScriptKind::IncrementCounter, "second"), 9);
    }

    #[tokio::test]
    async fn failed_try_acquire_leaves_partial_permits() {
        let (mem, nodes) = memory_nodes(3);
        mem[0].deny_next(1);
        mem[1].deny_next(1);
        let sem = semaphore(&nodes, "a", 1, 0);

        assert!(!sem.try_acquire().await);
        settle().await;
        assert_eq!(count_calls(&mem, ScriptKind::DecrementCounter, "a"), 0);
        assert_eq!(mem[2].counter_owners(RESOURCE), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn release_reports_unreachable_node() {
        let (mem, nodes) = memory_nodes(3);
        let sem = semaphore(&nodes, "a", 1, 0);
        sem.acquire().await.unwrap();
        settle().await;

        mem[0].set_offline(true);
        let err = sem.release().await.unwrap_err();
        assert!(matches!(err, Error::Multi(_)));
        assert_eq!(sem.state(), LockState::Releasing);
    }

    #[tokio::test]
    async fn survives_a_minority_of_dead_nodes() {
        let (mem, nodes) = memory_nodes(5);
        mem[3].set_offline(true);
        mem[4].set_hanging(true);
        let sem = semaphore(&nodes, "a", 1, 0);

        sem.acquire().await.unwrap();
        assert_eq!(sem.state(), LockState::Locked);
    }

    #[test]
    fn builder_validation() {
        let (_mem, nodes) = memory_nodes(3);

        let err = Semaphore::builder()
            .nodes(nodes.clone())
            .shared_resource_id(RESOURCE)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_shared_resource_owners"));

        let err = Semaphore::builder()
            .nodes(nodes.clone())
            .max_shared_resource_owners(1)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("shared_resource_id"));

        let err = Semaphore::builder()
            .nodes(nodes.clone())
            .shared_resource_id(RESOURCE)
            .max_shared_resource_owners(1)
            .owner_id("")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("owner_id"));

        let sem = Semaphore::builder()
            .nodes(nodes)
            .shared_resource_id(RESOURCE)
            .max_shared_resource_owners(3)
            .build()
            .unwrap();
        assert_eq!(sem.max_shared_resource_owners(), 3);
        assert_eq!(sem.expire_after_ms(), DEFAULT_EXPIRE_AFTER_MS);
        assert_eq!(sem.quorum(), 2);
        assert_eq!(sem.shared_resource_id(), RESOURCE);
        assert!(!sem.owner_id().is_empty());
    }
}
