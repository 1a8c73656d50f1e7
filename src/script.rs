//! Client side of the per-node atomic scripts.
//!
//! Each script is addressed by the hex SHA-1 of its source. Calls go out by
//! hash first and fall back to the full source when the node has not seen
//! the script yet, which also registers it for the next call.

use crate::error::{Error, NodeError, ValidationError};
use crate::node::{Reply, ScriptNode};
use log::*;
use sha1::{Digest, Sha1};
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    AcquireLock,
    ReleaseLock,
    IncrementCounter,
    DecrementCounter,
}

#[derive(Debug)]
pub struct Script {
    kind: ScriptKind,
    name: &'static str,
    source: &'static str,
    hash: String,
}

impl Script {
    fn new(kind: ScriptKind, name: &'static str, source: &'static str) -> Self {
        Self {
            kind,
            name,
            source,
            hash: sha1_hex(source),
        }
    }

    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

static SCRIPTS: LazyLock<[Script; 4]> = LazyLock::new(|| {
    [
        Script::new(
            ScriptKind::AcquireLock,
            "TRY_TO_ACQUIRE_LOCK",
            include_str!("scripts/try-to-acquire-lock.lua"),
        ),
        Script::new(
            ScriptKind::ReleaseLock,
            "TRY_TO_RELEASE_LOCK",
            include_str!("scripts/try-to-release-lock.lua"),
        ),
        Script::new(
            ScriptKind::IncrementCounter,
            "TRY_TO_INCREMENT_COUNTER",
            include_str!("scripts/try-to-increment-counter.lua"),
        ),
        Script::new(
            ScriptKind::DecrementCounter,
            "TRY_TO_DECREMENT_COUNTER",
            include_str!("scripts/try-to-decrement-counter.lua"),
        ),
    ]
});

pub fn script(kind: ScriptKind) -> &'static Script {
    let index = match kind {
        ScriptKind::AcquireLock => 0,
        ScriptKind::ReleaseLock => 1,
        ScriptKind::IncrementCounter => 2,
        ScriptKind::DecrementCounter => 3,
    };

    &SCRIPTS[index]
}

pub fn find_by_hash(hash: &str) -> Option<&'static Script> {
    SCRIPTS.iter().find(|s| s.hash == hash)
}

pub fn sha1_hex(source: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

/// Runs `script` on `node`, cached copy first.
pub async fn exec_script(
    node: &dyn ScriptNode,
    script: &Script,
    keys: &[String],
    args: &[String],
) -> Result<Reply, NodeError> {
    match node.eval_sha(script.hash(), keys, args).await {
        Err(NodeError::ScriptNotFound(_)) => {
            debug!("{}: {} not cached, sending source", node.name(), script.name());
            node.eval(script.source(), keys, args).await
        }
        other => other,
    }
}

fn unexpected(script: &Script, expected: &str, reply: &Reply) -> Error {
    ValidationError::new(format!(
        "[{}]: Expected {expected}, but was {reply:?} in result",
        script.name()
    ))
    .into()
}

async fn exec_int(
    node: &dyn ScriptNode,
    kind: ScriptKind,
    keys: &[String],
    args: &[String],
) -> Result<bool, Error> {
    let script = script(kind);
    match exec_script(node, script, keys, args).await? {
        Reply::Int(n) => Ok(n == 1),
        other => Err(unexpected(script, "number", &other)),
    }
}

/// `Ok(true)` when the node answered `"OK"`, `Ok(false)` on nil.
pub async fn try_acquire_lock(
    node: &dyn ScriptNode,
    resource_id: &str,
    owner_id: &str,
    max_lock_time_ms: u64,
) -> Result<bool, Error> {
    let script = script(ScriptKind::AcquireLock);
    let keys = [resource_id.to_string()];
    let args = [owner_id.to_string(), max_lock_time_ms.to_string()];
    match exec_script(node, script, &keys, &args).await? {
        Reply::Str(s) => Ok(s == "OK"),
        Reply::Nil => Ok(false),
        other => Err(unexpected(script, "string", &other)),
    }
}

pub async fn try_release_lock(
    node: &dyn ScriptNode,
    resource_id: &str,
    owner_id: &str,
) -> Result<bool, Error> {
    let keys = [resource_id.to_string()];
    let args = [owner_id.to_string()];
    exec_int(node, ScriptKind::ReleaseLock, &keys, &args).await
}

pub async fn try_increment_counter(
    node: &dyn ScriptNode,
    shared_resource_id: &str,
    owner_id: &str,
    max_shared_resource_owners: u32,
    max_lock_time_ms: u64,
    current_time_ms: i64,
) -> Result<bool, Error> {
    let keys = [shared_resource_id.to_string()];
    let args = [
        owner_id.to_string(),
        max_shared_resource_owners.to_string(),
        max_lock_time_ms.to_string(),
        current_time_ms.to_string(),
    ];
    exec_int(node, ScriptKind::IncrementCounter, &keys, &args).await
}

pub async fn try_decrement_counter(
    node: &dyn ScriptNode,
    shared_resource_id: &str,
    owner_id: &str,
) -> Result<bool, Error> {
    let keys = [shared_resource_id.to_string()];
    let args = [owner_id.to_string()];
    exec_int(node, ScriptKind::DecrementCounter, &keys, &args).await
}
