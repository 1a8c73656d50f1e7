//! In-process storage node.
//!
//! Emulates the four node scripts atomically behind a mutex and speaks the
//! same hash-then-source protocol as a real node: the script cache starts
//! empty, so the first call of every script comes back as NOSCRIPT.

use crate::clock::now_unix_ms;
use crate::error::NodeError;
use crate::node::{Reply, ScriptNode};
use crate::script::{self, ScriptKind};
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// One script execution seen by a [`MemoryNode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCall {
    pub kind: ScriptKind,
    pub keys: Vec<String>,
    pub args: Vec<String>,
}

#[derive(Debug)]
struct LockEntry {
    owner: String,
    expires_at_ms: i64,
}

#[derive(Debug, Default)]
struct State {
    scripts: HashSet<String>,
    locks: HashMap<String, LockEntry>,
    // shared resource -> owner -> expiry (ms)
    counters: HashMap<String, HashMap<String, i64>>,
    calls: Vec<ScriptCall>,
    source_evals: usize,
    denials: u32,
    offline: bool,
    hanging: bool,
}

#[derive(Debug)]
pub struct MemoryNode {
    name: String,
    state: Mutex<State>,
}

impl MemoryNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Every call fails with a transport error while set.
    pub fn set_offline(&self, offline: bool) {
        self.with_state(|s| s.offline = offline);
    }

    pub fn set_hanging(&self, hanging: bool) {
        self.with_state(|s| s.hanging = hanging);
    }

    /// Refuses the next `n` acquire/increment calls as if another owner held
    /// the resource. Refused calls still show up in [`calls`](Self::calls).
    pub fn deny_next(&self, n: u32) {
        self.with_state(|s| s.denials = n);
    }

    /// Drops the script cache, like SCRIPT FLUSH.
    pub fn flush_scripts(&self) {
        self.with_state(|s| s.scripts.clear());
    }

    pub fn calls(&self) -> Vec<ScriptCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn calls_of(&self, kind: ScriptKind) -> Vec<ScriptCall> {
        self.with_state(|s| s.calls.iter().filter(|c| c.kind == kind).cloned().collect())
    }

    /// How many times a script arrived as source rather than hash.
    pub fn source_evals(&self) -> usize {
        self.with_state(|s| s.source_evals)
    }

    /// Current lock owner of `resource_id`, if any and not expired.
    pub fn lock_owner(&self, resource_id: &str) -> Option<String> {
        let now = now_unix_ms();
        self.with_state(|s| {
            s.locks
                .get(resource_id)
                .filter(|e| e.expires_at_ms > now)
                .map(|e| e.owner.clone())
        })
    }

    /// Owners currently registered on `shared_resource_id`, expired or not.
    pub fn counter_owners(&self, shared_resource_id: &str) -> Vec<String> {
        self.with_state(|s| {
            let mut owners: Vec<String> = s
                .counters
                .get(shared_resource_id)
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();
            owners.sort();
            owners
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    async fn gate(&self) -> Result<(), NodeError> {
        let (offline, hanging) = self.with_state(|s| (s.offline, s.hanging));
        if hanging {
            std::future::pending::<()>().await;
        }

        if offline {
            return Err(anyhow!("{}: connection refused", self.name).into());
        }

        Ok(())
    }

    fn run(&self, kind: ScriptKind, keys: &[String], args: &[String]) -> Result<Reply, NodeError> {
        let key = keys
            .first()
            .ok_or_else(|| anyhow!("ERR wrong number of keys"))?
            .clone();

        self.with_state(|s| {
            s.calls.push(ScriptCall {
                kind,
                keys: keys.to_vec(),
                args: args.to_vec(),
            });

            let deny = matches!(kind, ScriptKind::AcquireLock | ScriptKind::IncrementCounter)
                && s.denials > 0;
            if deny {
                s.denials -= 1;
                return Ok(match kind {
                    ScriptKind::AcquireLock => Reply::Nil,
                    _ => Reply::Int(0),
                });
            }

            match kind {
                ScriptKind::AcquireLock => {
                    let owner = arg(args, 0)?;
                    let ttl = int_arg(args, 1)?;
                    let now = now_unix_ms();
                    let free = match s.locks.get(&key) {
                        None => true,
                        Some(e) => e.expires_at_ms <= now || e.owner == owner,
                    };
                    if !free {
                        return Ok(Reply::Nil);
                    }
                    s.locks.insert(
                        key,
                        LockEntry {
                            owner: owner.to_string(),
                            expires_at_ms: now + ttl,
                        },
                    );
                    Ok(Reply::Str("OK".to_string()))
                }
                ScriptKind::ReleaseLock => {
                    let owner = arg(args, 0)?;
                    let now = now_unix_ms();
                    let owned = s
                        .locks
                        .get(&key)
                        .is_some_and(|e| e.owner == owner && e.expires_at_ms > now);
                    if owned {
                        s.locks.remove(&key);
                        Ok(Reply::Int(1))
                    } else {
                        Ok(Reply::Int(0))
                    }
                }
                ScriptKind::IncrementCounter => {
                    let owner = arg(args, 0)?;
                    let max_owners = int_arg(args, 1)?;
                    let ttl = int_arg(args, 2)?;
                    let now = int_arg(args, 3)?;
                    let owners = s.counters.entry(key).or_default();
                    owners.retain(|_, expires_at| *expires_at > now);
                    if (owners.len() as i64) < max_owners {
                        owners.insert(owner.to_string(), now + ttl);
                        Ok(Reply::Int(1))
                    } else {
                        Ok(Reply::Int(0))
                    }
                }
                ScriptKind::DecrementCounter => {
                    let owner = arg(args, 0)?;
                    let removed = s
                        .counters
                        .get_mut(&key)
                        .and_then(|owners| owners.remove(owner))
                        .is_some();
                    Ok(Reply::Int(i64::from(removed)))
                }
            }
        })
    }
}

fn arg(args: &[String], i: usize) -> Result<&str, NodeError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("ERR missing argument {}", i + 1).into())
}

fn int_arg(args: &[String], i: usize) -> Result<i64, NodeError> {
    arg(args, i)?
        .parse()
        .map_err(|_| anyhow!("ERR value is not an integer or out of range").into())
}

#[async_trait]
impl ScriptNode for MemoryNode {
    async fn eval_sha(
        &self,
        hash: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply, NodeError> {
        self.gate().await?;
        let known = self.with_state(|s| s.scripts.contains(hash));
        let script = match script::find_by_hash(hash) {
            Some(script) if known => script,
            _ => {
                return Err(NodeError::ScriptNotFound(
                    "No matching script. Please use EVAL.".to_string(),
                ));
            }
        };

        self.run(script.kind(), keys, args)
    }

    async fn eval(
        &self,
        source: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply, NodeError> {
        self.gate().await?;
        let hash = script::sha1_hex(source);
        let script = script::find_by_hash(&hash)
            .ok_or_else(|| anyhow!("{}: script {hash} is not supported", self.name))?;
        self.with_state(|s| {
            s.scripts.insert(hash);
            s.source_evals += 1;
        });

        self.run(script.kind(), keys, args)
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
