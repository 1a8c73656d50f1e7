//! Redis-backed storage node.

use crate::error::NodeError;
use crate::node::{Reply, ScriptNode};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{ErrorKind, RedisError, Value};

#[derive(Clone)]
pub struct RedisNode {
    name: String,
    conn: MultiplexedConnection,
}

impl RedisNode {
    pub async fn connect(url: &str) -> anyhow::Result<RedisNode> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(RedisNode {
            name: url.to_string(),
            conn,
        })
    }

    pub fn from_connection(name: impl Into<String>, conn: MultiplexedConnection) -> RedisNode {
        RedisNode {
            name: name.into(),
            conn,
        }
    }

    async fn call(
        &self,
        cmd: &str,
        script: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply, NodeError> {
        let mut conn = self.conn.clone();
        let value: Value = redis::cmd(cmd)
            .arg(script)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async(&mut conn)
            .await
            .map_err(node_error)?;

        Ok(reply(value))
    }
}

fn node_error(e: RedisError) -> NodeError {
    if e.kind() == ErrorKind::NoScriptError {
        NodeError::ScriptNotFound(e.to_string())
    } else {
        NodeError::Transport(e.into())
    }
}

fn reply(value: Value) -> Reply {
    match value {
        Value::Nil => Reply::Nil,
        Value::Int(n) => Reply::Int(n),
        Value::Okay => Reply::Str("OK".to_string()),
        Value::SimpleString(s) => Reply::Str(s),
        Value::BulkString(b) => Reply::Str(String::from_utf8_lossy(&b).into_owned()),
        other => Reply::Unsupported(format!("{other:?}")),
    }
}

#[async_trait]
impl ScriptNode for RedisNode {
    async fn eval_sha(
        &self,
        hash: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply, NodeError> {
        self.call("EVALSHA", hash, keys, args).await
    }

    async fn eval(
        &self,
        source: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply, NodeError> {
        self.call("EVAL", source, keys, args).await
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
