use log::*;
use quorumlock::*;
use std::env;
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::Duration;

// Comma-separated redis URLs in QUORUMLOCK_NODES, else five in-memory nodes.
async fn nodes() -> anyhow::Result<Vec<Arc<dyn ScriptNode>>> {
    let mut out: Vec<Arc<dyn ScriptNode>> = vec![];
    match env::var("QUORUMLOCK_NODES") {
        Ok(urls) => {
            for url in urls.split(',').filter(|u| !u.is_empty()) {
                out.push(Arc::new(RedisNode::connect(url).await?));
            }
        }
        Err(_) => {
            for i in 0..5 {
                out.push(Arc::new(MemoryNode::new(format!("mem-{i}"))));
            }
        }
    }

    Ok(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let (tx, rx) = channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    let nodes = nodes().await?;
    info!("quorum={} of {}", quorum(nodes.len()), nodes.len());

    for worker in 0..3 {
        let lock = Lock::builder()
            .nodes(nodes.clone())
            .resource_id("example-lock")
            .expire_after_ms(5000)
            .retry_policy(RetryPolicy::default().max_retry_attempts(50))
            .build()?;

        let permits = Semaphore::builder()
            .nodes(nodes.clone())
            .shared_resource_id("example-pool")
            .max_shared_resource_owners(2)
            .build()?;

        tokio::spawn(async move {
            loop {
                match lock.lock().await {
                    Ok(()) => {
                        info!("[{worker}] holding lock as {}", lock.owner_id());
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        if let Err(e) = lock.unlock().await {
                            error!("[{worker}] unlock: {e}");
                        }
                    }
                    Err(e) => warn!("[{worker}] lock: {e}"),
                }

                if permits.try_acquire().await {
                    info!("[{worker}] got a permit");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if let Err(e) = permits.release().await {
                        error!("[{worker}] release: {e}");
                    }
                }
            }
        });
    }

    // Wait for Ctrl-C.
    tokio::task::spawn_blocking(move || rx.recv()).await??;
    Ok(())
}
