//! Batched pageview writer
//!
//! The tracking endpoint queues pageviews on a channel; a background task
//! writes them in batches. A batch that fails to write stays queued and is
//! retried on the next tick, up to a bounded backlog. Pageviews feed the
//! yearly estimate, so every row that has to be dropped is counted in the log.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::Database;
use crate::error::Result;
use crate::model::Pageview;

/// Sender handle for queueing pageviews
pub type PageviewSender = mpsc::UnboundedSender<Pageview>;

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL_MS: u64 = 250;
/// Rows kept across failed flushes before the oldest are dropped
const MAX_BACKLOG: usize = 10 * BATCH_SIZE;

/// Where batches end up
#[async_trait]
pub(crate) trait PageviewSink: Send + Sync + 'static {
    async fn write_batch(&self, pageviews: &[Pageview]) -> Result<()>;
}

#[async_trait]
impl PageviewSink for Database {
    async fn write_batch(&self, pageviews: &[Pageview]) -> Result<()> {
        self.batch_insert_pageviews(pageviews).await
    }
}

/// Start the writer task for `db`
pub fn start_write_buffer(db: Arc<Database>) -> PageviewSender {
    spawn_writer(db)
}

fn spawn_writer<S: PageviewSink>(sink: Arc<S>) -> PageviewSender {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(writer_task(sink, rx));
    tx
}

async fn writer_task<S: PageviewSink>(sink: Arc<S>, mut rx: mpsc::UnboundedReceiver<Pageview>) {
    let mut backlog: Vec<Pageview> = Vec::with_capacity(BATCH_SIZE);
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_millis(FLUSH_INTERVAL_MS));

    info!(
        "Pageview writer started (batch_size={}, flush_interval={}ms, max_backlog={})",
        BATCH_SIZE, FLUSH_INTERVAL_MS, MAX_BACKLOG
    );

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(pageview) => {
                    backlog.push(pageview);
                    if backlog.len() % BATCH_SIZE == 0 {
                        flush(sink.as_ref(), &mut backlog).await;
                    }
                }
                None => {
                    if !backlog.is_empty() && !flush(sink.as_ref(), &mut backlog).await {
                        error!("Pageview writer closing, {} pageviews lost", backlog.len());
                    }
                    info!("Pageview writer shutting down");
                    break;
                }
            },
            _ = ticker.tick() => {
                if !backlog.is_empty() {
                    flush(sink.as_ref(), &mut backlog).await;
                }
            }
        }
    }
}

/// Write the backlog; on failure keep it for the next attempt. Returns
/// whether the backlog is now empty.
async fn flush<S: PageviewSink + ?Sized>(sink: &S, backlog: &mut Vec<Pageview>) -> bool {
    let count = backlog.len();
    match sink.write_batch(backlog).await {
        Ok(()) => {
            debug!("Wrote {} pageviews", count);
            backlog.clear();
            true
        }
        Err(e) => {
            warn!("Failed to write {} pageviews, keeping them for retry: {}", count, e);
            let dropped = trim_backlog(backlog, MAX_BACKLOG);
            if dropped > 0 {
                error!("Pageview backlog full, dropped {} oldest pageviews", dropped);
            }
            false
        }
    }
}

/// Drop the oldest rows beyond `max`, returning how many went
fn trim_backlog(backlog: &mut Vec<Pageview>, max: usize) -> usize {
    let excess = backlog.len().saturating_sub(max);
    backlog.drain(..excess);
    excess
}
