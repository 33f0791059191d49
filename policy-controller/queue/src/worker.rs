use crate::{Item, WorkQueue};
use std::sync::Arc;

/// Processes items delivered by a [`WorkQueue`].
#[async_trait::async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, item: &T) -> anyhow::Result<()>;
}

/// Drains the queue until it is shut down.
///
/// Any number of workers may run against the same queue.
pub async fn run<T, H>(queue: Arc<WorkQueue<T>>, handler: Arc<H>)
where
    T: Item,
    H: Handler<T> + ?Sized,
{
    while process_next(&queue, &*handler).await {}
    tracing::debug!("Work queue shut down");
}

/// Processes a single item, returning false when the queue has shut down.
///
/// Successfully handled items are forgotten by the rate limiter; failed items
/// are re-added with backoff. Handler failures never stop the worker.
pub async fn process_next<T, H>(queue: &Arc<WorkQueue<T>>, handler: &H) -> bool
where
    T: Item,
    H: Handler<T> + ?Sized,
{
    let Some(delivery) = queue.get().await else {
        return false;
    };

    match handler.handle(&delivery).await {
        Ok(()) => {
            queue.forget(&delivery);
            tracing::debug!(item = %delivery.item(), "Synced");
        }
        Err(error) => {
            queue.add_rate_limited(delivery.item().clone());
            tracing::warn!(
                item = %delivery.item(),
                retries = queue.num_requeues(&delivery),
                error = %format_args!("{error:#}"),
                "Failed to sync; requeuing"
            );
        }
    }

    true
}
