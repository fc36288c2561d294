//! Bounded pool of workers, each with its own document store session

use {
    crate::store::{Connector, DocumentStore},
    anyhow::Result,
    std::{fmt::Display, future::Future, sync::Arc, thread},
    tokio::task,
    tracing::error,
};

/// Number of workers to use by default: the hardware parallelism divided by `divisor`, and at least one
pub fn default_workers(divisor: usize) -> usize {
    (thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        / divisor.max(1))
    .max(1)
}

/// Deal `items` round-robin into at most `workers` non-empty batches
pub fn partition<T>(items: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let workers = workers.max(1).min(items.len());

    let mut batches = (0..workers).map(|_| Vec::new()).collect::<Vec<_>>();

    for (index, item) in items.into_iter().enumerate() {
        batches[index % workers].push(item);
    }

    batches
}

/// What a pool run accomplished
#[derive(Debug)]
pub struct Tally<R> {
    pub done: Vec<R>,
    pub failed: usize,
}

/// Apply `work` to every item on `workers` concurrent tasks.
///
/// Each task opens its own session with `connector` and processes its batch sequentially.  An item whose work
/// fails is logged and counted, and the task moves on to its next item.  If a task cannot open a session, or
/// dies, every item of its batch counts as failed.
pub async fn run<T, R, F, Fut>(
    connector: Arc<dyn Connector>,
    items: Vec<T>,
    workers: usize,
    work: F,
) -> Tally<R>
where
    T: Display + Send + 'static,
    R: Send + 'static,
    F: Fn(Arc<dyn DocumentStore>, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send,
{
    let work = Arc::new(work);

    let handles = partition(items, workers)
        .into_iter()
        .map(|batch| {
            let connector = connector.clone();
            let work = work.clone();
            let size = batch.len();

            let handle = task::spawn(async move {
                let session = match connector.connect().await {
                    Ok(session) => Arc::<dyn DocumentStore>::from(session),
                    Err(e) => {
                        error!("unable to open worker session: {:?}", e);

                        return Tally {
                            done: Vec::new(),
                            failed: batch.len(),
                        };
                    }
                };

                let mut tally = Tally {
                    done: Vec::new(),
                    failed: 0,
                };

                for item in batch {
                    let label = item.to_string();

                    match work(session.clone(), item).await {
                        Ok(result) => tally.done.push(result),
                        Err(e) => {
                            error!("failed to process {}: {:?}", label, e);

                            tally.failed += 1;
                        }
                    }
                }

                tally
            });

            (size, handle)
        })
        .collect::<Vec<_>>();

    let mut tally = Tally {
        done: Vec::new(),
        failed: 0,
    };

    for (size, handle) in handles {
        match handle.await {
            Ok(worker) => {
                tally.done.extend(worker.done);
                tally.failed += worker.failed;
            }
            Err(e) => {
                error!("worker task failed: {:?}", e);

                tally.failed += size;
            }
        }
    }

    tally
}
