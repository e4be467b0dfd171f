//! Fan-out/fan-in over pool connections with first-error-wins aggregation.

use hmyload_core::{LoadError, LoadResult};
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Handle a worker uses to publish results.
pub struct Results<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Results<T> {
    pub async fn push(&self, item: T) -> LoadResult<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| LoadError::Internal("result queue closed".into()))
    }
}

/// A set of workers feeding one result queue sized to the expected count.
///
/// [`WorkerGroup::collect`] returns once every worker has finished. The first
/// worker error aborts the rest and is returned; no partial results escape.
pub struct WorkerGroup<T> {
    tasks: JoinSet<LoadResult<()>>,
    tx: mpsc::Sender<T>,
    rx: mpsc::Receiver<T>,
    expected: usize,
}

impl<T: Send + 'static> WorkerGroup<T> {
    pub fn new(expected: usize) -> Self {
        let (tx, rx) = mpsc::channel(expected.max(1));
        Self {
            tasks: JoinSet::new(),
            tx,
            rx,
            expected,
        }
    }

    pub fn spawn<F, Fut>(&mut self, work: F)
    where
        F: FnOnce(Results<T>) -> Fut,
        Fut: Future<Output = LoadResult<()>> + Send + 'static,
    {
        let results = Results { tx: self.tx.clone() };
        self.tasks.spawn(work(results));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub async fn collect(self) -> LoadResult<Vec<T>> {
        let Self {
            mut tasks,
            tx,
            mut rx,
            expected,
        } = self;
        drop(tx);

        let mut results = Vec::with_capacity(expected);
        loop {
            tokio::select! {
                Some(item) = rx.recv() => results.push(item),
                joined = tasks.join_next() => match joined {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        tasks.abort_all();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        tasks.abort_all();
                        return Err(LoadError::Internal(format!("Worker failed: {e}")));
                    }
                    None => break,
                },
            }
        }
        while let Ok(item) = rx.try_recv() {
            results.push(item);
        }

        if results.len() != expected {
            return Err(LoadError::Internal(format!(
                "expected {expected} results, workers produced {}",
                results.len()
            )));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn gathers_from_every_worker() {
        let mut group = WorkerGroup::new(6);
        for w in 0..3u32 {
            group.spawn(move |out| async move {
                out.push(w * 10).await?;
                out.push(w * 10 + 1).await
            });
        }
        let mut got = group.collect().await.unwrap();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 10, 11, 20, 21]);
    }

    #[tokio::test]
    async fn first_error_aborts_siblings() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut group = WorkerGroup::<u32>::new(2);

        let flag = finished.clone();
        group.spawn(move |out| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            flag.store(true, Ordering::SeqCst);
            out.push(1).await
        });
        group.spawn(|_| async { Err(LoadError::Transport("socket reset".into())) });

        let err = group.collect().await.unwrap_err();
        assert!(matches!(err, LoadError::Transport(_)));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn short_count_is_an_error() {
        let mut group = WorkerGroup::<u32>::new(3);
        group.spawn(|out| async move { out.push(1).await });
        assert!(matches!(group.collect().await, Err(LoadError::Internal(_))));
    }

    #[tokio::test]
    async fn empty_group_yields_nothing() {
        let group = WorkerGroup::<u32>::new(0);
        assert!(group.collect().await.unwrap().is_empty());
    }
}
