use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tablesnap_core::{Error, RemoteFile, Result};
use tokio::sync::mpsc;
use tracing::debug;

const LISTING_BUFFER: usize = 1000;

/// Producer side of a walk. Dropped by the caller on timeout.
pub struct ListingSink {
    tx: mpsc::Sender<Result<RemoteFile>>,
}

impl ListingSink {
    /// Returns `false` once the walking side has gone away.
    pub async fn send(&self, file: RemoteFile) -> bool {
        self.tx.send(Ok(file)).await.is_ok()
    }

    pub async fn fail(&self, error: Error) {
        let _ = self.tx.send(Err(error)).await;
    }
}

/// One page of a token- or marker-paginated listing.
#[async_trait]
pub trait PageSource: Send {
    /// `Ok(None)` once the listing is exhausted.
    async fn next_page(&mut self) -> Result<Option<Vec<RemoteFile>>>;
}

/// Feeds every page of `source` into `sink` until exhaustion, error, or the
/// caller losing interest. The page being fetched is always allowed to finish.
pub async fn drain_pages<P: PageSource>(mut source: P, sink: ListingSink) {
    loop {
        match source.next_page().await {
            Ok(Some(page)) => {
                for file in page {
                    if !sink.send(file).await {
                        debug!("Listing abandoned by caller, stopping after current page");
                        return;
                    }
                }
            }
            Ok(None) => return,
            Err(e) => {
                sink.fail(e).await;
                return;
            }
        }
    }
}

/// Runs `list` as an independent task and feeds its results to `visit`.
///
/// Visiting happens on the caller's task. When `deadline` elapses first the
/// caller gets [`Error::Timeout`]; the listing task is not aborted, it notices
/// the closed channel on its next send and stops.
pub async fn walk_with_deadline<F, Fut>(
    kind: &'static str,
    deadline: Option<Duration>,
    list: F,
    visit: &mut (dyn FnMut(RemoteFile) + Send),
) -> Result<()>
where
    F: FnOnce(ListingSink) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(LISTING_BUFFER);
    tokio::spawn(list(ListingSink { tx }));

    let drain = async {
        while let Some(item) = rx.recv().await {
            visit(item?);
        }
        Ok::<(), Error>(())
    };

    match deadline {
        Some(limit) => tokio::time::timeout(limit, drain)
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout {
                    kind,
                    after_ms: limit.as_millis() as u64,
                })
            }),
        None => drain.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakePages {
        names: Vec<String>,
        page_size: usize,
        offset: usize,
        fail_at: Option<usize>,
    }

    impl FakePages {
        fn new(count: usize, page_size: usize) -> Self {
            Self {
                names: (0..count).map(|i| format!("backup/part-{:03}", i)).collect(),
                page_size,
                offset: 0,
                fail_at: None,
            }
        }
    }

    #[async_trait]
    impl PageSource for FakePages {
        async fn next_page(&mut self) -> Result<Option<Vec<RemoteFile>>> {
            if self.fail_at == Some(self.offset) {
                return Err(Error::Other("listing broke".to_string()));
            }
            if self.offset >= self.names.len() {
                return Ok(None);
            }
            let end = (self.offset + self.page_size).min(self.names.len());
            let page = self.names[self.offset..end]
                .iter()
                .map(|name| RemoteFile::new(name.clone(), 1, Utc::now()))
                .collect();
            self.offset = end;
            Ok(Some(page))
        }
    }

    #[tokio::test]
    async fn test_every_object_visited_once_for_any_page_size() {
        for count in [0usize, 1, 20, 1001] {
            for page_size in [1usize, 3, 7, 20, 1000] {
                let source = FakePages::new(count, page_size);
                let mut seen: HashMap<String, usize> = HashMap::new();
                let mut visit = |file: RemoteFile| *seen.entry(file.name).or_default() += 1;
                let deadline = Some(Duration::from_secs(10));
                walk_with_deadline("fake", deadline, |sink| drain_pages(source, sink), &mut visit)
                    .await
                    .unwrap();
                assert_eq!(seen.len(), count, "count {} page size {}", count, page_size);
                assert!(seen.values().all(|&n| n == 1));
            }
        }
    }

    #[tokio::test]
    async fn test_listing_error_reaches_caller() {
        let mut source = FakePages::new(10, 3);
        source.fail_at = Some(6);
        let mut visited = 0;
        let mut visit = |_file: RemoteFile| visited += 1;
        let err = walk_with_deadline("fake", None, |sink| drain_pages(source, sink), &mut visit)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert_eq!(visited, 6);
    }

    #[tokio::test]
    async fn test_deadline_returns_timeout_and_listing_finishes() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let mut visit = |_file: RemoteFile| {};
        let err = walk_with_deadline(
            "fake",
            Some(Duration::from_millis(20)),
            move |sink| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let _ = sink.send(RemoteFile::new("late", 1, Utc::now())).await;
                flag.store(true, Ordering::SeqCst);
            },
            &mut visit,
        )
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        assert!(matches!(err, Error::Timeout { kind: "fake", after_ms: 20 }));
        assert!(!finished.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(finished.load(Ordering::SeqCst));
    }
}
