use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::error::ReaderError;
use crate::library::cache::ChapterCache;

use super::events::ReaderEvent;

/// Chapters to keep cached around `current`: itself, then its neighbours.
pub fn prefetch_window(current: u32, total: u32) -> Vec<u32> {
    if current == 0 {
        return Vec::new();
    }
    let mut targets = vec![current];
    if current > 1 {
        targets.push(current - 1);
    }
    if current < total {
        targets.push(current + 1);
    }
    targets
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    pub book: String,
    pub current: u32,
    pub any_downloaded: bool,
    pub downloaded: Vec<u32>,
    pub failures: Vec<(u32, String)>,
}

#[derive(Clone)]
pub struct Prefetcher {
    cache: Arc<ChapterCache>,
}

impl Prefetcher {
    pub fn new(cache: Arc<ChapterCache>) -> Self {
        Self { cache }
    }

    /// Ensures every chapter of the window is cached. Targets run on the
    /// blocking pool side by side; one failure does not stop the others.
    pub async fn run(&self, book: &str, current: u32) -> PrefetchReport {
        let total = match self.cache.load_chapter_list(book) {
            Ok(list) => list.len() as u32,
            Err(err) => {
                log::debug!("[prefetch] no chapter list for {} yet: {}", book, err);
                0
            }
        };
        let targets = prefetch_window(current, total);

        let tasks = targets.iter().map(|&index| {
            let cache = self.cache.clone();
            let book = book.to_string();
            tokio::task::spawn_blocking(move || cache.ensure_cached(&book, index, None))
        });
        let results = join_all(tasks).await;

        let mut report = PrefetchReport {
            book: book.to_string(),
            current,
            ..PrefetchReport::default()
        };
        for (index, result) in targets.into_iter().zip(results) {
            match result {
                Ok(Ok(cached)) if cached.downloaded => report.downloaded.push(index),
                Ok(Ok(_)) => {}
                Ok(Err(err)) => report.failures.push((index, err.to_string())),
                Err(join_err) => report
                    .failures
                    .push((index, ReaderError::network(join_err.to_string()).to_string())),
            }
        }
        report.any_downloaded = !report.downloaded.is_empty();
        if !report.failures.is_empty() {
            log::warn!(
                "[prefetch] {} around chapter {}: {} target(s) failed",
                book,
                current,
                report.failures.len()
            );
        }
        report
    }

    /// Runs the window in the background and posts a single completion event.
    pub fn schedule(
        &self,
        book: String,
        current: u32,
        events: UnboundedSender<ReaderEvent>,
    ) -> JoinHandle<()> {
        let prefetcher = self.clone();
        tokio::spawn(async move {
            let report = prefetcher.run(&book, current).await;
            if events.send(ReaderEvent::PrefetchCompleted(report)).is_err() {
                log::debug!("[prefetch] reader is gone, dropping report for {}", book);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::cache::BookListing;
    use crate::library::fetcher::StaticContentFetcher;
    use tempfile::TempDir;

    fn sorted(mut targets: Vec<u32>) -> Vec<u32> {
        targets.sort_unstable();
        targets
    }

    #[test]
    fn window_covers_neighbours_within_bounds() {
        assert_eq!(sorted(prefetch_window(5, 10)), vec![4, 5, 6]);
        assert_eq!(sorted(prefetch_window(1, 10)), vec![1, 2]);
        assert_eq!(sorted(prefetch_window(10, 10)), vec![9, 10]);
        assert_eq!(prefetch_window(5, 10)[0], 5);
        assert_eq!(prefetch_window(1, 0), vec![1]);
        assert!(prefetch_window(0, 10).is_empty());
    }

    fn cache_with(fetcher: StaticContentFetcher) -> (TempDir, Arc<StaticContentFetcher>, Arc<ChapterCache>) {
        let dir = TempDir::new().expect("temp dir");
        let fetcher = Arc::new(fetcher);
        let cache = Arc::new(ChapterCache::new(dir.path(), fetcher.clone()));
        cache
            .add_book(&BookListing {
                name: "书".into(),
                source_ref: "mem://b".into(),
                ..BookListing::default()
            })
            .expect("add");
        (dir, fetcher, cache)
    }

    fn five_chapters() -> StaticContentFetcher {
        StaticContentFetcher::new().with_book(
            "mem://b",
            vec![
                ("第1章", vec!["一"]),
                ("第2章", vec!["二"]),
                ("第3章", vec!["三"]),
                ("第4章", vec!["四"]),
                ("第5章", vec!["五"]),
            ],
        )
    }

    #[tokio::test]
    async fn run_downloads_window_once() {
        let (_dir, _fetcher, cache) = cache_with(five_chapters());
        let prefetcher = Prefetcher::new(cache.clone());

        let report = prefetcher.run("书", 3).await;
        assert!(report.any_downloaded);
        assert_eq!(sorted(report.downloaded.clone()), vec![2, 3, 4]);
        assert!(report.failures.is_empty());
        assert_eq!(cache.cached_indices("书").expect("indices"), vec![2, 3, 4]);

        let again = prefetcher.run("书", 3).await;
        assert!(!again.any_downloaded);
    }

    #[tokio::test]
    async fn failures_are_reported_without_aborting() {
        let (_dir, fetcher, cache) = cache_with(five_chapters());
        fetcher.fail_link("mem://b/4.html");
        let report = Prefetcher::new(cache.clone()).run("书", 5).await;

        assert_eq!(report.downloaded, vec![5]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, 4);
        assert!(report.any_downloaded);
    }

    #[tokio::test]
    async fn schedule_posts_one_completion_event() {
        let (_dir, _fetcher, cache) = cache_with(five_chapters());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        Prefetcher::new(cache)
            .schedule("书".into(), 1, tx)
            .await
            .expect("join");

        match rx.recv().await {
            Some(ReaderEvent::PrefetchCompleted(report)) => {
                assert_eq!(report.book, "书");
                assert_eq!(report.current, 1);
                assert_eq!(sorted(report.downloaded), vec![1, 2]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
