use std::ops::Range;
use std::sync::Arc;

use crate::error::Result;
use crate::progress::{ProgressRecord, ProgressStore};
use crate::text::chapters::fallback_title;
use crate::text::layout::{page_count, paginate, PageSlice, Viewport};

use super::book::Book;

/// Position within the loaded chapter sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadPosition {
    pub chapter: usize,
    pub page: usize,
}

/// Owns the open book, the viewport and the reading position. Every move
/// is written to the progress store right away.
pub struct ReaderSession {
    book: Book,
    viewport: Viewport,
    position: ReadPosition,
    progress: Arc<dyn ProgressStore>,
    save_error: Option<String>,
}

impl ReaderSession {
    /// Opens `book` at the stored position. A stored chapter that is not
    /// loaded falls back to the first loaded chapter.
    pub fn open(book: Book, viewport: Viewport, progress: Arc<dyn ProgressStore>) -> Self {
        let record = match progress.get(book.name(), book.source()) {
            Ok(record) => record,
            Err(err) => {
                log::warn!("[session] cannot read progress for {}: {}", book.name(), err);
                None
            }
        };
        let mut session = Self {
            book,
            viewport,
            position: ReadPosition::default(),
            progress,
            save_error: None,
        };
        if let Some(record) = record {
            if let Some(chapter) = session.book.index().position_of(record.chapter) {
                session.position = ReadPosition {
                    chapter,
                    page: record.page,
                };
            } else {
                log::debug!(
                    "[session] stored chapter {} of {} is not loaded",
                    record.chapter,
                    session.book.name()
                );
            }
        }
        session.clamp_page();
        session
    }

    pub fn book(&self) -> &Book {
        &self.book
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn position(&self) -> ReadPosition {
        self.position
    }

    pub fn canonical_index(&self) -> u32 {
        self.book
            .index()
            .canonical_at(self.position.chapter)
            .unwrap_or(1)
    }

    pub fn title_for(&self, canonical: u32) -> String {
        self.book.title_for(canonical)
    }

    pub fn current_title(&self) -> String {
        self.book
            .chapter(self.position.chapter)
            .map(|chapter| chapter.title.clone())
            .unwrap_or_else(|| fallback_title(self.canonical_index()))
    }

    fn chapter_range(&self, chapter: usize) -> Range<usize> {
        self.book
            .chapter(chapter)
            .map(|chapter| chapter.range())
            .unwrap_or(0..0)
    }

    fn pages_in(&self, chapter: usize) -> usize {
        page_count(self.book.lines(), self.chapter_range(chapter), &self.viewport)
    }

    pub fn page_count(&self) -> usize {
        self.pages_in(self.position.chapter)
    }

    pub fn current_page(&self) -> PageSlice<'_> {
        paginate(
            self.book.lines(),
            self.chapter_range(self.position.chapter),
            &self.viewport,
            self.position.page,
        )
    }

    pub fn is_last_page(&self) -> bool {
        self.current_page().end >= self.chapter_range(self.position.chapter).end
    }

    fn clamp_page(&mut self) {
        if self.position.chapter >= self.book.chapter_count() {
            self.position = ReadPosition::default();
        }
        let last = self.page_count().saturating_sub(1);
        self.position.page = self.position.page.min(last);
    }

    /// Moves always stick; a progress write that fails afterwards is kept
    /// for [`take_save_error`](Self::take_save_error).
    fn move_to(&mut self, position: ReadPosition) -> Result<bool> {
        if position == self.position {
            return Ok(false);
        }
        self.position = position;
        self.record_progress();
        Ok(true)
    }

    fn record_progress(&mut self) {
        match self.save_progress() {
            Ok(()) => self.save_error = None,
            Err(err) => {
                log::warn!("[session] cannot save progress for {}: {}", self.book.name(), err);
                self.save_error = Some(err.to_string());
            }
        }
    }

    /// Error of the most recent progress write, if it failed.
    pub fn take_save_error(&mut self) -> Option<String> {
        self.save_error.take()
    }

    pub fn advance(&mut self) -> Result<bool> {
        let ReadPosition { chapter, page } = self.position;
        if !self.is_last_page() {
            return self.move_to(ReadPosition {
                chapter,
                page: page + 1,
            });
        }
        if chapter + 1 < self.book.chapter_count() {
            return self.move_to(ReadPosition {
                chapter: chapter + 1,
                page: 0,
            });
        }
        Ok(false)
    }

    /// Goes back one page; from a chapter's first page, lands on the last
    /// page of the previous chapter.
    pub fn retreat(&mut self) -> Result<bool> {
        let ReadPosition { chapter, page } = self.position;
        if page > 0 {
            return self.move_to(ReadPosition {
                chapter,
                page: page - 1,
            });
        }
        if chapter > 0 {
            let last = self.pages_in(chapter - 1).saturating_sub(1);
            return self.move_to(ReadPosition {
                chapter: chapter - 1,
                page: last,
            });
        }
        Ok(false)
    }

    pub fn next_chapter(&mut self) -> Result<bool> {
        let next = self.position.chapter + 1;
        if next >= self.book.chapter_count() {
            return Ok(false);
        }
        self.jump_to(next)
    }

    pub fn previous_chapter(&mut self) -> Result<bool> {
        match self.position.chapter.checked_sub(1) {
            Some(previous) => self.jump_to(previous),
            None => Ok(false),
        }
    }

    /// Jumps to a loaded chapter position, always on its first page.
    pub fn jump_to(&mut self, chapter: usize) -> Result<bool> {
        if chapter >= self.book.chapter_count() {
            return Ok(false);
        }
        self.move_to(ReadPosition { chapter, page: 0 })
    }

    /// Jumps by canonical index. Returns `false` when that chapter is not
    /// loaded.
    pub fn jump_to_canonical(&mut self, canonical: u32) -> Result<bool> {
        match self.book.index().position_of(canonical) {
            Some(chapter) => self.jump_to(chapter),
            None => Ok(false),
        }
    }

    pub fn resize(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        self.clamp_page();
    }

    /// Swaps in a rebuilt book and places the reader on `canonical` at
    /// `page` (clamped), recording the result.
    pub fn replace_book(&mut self, book: Book, canonical: u32, page: usize) {
        let chapter = book.index().position_of(canonical).unwrap_or(0);
        self.book = book;
        self.position = ReadPosition { chapter, page };
        self.clamp_page();
        self.record_progress();
    }

    pub fn save_progress(&self) -> Result<()> {
        let record = ProgressRecord::now(
            self.book.source(),
            self.canonical_index(),
            self.position.page,
            self.current_title(),
        );
        self.progress
            .set(self.book.name(), self.book.source(), record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReaderError;
    use crate::library::cache::{BookListing, ChapterCache};
    use crate::library::fetcher::StaticContentFetcher;
    use crate::progress::{BookSource, InMemoryProgressStore, ProgressKey};
    use crate::reader::book::ChapterIndex;
    use tempfile::TempDir;

    struct FullDiskStore;

    impl ProgressStore for FullDiskStore {
        fn get(&self, _book: &str, _source: BookSource) -> Result<Option<ProgressRecord>> {
            Ok(None)
        }

        fn set(&self, _book: &str, _source: BookSource, _record: ProgressRecord) -> Result<()> {
            Err(ReaderError::format("disk full"))
        }

        fn delete(&self, _book: &str, _source: BookSource) -> Result<bool> {
            Ok(false)
        }

        fn list(&self) -> Result<Vec<(ProgressKey, ProgressRecord)>> {
            Ok(Vec::new())
        }
    }

    fn to_lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|line| line.to_string()).collect()
    }

    fn session_with(lines: &[&str], rows: usize) -> (ReaderSession, Arc<InMemoryProgressStore>) {
        let store = Arc::new(InMemoryProgressStore::new());
        let book = Book::from_lines("demo", to_lines(lines));
        let session = ReaderSession::open(book, Viewport::new(40, rows), store.clone());
        (session, store)
    }

    fn visible(session: &ReaderSession) -> Vec<String> {
        session.current_page().lines.to_vec()
    }

    #[test]
    fn advance_walks_pages_then_chapters() {
        let (mut session, _store) = session_with(&["Chapter 1", "a", "b", "Chapter 2", "c"], 2);
        assert_eq!(visible(&session), to_lines(&["Chapter 1", "a"]));
        assert!(session.advance().expect("advance"));
        assert_eq!(visible(&session), to_lines(&["b"]));
        assert!(session.advance().expect("advance"));
        assert_eq!(visible(&session), to_lines(&["Chapter 2", "c"]));
        assert_eq!(session.canonical_index(), 2);
        assert!(!session.advance().expect("end of book"));
    }

    #[test]
    fn retreat_lands_on_previous_chapters_last_page() {
        let (mut session, _store) = session_with(&["Chapter 1", "a", "b", "c", "Chapter 2", "d"], 2);
        session.jump_to(1).expect("jump");
        assert!(session.retreat().expect("retreat"));
        assert_eq!(session.position(), ReadPosition { chapter: 0, page: 1 });
        assert_eq!(visible(&session), to_lines(&["b", "c"]));
        assert!(session.retreat().expect("retreat"));
        assert!(!session.retreat().expect("start of book"));
    }

    #[test]
    fn every_move_is_recorded() {
        let (mut session, store) = session_with(&["Chapter 1", "a", "b", "Chapter 2", "c"], 2);
        assert_eq!(store.get("demo", BookSource::Local).expect("get"), None);

        session.advance().expect("advance");
        let record = store.get("demo", BookSource::Local).expect("get").expect("record");
        assert_eq!((record.chapter, record.page), (1, 1));
        assert_eq!(record.last_chapter, "Chapter 1");

        session.next_chapter().expect("next");
        let record = store.get("demo", BookSource::Local).expect("get").expect("record");
        assert_eq!((record.chapter, record.page), (2, 0));
        assert_eq!(record.last_chapter, "Chapter 2");
    }

    #[test]
    fn reopening_restores_the_stored_position() {
        let store = Arc::new(InMemoryProgressStore::new());
        store
            .set("demo", BookSource::Local, ProgressRecord::now(BookSource::Local, 2, 1, ""))
            .expect("seed");
        let book = Book::from_lines("demo", to_lines(&["Chapter 1", "a", "Chapter 2", "b", "c", "d"]));
        let session = ReaderSession::open(book, Viewport::new(40, 2), store);
        assert_eq!(session.position(), ReadPosition { chapter: 1, page: 1 });
        assert_eq!(visible(&session), to_lines(&["c", "d"]));
    }

    #[test]
    fn unresolvable_stored_chapter_falls_back_to_first_loaded() {
        let index = ChapterIndex::new(vec![1, 2, 3]);
        assert_eq!(index.position_of(7), None);

        let store = Arc::new(InMemoryProgressStore::new());
        store
            .set("demo", BookSource::Local, ProgressRecord::now(BookSource::Local, 7, 4, ""))
            .expect("seed");
        let book = Book::from_lines("demo", to_lines(&["Chapter 1", "a", "Chapter 2", "Chapter 3"]));
        let session = ReaderSession::open(book, Viewport::new(40, 2), store);
        assert_eq!(session.position(), ReadPosition { chapter: 0, page: 0 });
        assert_eq!(session.canonical_index(), 1);
    }

    #[test]
    fn unresolvable_remote_chapter_falls_back_to_first_cached() {
        let dir = TempDir::new().expect("temp dir");
        let chapters: Vec<(&str, Vec<&str>)> = ["一", "二", "三", "四", "五", "六", "七", "八"]
            .into_iter()
            .map(|body| ("", vec![body]))
            .collect();
        let fetcher = Arc::new(StaticContentFetcher::new().with_book("mem://b", chapters));
        let cache = ChapterCache::new(dir.path(), fetcher);
        cache
            .add_book(&BookListing {
                name: "书".into(),
                source_ref: "mem://b".into(),
                ..BookListing::default()
            })
            .expect("add");
        for index in 1..=3 {
            cache.ensure_cached("书", index, None).expect("cache");
        }

        let store = Arc::new(InMemoryProgressStore::new());
        store
            .set("书", BookSource::Online, ProgressRecord::now(BookSource::Online, 7, 3, ""))
            .expect("seed");
        let book = Book::open_remote(&cache, "书").expect("open");
        assert_eq!(book.index().position_of(7), None);
        let session = ReaderSession::open(book, Viewport::new(40, 2), store.clone());
        assert_eq!(session.position(), ReadPosition { chapter: 0, page: 0 });
        assert_eq!(session.canonical_index(), 1);

        store
            .set("书", BookSource::Online, ProgressRecord::now(BookSource::Online, 3, 0, ""))
            .expect("seed");
        let book = Book::open_remote(&cache, "书").expect("reopen");
        let session = ReaderSession::open(book, Viewport::new(40, 2), store);
        assert_eq!(session.position().chapter, 2);
        assert_eq!(session.canonical_index(), 3);
    }

    #[test]
    fn failed_progress_write_keeps_the_move() {
        let book = Book::from_lines("demo", to_lines(&["Chapter 1", "a", "b", "Chapter 2", "c"]));
        let mut session = ReaderSession::open(book, Viewport::new(40, 2), Arc::new(FullDiskStore));

        assert!(session.advance().expect("advance"));
        assert_eq!(session.position(), ReadPosition { chapter: 0, page: 1 });
        let err = session.take_save_error().expect("save error");
        assert!(err.contains("disk full"));
        assert_eq!(session.take_save_error(), None);

        assert!(session.next_chapter().expect("next"));
        assert_eq!(session.canonical_index(), 2);
        assert!(session.take_save_error().is_some());
    }

    #[test]
    fn stored_page_is_clamped() {
        let store = Arc::new(InMemoryProgressStore::new());
        store
            .set("demo", BookSource::Local, ProgressRecord::now(BookSource::Local, 1, 99, ""))
            .expect("seed");
        let book = Book::from_lines("demo", to_lines(&["Chapter 1", "a", "b"]));
        let session = ReaderSession::open(book, Viewport::new(40, 2), store);
        assert_eq!(session.position().page, 1);
    }

    #[test]
    fn jumps_reset_the_page() {
        let (mut session, _store) = session_with(&["Chapter 1", "a", "b", "Chapter 2", "c", "d", "e"], 2);
        session.jump_to(1).expect("jump");
        session.advance().expect("advance");
        assert_eq!(session.position().page, 1);
        session.jump_to_canonical(1).expect("jump back");
        assert_eq!(session.position(), ReadPosition { chapter: 0, page: 0 });
        assert!(!session.jump_to_canonical(9).expect("unknown"));
        assert!(!session.jump_to(5).expect("out of range"));
        assert!(session.previous_chapter().is_ok());
    }

    #[test]
    fn resize_keeps_page_in_range() {
        let (mut session, _store) = session_with(&["Chapter 1", "a", "b", "c", "d", "e"], 2);
        session.advance().expect("advance");
        session.advance().expect("advance");
        assert_eq!(session.position().page, 2);
        session.resize(Viewport::new(40, 10));
        assert_eq!(session.position().page, 0);
        assert_eq!(session.page_count(), 1);
    }
}
