use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::error::{ReaderError, Result};
use crate::library::cache::ChapterCache;
use crate::text::layout::Viewport;

use super::book::Book;
use super::events::{ReaderCommand, ReaderEvent};
use super::prefetch::{PrefetchReport, Prefetcher};
use super::session::ReaderSession;

/// Everything a presentation layer needs to draw one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenView {
    pub lines: Vec<String>,
    pub title: String,
    pub chapter: u32,
    pub total_chapters: usize,
    /// 1-based page within the chapter.
    pub page: usize,
    pub page_count: usize,
    pub loading: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct PendingLoad {
    canonical: u32,
    ticket: u64,
    land_on_last: bool,
}

/// A book reassembly running on the blocking pool. `target` is where the
/// reader lands once it arrives; `None` keeps the position current at that
/// time.
#[derive(Debug, Clone, Copy)]
struct PendingRebuild {
    ticket: u64,
    target: Option<(u32, usize)>,
}

/// Single owner of the reading state. Background fetches and rebuilds post
/// their results back as [`ReaderEvent`]s; results that no longer match the
/// current book or the latest request are dropped.
pub struct ReaderApp {
    session: ReaderSession,
    cache: Option<Arc<ChapterCache>>,
    prefetcher: Option<Prefetcher>,
    events: UnboundedSender<ReaderEvent>,
    pending: Option<PendingLoad>,
    rebuilding: Option<PendingRebuild>,
    next_ticket: u64,
    last_error: Option<String>,
}

impl ReaderApp {
    pub fn local(session: ReaderSession, events: UnboundedSender<ReaderEvent>) -> Self {
        Self {
            session,
            cache: None,
            prefetcher: None,
            events,
            pending: None,
            rebuilding: None,
            next_ticket: 0,
            last_error: None,
        }
    }

    pub fn remote(
        session: ReaderSession,
        cache: Arc<ChapterCache>,
        events: UnboundedSender<ReaderEvent>,
    ) -> Self {
        Self {
            prefetcher: Some(Prefetcher::new(cache.clone())),
            cache: Some(cache),
            ..Self::local(session, events)
        }
    }

    pub fn session(&self) -> &ReaderSession {
        &self.session
    }

    /// True while an explicitly requested chapter is being fetched or the
    /// book is being reassembled to show it.
    pub fn is_loading(&self) -> bool {
        self.loading_target().is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn loading_target(&self) -> Option<u32> {
        self.pending.map(|pending| pending.canonical).or_else(|| {
            self.rebuilding
                .and_then(|rebuild| rebuild.target)
                .map(|(canonical, _)| canonical)
        })
    }

    fn is_remote(&self) -> bool {
        self.cache.is_some() && self.session.book().is_remote()
    }

    /// Kicks off the initial prefetch around the opening chapter.
    pub fn start(&mut self) {
        self.schedule_prefetch();
    }

    /// Applies one event. Returns `false` once the reader should close.
    pub fn handle(&mut self, event: ReaderEvent) -> bool {
        match event {
            ReaderEvent::Command(command) => return self.handle_command(command),
            ReaderEvent::ChapterReady {
                book,
                canonical,
                ticket,
                outcome,
            } => self.on_chapter_ready(&book, canonical, ticket, outcome),
            ReaderEvent::PrefetchCompleted(report) => self.on_prefetch_completed(report),
            ReaderEvent::UpdatesChecked { book, outcome } => self.on_updates_checked(&book, outcome),
            ReaderEvent::BookRebuilt {
                book,
                ticket,
                outcome,
            } => self.on_book_rebuilt(&book, ticket, outcome),
        }
        true
    }

    fn handle_command(&mut self, command: ReaderCommand) -> bool {
        match command {
            ReaderCommand::NextPage => {
                let next = self.session.canonical_index() + 1;
                if self.session.is_last_page() && self.needs_fetch(next) {
                    self.request_chapter(next, false);
                } else {
                    self.navigate(ReaderSession::advance);
                }
            }
            ReaderCommand::PreviousPage => {
                let previous = self.session.canonical_index().saturating_sub(1);
                if self.session.position().page == 0 && self.needs_fetch(previous) {
                    self.request_chapter(previous, true);
                } else {
                    self.navigate(ReaderSession::retreat);
                }
            }
            ReaderCommand::NextChapter => {
                let next = self.session.canonical_index() + 1;
                if self.is_remote() {
                    self.open_canonical(next);
                } else {
                    self.navigate(ReaderSession::next_chapter);
                }
            }
            ReaderCommand::PreviousChapter => {
                let previous = self.session.canonical_index().saturating_sub(1);
                if self.is_remote() {
                    if previous >= 1 {
                        self.open_canonical(previous);
                    }
                } else {
                    self.navigate(ReaderSession::previous_chapter);
                }
            }
            ReaderCommand::JumpTo(canonical) => {
                let last = self.session.book().last_known_index();
                if canonical == 0 || canonical > last {
                    self.last_error = Some(
                        ReaderError::not_found(format!("chapter {canonical} out of range 1..={last}"))
                            .to_string(),
                    );
                } else {
                    self.open_canonical(canonical);
                }
            }
            ReaderCommand::Resize { width, height } => {
                let viewport = Viewport {
                    width,
                    height,
                    ..*self.session.viewport()
                };
                self.session.resize(viewport);
            }
            ReaderCommand::CheckUpdates => self.check_updates(),
            ReaderCommand::Quit => return false,
        }
        true
    }

    /// Remote chapter that exists upstream but is not loaded yet.
    fn needs_fetch(&self, canonical: u32) -> bool {
        self.is_remote()
            && canonical >= 1
            && canonical <= self.session.book().last_known_index()
            && self.session.book().index().position_of(canonical).is_none()
    }

    fn open_canonical(&mut self, canonical: u32) {
        if canonical > self.session.book().last_known_index() {
            return;
        }
        if self.needs_fetch(canonical) {
            self.request_chapter(canonical, false);
        } else {
            self.navigate(|session| session.jump_to_canonical(canonical));
        }
    }

    fn navigate(&mut self, step: impl FnOnce(&mut ReaderSession) -> Result<bool>) {
        let before = self.session.canonical_index();
        match step(&mut self.session) {
            Ok(true) => {
                self.pending = None;
                if let Some(rebuild) = self.rebuilding.as_mut() {
                    rebuild.target = None;
                }
                self.last_error = self.session.take_save_error();
                if self.session.canonical_index() != before {
                    self.schedule_prefetch();
                }
            }
            Ok(false) => {}
            Err(err) => {
                log::warn!("[reader] navigation failed: {}", err);
                self.last_error = Some(err.to_string());
            }
        }
    }

    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn request_chapter(&mut self, canonical: u32, land_on_last: bool) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let ticket = self.issue_ticket();
        self.pending = Some(PendingLoad {
            canonical,
            ticket,
            land_on_last,
        });
        log::debug!("[reader] loading chapter {} (ticket {})", canonical, ticket);

        let book = self.session.book().name().to_string();
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = cache
                .ensure_cached(&book, canonical, None)
                .map(|cached| cached.downloaded);
            let event = ReaderEvent::ChapterReady {
                book,
                canonical,
                ticket,
                outcome,
            };
            if events.send(event).is_err() {
                log::debug!("[reader] loop is gone, dropping chapter {}", canonical);
            }
        });
    }

    /// Reassembles the book from the cache on the blocking pool. A newer
    /// request supersedes an older one but inherits its landing target.
    fn request_rebuild(&mut self, target: Option<(u32, usize)>) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let target = target.or_else(|| self.rebuilding.and_then(|rebuild| rebuild.target));
        let ticket = self.issue_ticket();
        self.rebuilding = Some(PendingRebuild { ticket, target });

        let book = self.session.book().name().to_string();
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = Book::open_remote(&cache, &book);
            if events.send(ReaderEvent::BookRebuilt { book, ticket, outcome }).is_err() {
                log::debug!("[reader] loop is gone, dropping rebuild {}", ticket);
            }
        });
    }

    fn check_updates(&mut self) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let book = self.session.book().name().to_string();
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = cache.check_for_updates(&book);
            if events.send(ReaderEvent::UpdatesChecked { book, outcome }).is_err() {
                log::debug!("[reader] loop is gone, dropping update check");
            }
        });
    }

    fn schedule_prefetch(&self) {
        if !self.is_remote() {
            return;
        }
        if let Some(prefetcher) = &self.prefetcher {
            prefetcher.schedule(
                self.session.book().name().to_string(),
                self.session.canonical_index(),
                self.events.clone(),
            );
        }
    }

    fn on_chapter_ready(&mut self, book: &str, canonical: u32, ticket: u64, outcome: Result<bool>) {
        let current = match self.pending {
            Some(pending) if book == self.session.book().name() && pending.ticket == ticket => pending,
            _ => {
                log::debug!("[reader] dropping stale load of {} chapter {}", book, canonical);
                return;
            }
        };
        self.pending = None;

        if let Err(err) = outcome {
            log::warn!("[reader] chapter {} failed to load: {}", canonical, err);
            self.last_error = Some(format!("chapter {canonical}: {err}"));
            return;
        }
        let page = if current.land_on_last { usize::MAX } else { 0 };
        self.request_rebuild(Some((canonical, page)));
    }

    fn on_book_rebuilt(&mut self, book: &str, ticket: u64, outcome: Result<Book>) {
        let rebuild = match self.rebuilding {
            Some(rebuild) if book == self.session.book().name() && rebuild.ticket == ticket => rebuild,
            _ => {
                log::debug!("[reader] dropping stale rebuild of {}", book);
                return;
            }
        };
        self.rebuilding = None;

        let rebuilt = match outcome {
            Ok(rebuilt) => rebuilt,
            Err(err) => {
                log::warn!("[reader] cannot reopen {}: {}", book, err);
                if let Some((canonical, _)) = rebuild.target {
                    self.last_error = Some(format!("chapter {canonical}: {err}"));
                }
                return;
            }
        };
        let (canonical, page) = rebuild
            .target
            .unwrap_or_else(|| (self.session.canonical_index(), self.session.position().page));
        self.session.replace_book(rebuilt, canonical, page);

        let save_error = self.session.take_save_error();
        if rebuild.target.is_some() {
            self.last_error = save_error;
            self.schedule_prefetch();
        } else if save_error.is_some() {
            self.last_error = save_error;
        }
    }

    fn on_prefetch_completed(&mut self, report: PrefetchReport) {
        if report.book != self.session.book().name() {
            return;
        }
        for (index, err) in &report.failures {
            log::debug!("[reader] prefetch of chapter {} failed: {}", index, err);
        }
        if report.any_downloaded {
            self.request_rebuild(None);
        }
    }

    fn on_updates_checked(&mut self, book: &str, outcome: Result<bool>) {
        if book != self.session.book().name() {
            return;
        }
        match outcome {
            Ok(true) => self.request_rebuild(None),
            Ok(false) => {}
            Err(err) => self.last_error = Some(err.to_string()),
        }
    }

    pub fn view(&self) -> ScreenView {
        let page = self.session.current_page();
        ScreenView {
            lines: page.lines.to_vec(),
            title: self.session.current_title(),
            chapter: self.session.canonical_index(),
            total_chapters: self.session.book().toc().len(),
            page: self.session.position().page + 1,
            page_count: self.session.page_count(),
            loading: self
                .loading_target()
                .map(|canonical| format!("Loading {}", self.session.title_for(canonical))),
            error: self.last_error.clone(),
        }
    }
}

/// Drives `app` until a quit command arrives, publishing a fresh view after
/// every event.
pub async fn run(
    mut app: ReaderApp,
    mut events: UnboundedReceiver<ReaderEvent>,
    views: UnboundedSender<ScreenView>,
) -> ReaderApp {
    app.start();
    if views.send(app.view()).is_err() {
        log::debug!("[reader] no view consumer left");
    }
    while let Some(event) = events.recv().await {
        let keep_going = app.handle(event);
        if views.send(app.view()).is_err() {
            log::debug!("[reader] no view consumer left");
        }
        if !keep_going {
            break;
        }
    }
    app
}
