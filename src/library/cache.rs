use std::fs;
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::fetcher::{CanonicalChapter, ContentFetcher};
use super::flight::{FlightKey, FlightTracker};
use crate::error::{ReaderError, Result};
use crate::settings::ReaderSettings;
use crate::text::chapters::fallback_title;
use crate::text::decode::read_text_lines;

const META_FILE: &str = "meta.json";
const CHAPTER_LIST_FILE: &str = "chapters.json";
/// Flight slot reserved for chapter-list refreshes; chapter indices start at 1.
const LIST_SLOT: u32 = 0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookMeta {
    pub title: String,
    pub author: String,
    pub source_ref: String,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub total_known_chapters: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedChapter {
    pub entry: CanonicalChapter,
    pub path: PathBuf,
    pub downloaded: bool,
}

/// A remote book as offered by a search result or listing.
#[derive(Debug, Clone, Default)]
pub struct BookListing {
    pub name: String,
    pub author: String,
    pub source_ref: String,
    pub latest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedBookSummary {
    pub name: String,
    pub author: String,
    pub source_ref: String,
    pub latest_title: String,
    pub total_chapters: usize,
    pub added: Option<DateTime<Utc>>,
    pub path: PathBuf,
}

type ContentKey = (String, u32);

pub struct ChapterCache {
    root: PathBuf,
    fetcher: Arc<dyn ContentFetcher>,
    flights: FlightTracker,
    max_fragments: u32,
    content: Mutex<LruCache<ContentKey, Arc<Vec<String>>>>,
}

impl ChapterCache {
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn ContentFetcher>) -> Self {
        let defaults = ReaderSettings::default();
        Self::with_limits(root, fetcher, defaults.max_fragments, defaults.content_cache_chapters)
    }

    pub fn from_settings(settings: &ReaderSettings, fetcher: Arc<dyn ContentFetcher>) -> Self {
        Self::with_limits(
            settings.cache_root(),
            fetcher,
            settings.max_fragments,
            settings.content_cache_chapters,
        )
    }

    pub fn with_limits(
        root: impl Into<PathBuf>,
        fetcher: Arc<dyn ContentFetcher>,
        max_fragments: u32,
        content_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(content_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            root: root.into(),
            fetcher,
            flights: FlightTracker::new(),
            max_fragments: max_fragments.max(1),
            content: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn flights(&self) -> &FlightTracker {
        &self.flights
    }

    pub fn book_dir(&self, book: &str) -> Result<PathBuf> {
        let name = book.trim();
        if name.is_empty() || name == "." || name == ".." || name.contains(|c: char| c == '/' || c == '\\') {
            return Err(ReaderError::not_found(format!("invalid book name {book:?}")));
        }
        Ok(self.root.join(name))
    }

    pub fn chapter_path(&self, book: &str, index: u32) -> Result<PathBuf> {
        Ok(self.book_dir(book)?.join(format!("{index}.txt")))
    }

    pub fn is_cached(&self, book: &str, index: u32) -> bool {
        self.chapter_path(book, index)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    pub fn save_meta(&self, book: &str, meta: &BookMeta) -> Result<()> {
        let dir = self.book_dir(book)?;
        let json = serde_json::to_vec_pretty(meta)?;
        write_atomic(&dir, &dir.join(META_FILE), &json)
    }

    pub fn load_meta(&self, book: &str) -> Result<BookMeta> {
        let path = self.book_dir(book)?.join(META_FILE);
        let bytes = read_or_not_found(&path, || format!("no metadata for {book}"))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save_chapter_list(&self, book: &str, chapters: &[CanonicalChapter]) -> Result<()> {
        if chapters.is_empty() {
            return Err(ReaderError::not_found(format!("no chapters to save for {book}")));
        }
        let dir = self.book_dir(book)?;
        let json = serde_json::to_vec_pretty(chapters)?;
        write_atomic(&dir, &dir.join(CHAPTER_LIST_FILE), &json)
    }

    pub fn load_chapter_list(&self, book: &str) -> Result<Vec<CanonicalChapter>> {
        let path = self.book_dir(book)?.join(CHAPTER_LIST_FILE);
        let bytes = read_or_not_found(&path, || format!("no chapter list for {book}"))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Returns the cached chapter list, fetching it when none is cached or when
    /// `expected_latest` is not among the cached titles.
    pub fn load_or_refresh_chapter_list(
        &self,
        book: &str,
        source_ref: &str,
        expected_latest: Option<&str>,
    ) -> Result<Vec<CanonicalChapter>> {
        let gate = self.flights.gate(&FlightKey::new(book, LIST_SLOT));
        let _guard = gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let cached = match self.load_chapter_list(book) {
            Ok(list) if !list.is_empty() => Some(list),
            Ok(_) => None,
            Err(ReaderError::NotFound(_)) => None,
            Err(err) => {
                log::warn!("[cache] unreadable chapter list for {}: {}", book, err);
                None
            }
        };
        let latest = expected_latest.map(str::trim).filter(|title| !title.is_empty());

        let cached = match (cached, latest) {
            (Some(list), Some(latest)) if contains_title(&list, latest) => return Ok(list),
            (Some(list), None) => return Ok(list),
            (cached, _) => cached,
        };

        log::info!(
            "[cache] refreshing chapter list for {} (expected latest: {})",
            book,
            latest.unwrap_or("-")
        );
        let fetched = self.fetcher.fetch_chapter_list(source_ref, latest)?;
        let merged = match cached {
            Some(existing) if fetched.is_empty() => {
                log::warn!("[cache] refresh for {} returned no chapters, keeping cached list", book);
                return Ok(existing);
            }
            Some(existing) => merge_chapter_lists(existing, fetched),
            None if fetched.is_empty() => {
                return Err(ReaderError::not_found(format!("no chapters found for {book}")));
            }
            None => fetched,
        };

        self.save_chapter_list(book, &merged)?;
        if let Ok(mut meta) = self.load_meta(book) {
            meta.total_known_chapters = merged.len();
            meta.last_refreshed_at = Some(Utc::now());
            self.save_meta(book, &meta)?;
        }
        Ok(merged)
    }

    /// Makes sure chapter `index` (1-based canonical) is stored locally.
    /// An existing artifact is returned untouched without network access.
    pub fn ensure_cached(
        &self,
        book: &str,
        index: u32,
        expected_latest: Option<&str>,
    ) -> Result<CachedChapter> {
        let meta = self.load_meta(book)?;
        let source_ref = meta.source_ref.trim();
        if source_ref.is_empty() {
            return Err(ReaderError::not_found(format!("missing source reference for {book}")));
        }

        let list = self.load_or_refresh_chapter_list(book, source_ref, expected_latest)?;
        if index == 0 || index as usize > list.len() {
            return Err(ReaderError::not_found(format!(
                "chapter index {} out of range 1..={} for {}",
                index,
                list.len(),
                book
            )));
        }
        let entry = list
            .iter()
            .find(|chapter| chapter.index == index)
            .cloned()
            .ok_or_else(|| ReaderError::not_found(format!("chapter {index} missing from list of {book}")))?;

        let path = self.chapter_path(book, index)?;
        let key = FlightKey::new(book, index);
        let gate = self.flights.gate(&key);
        let _guard = gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if path.is_file() {
            return Ok(CachedChapter {
                entry,
                path,
                downloaded: false,
            });
        }

        self.flights.mark_fetching(&key);
        let stored = self
            .fetch_chapter_text(&entry)
            .and_then(|text| write_atomic(&self.book_dir(book)?, &path, text.as_bytes()));
        match stored {
            Ok(()) => {
                self.flights.mark_completed(&key);
                log::info!("[cache] stored {} chapter {} at {}", book, index, path.display());
                Ok(CachedChapter {
                    entry,
                    path,
                    downloaded: true,
                })
            }
            Err(err) => {
                self.flights.mark_failed(&key, err.to_string());
                log::warn!("[cache] failed to fetch {} chapter {}: {}", book, index, err);
                Err(err)
            }
        }
    }

    fn fetch_chapter_text(&self, entry: &CanonicalChapter) -> Result<String> {
        let mut body = String::new();
        let mut previous: Option<String> = None;

        for fragment_no in 1..=self.max_fragments {
            let fragment = match self.fetcher.fetch_fragment(entry, fragment_no) {
                Ok(fragment) => fragment,
                Err(err) if fragment_no == 1 => return Err(err),
                Err(err) => {
                    log::debug!(
                        "[cache] fragment {} of {} ended the chapter: {}",
                        fragment_no,
                        entry.link,
                        err
                    );
                    break;
                }
            };
            if fragment.trim().is_empty() {
                if fragment_no == 1 {
                    return Err(ReaderError::network(format!("empty content at {}", entry.link)));
                }
                break;
            }
            if previous.as_deref() == Some(fragment.as_str()) {
                break;
            }
            if !body.is_empty() && !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&fragment);
            previous = Some(fragment);

            if fragment_no == self.max_fragments {
                log::warn!("[cache] {} still had fragments after {}", entry.link, fragment_no);
            }
        }

        let title = entry.title.trim();
        let first_line = body.lines().map(str::trim).find(|line| !line.is_empty());
        if title.is_empty() || first_line == Some(title) {
            Ok(body)
        } else {
            Ok(format!("{title}\n{body}"))
        }
    }

    /// Probes upstream for a newer latest chapter and refreshes the list if
    /// it is not cached yet. Returns whether the list grew.
    pub fn check_for_updates(&self, book: &str) -> Result<bool> {
        let meta = self.load_meta(book)?;
        let source_ref = meta.source_ref.trim();
        if source_ref.is_empty() {
            return Err(ReaderError::not_found(format!("missing source reference for {book}")));
        }
        let Some(latest) = self.fetcher.probe_latest_title(source_ref)? else {
            return Ok(false);
        };
        let before = self.load_chapter_list(book).map(|list| list.len()).unwrap_or(0);
        let after = self
            .load_or_refresh_chapter_list(book, source_ref, Some(&latest))?
            .len();
        Ok(after > before)
    }

    /// Registers a remote book and loads its chapter list.
    pub fn add_book(&self, listing: &BookListing) -> Result<BookMeta> {
        let source_ref = listing.source_ref.trim();
        if source_ref.is_empty() {
            return Err(ReaderError::not_found(format!(
                "missing source reference for {}",
                listing.name
            )));
        }
        let previous = self.load_meta(&listing.name).ok();
        let author = match listing.author.trim() {
            "" => previous.as_ref().map(|meta| meta.author.clone()).unwrap_or_default(),
            author => author.to_string(),
        };
        let mut meta = BookMeta {
            title: listing.name.clone(),
            author,
            source_ref: source_ref.to_string(),
            last_refreshed_at: previous.as_ref().and_then(|meta| meta.last_refreshed_at),
            total_known_chapters: previous.map(|meta| meta.total_known_chapters).unwrap_or(0),
        };
        self.save_meta(&listing.name, &meta)?;

        let list = self.load_or_refresh_chapter_list(&listing.name, source_ref, listing.latest.as_deref())?;
        meta.total_known_chapters = list.len();
        meta.last_refreshed_at = Some(Utc::now());
        self.save_meta(&listing.name, &meta)?;
        Ok(meta)
    }

    /// Canonical indices with a stored artifact, ascending.
    pub fn cached_indices(&self, book: &str) -> Result<Vec<u32>> {
        let dir = self.book_dir(book)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut indices: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| {
                let name = entry.file_name();
                let stem = name.to_str()?.strip_suffix(".txt")?;
                stem.parse::<u32>().ok().filter(|index| *index >= 1)
            })
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    pub fn cached_books(&self) -> Result<Vec<CachedBookSummary>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut books = Vec::new();
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(meta) = self.load_meta(&name) else {
                continue;
            };
            let latest_title = match self.load_chapter_list(&name).ok().and_then(|list| list.last().cloned()) {
                Some(last) if !last.title.trim().is_empty() => last.title.trim().to_string(),
                Some(last) => fallback_title(last.index),
                None if meta.total_known_chapters > 0 => fallback_title(meta.total_known_chapters as u32),
                None => String::new(),
            };
            let added = meta.last_refreshed_at.or_else(|| {
                fs::metadata(&path)
                    .and_then(|info| info.modified())
                    .ok()
                    .map(DateTime::<Utc>::from)
            });
            books.push(CachedBookSummary {
                name,
                author: meta.author.trim().to_string(),
                source_ref: meta.source_ref,
                latest_title,
                total_chapters: meta.total_known_chapters,
                added,
                path,
            });
        }
        books.sort_by(|a, b| natord::compare(&a.name, &b.name));
        Ok(books)
    }

    /// Deletes every stored artifact of a book.
    pub fn remove_book(&self, book: &str) -> Result<()> {
        let dir = self.book_dir(book)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.flights.forget_book(book);
        if let Ok(mut content) = self.content.lock() {
            let stale: Vec<ContentKey> = content
                .iter()
                .filter(|(key, _)| key.0 == book)
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                content.pop(&key);
            }
        }
        log::info!("[cache] removed {}", book);
        Ok(())
    }

    /// Decoded lines of a stored chapter, served from memory when possible.
    pub fn read_chapter_lines(&self, book: &str, index: u32) -> Result<Arc<Vec<String>>> {
        let key = (book.to_string(), index);
        if let Ok(mut content) = self.content.lock() {
            if let Some(lines) = content.get(&key) {
                return Ok(lines.clone());
            }
        }
        let path = self.chapter_path(book, index)?;
        if !path.is_file() {
            return Err(ReaderError::not_found(format!("chapter {index} of {book} is not cached")));
        }
        let lines = Arc::new(read_text_lines(&path)?);
        if let Ok(mut content) = self.content.lock() {
            content.put(key, lines.clone());
        }
        Ok(lines)
    }
}

fn contains_title(list: &[CanonicalChapter], title: &str) -> bool {
    list.iter().any(|chapter| chapter.title.trim() == title)
}

/// Existing entries keep their index, link and title; only chapters beyond
/// the cached tail are appended.
fn merge_chapter_lists(
    existing: Vec<CanonicalChapter>,
    fetched: Vec<CanonicalChapter>,
) -> Vec<CanonicalChapter> {
    let tail = existing.last().map(|chapter| chapter.index).unwrap_or(0);
    let mut merged = existing;
    merged.extend(fetched.into_iter().filter(|chapter| chapter.index > tail));
    merged
}

fn read_or_not_found(path: &Path, message: impl FnOnce() -> String) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(ReaderError::not_found(message())),
        Err(err) => Err(err.into()),
    }
}

/// Writes through a temp file in `dir` and renames it over `path`.
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}
