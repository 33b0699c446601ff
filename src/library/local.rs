use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use walkdir::{DirEntry, WalkDir};

use crate::error::{ReaderError, Result};
use crate::progress::{BookSource, ProgressStore};
use crate::text::chapters::latest_heading;
use crate::text::decode::read_text_lines;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalBook {
    pub name: String,
    pub path: PathBuf,
    pub latest_chapter: String,
    pub current_chapter: String,
    /// Last read time when known, otherwise the file's mtime.
    pub modified: DateTime<Utc>,
    pub added: DateTime<Utc>,
}

fn should_descend(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    if entry.file_type().is_dir() {
        if let Some(name) = entry.file_name().to_str() {
            return !name.starts_with('.');
        }
    }
    true
}

fn is_text_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("txt"))
        .unwrap_or(false)
}

/// Last chapter heading found in a local book, if any.
pub fn latest_chapter(path: &Path) -> Result<Option<String>> {
    let lines = read_text_lines(path)?;
    Ok(latest_heading(&lines))
}

/// Walks every configured folder for `.txt` books. Missing folders are
/// skipped.
pub fn scan_local_library(roots: &[PathBuf]) -> Result<Vec<LocalBook>> {
    let mut books = Vec::new();
    for root in roots {
        if !root.is_dir() {
            log::warn!("[library] skipping missing folder {}", root.display());
            continue;
        }
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(should_descend)
        {
            let entry = entry.map_err(|err| match err.io_error() {
                Some(io_err) => ReaderError::Io(io::Error::new(io_err.kind(), io_err.to_string())),
                None => ReaderError::Io(io::Error::new(io::ErrorKind::Other, err.to_string())),
            })?;
            if !entry.file_type().is_file() || !is_text_file(entry.path()) {
                continue;
            }
            let Some(name) = entry.path().file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let name = name.to_string();
            let modified = entry
                .metadata()
                .ok()
                .and_then(|info| info.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or_default();
            let latest = match latest_chapter(entry.path()) {
                Ok(latest) => latest.unwrap_or_default(),
                Err(err) => {
                    log::warn!("[library] cannot read {}: {}", entry.path().display(), err);
                    String::new()
                }
            };
            books.push(LocalBook {
                name,
                path: entry.into_path(),
                latest_chapter: latest,
                current_chapter: String::new(),
                modified,
                added: modified,
            });
        }
    }
    Ok(books)
}

/// Overlays last-read time and chapter from the progress store, then sorts
/// most recently read first.
pub fn merge_progress(books: &mut [LocalBook], store: &dyn ProgressStore) -> Result<()> {
    for book in books.iter_mut() {
        let Some(record) = store.get(&book.name, BookSource::Local)? else {
            continue;
        };
        if record.last_read_at != DateTime::<Utc>::default() {
            book.modified = record.last_read_at;
        }
        if !record.last_chapter.is_empty() {
            book.current_chapter = record.last_chapter;
        }
    }
    books.sort_by(|a, b| match b.modified.cmp(&a.modified) {
        Ordering::Equal => natord::compare(&a.name, &b.name),
        other => other,
    });
    Ok(())
}

/// Groups books under the configured folder containing them, keeping the
/// folders' order. Newest additions come first inside a group.
pub fn group_by_root(books: &[LocalBook], roots: &[PathBuf]) -> Vec<(PathBuf, Vec<LocalBook>)> {
    let mut groups: Vec<(PathBuf, Vec<LocalBook>)> =
        roots.iter().map(|root| (root.clone(), Vec::new())).collect();
    for book in books {
        if let Some((_, members)) = groups
            .iter_mut()
            .find(|(root, _)| book.path.starts_with(root))
        {
            members.push(book.clone());
        }
    }
    groups.retain(|(_, members)| !members.is_empty());
    for (_, members) in groups.iter_mut() {
        members.sort_by(|a, b| b.added.cmp(&a.added));
    }
    groups
}
