use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::error::{ReaderError, Result};
use crate::library::cache::ChapterCache;
use crate::library::fetcher::CanonicalChapter;
use crate::progress::BookSource;
use crate::text::chapters::{detect_chapters, fallback_title};
use crate::text::decode::read_text_lines;

/// Maps loaded positions to canonical chapter indices. Kept as a sorted
/// array so reverse lookups are a binary search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterIndex {
    canonical: Vec<u32>,
}

impl ChapterIndex {
    pub fn new(mut canonical: Vec<u32>) -> Self {
        canonical.sort_unstable();
        canonical.dedup();
        Self { canonical }
    }

    /// Local books: position `p` is canonical `p + 1`.
    pub fn identity(count: usize) -> Self {
        Self {
            canonical: (1..=count as u32).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }

    pub fn canonical_at(&self, position: usize) -> Option<u32> {
        self.canonical.get(position).copied()
    }

    /// `None` means the chapter is not materialized.
    pub fn position_of(&self, canonical: u32) -> Option<usize> {
        self.canonical.binary_search(&canonical).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.canonical.iter().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedChapter {
    pub canonical: u32,
    pub title: String,
    pub start_line: usize,
    pub end_line: usize,
}

impl LoadedChapter {
    pub fn range(&self) -> Range<usize> {
        self.start_line..self.end_line
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    pub canonical: u32,
    pub title: String,
    pub loaded: bool,
}

#[derive(Debug, Clone)]
pub struct Book {
    name: String,
    source: BookSource,
    path: PathBuf,
    lines: Vec<String>,
    chapters: Vec<LoadedChapter>,
    index: ChapterIndex,
    toc: Vec<TocEntry>,
}

fn first_non_blank(lines: &[String]) -> Option<&str> {
    lines.iter().map(|line| line.trim()).find(|line| !line.is_empty())
}

/// Declared title, then the chapter's first non-blank line, then a label.
fn resolve_title(declared: Option<&str>, lines: &[String], canonical: u32) -> String {
    declared
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .or_else(|| first_non_blank(lines))
        .map(str::to_string)
        .unwrap_or_else(|| fallback_title(canonical))
}

impl Book {
    pub fn open_local(path: &Path, name: Option<&str>) -> Result<Self> {
        let lines = read_text_lines(path)?;
        let name = match name {
            Some(name) => name.to_string(),
            None => path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default()
                .to_string(),
        };
        let mut book = Self::from_lines(name, lines);
        book.path = path.to_path_buf();
        Ok(book)
    }

    /// Builds a local book from already decoded lines.
    pub fn from_lines(name: impl Into<String>, lines: Vec<String>) -> Self {
        let records = detect_chapters(&lines);
        let mut chapters = Vec::with_capacity(records.len());
        for (pos, record) in records.iter().enumerate() {
            let end_line = records
                .get(pos + 1)
                .map(|next| next.start_line)
                .unwrap_or(lines.len());
            let canonical = pos as u32 + 1;
            let start_line = record.start_line.min(end_line);
            chapters.push(LoadedChapter {
                canonical,
                title: resolve_title(Some(record.title.as_str()), &lines[start_line..end_line], canonical),
                start_line,
                end_line,
            });
        }
        let toc = chapters
            .iter()
            .map(|chapter| TocEntry {
                canonical: chapter.canonical,
                title: chapter.title.clone(),
                loaded: true,
            })
            .collect();
        Self {
            name: name.into(),
            source: BookSource::Local,
            path: PathBuf::new(),
            lines,
            index: ChapterIndex::identity(chapters.len()),
            chapters,
            toc,
        }
    }

    /// Loads every cached chapter of a remote book, in canonical order.
    pub fn open_remote(cache: &ChapterCache, name: &str) -> Result<Self> {
        let indices = cache.cached_indices(name)?;
        if indices.is_empty() {
            return Err(ReaderError::not_found(format!("no cached chapters for {name}")));
        }
        let canonical_list = match cache.load_chapter_list(name) {
            Ok(list) => list,
            Err(ReaderError::NotFound(_)) => Vec::new(),
            Err(err) => return Err(err),
        };
        Self::assemble_remote(cache, name, &canonical_list, ChapterIndex::new(indices))
    }

    fn assemble_remote(
        cache: &ChapterCache,
        name: &str,
        canonical_list: &[CanonicalChapter],
        index: ChapterIndex,
    ) -> Result<Self> {
        let declared = |canonical: u32| {
            canonical_list
                .iter()
                .find(|chapter| chapter.index == canonical)
                .map(|chapter| chapter.title.as_str())
        };

        let mut lines = Vec::new();
        let mut chapters = Vec::with_capacity(index.len());
        for canonical in index.iter() {
            let content = cache.read_chapter_lines(name, canonical)?;
            let start_line = lines.len();
            lines.extend(content.iter().cloned());
            chapters.push(LoadedChapter {
                canonical,
                title: resolve_title(declared(canonical), &content, canonical),
                start_line,
                end_line: lines.len(),
            });
        }

        let toc = if canonical_list.is_empty() {
            chapters
                .iter()
                .map(|chapter| TocEntry {
                    canonical: chapter.canonical,
                    title: chapter.title.clone(),
                    loaded: true,
                })
                .collect()
        } else {
            canonical_list
                .iter()
                .map(|entry| TocEntry {
                    canonical: entry.index,
                    title: match index.position_of(entry.index) {
                        Some(pos) => chapters[pos].title.clone(),
                        None => resolve_title(Some(entry.title.as_str()), &[], entry.index),
                    },
                    loaded: index.position_of(entry.index).is_some(),
                })
                .collect()
        };

        Ok(Self {
            name: name.to_string(),
            source: BookSource::Online,
            path: cache.book_dir(name)?,
            lines,
            chapters,
            index,
            toc,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> BookSource {
        self.source
    }

    pub fn is_remote(&self) -> bool {
        self.source == BookSource::Online
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn chapters(&self) -> &[LoadedChapter] {
        &self.chapters
    }

    pub fn chapter(&self, position: usize) -> Option<&LoadedChapter> {
        self.chapters.get(position)
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }

    pub fn index(&self) -> &ChapterIndex {
        &self.index
    }

    /// Every known canonical chapter, loaded or not.
    pub fn toc(&self) -> &[TocEntry] {
        &self.toc
    }

    pub fn last_known_index(&self) -> u32 {
        self.toc.last().map(|entry| entry.canonical).unwrap_or(0)
    }

    pub fn title_for(&self, canonical: u32) -> String {
        self.toc
            .iter()
            .find(|entry| entry.canonical == canonical)
            .map(|entry| entry.title.trim())
            .filter(|title| !title.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| fallback_title(canonical))
    }
}
