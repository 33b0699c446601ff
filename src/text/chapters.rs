use std::sync::LazyLock;

use regex::Regex;

static WESTERN_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:Chapter|CHAPTER)\s+(?:[0-9]+|[IVXLCDM]+)(?:\b.*)?$").expect("western heading")
});

static CJK_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^第[0-9０-９零〇一二三四五六七八九十百千两~-]+章(?:\s*[：:]?\s*.*)?$")
        .expect("cjk heading")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterRecord {
    pub title: String,
    pub start_line: usize,
}

pub fn is_chapter_heading(line: &str) -> bool {
    let line = line.trim();
    WESTERN_HEADING.is_match(line) || CJK_HEADING.is_match(line)
}

/// Scans `lines` once for headings. Never returns an empty table: text
/// without any heading becomes a single untitled chapter starting at line 0.
pub fn detect_chapters<S: AsRef<str>>(lines: &[S]) -> Vec<ChapterRecord> {
    let mut records: Vec<ChapterRecord> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| is_chapter_heading(line.as_ref()))
        .map(|(start_line, line)| ChapterRecord {
            title: line.as_ref().trim().to_string(),
            start_line,
        })
        .collect();

    if records.is_empty() {
        records.push(ChapterRecord {
            title: String::new(),
            start_line: 0,
        });
    }
    records
}

/// Title of the last heading in `lines`, if any.
pub fn latest_heading<S: AsRef<str>>(lines: &[S]) -> Option<String> {
    lines
        .iter()
        .rev()
        .map(|line| line.as_ref().trim())
        .find(|line| is_chapter_heading(line))
        .map(str::to_string)
}

/// Label used when neither the chapter list nor the text provides a title.
pub fn fallback_title(index: u32) -> String {
    format!("Chapter {index}")
}

/// Drops anything a listing page prints before a `第…章` heading.
pub fn clean_heading_title(raw: &str) -> String {
    let raw = raw.trim();
    if raw.contains('章') {
        if let Some(idx) = raw.find('第') {
            return raw[idx..].trim().to_string();
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_western_and_cjk_headings() {
        let lines = [
            "Preface",
            "Chapter 1",
            "text",
            "第十二章 风起",
            "more",
            "第3章：归来",
            "CHAPTER XIV The End",
        ];
        let records = detect_chapters(&lines);
        let starts: Vec<usize> = records.iter().map(|r| r.start_line).collect();
        assert_eq!(starts, vec![1, 3, 5, 6]);
        assert_eq!(records[1].title, "第十二章 风起");
    }

    #[test]
    fn text_without_headings_is_one_chapter() {
        let lines = ["1. Intro", "Section two", "", "closing"];
        let records = detect_chapters(&lines);
        assert_eq!(
            records,
            vec![ChapterRecord {
                title: String::new(),
                start_line: 0
            }]
        );
    }

    #[test]
    fn empty_input_still_has_one_chapter() {
        let lines: [&str; 0] = [];
        assert_eq!(detect_chapters(&lines).len(), 1);
    }

    #[test]
    fn start_lines_strictly_increase() {
        let lines = ["Chapter 1", "Chapter 2", "Chapter 3", "x", "Chapter 4"];
        let records = detect_chapters(&lines);
        assert!(records.windows(2).all(|w| w[0].start_line < w[1].start_line));
    }

    #[test]
    fn rejects_prose_that_mentions_chapters() {
        assert!(!is_chapter_heading("Chapters were read aloud"));
        assert!(!is_chapter_heading("Chapter"));
        assert!(!is_chapter_heading("他翻到第三章的时候"));
        assert!(is_chapter_heading("  Chapter 7: Storm  "));
    }

    #[test]
    fn latest_heading_picks_last_match() {
        let lines = ["第1章", "a", "第2章 夜", "b"];
        assert_eq!(latest_heading(&lines).as_deref(), Some("第2章 夜"));
        assert_eq!(latest_heading(&["plain"]), None);
    }

    #[test]
    fn clean_heading_title_strips_listing_prefix() {
        assert_eq!(clean_heading_title(" 最新 第5章 雨 "), "第5章 雨");
        assert_eq!(clean_heading_title("Epilogue"), "Epilogue");
    }
}
