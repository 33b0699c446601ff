use std::fs;
use std::path::Path;

use encoding_rs::{Encoding, GB18030};

use super::chapters::is_chapter_heading;
use crate::error::Result;

const INDENT: &str = "\u{3000}\u{3000}";

/// Decodes raw chapter bytes into a `String`.
///
/// A byte-order mark selects UTF-8 or UTF-16. Without one, valid UTF-8 is
/// taken as is and anything else is tried as GB18030 (a superset of GBK and
/// GB2312) before falling back to lossy UTF-8.
pub fn decode_text(bytes: &[u8]) -> String {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        return text.into_owned();
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }
    let (text, had_errors) = GB18030.decode_without_bom_handling(bytes);
    if !had_errors {
        return text.into_owned();
    }
    log::debug!("[decode] input is neither UTF-8 nor GB18030, replacing invalid bytes");
    String::from_utf8_lossy(bytes).into_owned()
}

/// Splits on LF, CRLF or lone CR.
pub fn split_lines(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    normalized.split('\n').map(str::to_string).collect()
}

fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{3000}'..='\u{303F}'
        | '\u{FF00}'..='\u{FFEF}')
}

/// True when most non-whitespace characters are CJK.
pub fn is_mostly_cjk(text: &str) -> bool {
    let mut cjk = 0usize;
    let mut total = 0usize;
    for ch in text.chars().filter(|ch| !ch.is_whitespace()) {
        total += 1;
        if is_cjk(ch) {
            cjk += 1;
        }
    }
    total > 0 && cjk * 2 > total
}

fn trim_padding(line: &str) -> &str {
    line.trim_matches(|ch: char| matches!(ch, ' ' | '\t' | '\r' | '\n' | '\u{3000}' | '\u{00A0}'))
}

/// Re-indents CJK prose: blank lines are dropped and body paragraphs get two
/// ideographic spaces. Headings, `《` title lines, `声明` notices and `-`
/// separators stay flush.
pub fn normalize_cjk_lines(lines: Vec<String>) -> Vec<String> {
    lines
        .iter()
        .map(|line| trim_padding(line))
        .filter(|line| !line.is_empty())
        .map(|line| {
            let flush = is_chapter_heading(line)
                || line.starts_with('《')
                || line.starts_with("声明")
                || line.starts_with('-');
            if flush {
                line.to_string()
            } else {
                format!("{INDENT}{line}")
            }
        })
        .collect()
}

pub fn text_to_lines(text: &str) -> Vec<String> {
    let lines = split_lines(text);
    if is_mostly_cjk(text) {
        normalize_cjk_lines(lines)
    } else {
        lines
    }
}

pub fn read_text_lines(path: &Path) -> Result<Vec<String>> {
    let bytes = fs::read(path)?;
    Ok(text_to_lines(&decode_text(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_utf8_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice("Chapter 1".as_bytes());
        assert_eq!(decode_text(&bytes), "Chapter 1");
    }

    #[test]
    fn decodes_utf16_with_bom() {
        let mut le = vec![0xFF, 0xFE];
        let mut be = vec![0xFE, 0xFF];
        for unit in "第1章".encode_utf16() {
            le.extend_from_slice(&unit.to_le_bytes());
            be.extend_from_slice(&unit.to_be_bytes());
        }
        assert_eq!(decode_text(&le), "第1章");
        assert_eq!(decode_text(&be), "第1章");
    }

    #[test]
    fn decodes_gbk_files() {
        // "第1章 起\n他走了。" in GBK.
        let bytes: &[u8] = &[
            0xB5, 0xDA, b'1', 0xD5, 0xC2, b' ', 0xC6, 0xF0, b'\n', 0xCB, 0xFB, 0xD7, 0xDF, 0xC1, 0xCB,
            0xA1, 0xA3,
        ];
        assert!(std::str::from_utf8(bytes).is_err());
        assert_eq!(decode_text(bytes), "第1章 起\n他走了。");

        let (encoded, _, _) = GB18030.encode("第2章 承\n她来了。");
        assert_eq!(decode_text(&encoded), "第2章 承\n她来了。");
    }

    #[test]
    fn gbk_file_yields_chapters() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("长夜.txt");
        let (encoded, _, _) = GB18030.encode("第1章 起\n他走了。\n第2章 承\n她来了。");
        fs::write(&path, &encoded).expect("write");

        let lines = read_text_lines(&path).expect("read");
        let chapters = crate::text::chapters::detect_chapters(&lines);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[1].title, "第2章 承");
    }

    #[test]
    fn garbage_bytes_fall_back_to_lossy_utf8() {
        let decoded = decode_text(&[b'a', 0xFF, b'b']);
        assert!(decoded.starts_with('a'));
        assert!(decoded.ends_with('b'));
    }

    #[test]
    fn split_lines_normalizes_endings() {
        assert_eq!(split_lines("a\r\nb\rc\nd"), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn cjk_lines_are_reindented() {
        let text = "《长夜》\n\n第1章 开始\n  他走了。\n-----\n\u{3000}她来了。 ";
        let lines = text_to_lines(text);
        assert_eq!(
            lines,
            vec![
                "《长夜》".to_string(),
                "第1章 开始".to_string(),
                format!("{INDENT}他走了。"),
                "-----".to_string(),
                format!("{INDENT}她来了。"),
            ]
        );
    }

    #[test]
    fn latin_text_is_left_untouched() {
        let lines = text_to_lines("Chapter 1\n\n  indented\n");
        assert_eq!(lines, vec!["Chapter 1", "", "  indented", ""]);
    }
}
