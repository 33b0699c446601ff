use std::ops::Range;

use serde::{Deserialize, Serialize};
use unicode_width::UnicodeWidthStr;

/// Rendering surface in terminal cells. Paddings apply to both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: usize,
    pub height: usize,
    pub vertical_padding: usize,
    pub horizontal_padding: usize,
    pub line_spacing: usize,
}

impl Viewport {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    pub fn usable_width(&self) -> usize {
        self.width
            .saturating_sub(2 * self.horizontal_padding)
            .max(1)
    }

    pub fn usable_rows(&self) -> usize {
        self.height.saturating_sub(2 * self.vertical_padding)
    }

    /// Rows a line occupies once wrapped; blank lines still take one row.
    pub fn row_cost(&self, line: &str) -> usize {
        let width = UnicodeWidthStr::width(line);
        if width == 0 {
            return 1;
        }
        width.div_ceil(self.usable_width())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSlice<'a> {
    pub lines: &'a [String],
    /// First line of the page (absolute index into the source lines).
    pub start: usize,
    /// One past the last visible line.
    pub end: usize,
    pub remaining_rows: usize,
}

impl PageSlice<'_> {
    pub fn last_line(&self) -> Option<usize> {
        (self.end > self.start).then(|| self.end - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

fn clamp_range(lines: &[String], range: Range<usize>) -> Range<usize> {
    let end = range.end.min(lines.len());
    range.start.min(end)..end
}

/// Greedy fill of one page starting at `start`. Returns the exclusive end and
/// the rows left over. The first line is always taken so an oversized line
/// cannot stall pagination.
fn fill_page(lines: &[String], start: usize, end: usize, viewport: &Viewport) -> (usize, usize) {
    let spacing = viewport.line_spacing as isize;
    let mut available = viewport.usable_rows() as isize;
    let mut next = start;

    while next < end {
        let rows = viewport.row_cost(&lines[next]) as isize;
        if available - rows < 0 && next > start {
            break;
        }
        available -= rows;
        if next + 1 < end {
            available -= spacing;
        }
        next += 1;
    }

    (next, available.max(0) as usize)
}

/// Renders page `page` of `range` by replaying the greedy fill from the range
/// start. Pages past the end come back empty.
pub fn paginate<'a>(
    lines: &'a [String],
    range: Range<usize>,
    viewport: &Viewport,
    page: usize,
) -> PageSlice<'a> {
    let range = clamp_range(lines, range);
    let mut start = range.start;
    for _ in 0..page {
        if start >= range.end {
            break;
        }
        start = fill_page(lines, start, range.end, viewport).0;
    }

    if start >= range.end {
        return PageSlice {
            lines: &lines[range.end..range.end],
            start: range.end,
            end: range.end,
            remaining_rows: viewport.usable_rows(),
        };
    }

    let (end, remaining_rows) = fill_page(lines, start, range.end, viewport);
    PageSlice {
        lines: &lines[start..end],
        start,
        end,
        remaining_rows,
    }
}

/// Start line of every page in `range`. An empty range still has one page.
pub fn page_starts(lines: &[String], range: Range<usize>, viewport: &Viewport) -> Vec<usize> {
    let range = clamp_range(lines, range);
    let mut starts = vec![range.start];
    let mut start = range.start;
    while start < range.end {
        start = fill_page(lines, start, range.end, viewport).0;
        if start < range.end {
            starts.push(start);
        }
    }
    starts
}

pub fn page_count(lines: &[String], range: Range<usize>, viewport: &Viewport) -> usize {
    page_starts(lines, range, viewport).len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|line| line.to_string()).collect()
    }

    fn collect_pages(lines: &[String], range: Range<usize>, viewport: &Viewport) -> Vec<Vec<String>> {
        let total = page_count(lines, range.clone(), viewport);
        (0..total)
            .map(|page| paginate(lines, range.clone(), viewport, page).lines.to_vec())
            .collect()
    }

    #[test]
    fn two_row_pages_split_chapters() {
        let lines = to_lines(&["Chapter 1", "a", "b", "Chapter 2", "c"]);
        let viewport = Viewport::new(40, 2);
        assert_eq!(
            collect_pages(&lines, 0..3, &viewport),
            vec![to_lines(&["Chapter 1", "a"]), to_lines(&["b"])]
        );
        assert_eq!(
            collect_pages(&lines, 3..5, &viewport),
            vec![to_lines(&["Chapter 2", "c"])]
        );
    }

    #[test]
    fn wrapped_lines_cost_multiple_rows() {
        let viewport = Viewport::new(10, 10);
        assert_eq!(viewport.row_cost(""), 1);
        assert_eq!(viewport.row_cost("0123456789"), 1);
        assert_eq!(viewport.row_cost("0123456789a"), 2);
        // Wide CJK glyphs take two cells each.
        assert_eq!(viewport.row_cost("一二三四五六"), 2);
    }

    #[test]
    fn paddings_shrink_the_usable_area() {
        let viewport = Viewport {
            width: 14,
            height: 6,
            vertical_padding: 1,
            horizontal_padding: 2,
            line_spacing: 0,
        };
        assert_eq!(viewport.usable_width(), 10);
        assert_eq!(viewport.usable_rows(), 4);
    }

    #[test]
    fn line_spacing_is_charged_between_lines() {
        let lines = to_lines(&["a", "b", "c", "d"]);
        let viewport = Viewport {
            line_spacing: 1,
            ..Viewport::new(10, 3)
        };
        // a + gap + b = 3 rows, then c + gap + d.
        assert_eq!(
            collect_pages(&lines, 0..4, &viewport),
            vec![to_lines(&["a", "b"]), to_lines(&["c", "d"])]
        );
    }

    #[test]
    fn oversized_line_takes_its_own_page() {
        let long = "x".repeat(100);
        let lines = vec!["short".to_string(), long.clone(), "tail".to_string()];
        let viewport = Viewport::new(10, 3);
        let pages = collect_pages(&lines, 0..3, &viewport);
        assert_eq!(pages, vec![vec!["short".to_string()], vec![long], vec!["tail".to_string()]]);
    }

    #[test]
    fn zero_height_viewport_still_progresses() {
        let lines = to_lines(&["a", "b", "c"]);
        let viewport = Viewport::new(10, 0);
        assert_eq!(page_count(&lines, 0..3, &viewport), 3);
    }

    #[test]
    fn empty_range_has_one_empty_page() {
        let lines = to_lines(&["a"]);
        let viewport = Viewport::new(10, 5);
        assert_eq!(page_count(&lines, 1..1, &viewport), 1);
        let page = paginate(&lines, 1..1, &viewport, 0);
        assert!(page.is_empty());
        assert_eq!(page.last_line(), None);
    }

    #[test]
    fn page_past_the_end_is_empty() {
        let lines = to_lines(&["a", "b"]);
        let viewport = Viewport::new(10, 5);
        let page = paginate(&lines, 0..2, &viewport, 4);
        assert!(page.is_empty());
        assert_eq!(page.start, 2);
    }

    #[test]
    fn pages_reconstruct_the_range_for_many_viewports() {
        let lines: Vec<String> = (0..57)
            .map(|i| match i % 5 {
                0 => String::new(),
                1 => "x".repeat(i * 3),
                2 => "第十章 长标题".repeat(i % 4 + 1),
                _ => format!("line {i}"),
            })
            .collect();
        for width in [1, 7, 20, 80] {
            for height in [0, 1, 3, 10, 24] {
                for spacing in [0, 1, 2] {
                    let viewport = Viewport {
                        line_spacing: spacing,
                        ..Viewport::new(width, height)
                    };
                    let rebuilt: Vec<String> = collect_pages(&lines, 4..53, &viewport)
                        .into_iter()
                        .flatten()
                        .collect();
                    assert_eq!(rebuilt, lines[4..53].to_vec(), "w={width} h={height} s={spacing}");
                }
            }
        }
    }

    #[test]
    fn pagination_is_deterministic() {
        let lines = to_lines(&["alpha", "beta", "gamma", "delta", "epsilon"]);
        let viewport = Viewport::new(4, 3);
        let first = paginate(&lines, 0..5, &viewport, 1);
        let second = paginate(&lines, 0..5, &viewport, 1);
        assert_eq!(first, second);
    }

    #[test]
    fn remaining_rows_report_leftover_space() {
        let lines = to_lines(&["a"]);
        let viewport = Viewport::new(10, 5);
        let page = paginate(&lines, 0..1, &viewport, 0);
        assert_eq!(page.remaining_rows, 4);
        assert_eq!(page.last_line(), Some(0));
    }
}
