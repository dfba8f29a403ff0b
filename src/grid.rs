//! Grid serialization and the free-text grid extraction algorithm.
//!
//! `parse_grid_from_text` and `extract_all_grids_from_text` share one
//! line-classifier and block-builder; the former keeps only the last block,
//! the latter keeps every block in document order (needed by the duo-pick
//! judge, which must recover every grid the judge model emitted).

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::task::Grid;

const MAX_GAP: usize = 2;
const WIDTH_TOLERANCE: usize = 5;

static LEADING_NUMBERING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[.)]\s+").unwrap());
static ROW_LABEL_LEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^row\s+\d+:?\s*").unwrap());
static ROW_LABEL_TRAILING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*row\s+\d+:?\s*$").unwrap());
static ROW_LABEL_ALONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^row\s+\d+:?$").unwrap());
static DIGIT_LIST: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+(\s*,\s*\d+)*$").unwrap());

/// `grid_to_csv(grid) -> string`. Row-major, comma-separated, newline
/// between rows.
pub fn grid_to_csv(grid: &Grid) -> String {
    grid.iter()
        .map(|row| {
            row.iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

enum Line {
    HardSeparator,
    Row(Vec<u8>),
    Other,
}

fn strip_decorations(line: &str) -> String {
    let mut s = line.trim().to_string();
    s = s.replace('`', "");
    s = LEADING_NUMBERING.replace(&s, "").to_string();
    s = ROW_LABEL_LEADING.replace(&s, "").to_string();
    s = ROW_LABEL_TRAILING.replace(&s, "").to_string();
    s = s.replace(['[', ']'], "");
    s.trim().to_string()
}

fn classify(raw_line: &str) -> Line {
    let trimmed = raw_line.trim();
    if trimmed.starts_with("```") {
        return Line::HardSeparator;
    }
    if trimmed.is_empty() {
        return Line::Other;
    }
    if trimmed.starts_with('-') || trimmed.starts_with('*') || trimmed.starts_with('\u{2022}') {
        return Line::Other;
    }
    if ROW_LABEL_ALONE.is_match(trimmed) {
        return Line::Other;
    }

    let stripped = strip_decorations(trimmed);
    if stripped.is_empty() {
        return Line::Other;
    }
    if !DIGIT_LIST.is_match(&stripped) {
        // Alphabetic (or otherwise malformed) trailing noise rejects the line.
        return Line::Other;
    }

    let mut row = Vec::new();
    for part in stripped.split(',') {
        match part.trim().parse::<u8>() {
            Ok(v) => row.push(v),
            Err(_) => return Line::Other,
        }
    }
    if row.is_empty() {
        Line::Other
    } else {
        Line::Row(row)
    }
}

struct BlockBuilder {
    blocks: Vec<Vec<Vec<u8>>>,
    current: Vec<Vec<u8>>,
    gap: usize,
}

impl BlockBuilder {
    fn new() -> Self {
        BlockBuilder {
            blocks: Vec::new(),
            current: Vec::new(),
            gap: 0,
        }
    }

    fn close_current(&mut self) {
        if !self.current.is_empty() {
            self.blocks.push(std::mem::take(&mut self.current));
        }
        self.gap = 0;
    }

    fn push_row(&mut self, row: Vec<u8>) {
        let fits = match self.current.first() {
            Some(first) => {
                let diff = (first.len() as isize - row.len() as isize).unsigned_abs();
                diff <= WIDTH_TOLERANCE
            }
            None => true,
        };
        if !fits {
            self.close_current();
        }
        self.current.push(row);
        self.gap = 0;
    }

    fn push_gap(&mut self) {
        if self.current.is_empty() {
            return;
        }
        self.gap += 1;
        if self.gap > MAX_GAP {
            self.close_current();
        }
    }

    fn hard_break(&mut self) {
        self.close_current();
    }

    fn finish(mut self) -> Vec<Vec<Vec<u8>>> {
        self.close_current();
        self.blocks
    }
}

fn build_blocks(text: &str) -> Vec<Grid> {
    let mut builder = BlockBuilder::new();
    for raw_line in text.lines() {
        match classify(raw_line) {
            Line::HardSeparator => builder.hard_break(),
            Line::Row(row) => builder.push_row(row),
            Line::Other => builder.push_gap(),
        }
    }
    builder.finish()
}

/// Extracts the **last** plausible grid block from free text.
pub fn parse_grid_from_text(text: &str) -> Result<Grid> {
    let blocks = build_blocks(text);
    blocks.into_iter().last().ok_or(Error::ParseError)
}

/// Extracts **every** plausible grid block from free text, in document
/// order. Used by the duo-pick judge (§4.10 Branch A), which must recover
/// every grid the judge emitted, not just the final one.
pub fn extract_all_grids_from_text(text: &str) -> Vec<Grid> {
    build_blocks(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_csv_then_parse() {
        let grid: Grid = vec![vec![1, 2, 3], vec![4, 5, 6]];
        let csv = grid_to_csv(&grid);
        let parsed = parse_grid_from_text(&csv).unwrap();
        assert_eq!(parsed, grid);
    }

    #[test]
    fn no_numeric_content_fails() {
        let err = parse_grid_from_text("I think the answer involves symmetry.").unwrap_err();
        assert!(matches!(err, Error::ParseError));
    }

    #[test]
    fn returns_last_block_not_first() {
        let text = "First attempt:\n1,2\n3,4\n\nActually, final answer:\n9,9\n8,8\n";
        let grid = parse_grid_from_text(text).unwrap();
        assert_eq!(grid, vec![vec![9, 9], vec![8, 8]]);
    }

    #[test]
    fn hard_separator_breaks_block() {
        let text = "1,2\n3,4\n```\n5,6\n7,8\n";
        let grid = parse_grid_from_text(text).unwrap();
        assert_eq!(grid, vec![vec![5, 6], vec![7, 8]]);
    }

    #[test]
    fn tolerates_small_gaps() {
        let text = "1,2\n\n\n3,4\n";
        let grid = parse_grid_from_text(text).unwrap();
        assert_eq!(grid, vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn gap_too_large_splits_blocks() {
        let text = "1,2\n\n\n\n3,4\n";
        let grid = parse_grid_from_text(text).unwrap();
        // The first block (1,2) is closed after 3 blank lines (> MAX_GAP);
        // the second block (3,4) becomes the last block.
        assert_eq!(grid, vec![vec![3, 4]]);
    }

    #[test]
    fn strips_row_labels_brackets_and_numbering() {
        let text = "1) Row 1: [1,2,3]\n2) Row 2: [4,5,6]\n";
        let grid = parse_grid_from_text(text).unwrap();
        assert_eq!(grid, vec![vec![1, 2, 3], vec![4, 5, 6]]);
    }

    #[test]
    fn trailing_alpha_noise_rejects_line() {
        let text = "1,2,3\n4,5,6 ignore this\n";
        let grid = parse_grid_from_text(text).unwrap();
        assert_eq!(grid, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn extract_all_returns_every_block() {
        let text = "1,2\n3,4\n\nunrelated line\n\n5,6\n7,8\n";
        let blocks = extract_all_grids_from_text(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], vec![vec![1, 2], vec![3, 4]]);
        assert_eq!(blocks[1], vec![vec![5, 6], vec![7, 8]]);
    }

    proptest::proptest! {
        #[test]
        fn round_trip_prop(rows in proptest::collection::vec(
            proptest::collection::vec(0u8..=9, 1..6), 1..6
        ).prop_filter("rectangular", |rows: &Vec<Vec<u8>>| {
            let w = rows[0].len();
            rows.iter().all(|r| r.len() == w)
        })) {
            let csv = grid_to_csv(&rows);
            let parsed = parse_grid_from_text(&csv).unwrap();
            proptest::prop_assert_eq!(parsed, rows);
        }
    }
}
