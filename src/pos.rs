use serde::{Serialize, Serializer};
use std::sync::Arc;

/// A point in a source buffer: byte offset plus the 1-based line and column
/// (columns count Unicode scalar values, not bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pos {
    pub byte: usize,
    pub line: usize,
    pub column: usize,
}

impl Pos {
    /// The position of the first byte of a buffer.
    pub fn start() -> Pos {
        Pos {
            byte: 0,
            line: 1,
            column: 1,
        }
    }

    /// Advances the position over `c`.
    pub fn advance(&mut self, c: char) {
        self.byte += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
    }
}

/// A half-open span `[start, end)` over a named source buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Range {
    #[serde(serialize_with = "serialize_filename")]
    pub filename: Arc<str>,
    pub start: Pos,
    pub end: Pos,
}

fn serialize_filename<S: Serializer>(name: &Arc<str>, ser: S) -> Result<S::Ok, S::Error> {
    ser.serialize_str(name)
}

impl Range {
    pub fn new(filename: Arc<str>, start: Pos, end: Pos) -> Range {
        Range {
            filename,
            start,
            end,
        }
    }

    /// A zero-width range at `pos`.
    pub fn at(filename: Arc<str>, pos: Pos) -> Range {
        Range {
            filename,
            start: pos,
            end: pos,
        }
    }

    pub fn len(&self) -> usize {
        self.end.byte.saturating_sub(self.start.byte)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `pos` falls inside the range. A zero-width range contains
    /// nothing.
    pub fn contains_pos(&self, pos: &Pos) -> bool {
        pos.byte >= self.start.byte && pos.byte < self.end.byte
    }

    /// Whether `other` is fully inside `self`. Requires the same filename.
    pub fn contains(&self, other: &Range) -> bool {
        self.filename == other.filename
            && other.start.byte >= self.start.byte
            && other.end.byte <= self.end.byte
    }

    /// The smallest range covering both `self` and `other`.
    pub fn union(&self, other: &Range) -> Range {
        let start = if self.start.byte <= other.start.byte {
            self.start
        } else {
            other.start
        };
        let end = if self.end.byte >= other.end.byte {
            self.end
        } else {
            other.end
        };
        Range {
            filename: self.filename.clone(),
            start,
            end,
        }
    }

    /// The slice of `src` this range covers. Out-of-bounds ranges are clamped.
    pub fn slice<'a>(&self, src: &'a str) -> &'a str {
        let start = self.start.byte.min(src.len());
        let end = self.end.byte.clamp(start, src.len());
        &src[start..end]
    }

    /// The range as a miette span, for report labels.
    pub fn span(&self) -> miette::SourceSpan {
        (self.start.byte, self.len()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: usize, end: usize) -> Range {
        let f: Arc<str> = Arc::from("test.bcl");
        Range::new(
            f,
            Pos {
                byte: start,
                line: 1,
                column: start + 1,
            },
            Pos {
                byte: end,
                line: 1,
                column: end + 1,
            },
        )
    }

    #[test]
    fn test_advance_tracks_lines_and_columns() {
        let mut p = Pos::start();
        for c in "ab\nc".chars() {
            p.advance(c);
        }
        assert_eq!(p.byte, 4);
        assert_eq!(p.line, 2);
        assert_eq!(p.column, 2);
    }

    #[test]
    fn test_advance_counts_chars_not_bytes() {
        let mut p = Pos::start();
        for c in "é".chars() {
            p.advance(c);
        }
        assert_eq!(p.byte, 2);
        assert_eq!(p.column, 2);
    }

    #[test]
    fn test_containment_and_union() {
        let outer = range(0, 10);
        let inner = range(2, 5);
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert_eq!(inner.union(&range(7, 9)), range(2, 9));
    }

    #[test]
    fn test_slice() {
        let src = "foo = 1";
        assert_eq!(range(0, 3).slice(src), "foo");
        assert_eq!(range(6, 7).slice(src), "1");
    }
}
