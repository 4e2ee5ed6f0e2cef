//! Deterministic whitespace normalization over the token stream.
//!
//! The formatter rescans the source, discards whitespace trivia, and
//! re-renders tokens line by line: two-space indentation per nesting
//! level, `=` of consecutive attribute lines aligned, runs of blank
//! lines collapsed to one, trailing whitespace stripped. Comments and
//! heredoc bodies pass through verbatim. Formatting the output again
//! reproduces it unchanged.

use crate::diag::Diagnostics;
use crate::scanner;
use crate::token::{Token, TokenKind, TriviaKind};

/// Normalizes the whitespace of a configuration source. Scanner
/// diagnostics are passed through; the token sequence itself is
/// preserved, so the result parses exactly when the input does.
pub fn format(src: &str, filename: &str) -> (String, Diagnostics) {
    let (tokens, diags) = scanner::scan(src, filename, crate::pos::Pos::start());
    (render(&tokens), diags)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Atom {
    Tok(TokenKind, String),
    Comment(String),
}

impl Atom {
    fn text(&self) -> &str {
        match self {
            Atom::Tok(_, t) | Atom::Comment(t) => t,
        }
    }

    fn kind(&self) -> Option<TokenKind> {
        match self {
            Atom::Tok(k, _) => Some(*k),
            Atom::Comment(_) => None,
        }
    }
}

struct Line {
    atoms: Vec<Atom>,
    indent: usize,
}

impl Line {
    fn is_blank(&self) -> bool {
        self.atoms.is_empty()
    }

    /// An attribute line begins `name =`; those are the lines whose `=`
    /// gets aligned within a run.
    fn attr_name_width(&self) -> Option<usize> {
        match (self.atoms.first(), self.atoms.get(1)) {
            (Some(Atom::Tok(TokenKind::Ident, name)), Some(Atom::Tok(TokenKind::Equal, _))) => {
                Some(name.chars().count())
            }
            _ => None,
        }
    }
}

fn render(tokens: &[Token]) -> String {
    let lines = split_lines(tokens);
    let lines = collapse_blanks(lines);
    let widths = alignment_widths(&lines);

    let mut out = String::new();
    for (line, width) in lines.iter().zip(widths) {
        if line.is_blank() {
            out.push('\n');
            continue;
        }
        for _ in 0..line.indent {
            out.push_str("  ");
        }
        render_line(line, width, &mut out);
        out.push('\n');
    }
    out
}

/// Splits the token stream into logical lines and assigns each its
/// indentation depth. Only `Newline` tokens break lines; newlines inside
/// heredoc bodies stay embedded in their token text.
fn split_lines(tokens: &[Token]) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut atoms: Vec<Atom> = Vec::new();
    let mut depth: usize = 0;

    let mut finish = |atoms: &mut Vec<Atom>, depth: &mut usize| {
        let taken = std::mem::take(atoms);
        let leading_closers = taken
            .iter()
            .take_while(|a| a.kind().is_some_and(is_closer))
            .count();
        let indent = depth.saturating_sub(leading_closers.min(*depth));
        for atom in &taken {
            match atom.kind() {
                Some(k) if is_opener(k) => *depth += 1,
                Some(k) if is_closer(k) => *depth = depth.saturating_sub(1),
                _ => {}
            }
        }
        lines.push(Line {
            atoms: taken,
            indent,
        });
    };

    for token in tokens {
        for trivia in &token.leading {
            match trivia.kind {
                TriviaKind::Whitespace => {}
                TriviaKind::LineComment | TriviaKind::BlockComment => {
                    atoms.push(Atom::Comment(trivia.text.clone()));
                }
            }
        }
        match token.kind {
            TokenKind::Newline => finish(&mut atoms, &mut depth),
            TokenKind::Eof => {
                if !atoms.is_empty() {
                    finish(&mut atoms, &mut depth);
                }
            }
            kind => atoms.push(Atom::Tok(kind, token.text.clone())),
        }
    }
    lines
}

/// Drops leading and trailing blank lines and collapses interior runs
/// of blanks to a single blank line.
fn collapse_blanks(lines: Vec<Line>) -> Vec<Line> {
    let mut out: Vec<Line> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.is_blank() {
            let keep = matches!(out.last(), Some(prev) if !prev.is_blank());
            if !keep {
                continue;
            }
        }
        out.push(line);
    }
    while matches!(out.last(), Some(l) if l.is_blank()) {
        out.pop();
    }
    out
}

/// For each attribute line, the padded name width shared by its run.
/// A run is a maximal sequence of consecutive attribute lines at the
/// same indentation.
fn alignment_widths(lines: &[Line]) -> Vec<Option<usize>> {
    let mut widths: Vec<Option<usize>> = vec![None; lines.len()];
    let mut i = 0;
    while i < lines.len() {
        let Some(first) = lines[i].attr_name_width() else {
            i += 1;
            continue;
        };
        let indent = lines[i].indent;
        let mut max = first;
        let mut j = i + 1;
        while j < lines.len() && lines[j].indent == indent {
            match lines[j].attr_name_width() {
                Some(w) => max = max.max(w),
                None => break,
            }
            j += 1;
        }
        for w in widths.iter_mut().take(j).skip(i) {
            *w = Some(max);
        }
        i = j;
    }
    widths
}

fn render_line(line: &Line, align: Option<usize>, out: &mut String) {
    for (i, atom) in line.atoms.iter().enumerate() {
        if i > 0 {
            let pad = if i == 1 { align } else { None };
            if let Some(width) = pad {
                // The aligned `=`: pad the name to the run's width.
                let name_len = line.atoms[0].text().chars().count();
                for _ in 0..(width - name_len + 1) {
                    out.push(' ');
                }
            } else if needs_space(&line.atoms[i - 1], atom, line.atoms.get(i.wrapping_sub(2))) {
                out.push(' ');
            }
        }
        out.push_str(atom.text());
    }
}

fn is_opener(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::LBrace
            | TokenKind::LBrack
            | TokenKind::LParen
            | TokenKind::TemplateInterp
            | TokenKind::TemplateControl
    )
}

fn is_closer(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::RBrace | TokenKind::RBrack | TokenKind::RParen | TokenKind::TemplateSeqEnd
    )
}

/// Whether one space separates `prev` from `next`. `before_prev` is the
/// atom before `prev`, used to tell unary minus from subtraction.
fn needs_space(prev: &Atom, next: &Atom, before_prev: Option<&Atom>) -> bool {
    use TokenKind::*;

    // Comments keep one space on each side.
    let (Some(pk), Some(nk)) = (prev.kind(), next.kind()) else {
        return true;
    };

    if matches!(pk, OQuote | OHeredoc | TemplateInterp | TemplateControl) {
        return false;
    }
    if matches!(nk, CQuote | CHeredoc | TemplateSeqEnd) {
        return false;
    }
    // Template parts glue to their neighbors.
    if pk == StringLit || nk == StringLit {
        return false;
    }
    if pk == TemplateSeqEnd && matches!(nk, TemplateInterp | TemplateControl) {
        return false;
    }
    if matches!(pk, LParen | LBrack) || matches!(nk, RParen | RBrack) {
        return false;
    }
    // Empty object stays `{}`.
    if pk == LBrace && nk == RBrace {
        return false;
    }
    if nk == Comma {
        return false;
    }
    if pk == Dot || nk == Dot {
        return false;
    }
    if nk == Ellipsis {
        return false;
    }
    // Function call name glues to its argument list, and an index
    // bracket glues to the operand it indexes. Expression keywords such
    // as `in` and `if` keep their space.
    if pk == Ident && matches!(nk, LParen | LBrack) && !is_keyword(prev.text()) {
        return false;
    }
    if matches!(pk, RParen | RBrack | CQuote | CHeredoc | TemplateSeqEnd) && nk == LBrack {
        return false;
    }
    if pk == Bang {
        return false;
    }
    if pk == Minus && minus_is_unary(before_prev) {
        return false;
    }
    true
}

fn is_keyword(text: &str) -> bool {
    matches!(text, "for" | "in" | "if" | "else" | "endif" | "endfor")
}

fn minus_is_unary(before: Option<&Atom>) -> bool {
    match before.and_then(Atom::kind) {
        // After an operand the minus is subtraction.
        Some(
            TokenKind::Ident
            | TokenKind::Number
            | TokenKind::RParen
            | TokenKind::RBrack
            | TokenKind::RBrace
            | TokenKind::CQuote
            | TokenKind::CHeredoc,
        ) => false,
        Some(_) => true,
        // Line start, or a comment precedes it.
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(src: &str) -> String {
        let (out, diags) = format(src, "test.bcl");
        assert!(!diags.has_errors(), "scan failed: {diags}");
        out
    }

    #[test]
    fn test_indentation() {
        assert_eq!(
            fmt("outer {\ninner {\na=1\n}\n}\n"),
            "outer {\n  inner {\n    a = 1\n  }\n}\n"
        );
    }

    #[test]
    fn test_equals_alignment() {
        assert_eq!(
            fmt("a = 1\nlong_name = 2\nbb = 3\n"),
            "a         = 1\nlong_name = 2\nbb        = 3\n"
        );
    }

    #[test]
    fn test_alignment_runs_break_at_blank_lines() {
        assert_eq!(
            fmt("a = 1\nlong_name = 2\n\nc = 3\n"),
            "a         = 1\nlong_name = 2\n\nc = 3\n"
        );
        // The second run aligns independently.
        assert_eq!(fmt("a = 1\n\nlong = 2\nc = 3\n"), "a = 1\n\nlong = 2\nc    = 3\n");
    }

    #[test]
    fn test_blank_line_collapse() {
        assert_eq!(fmt("\n\na = 1\n\n\n\nb = 2\n\n\n"), "a = 1\n\nb = 2\n");
    }

    #[test]
    fn test_trailing_whitespace_stripped() {
        assert_eq!(fmt("a = 1   \nb = 2\t\n"), "a = 1\nb = 2\n");
    }

    #[test]
    fn test_operator_spacing() {
        assert_eq!(fmt("x = 1+2 * f( a,b )\n"), "x = 1 + 2 * f(a, b)\n");
        assert_eq!(fmt("x = [ 1 , 2 ]\n"), "x = [1, 2]\n");
        assert_eq!(fmt("x = {a=1,b=2}\n"), "x = { a = 1, b = 2 }\n");
        assert_eq!(fmt("x = {}\n"), "x = {}\n");
    }

    #[test]
    fn test_unary_minus() {
        assert_eq!(fmt("x = -3\n"), "x = -3\n");
        assert_eq!(fmt("x = a - 3\n"), "x = a - 3\n");
        assert_eq!(fmt("x = a * -3\n"), "x = a * -3\n");
        assert_eq!(fmt("x = !y\n"), "x = !y\n");
    }

    #[test]
    fn test_traversal_and_splat_spacing() {
        assert_eq!(fmt("x = a . b [0] . *\n"), "x = a.b[0].*\n");
        assert_eq!(fmt("x = items[*].id\n"), "x = items[*].id\n");
        assert_eq!(fmt("x = f(xs ...)\n"), "x = f(xs...)\n");
    }

    #[test]
    fn test_keywords_keep_space() {
        assert_eq!(
            fmt("x = [for v in [1, 2] : v if v > 1]\n"),
            "x = [for v in [1, 2] : v if v > 1]\n"
        );
    }

    #[test]
    fn test_template_spacing() {
        assert_eq!(fmt("x = \"a ${ y + 1 } b\"\n"), "x = \"a ${y + 1} b\"\n");
        assert_eq!(fmt("x = \"${a}${b}\"\n"), "x = \"${a}${b}\"\n");
    }

    #[test]
    fn test_heredoc_body_untouched() {
        let src = "x = <<EOT\n  raw   body\nEOT\ny = 1\n";
        assert_eq!(fmt(src), src);
    }

    #[test]
    fn test_comments_preserved() {
        assert_eq!(
            fmt("# header\na = 1    // trailing\n/* block */ b = 2\n"),
            "# header\na = 1 // trailing\n/* block */ b = 2\n"
        );
    }

    #[test]
    fn test_idempotent() {
        let sources = [
            "outer {\ninner {\na=1\nbb = [1,\n2,\n]\n}\n}\n",
            "a = 1\nlong_name = \"${x} y\"\n\n\nblk \"l\" {\n}\n",
            "x = <<-EOT\n  text ${v}\n  EOT\n",
        ];
        for src in sources {
            let once = fmt(src);
            assert_eq!(fmt(&once), once, "not idempotent for {src:?}");
        }
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(fmt(""), "");
        assert_eq!(fmt("\n\n"), "");
    }
}
