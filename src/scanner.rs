use crate::diag::{Diagnostic, Diagnostics};
use crate::pos::{Pos, Range};
use crate::token::{Token, TokenKind, Trivia, TriviaKind};
use log::trace;
use std::sync::Arc;

/// Scanner context stack. Code mode is the absence of any frame or a
/// `TemplateCode` frame; `Quote` and `Heredoc` are template mode.
#[derive(Debug)]
enum Ctx {
    Quote,
    Heredoc { tag: String },
    /// A standalone template source with no delimiters: the whole input
    /// is template text, terminated by EOF.
    Bare,
    TemplateCode { depth: u32 },
}

/// A two-mode state machine over UTF-8 source bytes. Produces the full
/// token stream (terminated by an EOF token) plus any lexical
/// diagnostics; unrecognizable bytes become `Illegal` tokens so the
/// parser can keep going.
///
/// Every byte of the input lands in exactly one token text or one piece
/// of trivia, which is what the rewrite tree's byte-exact round-trip
/// rests on.
pub struct Scanner<'a> {
    src: &'a str,
    filename: Arc<str>,
    pos: Pos,
    /// Absolute byte offset scanning started at; `pos.byte - pos_base`
    /// indexes into `src`.
    pos_base: usize,
    stack: Vec<Ctx>,
    pending: Vec<Trivia>,
    tokens: Vec<Token>,
    diags: Diagnostics,
}

/// Scans `src` into tokens, with ranges named after `filename` and
/// starting at `start` (callers embedding snippets pass a non-zero
/// start).
pub fn scan(src: &str, filename: &str, start: Pos) -> (Vec<Token>, Diagnostics) {
    trace!("scanning {} ({} bytes)", filename, src.len());
    let mut scanner = Scanner {
        src,
        filename: Arc::from(filename),
        pos: start,
        pos_base: start.byte,
        stack: Vec::new(),
        pending: Vec::new(),
        tokens: Vec::new(),
        diags: Diagnostics::new(),
    };
    scanner.run();
    (scanner.tokens, scanner.diags)
}

/// Scans `src` as bare template text, for sources that are a template
/// in their entirety rather than a quoted string inside code.
pub fn scan_template(src: &str, filename: &str, start: Pos) -> (Vec<Token>, Diagnostics) {
    trace!("scanning template {} ({} bytes)", filename, src.len());
    let mut scanner = Scanner {
        src,
        filename: Arc::from(filename),
        pos: start,
        pos_base: start.byte,
        stack: vec![Ctx::Bare],
        pending: Vec::new(),
        tokens: Vec::new(),
        diags: Diagnostics::new(),
    };
    scanner.run();
    (scanner.tokens, scanner.diags)
}

impl<'a> Scanner<'a> {
    fn run(&mut self) {
        loop {
            match self.stack.last() {
                None | Some(Ctx::TemplateCode { .. }) => {
                    if !self.scan_code() {
                        return;
                    }
                }
                Some(Ctx::Quote) => self.scan_quote(),
                Some(Ctx::Heredoc { .. }) => self.scan_heredoc(),
                Some(Ctx::Bare) => self.scan_bare(),
            }
        }
    }

    // === Low-level cursor ===

    fn rest(&self) -> &'a str {
        &self.src[self.offset()..]
    }

    /// Byte offset relative to the start of `src`. `self.pos` carries the
    /// absolute byte offset, which differs when scanning started mid-file.
    fn offset(&self) -> usize {
        self.pos.byte - self.pos_base
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn starts_with(&self, s: &str) -> bool {
        self.rest().starts_with(s)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos.advance(c);
        Some(c)
    }

    fn bump_n(&mut self, n: usize) {
        for _ in 0..n {
            self.bump();
        }
    }

    fn range_from(&self, start: Pos) -> Range {
        Range::new(self.filename.clone(), start, self.pos)
    }

    fn slice_from(&self, start: Pos) -> &'a str {
        &self.src[start.byte - self.pos_base..self.offset()]
    }

    fn emit(&mut self, kind: TokenKind, start: Pos) {
        let text = self.slice_from(start).to_string();
        self.tokens.push(Token {
            kind,
            text,
            range: self.range_from(start),
            leading: std::mem::take(&mut self.pending),
        });
    }

    fn error(&mut self, summary: &str, detail: &str, start: Pos) {
        self.diags
            .push(Diagnostic::error(summary, detail, self.range_from(start)));
    }

    // === Code mode ===

    /// Scans one token in code mode. Returns false once EOF is emitted.
    fn scan_code(&mut self) -> bool {
        self.collect_trivia();
        let start = self.pos;
        let c = match self.peek() {
            Some(c) => c,
            None => {
                if !self.stack.is_empty() {
                    self.error(
                        "Unterminated template",
                        "The file ended before this template's interpolation or string was closed.",
                        start,
                    );
                    self.stack.clear();
                }
                self.emit(TokenKind::Eof, start);
                return false;
            }
        };

        match c {
            '\n' => {
                self.bump();
                self.emit(TokenKind::Newline, start);
            }
            '"' => {
                self.bump();
                self.emit(TokenKind::OQuote, start);
                self.stack.push(Ctx::Quote);
            }
            c if c.is_ascii_alphabetic() || c == '_' => self.scan_ident(start),
            c if c.is_ascii_digit() => self.scan_number(start),
            '<' if self.peek_at(1) == Some('<') => self.scan_heredoc_intro(start),
            '{' => {
                self.bump();
                if let Some(Ctx::TemplateCode { depth }) = self.stack.last_mut() {
                    *depth += 1;
                }
                self.emit(TokenKind::LBrace, start);
            }
            '}' => {
                self.bump();
                match self.stack.last_mut() {
                    Some(Ctx::TemplateCode { depth }) if *depth == 0 => {
                        self.emit(TokenKind::TemplateSeqEnd, start);
                        self.stack.pop();
                    }
                    Some(Ctx::TemplateCode { depth }) => {
                        *depth -= 1;
                        self.emit(TokenKind::RBrace, start);
                    }
                    _ => self.emit(TokenKind::RBrace, start),
                }
            }
            _ => self.scan_operator(start, c),
        }
        true
    }

    fn scan_operator(&mut self, start: Pos, c: char) {
        const TWO_CHAR: [(&str, TokenKind); 7] = [
            ("==", TokenKind::EqualTo),
            ("!=", TokenKind::NotEqual),
            ("<=", TokenKind::LessThanEq),
            (">=", TokenKind::GreaterThanEq),
            ("&&", TokenKind::And),
            ("||", TokenKind::Or),
            ("=>", TokenKind::FatArrow),
        ];
        for (text, kind) in TWO_CHAR {
            if self.starts_with(text) {
                self.bump_n(2);
                self.emit(kind, start);
                return;
            }
        }
        if self.starts_with("...") {
            self.bump_n(3);
            self.emit(TokenKind::Ellipsis, start);
            return;
        }
        let kind = match c {
            '=' => Some(TokenKind::Equal),
            '<' => Some(TokenKind::LessThan),
            '>' => Some(TokenKind::GreaterThan),
            '+' => Some(TokenKind::Plus),
            '-' => Some(TokenKind::Minus),
            '*' => Some(TokenKind::Star),
            '/' => Some(TokenKind::Slash),
            '%' => Some(TokenKind::Percent),
            '!' => Some(TokenKind::Bang),
            '?' => Some(TokenKind::Question),
            ':' => Some(TokenKind::Colon),
            ',' => Some(TokenKind::Comma),
            '.' => Some(TokenKind::Dot),
            '[' => Some(TokenKind::LBrack),
            ']' => Some(TokenKind::RBrack),
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            _ => None,
        };
        match kind {
            Some(kind) => {
                self.bump();
                self.emit(kind, start);
            }
            None => {
                self.bump();
                if c.is_alphabetic() {
                    self.error(
                        "Invalid character in identifier",
                        "Identifiers may only contain ASCII letters, digits, underscores, and dashes.",
                        start,
                    );
                } else {
                    self.error(
                        "Invalid character",
                        "This character is not valid in BCL syntax.",
                        start,
                    );
                }
                self.emit(TokenKind::Illegal, start);
            }
        }
    }

    /// Identifiers allow internal dashes but may not end with one; a
    /// trailing dash is left behind as a minus token.
    fn scan_ident(&mut self, start: Pos) {
        let rest = self.rest();
        let mut len = 0;
        let mut keep = 0;
        for c in rest.chars() {
            if c.is_ascii_alphanumeric() || c == '_' {
                len += 1;
                keep = len;
            } else if c == '-' && len > 0 {
                len += 1;
            } else {
                break;
            }
        }
        self.bump_n(keep);
        self.emit(TokenKind::Ident, start);
    }

    fn scan_number(&mut self, start: Pos) {
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
        if self.peek() == Some('.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let after_sign = match self.peek_at(1) {
                Some('+' | '-') => self.peek_at(2),
                other => other,
            };
            if matches!(after_sign, Some(c) if c.is_ascii_digit()) {
                self.bump();
                if matches!(self.peek(), Some('+' | '-')) {
                    self.bump();
                }
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.bump();
                }
            }
        }
        self.emit(TokenKind::Number, start);
    }

    /// `<<ID` or `<<-ID`, through the introducing newline.
    fn scan_heredoc_intro(&mut self, start: Pos) {
        self.bump_n(2);
        if self.peek() == Some('-') {
            self.bump();
        }
        let tag_start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            self.bump();
        }
        let tag = self.slice_from(tag_start).to_string();
        if tag.is_empty() {
            self.error(
                "Invalid heredoc introducer",
                "A heredoc introducer must be followed by an identifier naming the terminator.",
                start,
            );
            self.emit(TokenKind::Illegal, start);
            return;
        }
        if self.peek() == Some('\r') {
            self.bump();
        }
        if self.peek() == Some('\n') {
            self.bump();
        } else {
            self.error(
                "Invalid heredoc introducer",
                "The heredoc tag must be immediately followed by a newline.",
                start,
            );
            self.emit(TokenKind::Illegal, start);
            return;
        }
        self.emit(TokenKind::OHeredoc, start);
        self.stack.push(Ctx::Heredoc { tag });
    }

    fn collect_trivia(&mut self) {
        loop {
            let start = self.pos;
            match self.peek() {
                Some(' ' | '\t' | '\r') => {
                    while matches!(self.peek(), Some(' ' | '\t')) // keep \r attached to \n below
                        || (self.peek() == Some('\r') && self.peek_at(1) != Some('\n'))
                    {
                        self.bump();
                    }
                    if self.peek() == Some('\r') && self.peek_at(1) == Some('\n') {
                        self.bump(); // the \r of a CRLF pair is trivia, the \n a token
                    }
                    self.push_trivia(TriviaKind::Whitespace, start);
                }
                Some('#') => {
                    self.consume_line_comment();
                    self.push_trivia(TriviaKind::LineComment, start);
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    self.consume_line_comment();
                    self.push_trivia(TriviaKind::LineComment, start);
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.bump_n(2);
                    loop {
                        if self.starts_with("*/") {
                            self.bump_n(2);
                            break;
                        }
                        if self.bump().is_none() {
                            self.error(
                                "Unterminated block comment",
                                "The file ended inside a /* ... */ comment.",
                                start,
                            );
                            break;
                        }
                    }
                    self.push_trivia(TriviaKind::BlockComment, start);
                }
                _ => return,
            }
        }
    }

    fn consume_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            if c == '\r' && self.peek_at(1) == Some('\n') {
                break;
            }
            self.bump();
        }
    }

    fn push_trivia(&mut self, kind: TriviaKind, start: Pos) {
        let text = self.slice_from(start).to_string();
        if text.is_empty() {
            return;
        }
        let range = self.range_from(start);
        self.pending.push(Trivia { kind, text, range });
    }

    // === Template mode: quoted strings ===

    fn scan_quote(&mut self) {
        let lit_start = self.pos;
        loop {
            match self.peek() {
                None => {
                    self.flush_literal(lit_start);
                    self.error(
                        "Unterminated string",
                        "The file ended before the closing quote of this string.",
                        self.pos,
                    );
                    self.stack.pop();
                    return;
                }
                Some('"') => {
                    self.flush_literal(lit_start);
                    let start = self.pos;
                    self.bump();
                    self.emit(TokenKind::CQuote, start);
                    self.stack.pop();
                    return;
                }
                Some('\n') => {
                    self.flush_literal(lit_start);
                    self.error(
                        "Invalid multi-line string",
                        "Quoted strings may not span lines; use a heredoc for multi-line text.",
                        self.pos,
                    );
                    self.stack.pop();
                    return;
                }
                Some('\\') => {
                    // Jump the escape so \" does not close the string;
                    // escape validation happens at parse time.
                    self.bump();
                    self.bump();
                }
                Some('$') if self.starts_with("$${") => {
                    self.bump_n(3);
                }
                Some('%') if self.starts_with("%%{") => {
                    self.bump_n(3);
                }
                Some('$') if self.starts_with("${") => {
                    self.flush_literal(lit_start);
                    self.open_sequence(TokenKind::TemplateInterp);
                    return;
                }
                Some('%') if self.starts_with("%{") => {
                    self.flush_literal(lit_start);
                    self.open_sequence(TokenKind::TemplateControl);
                    return;
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    fn open_sequence(&mut self, kind: TokenKind) {
        let start = self.pos;
        self.bump_n(2);
        self.emit(kind, start);
        self.stack.push(Ctx::TemplateCode { depth: 0 });
    }

    fn flush_literal(&mut self, start: Pos) {
        if self.pos.byte > start.byte {
            self.emit(TokenKind::StringLit, start);
        }
    }

    // === Template mode: bare template sources ===

    fn scan_bare(&mut self) {
        let lit_start = self.pos;
        loop {
            match self.peek() {
                None => {
                    self.flush_literal(lit_start);
                    self.stack.pop();
                    return;
                }
                Some('\\') => {
                    self.bump();
                    self.bump();
                }
                Some('$') if self.starts_with("$${") => self.bump_n(3),
                Some('%') if self.starts_with("%%{") => self.bump_n(3),
                Some('$') if self.starts_with("${") => {
                    self.flush_literal(lit_start);
                    self.open_sequence(TokenKind::TemplateInterp);
                    return;
                }
                Some('%') if self.starts_with("%{") => {
                    self.flush_literal(lit_start);
                    self.open_sequence(TokenKind::TemplateControl);
                    return;
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    // === Template mode: heredocs ===

    fn scan_heredoc(&mut self) {
        let tag = match self.stack.last() {
            Some(Ctx::Heredoc { tag }) => tag.clone(),
            _ => unreachable!("heredoc scan outside heredoc context"),
        };

        // Only a line start can carry the terminator.
        if self.pos.column == 1 {
            if let Some(term_len) = self.terminator_len(&tag) {
                let start = self.pos;
                self.bump_n(term_len);
                self.emit(TokenKind::CHeredoc, start);
                self.stack.pop();
                return;
            }
        }

        let lit_start = self.pos;
        loop {
            match self.peek() {
                None => {
                    self.flush_literal(lit_start);
                    self.error(
                        "Unterminated heredoc",
                        &format!("The file ended before the heredoc terminator \"{tag}\"."),
                        self.pos,
                    );
                    self.stack.pop();
                    return;
                }
                Some('\n') => {
                    self.bump();
                    self.flush_literal(lit_start);
                    return; // re-enter to check the next line for the terminator
                }
                Some('$') if self.starts_with("$${") => self.bump_n(3),
                Some('%') if self.starts_with("%%{") => self.bump_n(3),
                Some('$') if self.starts_with("${") => {
                    self.flush_literal(lit_start);
                    self.open_sequence(TokenKind::TemplateInterp);
                    return;
                }
                Some('%') if self.starts_with("%{") => {
                    self.flush_literal(lit_start);
                    self.open_sequence(TokenKind::TemplateControl);
                    return;
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    /// If the current line is the heredoc terminator (optional leading
    /// whitespace, the tag, then end of line), its length in chars.
    fn terminator_len(&self, tag: &str) -> Option<usize> {
        let rest = self.rest();
        let mut len = 0;
        let mut chars = rest.chars().peekable();
        while matches!(chars.peek(), Some(' ' | '\t')) {
            chars.next();
            len += 1;
        }
        for expected in tag.chars() {
            if chars.next() != Some(expected) {
                return None;
            }
            len += 1;
        }
        match chars.peek() {
            None | Some('\n') => Some(len),
            Some('\r') => Some(len),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let (tokens, _) = scan(src, "test.bcl", Pos::start());
        tokens.into_iter().map(|t| t.kind).collect()
    }

    fn roundtrip(src: &str) -> String {
        let (tokens, _) = scan(src, "test.bcl", Pos::start());
        let mut out = String::new();
        for t in &tokens {
            t.write_to(&mut out);
        }
        out
    }

    #[test]
    fn test_empty() {
        assert_eq!(kinds(""), vec![TokenKind::Eof]);
    }

    #[test]
    fn test_attribute_line() {
        assert_eq!(
            kinds("foo = 1\n"),
            vec![
                TokenKind::Ident,
                TokenKind::Equal,
                TokenKind::Number,
                TokenKind::Newline,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("== != <= >= && || ... =>"),
            vec![
                TokenKind::EqualTo,
                TokenKind::NotEqual,
                TokenKind::LessThanEq,
                TokenKind::GreaterThanEq,
                TokenKind::And,
                TokenKind::Or,
                TokenKind::Ellipsis,
                TokenKind::FatArrow,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_dashed_identifier() {
        let (tokens, _) = scan("a-b c-", "t", Pos::start());
        assert_eq!(tokens[0].text, "a-b");
        assert_eq!(tokens[1].text, "c");
        assert_eq!(tokens[2].kind, TokenKind::Minus);
    }

    #[test]
    fn test_quoted_template() {
        assert_eq!(
            kinds(r#""hello ${name}!""#),
            vec![
                TokenKind::OQuote,
                TokenKind::StringLit,
                TokenKind::TemplateInterp,
                TokenKind::Ident,
                TokenKind::TemplateSeqEnd,
                TokenKind::StringLit,
                TokenKind::CQuote,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_escaped_interpolation_stays_literal() {
        assert_eq!(
            kinds(r#""a $${b}""#),
            vec![
                TokenKind::OQuote,
                TokenKind::StringLit,
                TokenKind::CQuote,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_interp_with_nested_braces() {
        assert_eq!(
            kinds(r#""${ {a = 1} }""#),
            vec![
                TokenKind::OQuote,
                TokenKind::TemplateInterp,
                TokenKind::LBrace,
                TokenKind::Ident,
                TokenKind::Equal,
                TokenKind::Number,
                TokenKind::RBrace,
                TokenKind::TemplateSeqEnd,
                TokenKind::CQuote,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_heredoc() {
        let src = "x = <<EOT\nline one\nline ${t} two\nEOT\n";
        let k = kinds(src);
        assert_eq!(
            k,
            vec![
                TokenKind::Ident,
                TokenKind::Equal,
                TokenKind::OHeredoc,
                TokenKind::StringLit,
                TokenKind::StringLit,
                TokenKind::TemplateInterp,
                TokenKind::Ident,
                TokenKind::TemplateSeqEnd,
                TokenKind::StringLit,
                TokenKind::CHeredoc,
                TokenKind::Newline,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_heredoc_terminator_as_substring() {
        // A line *containing* the tag does not terminate the heredoc.
        let src = "x = <<EOT\nnot EOT here\nEOT\n";
        let (tokens, diags) = scan(src, "t", Pos::start());
        assert!(diags.is_empty());
        assert!(tokens.iter().any(|t| t.kind == TokenKind::CHeredoc));
        let lits: Vec<_> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::StringLit)
            .collect();
        assert_eq!(lits.len(), 1);
        assert_eq!(lits[0].text, "not EOT here\n");
    }

    #[test]
    fn test_comments_are_trivia() {
        let (tokens, _) = scan("# note\nfoo = 1 // same line\n", "t", Pos::start());
        // The comment attaches to the newline token that follows it.
        assert_eq!(tokens[0].kind, TokenKind::Newline);
        assert_eq!(tokens[0].leading.len(), 1);
        assert_eq!(tokens[0].leading[0].kind, TriviaKind::LineComment);
        let last_newline = &tokens[tokens.len() - 2];
        assert_eq!(last_newline.kind, TokenKind::Newline);
        assert!(last_newline
            .leading
            .iter()
            .any(|t| t.kind == TriviaKind::LineComment));
    }

    #[test]
    fn test_illegal_byte_recovers() {
        let (tokens, diags) = scan("a = @ 1\n", "t", Pos::start());
        assert!(diags.has_errors());
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Illegal));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Number));
    }

    #[test]
    fn test_non_ascii_identifier_rejected() {
        let (_, diags) = scan("héllo = 1\n", "t", Pos::start());
        assert!(diags.has_errors());
    }

    #[test]
    fn test_roundtrip_preserves_bytes() {
        let srcs = [
            "# comment\nfoo  =  \"x\"\n",
            "a = 1\n\n\nb = 2\n",
            "x = <<-EOT\n  indented\n  EOT\n",
            "block \"label\" {\n  inner = true # tail\n}\n",
            "crlf = 1\r\nnext = 2\r\n",
            "t = \"a ${ b } c\"\n",
        ];
        for src in srcs {
            assert_eq!(roundtrip(src), src, "round-trip failed for {src:?}");
        }
    }

    #[test]
    fn test_unterminated_string() {
        let (tokens, diags) = scan("x = \"abc", "t", Pos::start());
        assert!(diags.has_errors());
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
    }
}
