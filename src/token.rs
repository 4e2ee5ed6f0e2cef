use crate::pos::Range;
use serde::Serialize;

/// The kinds of tokens the scanner produces. Each token is a meaningful
/// unit of BCL syntax; whitespace and comments travel separately as
/// [`Trivia`] so the rewrite tree can round-trip source exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TokenKind {
    // == Special tokens ==
    /// End of the input buffer.
    Eof,
    /// A byte sequence the scanner could not recognize.
    Illegal,
    /// A significant newline. Newlines terminate attribute definitions
    /// inside bodies but are skipped inside bracketed expressions.
    Newline,

    // == Literals and names ==
    /// An identifier: `[A-Za-z_][A-Za-z0-9_-]*` with `-` only internal.
    Ident,
    /// A decimal number literal, optional fraction and exponent.
    Number,

    // == Template delimiters ==
    /// Opening `"` of a quoted template.
    OQuote,
    /// Closing `"` of a quoted template.
    CQuote,
    /// Heredoc introducer: `<<ID` or `<<-ID` including the newline.
    OHeredoc,
    /// Heredoc terminator line (leading whitespace plus the tag).
    CHeredoc,
    /// A literal chunk of template text.
    StringLit,
    /// `${`
    TemplateInterp,
    /// `%{`
    TemplateControl,
    /// The `}` that closes an interpolation or control sequence.
    TemplateSeqEnd,

    // == Punctuation and operators ==
    LBrace,
    RBrace,
    LBrack,
    RBrack,
    LParen,
    RParen,
    Equal,
    EqualTo,
    NotEqual,
    LessThan,
    GreaterThan,
    LessThanEq,
    GreaterThanEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    And,
    Or,
    Bang,
    Question,
    Colon,
    Comma,
    Dot,
    Ellipsis,
    FatArrow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TriviaKind {
    /// Spaces, tabs, and carriage returns.
    Whitespace,
    /// `# ...` or `// ...`, up to but not including the newline.
    LineComment,
    /// `/* ... */`, possibly spanning lines.
    BlockComment,
}

/// Whitespace or a comment, preserved verbatim and attached to the token
/// that follows it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trivia {
    pub kind: TriviaKind,
    pub text: String,
    pub range: Range,
}

/// A token: kind, exact source text, range, and any trivia that preceded
/// it. Concatenating `leading` texts and `text` across a token stream
/// reproduces the source byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub range: Range,
    pub leading: Vec<Trivia>,
}

impl Token {
    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }

    /// Appends the token's full surface form (trivia plus text) to `out`.
    pub fn write_to(&self, out: &mut String) {
        for t in &self.leading {
            out.push_str(&t.text);
        }
        out.push_str(&self.text);
    }
}

impl TokenKind {
    /// Human-readable name used in "expected X" diagnostics.
    pub fn describe(self) -> &'static str {
        match self {
            TokenKind::Eof => "end of file",
            TokenKind::Illegal => "invalid token",
            TokenKind::Newline => "newline",
            TokenKind::Ident => "identifier",
            TokenKind::Number => "number",
            TokenKind::OQuote | TokenKind::CQuote => "quote mark",
            TokenKind::OHeredoc => "heredoc introducer",
            TokenKind::CHeredoc => "heredoc terminator",
            TokenKind::StringLit => "string literal",
            TokenKind::TemplateInterp => "\"${\"",
            TokenKind::TemplateControl => "\"%{\"",
            TokenKind::TemplateSeqEnd => "\"}\"",
            TokenKind::LBrace => "\"{\"",
            TokenKind::RBrace => "\"}\"",
            TokenKind::LBrack => "\"[\"",
            TokenKind::RBrack => "\"]\"",
            TokenKind::LParen => "\"(\"",
            TokenKind::RParen => "\")\"",
            TokenKind::Equal => "\"=\"",
            TokenKind::EqualTo => "\"==\"",
            TokenKind::NotEqual => "\"!=\"",
            TokenKind::LessThan => "\"<\"",
            TokenKind::GreaterThan => "\">\"",
            TokenKind::LessThanEq => "\"<=\"",
            TokenKind::GreaterThanEq => "\">=\"",
            TokenKind::Plus => "\"+\"",
            TokenKind::Minus => "\"-\"",
            TokenKind::Star => "\"*\"",
            TokenKind::Slash => "\"/\"",
            TokenKind::Percent => "\"%\"",
            TokenKind::And => "\"&&\"",
            TokenKind::Or => "\"||\"",
            TokenKind::Bang => "\"!\"",
            TokenKind::Question => "\"?\"",
            TokenKind::Colon => "\":\"",
            TokenKind::Comma => "\",\"",
            TokenKind::Dot => "\".\"",
            TokenKind::Ellipsis => "\"...\"",
            TokenKind::FatArrow => "\"=>\"",
        }
    }
}

/// Whether `name` is a valid BCL identifier: ASCII letters, digits,
/// underscores, and internal dashes, not starting with a digit or dash.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    if name.ends_with('-') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validity() {
        assert!(is_valid_identifier("foo"));
        assert!(is_valid_identifier("_private"));
        assert!(is_valid_identifier("kebab-case"));
        assert!(!is_valid_identifier("3d"));
        assert!(!is_valid_identifier("-lead"));
        assert!(!is_valid_identifier("trail-"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("über"));
    }
}
