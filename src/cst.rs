use crate::parser;
use crate::pos::Pos;
use crate::token::{is_valid_identifier, Token, TokenKind};
use miette::Diagnostic as MietteDiagnostic;
use std::sync::Arc;
use thiserror::Error;

/// A half-open range of token indices into a [`Cst`]'s token store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSpan {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CstKind {
    Body,
    Attribute,
    Block,
    Expression,
    Template,
    TupleItem,
    ObjectItem,
}

/// A node in the concrete syntax tree. Nodes own no text; they are
/// spans over the shared token store, and children lie inside their
/// parent's span in source order.
#[derive(Debug, Clone)]
pub struct CstNode {
    pub kind: CstKind,
    pub span: TokenSpan,
    pub children: Vec<CstNode>,
}

/// The concrete syntax tree of one configuration file. Holds every
/// token of the source, trivia included, so the original bytes can be
/// reproduced exactly and surgical edits disturb nothing they don't
/// target.
///
/// Edits re-derive the tree from the edited byte stream, so the tree
/// and token store always agree after each operation.
#[derive(Debug, Clone)]
pub struct Cst {
    tokens: Vec<Token>,
    root: CstNode,
    filename: Arc<str>,
}

/// Addresses a nested block body: each element is a block type name and
/// its labels. The empty path addresses the file's top-level body.
pub type BlockPath<'a> = [(&'a str, &'a [&'a str])];

#[derive(Debug, Error, MietteDiagnostic)]
pub enum RewriteError {
    #[error("no block matching the given path was found")]
    #[diagnostic(code(bcl::rewrite::block_not_found))]
    BlockNotFound,

    #[error("no attribute named {name:?} was found")]
    #[diagnostic(code(bcl::rewrite::attribute_not_found))]
    AttributeNotFound { name: String },

    #[error("{name:?} is not a valid identifier")]
    #[diagnostic(
        code(bcl::rewrite::invalid_name),
        help("identifiers contain ASCII letters, digits, underscores, and non-trailing dashes")
    )]
    InvalidName { name: String },

    #[error("the replacement expression is not valid syntax")]
    #[diagnostic(code(bcl::rewrite::invalid_expression))]
    InvalidExpression,
}

impl Cst {
    pub(crate) fn new(tokens: Vec<Token>, root: CstNode) -> Cst {
        debug_assert!(spans_nest(&root));
        let filename = tokens
            .first()
            .map(|t| t.range.filename.clone())
            .unwrap_or_else(|| Arc::from(""));
        Cst {
            tokens,
            root,
            filename,
        }
    }

    /// Reproduces the source text, byte for byte.
    pub fn to_source(&self) -> String {
        let mut out = String::new();
        for t in &self.tokens {
            t.write_to(&mut out);
        }
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_source().into_bytes()
    }

    pub fn root(&self) -> &CstNode {
        &self.root
    }

    // === Queries ===

    /// The attribute names defined directly in the addressed body, in
    /// source order.
    pub fn attribute_names(&self, path: &BlockPath<'_>) -> Vec<String> {
        match self.body_node(path) {
            Some(body) => body
                .children
                .iter()
                .filter(|n| n.kind == CstKind::Attribute)
                .map(|n| self.tokens[n.span.start].text.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn has_attribute(&self, path: &BlockPath<'_>, name: &str) -> bool {
        self.body_node(path)
            .and_then(|b| self.find_attribute(b, name))
            .is_some()
    }

    pub fn has_block(&self, path: &BlockPath<'_>, type_name: &str, labels: &[&str]) -> bool {
        self.body_node(path)
            .map(|b| self.find_block(b, type_name, labels).is_some())
            .unwrap_or(false)
    }

    /// The label values of every block of the given type in the
    /// addressed body.
    pub fn block_labels(&self, path: &BlockPath<'_>, type_name: &str) -> Vec<Vec<String>> {
        match self.body_node(path) {
            Some(body) => body
                .children
                .iter()
                .filter(|n| {
                    n.kind == CstKind::Block && self.tokens[n.span.start].text == type_name
                })
                .map(|n| self.labels_of(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// The source text of an attribute's value expression, trivia
    /// stripped from the edges.
    pub fn attribute_value_source(&self, path: &BlockPath<'_>, name: &str) -> Option<String> {
        let body = self.body_node(path)?;
        let attr = self.find_attribute(body, name)?;
        let expr = attr
            .children
            .iter()
            .find(|n| n.kind == CstKind::Expression)?;
        let mut out = String::new();
        for (i, t) in self.tokens[expr.span.start..expr.span.end].iter().enumerate() {
            if i > 0 {
                for trivia in &t.leading {
                    out.push_str(&trivia.text);
                }
            }
            out.push_str(&t.text);
        }
        Some(out)
    }

    // === Edits ===

    /// Replaces the value of an existing attribute, or appends the
    /// attribute if it's absent. Spacing around the attribute's `=` is
    /// preserved on replacement.
    pub fn set_attribute(
        &mut self,
        path: &BlockPath<'_>,
        name: &str,
        value_source: &str,
    ) -> Result<(), RewriteError> {
        if !is_valid_identifier(name) {
            return Err(RewriteError::InvalidName { name: name.into() });
        }
        check_expression(value_source)?;
        let body = self.body_node(path).ok_or(RewriteError::BlockNotFound)?;
        match self.find_attribute(body, name) {
            Some(attr) => {
                let expr = attr
                    .children
                    .iter()
                    .find(|n| n.kind == CstKind::Expression)
                    .ok_or(RewriteError::AttributeNotFound { name: name.into() })?;
                let a = self.tokens[expr.span.start].range.start.byte;
                let b = self.tokens[expr.span.end - 1].range.end.byte;
                self.splice(a, b, value_source);
                Ok(())
            }
            None => self.append_attribute(path, name, value_source),
        }
    }

    /// Inserts a new attribute line at the end of the addressed body,
    /// indented like its siblings.
    pub fn append_attribute(
        &mut self,
        path: &BlockPath<'_>,
        name: &str,
        value_source: &str,
    ) -> Result<(), RewriteError> {
        if !is_valid_identifier(name) {
            return Err(RewriteError::InvalidName { name: name.into() });
        }
        check_expression(value_source)?;
        let body = self.body_node(path).ok_or(RewriteError::BlockNotFound)?;
        let indent = self.body_indent(body, path.len());
        let at = self.body_insert_offset(body);
        let line = format!("{indent}{name} = {value_source}\n");
        self.splice(at, at, &line);
        Ok(())
    }

    /// Removes an attribute together with its line.
    pub fn remove_attribute(
        &mut self,
        path: &BlockPath<'_>,
        name: &str,
    ) -> Result<(), RewriteError> {
        let body = self.body_node(path).ok_or(RewriteError::BlockNotFound)?;
        let attr = self
            .find_attribute(body, name)
            .ok_or_else(|| RewriteError::AttributeNotFound { name: name.into() })?;
        let (a, b) = self.item_byte_extent(attr);
        self.splice(a, b, "");
        Ok(())
    }

    /// Appends an empty block to the addressed body and returns nothing;
    /// populate it with further edits addressed through its path.
    pub fn append_block(
        &mut self,
        path: &BlockPath<'_>,
        type_name: &str,
        labels: &[&str],
    ) -> Result<(), RewriteError> {
        if !is_valid_identifier(type_name) {
            return Err(RewriteError::InvalidName {
                name: type_name.into(),
            });
        }
        let body = self.body_node(path).ok_or(RewriteError::BlockNotFound)?;
        let indent = self.body_indent(body, path.len());
        let at = self.body_insert_offset(body);
        let mut header = String::new();
        header.push_str(&indent);
        header.push_str(type_name);
        for label in labels {
            header.push_str(&format!(" {:?}", label));
        }
        header.push_str(" {\n");
        header.push_str(&indent);
        header.push_str("}\n");
        self.splice(at, at, &header);
        Ok(())
    }

    /// Removes a whole block, its body included.
    pub fn remove_block(
        &mut self,
        path: &BlockPath<'_>,
        type_name: &str,
        labels: &[&str],
    ) -> Result<(), RewriteError> {
        let body = self.body_node(path).ok_or(RewriteError::BlockNotFound)?;
        let block = self
            .find_block(body, type_name, labels)
            .ok_or(RewriteError::BlockNotFound)?;
        let (a, b) = self.item_byte_extent(block);
        self.splice(a, b, "");
        Ok(())
    }

    /// Moves a block to a new position among the addressed body's
    /// blocks. `index` counts the body's blocks after the move; an
    /// out-of-range index places the block last.
    pub fn move_block(
        &mut self,
        path: &BlockPath<'_>,
        type_name: &str,
        labels: &[&str],
        index: usize,
    ) -> Result<(), RewriteError> {
        let body = self.body_node(path).ok_or(RewriteError::BlockNotFound)?;
        let block = self
            .find_block(body, type_name, labels)
            .ok_or(RewriteError::BlockNotFound)?;
        let (a, b) = self.item_byte_extent(block);
        let src = self.to_source();
        let text = src[a..b].to_string();
        self.splice(a, b, "");

        // The tree was rebuilt; address the body again and insert before
        // the block now occupying the target slot.
        let body = self.body_node(path).ok_or(RewriteError::BlockNotFound)?;
        let sibling = body
            .children
            .iter()
            .filter(|n| n.kind == CstKind::Block)
            .nth(index);
        let at = match sibling {
            Some(node) => self.item_byte_extent(node).0,
            None => self.body_insert_offset(body),
        };
        self.splice(at, at, &text);
        Ok(())
    }

    /// Replaces the labels of a block, keeping its body untouched.
    pub fn set_block_labels(
        &mut self,
        path: &BlockPath<'_>,
        type_name: &str,
        labels: &[&str],
        new_labels: &[&str],
    ) -> Result<(), RewriteError> {
        let body = self.body_node(path).ok_or(RewriteError::BlockNotFound)?;
        let block = self
            .find_block(body, type_name, labels)
            .ok_or(RewriteError::BlockNotFound)?;
        let type_tok = block.span.start;
        let open_brace = (block.span.start..block.span.end)
            .find(|&i| self.tokens[i].kind == TokenKind::LBrace)
            .ok_or(RewriteError::BlockNotFound)?;
        let a = self.tokens[type_tok].range.end.byte;
        let b = self.tokens[open_brace].range.start.byte;
        let mut text = String::new();
        for label in new_labels {
            text.push_str(&format!(" {:?}", label));
        }
        text.push(' ');
        self.splice(a, b, &text);
        Ok(())
    }

    // === Internals ===

    fn body_node(&self, path: &BlockPath<'_>) -> Option<&CstNode> {
        let mut body = &self.root;
        for (type_name, labels) in path {
            let block = self.find_block(body, type_name, labels)?;
            body = block.children.iter().find(|n| n.kind == CstKind::Body)?;
        }
        Some(body)
    }

    fn find_attribute<'a>(&self, body: &'a CstNode, name: &str) -> Option<&'a CstNode> {
        body.children
            .iter()
            .find(|n| n.kind == CstKind::Attribute && self.tokens[n.span.start].text == name)
    }

    fn find_block<'a>(
        &self,
        body: &'a CstNode,
        type_name: &str,
        labels: &[&str],
    ) -> Option<&'a CstNode> {
        body.children.iter().find(|n| {
            n.kind == CstKind::Block
                && self.tokens[n.span.start].text == type_name
                && self.labels_of(n) == labels
        })
    }

    /// Reads a block's labels back out of its header tokens.
    fn labels_of(&self, block: &CstNode) -> Vec<String> {
        let mut labels = Vec::new();
        let mut i = block.span.start + 1;
        while i < block.span.end {
            match self.tokens[i].kind {
                TokenKind::Ident => {
                    labels.push(self.tokens[i].text.clone());
                    i += 1;
                }
                TokenKind::OQuote => {
                    let mut text = String::new();
                    i += 1;
                    while i < block.span.end && self.tokens[i].kind == TokenKind::StringLit {
                        text.push_str(&self.tokens[i].text);
                        i += 1;
                    }
                    if i < block.span.end && self.tokens[i].kind == TokenKind::CQuote {
                        i += 1;
                    }
                    labels.push(text);
                }
                _ => break,
            }
        }
        labels
    }

    /// The byte range an item removal should take with it: the item's
    /// own tokens, its terminating newline, and the whitespace indenting
    /// it. Leading comment trivia stays behind.
    fn item_byte_extent(&self, node: &CstNode) -> (usize, usize) {
        let first = &self.tokens[node.span.start];
        let start = first
            .leading
            .iter()
            .rev()
            .take_while(|t| t.kind == crate::token::TriviaKind::Whitespace)
            .last()
            .map(|t| t.range.start.byte)
            .unwrap_or(first.range.start.byte);
        let end = self.tokens[node.span.end - 1].range.end.byte;
        (start, end)
    }

    /// Where new items go: just before the body's closing token's own
    /// indentation, i.e. at the start of the line holding the `}`.
    fn body_insert_offset(&self, body: &CstNode) -> usize {
        let closer = &self.tokens[body.span.end.min(self.tokens.len() - 1)];
        closer
            .leading
            .iter()
            .rev()
            .take_while(|t| t.kind == crate::token::TriviaKind::Whitespace)
            .last()
            .map(|t| t.range.start.byte)
            .unwrap_or(closer.range.start.byte)
    }

    /// Indentation for a new item: copied from the body's first existing
    /// item, or two spaces per nesting level.
    fn body_indent(&self, body: &CstNode, depth: usize) -> String {
        for child in &body.children {
            let first = &self.tokens[child.span.start];
            if let Some(t) = first.leading.last() {
                if t.kind == crate::token::TriviaKind::Whitespace && !t.text.contains('\n') {
                    return t.text.clone();
                }
            }
        }
        "  ".repeat(depth)
    }

    /// Replaces a byte range of the source and re-derives tokens and
    /// tree from the result. Untouched bytes come through verbatim.
    fn splice(&mut self, start: usize, end: usize, replacement: &str) {
        let mut src = self.to_source();
        src.replace_range(start..end, replacement);
        let (_, cst, _) = parser::parse_file(&src, &self.filename, Pos::start());
        self.tokens = cst.tokens;
        self.root = cst.root;
    }
}

fn check_expression(src: &str) -> Result<(), RewriteError> {
    let (_, diags) = parser::parse_expression(src, "<rewrite>", Pos::start());
    if diags.has_errors() {
        return Err(RewriteError::InvalidExpression);
    }
    Ok(())
}

fn spans_nest(node: &CstNode) -> bool {
    let mut prev_end = node.span.start;
    for child in &node.children {
        if child.span.start < prev_end || child.span.end > node.span.end {
            return false;
        }
        prev_end = child.span.end;
        if !spans_nest(child) {
            return false;
        }
    }
    true
}
