use crate::pos::Range;
use miette::{LabeledSpan, NamedSource};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A source-anchored error or warning value. Diagnostics are data, not
/// control flow: fallible operations return a result alongside a
/// [`Diagnostics`] list, and only an error-severity entry constitutes
/// failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Short problem statement, suitable for a one-line listing.
    pub summary: String,
    /// Longer explanation, suitable for a report body.
    pub detail: String,
    /// The range the problem is anchored to.
    pub subject: Option<Range>,
    /// A wider range giving context, e.g. the whole expression an
    /// evaluation error occurred inside.
    pub context: Option<Range>,
}

impl Diagnostic {
    pub fn error(
        summary: impl Into<String>,
        detail: impl Into<String>,
        subject: Range,
    ) -> Diagnostic {
        Diagnostic {
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.into(),
            subject: Some(subject),
            context: None,
        }
    }

    pub fn warning(
        summary: impl Into<String>,
        detail: impl Into<String>,
        subject: Range,
    ) -> Diagnostic {
        Diagnostic {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.into(),
            subject: Some(subject),
            context: None,
        }
    }

    pub fn with_context(mut self, context: Range) -> Diagnostic {
        self.context = Some(context);
        self
    }

    /// Wraps the diagnostic with its source text so miette can render a
    /// fancy graphical report.
    pub fn into_report(self, source: &str) -> Report {
        let name = self
            .subject
            .as_ref()
            .map(|r| r.filename.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        Report {
            src: NamedSource::new(name, source.to_string()),
            diag: self,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sev = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match &self.subject {
            Some(r) => write!(
                f,
                "{}: {} ({}:{}:{})",
                sev, self.summary, r.filename, r.start.line, r.start.column
            ),
            None => write!(f, "{}: {}", sev, self.summary),
        }
    }
}

/// An ordered accumulator of diagnostics. Order is discovery order, which
/// callers rely on for stable output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Diagnostics {
        Diagnostics(Vec::new())
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.0.push(diag);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.0.iter()
    }

    /// Drops every entry past `len`. The evaluator uses this to suppress
    /// errors from a short-circuited operand.
    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.0
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(diag: Diagnostic) -> Diagnostics {
        Diagnostics(vec![diag])
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{d}")?;
        }
        Ok(())
    }
}

/// A [`Diagnostic`] paired with its source, rendered through miette.
#[derive(Debug)]
pub struct Report {
    src: NamedSource<String>,
    diag: Diagnostic,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.diag.summary)
    }
}

impl std::error::Error for Report {}

impl miette::Diagnostic for Report {
    fn severity(&self) -> Option<miette::Severity> {
        Some(match self.diag.severity {
            Severity::Error => miette::Severity::Error,
            Severity::Warning => miette::Severity::Warning,
        })
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        if self.diag.detail.is_empty() {
            None
        } else {
            Some(Box::new(self.diag.detail.clone()))
        }
    }

    fn source_code(&self) -> Option<&dyn miette::SourceCode> {
        Some(&self.src)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = LabeledSpan> + '_>> {
        let mut labels = Vec::new();
        if let Some(r) = &self.diag.subject {
            labels.push(LabeledSpan::new_with_span(
                Some(self.diag.summary.clone()),
                r.span(),
            ));
        }
        if let Some(r) = &self.diag.context {
            labels.push(LabeledSpan::new_with_span(
                Some("within this context".to_string()),
                r.span(),
            ));
        }
        if labels.is_empty() {
            None
        } else {
            Some(Box::new(labels.into_iter()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pos::Pos;
    use std::sync::Arc;

    fn subject() -> Range {
        Range::new(Arc::from("test.bcl"), Pos::start(), Pos::start())
    }

    #[test]
    fn test_warnings_are_not_failure() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::warning("odd spacing", "", subject()));
        assert!(!diags.has_errors());
        diags.push(Diagnostic::error("bad token", "", subject()));
        assert!(diags.has_errors());
    }

    #[test]
    fn test_order_is_preserved() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::error("first", "", subject()));
        diags.push(Diagnostic::error("second", "", subject()));
        let summaries: Vec<_> = diags.into_iter().map(|d| d.summary).collect();
        assert_eq!(summaries, vec!["first", "second"]);
    }
}
