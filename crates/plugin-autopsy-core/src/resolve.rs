use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::classify::{Classification, PathClassifier};
use crate::AutopsyError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackFrame {
    pub file: Option<String>,
    pub line: u32,
    pub function: Option<String>,
}

impl StackFrame {
    #[must_use]
    pub fn new(file: &str, line: u32, function: Option<&str>) -> Self {
        Self {
            file: Some(file.to_string()),
            line,
            function: function.map(str::to_string),
        }
    }
}

/// The extension-owned frame a query or callback was traced back to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedOrigin {
    pub slug: String,
    pub file: String,
    pub line: u32,
    pub function: Option<String>,
}

/// A callback registered at a lifecycle checkpoint.
///
/// The dispatcher fills `declared_in` with the declaring source file when the
/// callback is registered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackRef {
    pub name: String,
    pub declared_in: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct StackResolver<'a> {
    classifier: &'a PathClassifier,
}

impl<'a> StackResolver<'a> {
    #[must_use]
    pub fn new(classifier: &'a PathClassifier) -> Self {
        Self { classifier }
    }

    /// Returns the innermost frame whose file lies under the extensions root.
    ///
    /// Frames are expected innermost first. Theme and core frames are skipped,
    /// and `None` means no extension appears anywhere in the stack.
    #[must_use]
    pub fn resolve(&self, frames: &[StackFrame]) -> Option<ResolvedOrigin> {
        frames.iter().find_map(|frame| {
            let file = frame.file.as_deref()?;
            let slug = self.classifier.extension_slug(file)?;
            Some(ResolvedOrigin {
                slug,
                file: file.to_string(),
                line: frame.line,
                function: frame.function.clone(),
            })
        })
    }

    /// Classifies a registered callback by its declaring source file.
    #[must_use]
    pub fn resolve_callback(&self, callback: &CallbackRef) -> Option<Classification> {
        let declared_in = callback.declared_in.as_deref()?;
        let classification = self.classifier.classify_path(declared_in);
        classification.is_extension().then_some(classification)
    }
}

/// Splits stack-trace text from a query log into frames, innermost first.
///
/// Each line has the form `[#N ]<file>(<line>)[: <function>]`; other lines are
/// ignored.
#[derive(Debug, Clone)]
pub struct StackTraceParser {
    pattern: Regex,
}

impl StackTraceParser {
    /// # Errors
    /// Returns [`AutopsyError::Configuration`] if the frame pattern fails to compile.
    pub fn new() -> Result<Self, AutopsyError> {
        let pattern = Regex::new(r"^(?:#\d+\s+)?([^(]+)\((\d+)\)(?::\s*(.+))?$").map_err(
            |err| AutopsyError::Configuration(format!("invalid stack frame pattern: {err}")),
        )?;
        Ok(Self { pattern })
    }

    #[must_use]
    pub fn parse(&self, text: &str) -> Vec<StackFrame> {
        text.lines()
            .map(str::trim)
            .filter_map(|line| {
                let captures = self.pattern.captures(line)?;
                let file = captures.get(1)?.as_str().trim();
                let line_number = captures.get(2)?.as_str().parse::<u32>().ok()?;
                let function = captures
                    .get(3)
                    .map(|value| value.as_str().trim().to_string())
                    .filter(|value| !value.is_empty());
                Some(StackFrame {
                    file: Some(file.to_string()),
                    line: line_number,
                    function,
                })
            })
            .collect()
    }
}

/// One-shot form of [`StackTraceParser::parse`].
///
/// # Errors
/// Returns [`AutopsyError::Configuration`] if the frame pattern fails to compile.
pub fn parse_stack_trace(text: &str) -> Result<Vec<StackFrame>, AutopsyError> {
    Ok(StackTraceParser::new()?.parse(text))
}
