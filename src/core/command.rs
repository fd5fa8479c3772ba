//! Parameterized commands
//!
//! A `Command` is the query text, its positional parameters and the timeout
//! applied to each driver call made for it. The rewrites used by the retry
//! policy (always-false requery, non-ASCII stripping) live here.

use super::config::DEFAULT_COMMAND_TIMEOUT_MS;
use super::value::DatabaseValue;
use std::time::Duration;

/// Predicate substituted when a filter overflows
pub const ALWAYS_FALSE_PREDICATE: &str = " WHERE 0 = 1";

/// A query and its parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    query: String,
    params: Vec<DatabaseValue>,
    timeout: Duration,
    wait_for_lock_release: Option<bool>,
    sanitized: bool,
}

impl Command {
    /// Create a command with the default timeout
    pub fn new(query: impl Into<String>, params: Vec<DatabaseValue>) -> Self {
        Self {
            query: query.into(),
            params,
            timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            wait_for_lock_release: None,
            sanitized: false,
        }
    }

    /// Set the per-call timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the configured lock-wait behaviour for this command
    #[must_use]
    pub fn with_wait_for_lock_release(mut self, wait: bool) -> Self {
        self.wait_for_lock_release = Some(wait);
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn params(&self) -> &[DatabaseValue] {
        &self.params
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Per-command lock-wait override, if any
    pub fn wait_for_lock_release(&self) -> Option<bool> {
        self.wait_for_lock_release
    }

    /// Whether values written for this command must be stripped to ASCII
    pub fn is_sanitized(&self) -> bool {
        self.sanitized
    }

    /// Table named after the first `FROM`
    pub fn source_table(&self) -> Option<String> {
        source_table(&self.query)
    }

    /// Replace the filter with `WHERE 0 = 1`.
    ///
    /// The query is cut at its last `where` keyword, and the parameters bound
    /// after the cut are dropped. A query without a filter gets the predicate
    /// appended.
    #[must_use]
    pub fn with_always_false_predicate(&self) -> Command {
        let cut = find_keyword_from_end(&self.query, "where").unwrap_or(self.query.len());
        let head = self.query[..cut].trim_end();
        let kept = head.matches('?').count().min(self.params.len());

        Command {
            query: format!("{head}{ALWAYS_FALSE_PREDICATE}"),
            params: self.params[..kept].to_vec(),
            timeout: self.timeout,
            wait_for_lock_release: self.wait_for_lock_release,
            sanitized: self.sanitized,
        }
    }

    /// Copy of the command with non-ASCII characters removed from string
    /// parameters and from the query text
    #[must_use]
    pub fn sanitized(&self) -> Command {
        Command {
            query: strip_non_ascii(&self.query),
            params: self
                .params
                .iter()
                .map(|value| match value {
                    DatabaseValue::String(s) => DatabaseValue::String(strip_non_ascii(s)),
                    other => other.clone(),
                })
                .collect(),
            timeout: self.timeout,
            wait_for_lock_release: self.wait_for_lock_release,
            sanitized: true,
        }
    }
}

/// Remove every non-ASCII character
pub fn strip_non_ascii(text: &str) -> String {
    text.chars().filter(char::is_ascii).collect()
}

/// Table named after the first `FROM` keyword of a query
pub fn source_table(query: &str) -> Option<String> {
    let mut words = query.split_whitespace();
    words.find(|w| w.eq_ignore_ascii_case("from"))?;
    words
        .next()
        .map(|t| t.trim_end_matches([';', ',', ')']).to_string())
        .filter(|t| !t.is_empty())
}

/// Byte offset of the last standalone occurrence of a keyword
pub(crate) fn find_keyword_from_end(query: &str, keyword: &str) -> Option<usize> {
    let lower = query.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let boundary = |i: usize| i >= bytes.len() || !(bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_');

    lower
        .rmatch_indices(keyword)
        .map(|(i, _)| i)
        .find(|&i| (i == 0 || boundary(i - 1)) && boundary(i + keyword.len()))
}
