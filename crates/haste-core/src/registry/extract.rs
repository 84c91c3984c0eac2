//! Require/import specifier extraction.
//!
//! Scans source text for dependency specifiers without parsing it.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Dependency names declared by one module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedDeps {
    /// Static dependencies, first-appearance order, deduplicated.
    pub sync: Vec<String>,
    /// One group per dynamic `import()` / `System.import()` site.
    pub async_groups: Vec<Vec<String>>,
}

/// Pluggable dependency extractor.
pub trait RequireExtractor: Send + Sync + Debug {
    fn extract(&self, source: &str) -> ExtractedDeps;
}

/// Lexical scanner for `require`, `import` and `export ... from`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExtractor;

impl RequireExtractor for DefaultExtractor {
    fn extract(&self, source: &str) -> ExtractedDeps {
        extract_requires(source)
    }
}

/// Scan `source` for dependency specifiers, skipping comments.
#[must_use]
pub fn extract_requires(source: &str) -> ExtractedDeps {
    let chars: Vec<char> = source.chars().collect();
    let len = chars.len();
    let mut deps = ExtractedDeps::default();
    let mut seen_sync = FxHashSet::default();
    let mut seen_async = FxHashSet::default();
    let mut i = 0;

    let mut push_sync = |spec: String, deps: &mut ExtractedDeps| {
        if !spec.is_empty() && seen_sync.insert(spec.clone()) {
            deps.sync.push(spec);
        }
    };

    while i < len {
        if chars[i] == '/' && i + 1 < len && chars[i + 1] == '/' {
            while i < len && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if chars[i] == '/' && i + 1 < len && chars[i + 1] == '*' {
            i += 2;
            while i + 1 < len && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            i += 2;
            continue;
        }

        if is_keyword_at(&chars, i, "import") {
            let after = skip_ws(&chars, i + 6);
            if after < len && chars[after] == '(' {
                if let Some((spec, end)) = string_arg(&chars, after + 1) {
                    if !spec.is_empty() && seen_async.insert(spec.clone()) {
                        deps.async_groups.push(vec![spec]);
                    }
                    i = end;
                    continue;
                }
            } else if !preceded_by_dot(&chars, i) {
                if let Some((spec, end)) = import_statement(&chars, after) {
                    push_sync(spec, &mut deps);
                    i = end;
                    continue;
                }
            }
            i += 6;
            continue;
        }

        if is_keyword_at(&chars, i, "export") {
            if let Some((spec, end)) = export_from(&chars, i + 6) {
                push_sync(spec, &mut deps);
                i = end;
                continue;
            }
            i += 6;
            continue;
        }

        if is_keyword_at(&chars, i, "require") && !preceded_by_dot(&chars, i) {
            let after = skip_ws(&chars, i + 7);
            if after < len && chars[after] == '(' {
                if let Some((spec, end)) = string_arg(&chars, after + 1) {
                    push_sync(spec, &mut deps);
                    i = end;
                    continue;
                }
            }
            i += 7;
            continue;
        }

        i += 1;
    }

    deps
}

fn is_keyword_at(chars: &[char], pos: usize, keyword: &str) -> bool {
    let kw: Vec<char> = keyword.chars().collect();
    if pos + kw.len() > chars.len() {
        return false;
    }
    if pos > 0 && is_ident(chars[pos - 1]) {
        return false;
    }
    if chars[pos..pos + kw.len()] != kw[..] {
        return false;
    }
    !(pos + kw.len() < chars.len() && is_ident(chars[pos + kw.len()]))
}

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// `foo.require(...)` is a method call; `System.import(...)` is still dynamic.
fn preceded_by_dot(chars: &[char], pos: usize) -> bool {
    pos > 0 && chars[pos - 1] == '.'
}

fn skip_ws(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

fn is_quote(c: char) -> bool {
    c == '"' || c == '\''
}

/// A quoted literal starting at `i`. Returns the content and the index past
/// the closing quote.
fn quoted(chars: &[char], i: usize) -> Option<(String, usize)> {
    let quote = *chars.get(i)?;
    if !is_quote(quote) {
        return None;
    }
    let mut j = i + 1;
    let mut out = String::new();
    while j < chars.len() && chars[j] != quote {
        if chars[j] == '\n' {
            return None;
        }
        if chars[j] == '\\' && j + 1 < chars.len() {
            out.push(chars[j + 1]);
            j += 2;
            continue;
        }
        out.push(chars[j]);
        j += 1;
    }
    if j >= chars.len() {
        return None;
    }
    Some((out, j + 1))
}

/// `( 'spec' )` with the opening paren already consumed.
fn string_arg(chars: &[char], start: usize) -> Option<(String, usize)> {
    let i = skip_ws(chars, start);
    let (spec, end) = quoted(chars, i)?;
    let close = skip_ws(chars, end);
    if close < chars.len() && chars[close] == ')' {
        Some((spec, close + 1))
    } else {
        None
    }
}

/// `import x from 'spec'`, `import {a} from 'spec'` or `import 'spec'`.
fn import_statement(chars: &[char], start: usize) -> Option<(String, usize)> {
    if let Some(found) = quoted(chars, start) {
        return Some(found);
    }
    let limit = (start + 1000).min(chars.len());
    let mut i = start;
    while i < limit {
        if chars[i] == ';' || is_quote(chars[i]) {
            return None;
        }
        if is_keyword_at(chars, i, "from") {
            return quoted(chars, skip_ws(chars, i + 4));
        }
        i += 1;
    }
    None
}

/// `export ... from 'spec'`, stopping at the end of the statement.
fn export_from(chars: &[char], start: usize) -> Option<(String, usize)> {
    let limit = (start + 500).min(chars.len());
    let mut i = start;
    while i < limit {
        if chars[i] == ';' || is_quote(chars[i]) || chars[i] == '=' || chars[i] == '(' {
            return None;
        }
        if is_keyword_at(chars, i, "from") {
            return quoted(chars, skip_ws(chars, i + 4));
        }
        i += 1;
    }
    None
}
