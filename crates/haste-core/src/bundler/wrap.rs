//! Module wrapping and require rewriting.

use regex_lite::{Captures, Regex};
use rustc_hash::FxHashMap;
use std::sync::OnceLock;

const MODULE_ARGS: &str = "global, require, module, exports";

fn specifier_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |p: &str| {
            Regex::new(p).unwrap_or_else(|e| panic!("BUG: invalid specifier pattern {p}: {e}"))
        };
        [
            compile(r#"(\bimport\s+(?:[^'"]+\s+from\s+)??)(['"])([^'"]+)(['"])"#),
            compile(r#"(\bexport\s+(?:[^'"]+\s+from\s+)??)(['"])([^'"]+)(['"])"#),
            compile(r#"(\brequire\s*?\(\s*?)(['"])([^'"]+)(['"]\s*?\))"#),
        ]
    })
}

/// Rewrite every static `import`, `export ... from` and `require` specifier
/// found in `resolved` to its resolved module name. Unknown specifiers are
/// left untouched.
#[must_use]
pub fn resolve_requires(code: &str, resolved: &FxHashMap<String, String>) -> String {
    if resolved.is_empty() {
        return code.to_string();
    }
    let mut code = code.to_string();
    for pattern in specifier_patterns() {
        code = pattern
            .replace_all(&code, |caps: &Captures<'_>| match resolved.get(&caps[3]) {
                Some(id) => format!("{}{}{}{}", &caps[1], &caps[2], id, &caps[4]),
                None => caps[0].to_string(),
            })
            .into_owned();
    }
    code
}

fn indent(code: &str) -> String {
    code.split('\n')
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn quote(name: &str) -> String {
    serde_json::to_string(name).unwrap_or_else(|_| format!("\"{name}\""))
}

/// Wrap a module in its registration call.
#[must_use]
pub fn define_module(name: &str, code: &str) -> String {
    format!(
        "__d({}, function({MODULE_ARGS}) {{\n{}\n}});",
        quote(name),
        indent(code)
    )
}

/// Wrap a hot-update patch for one module.
#[must_use]
pub fn accept_module(name: &str, code: &str) -> String {
    format!(
        "__accept({}, function({MODULE_ARGS}) {{\n{}\n}});",
        quote(name),
        indent(code)
    )
}

/// Polyfills run in the global scope, not as registered modules.
#[must_use]
pub fn wrap_polyfill(code: &str) -> String {
    format!(
        "(function(global) {{\n{code}\n}})(typeof global !== 'undefined' ? global : typeof self !== 'undefined' ? self : this);"
    )
}

/// Statement invoking a registered module.
#[must_use]
pub fn require_call(id: &str) -> String {
    format!(";require({});", quote(id))
}

/// Lines added above the module body by [`define_module`].
pub const WRAPPER_HEADER_LINES: u32 = 1;
