//! Built-in polyfill chain prepended to every bundle.

use crate::error::{Error, Result};
use crate::registry::{Module, ModuleCache};
use haste_util::fs::read_to_string_lossy;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Virtual directory the built-in polyfills live under.
pub const POLYFILL_DIR: &str = "/__haste__/polyfills";

const PRELUDE_DEV: (&str, &str) = ("prelude_dev.js", include_str!("../../polyfills/prelude_dev.js"));
const PRELUDE: (&str, &str) = ("prelude.js", include_str!("../../polyfills/prelude.js"));
const REQUIRE: (&str, &str) = ("require.js", include_str!("../../polyfills/require.js"));
const REQUIRE_UNBUNDLE: (&str, &str) = (
    "require-unbundle.js",
    include_str!("../../polyfills/require-unbundle.js"),
);

const LANGUAGE: &[(&str, &str)] = &[
    ("polyfills.js", include_str!("../../polyfills/polyfills.js")),
    ("error-guard.js", include_str!("../../polyfills/error-guard.js")),
    (
        "String.prototype.es6.js",
        include_str!("../../polyfills/String.prototype.es6.js"),
    ),
    (
        "Array.prototype.es6.js",
        include_str!("../../polyfills/Array.prototype.es6.js"),
    ),
    ("Array.es6.js", include_str!("../../polyfills/Array.es6.js")),
    ("babelHelpers.js", include_str!("../../polyfills/babelHelpers.js")),
];

/// Build the polyfill modules for one dev/unbundle mode, in load order.
///
/// The chain is the prelude, the module system, the language polyfills and
/// then `extra` files. Each polyfill depends on every earlier one.
///
/// # Errors
/// Fails if an extra polyfill file cannot be read.
pub fn polyfill_modules(
    registry: &ModuleCache,
    dev: bool,
    unbundle: bool,
    extra: &[PathBuf],
) -> Result<Vec<Arc<Module>>> {
    let mut sources: Vec<(PathBuf, Arc<str>)> = Vec::with_capacity(LANGUAGE.len() + 2 + extra.len());
    let prelude = if dev { PRELUDE_DEV } else { PRELUDE };
    let system = if unbundle { REQUIRE_UNBUNDLE } else { REQUIRE };
    for (name, code) in [prelude, system].iter().chain(LANGUAGE) {
        sources.push((Path::new(POLYFILL_DIR).join(name), Arc::from(*code)));
    }
    for path in extra {
        let code = match registry.vfs().read_file(path) {
            Ok(code) => code,
            Err(_) => Arc::from(read_to_string_lossy(path).map_err(|e| {
                Error::internal(format!("Failed to read polyfill {}: {e}", path.display()))
            })?),
        };
        sources.push((path.clone(), code));
    }

    let mut ids: Vec<String> = Vec::with_capacity(sources.len());
    let mut modules = Vec::with_capacity(sources.len());
    for (path, code) in sources {
        let id = path.to_string_lossy().into_owned();
        modules.push(registry.create_polyfill(&path, &id, ids.clone(), code));
        ids.push(id);
    }
    Ok(modules)
}
