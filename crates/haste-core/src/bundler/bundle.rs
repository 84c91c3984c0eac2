//! The bundle artifact.

use super::source_map::{identity_map, indexed_map, line_count, Section};
use super::wrap::{require_call, WRAPPER_HEADER_LINES};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One module as emitted into a bundle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleTransport {
    /// Resolved module name (empty for polyfills).
    pub name: String,
    /// Final, wrapped code.
    pub code: String,
    /// Map for the unwrapped code, if the transformer produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map: Option<Value>,
    pub source_code: String,
    pub source_path: PathBuf,
    /// No file on disk backs this code.
    #[serde(rename = "virtual")]
    pub is_virtual: bool,
    /// Whether `code` carries the registration wrapper.
    #[serde(skip)]
    pub wrapped: bool,
    /// Specifier to resolved-name map, kept by prepacked bundles.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
}

/// Concatenated output of one build.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    modules: Vec<ModuleTransport>,
    assets: Vec<Value>,
    main_module_id: Option<String>,
    num_prepended: usize,
    source_map_url: Option<String>,
    finalized: bool,
}

impl Bundle {
    #[must_use]
    pub fn new(source_map_url: Option<String>) -> Self {
        Self {
            source_map_url,
            ..Self::default()
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finalized {
            return Err(Error::internal("Attempted to modify a finalized bundle"));
        }
        Ok(())
    }

    /// # Errors
    /// Fails once the bundle is finalized.
    pub fn add_module(&mut self, module: ModuleTransport) -> Result<()> {
        self.ensure_open()?;
        self.modules.push(module);
        Ok(())
    }

    /// Record an asset descriptor.
    pub fn add_asset(&mut self, asset: Value) {
        self.assets.push(asset);
    }

    pub fn set_main_module_id(&mut self, id: String) {
        self.main_module_id = Some(id);
    }

    pub fn set_num_prepended_modules(&mut self, n: usize) {
        self.num_prepended = n;
    }

    /// Append the invocation of the run-before modules and the main module.
    ///
    /// # Errors
    /// Fails if called twice.
    pub fn finalize(&mut self, run_main_module: bool, run_before_main: &[String]) -> Result<()> {
        self.ensure_open()?;
        if run_main_module {
            for id in run_before_main {
                self.add_require_call(id);
            }
            if let Some(main) = self.main_module_id.clone() {
                self.add_require_call(&main);
            }
        }
        self.finalized = true;
        Ok(())
    }

    fn add_require_call(&mut self, id: &str) {
        let code = require_call(id);
        let name = format!("require-{id}");
        self.modules.push(ModuleTransport {
            source_path: PathBuf::from(format!("{name}.js")),
            name,
            source_code: code.clone(),
            code,
            map: None,
            is_virtual: true,
            wrapped: false,
            dependencies: BTreeMap::new(),
        });
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    #[must_use]
    pub fn modules(&self) -> &[ModuleTransport] {
        &self.modules
    }

    #[must_use]
    pub fn assets(&self) -> &[Value] {
        &self.assets
    }

    #[must_use]
    pub fn main_module_id(&self) -> Option<&str> {
        self.main_module_id.as_deref()
    }

    #[must_use]
    pub fn num_prepended_modules(&self) -> usize {
        self.num_prepended
    }

    /// Paths of the modules backed by files.
    #[must_use]
    pub fn module_paths(&self) -> Vec<PathBuf> {
        self.modules
            .iter()
            .filter(|m| !m.is_virtual)
            .map(|m| m.source_path.clone())
            .collect()
    }

    /// The bundle source. With `inline_source_map` the map is appended as a
    /// data URL, otherwise the configured map URL is referenced.
    #[must_use]
    pub fn source(&self, inline_source_map: bool) -> String {
        let mut out = self
            .modules
            .iter()
            .map(|m| m.code.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        if inline_source_map {
            let map = self.source_map().to_string();
            out.push_str("\n//# sourceMappingURL=data:application/json;base64,");
            out.push_str(&BASE64.encode(map));
        } else if let Some(url) = &self.source_map_url {
            out.push_str("\n//# sourceMappingURL=");
            out.push_str(url);
        }
        out
    }

    /// Indexed source map with one section per file-backed module.
    #[must_use]
    pub fn source_map(&self) -> Value {
        let mut line = 0u32;
        let mut sections = Vec::new();
        for module in &self.modules {
            if !module.is_virtual {
                let header = if module.wrapped { WRAPPER_HEADER_LINES } else { 0 };
                let map = module
                    .map
                    .clone()
                    .unwrap_or_else(|| identity_map(&module.source_path, &module.source_code));
                sections.push(Section {
                    line: line + header,
                    map,
                });
            }
            line += line_count(&module.code);
        }
        indexed_map("bundle.js", &sections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(name: &str, code: &str, is_virtual: bool) -> ModuleTransport {
        ModuleTransport {
            name: name.into(),
            code: code.into(),
            map: None,
            source_code: code.into(),
            source_path: PathBuf::from(format!("/proj/{name}")),
            is_virtual,
            wrapped: false,
            dependencies: BTreeMap::new(),
        }
    }

    #[test]
    fn test_finalize_appends_require_calls() {
        let mut bundle = Bundle::new(None);
        bundle.add_module(transport("a.js", "a();", false)).unwrap();
        bundle.set_main_module_id("a.js".into());
        bundle.finalize(true, &["InitializeCore".to_string()]).unwrap();

        assert_eq!(
            bundle.source(false),
            "a();\n;require(\"InitializeCore\");\n;require(\"a.js\");"
        );
        assert!(bundle.add_module(transport("b.js", "", false)).is_err());
    }

    #[test]
    fn test_no_run_module() {
        let mut bundle = Bundle::new(Some("/index.map".into()));
        bundle.add_module(transport("a.js", "a();", false)).unwrap();
        bundle.set_main_module_id("a.js".into());
        bundle.finalize(false, &[]).unwrap();
        assert_eq!(bundle.source(false), "a();\n//# sourceMappingURL=/index.map");
    }

    #[test]
    fn test_source_map_skips_virtual_modules() {
        let mut bundle = Bundle::new(None);
        bundle.add_module(transport("poly", "p1\np2", true)).unwrap();
        bundle.add_module(transport("a.js", "a1\na2", false)).unwrap();
        bundle.set_main_module_id("a.js".into());
        bundle.finalize(true, &[]).unwrap();

        let map = bundle.source_map();
        let sections = map["sections"].as_array().unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0]["offset"]["line"], 2);
        assert_eq!(sections[0]["map"]["sources"][0], "/proj/a.js");
        assert_eq!(bundle.module_paths(), vec![PathBuf::from("/proj/a.js")]);
        assert!(bundle.source(true).contains("sourceMappingURL=data:application/json;base64,"));
    }
}
