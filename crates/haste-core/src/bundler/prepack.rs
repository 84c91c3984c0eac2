//! Prepacked bundles keep each module's dependency map instead of
//! rewriting requires, for an ahead-of-time linker.

use super::bundle::ModuleTransport;
use crate::error::{Error, Result};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Default)]
pub struct PrepackBundle {
    modules: Vec<ModuleTransport>,
    polyfills: Vec<String>,
    main_module_id: Option<String>,
    finalized: bool,
}

impl PrepackBundle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finalized {
            return Err(Error::internal("Attempted to modify a finalized prepack bundle"));
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

    /// # Errors
    /// Fails once the bundle is finalized.
    pub fn add_polyfill(&mut self, code: String) -> Result<()> {
        self.ensure_open()?;
        self.polyfills.push(code);
        Ok(())
    }

    /// # Errors
    /// Fails if called twice.
    pub fn finalize(&mut self, main_module_id: Option<String>) -> Result<()> {
        self.ensure_open()?;
        self.main_module_id = main_module_id;
        self.finalized = true;
        Ok(())
    }

    #[must_use]
    pub fn modules(&self) -> &[ModuleTransport] {
        &self.modules
    }

    #[must_use]
    pub fn polyfills(&self) -> &[String] {
        &self.polyfills
    }

    #[must_use]
    pub fn main_module_id(&self) -> Option<&str> {
        self.main_module_id.as_deref()
    }

    /// The linker input: modules by name with their dependency maps and
    /// unwrapped code, plus the polyfill sources in load order.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let modules: Map<String, Value> = self
            .modules
            .iter()
            .map(|m| {
                (
                    m.name.clone(),
                    json!({
                        "dependencies": m.dependencies,
                        "code": m.code,
                        "sourcePath": m.source_path,
                    }),
                )
            })
            .collect();
        json!({
            "modules": modules,
            "polyfills": self.polyfills,
            "mainModuleId": self.main_module_id,
        })
    }
}
