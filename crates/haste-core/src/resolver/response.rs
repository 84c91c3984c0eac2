use crate::error::{Error, Result};
use crate::registry::{Module, ModuleId};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Result of one dependency traversal.
///
/// Mutable while the traversal runs; [`ResolutionResponse::finalize`]
/// freezes it and every later mutation is an internal error.
#[derive(Debug, Default)]
pub struct ResolutionResponse {
    pub dependencies: Vec<Arc<Module>>,
    pub async_dependencies: Vec<Vec<PathBuf>>,
    pub main_module_id: Option<String>,
    pub mocks: BTreeMap<String, PathBuf>,
    pub num_prepended_dependencies: usize,
    pub warnings: Vec<String>,
    resolved_pairs: FxHashMap<ModuleId, Vec<(String, Arc<Module>)>>,
    finalized: bool,
}

impl ResolutionResponse {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finalized {
            return Err(Error::internal("Attempted to mutate a finalized response"));
        }
        Ok(())
    }

    /// # Errors
    /// Fails once the response is finalized.
    pub fn push_dependency(&mut self, module: Arc<Module>) -> Result<()> {
        self.ensure_open()?;
        self.dependencies.push(module);
        Ok(())
    }

    /// Insert at the front; counted as prepended (polyfills).
    ///
    /// # Errors
    /// Fails once the response is finalized.
    pub fn prepend_dependency(&mut self, module: Arc<Module>) -> Result<()> {
        self.ensure_open()?;
        self.dependencies.insert(0, module);
        self.num_prepended_dependencies += 1;
        Ok(())
    }

    /// # Errors
    /// Fails once the response is finalized.
    pub fn push_async_dependency(&mut self, group: Vec<PathBuf>) -> Result<()> {
        self.ensure_open()?;
        self.async_dependencies.push(group);
        Ok(())
    }

    /// # Errors
    /// Fails once the response is finalized.
    pub fn set_resolved_pairs(&mut self, module: &Module, pairs: Vec<(String, Arc<Module>)>) -> Result<()> {
        self.ensure_open()?;
        self.resolved_pairs.insert(module.id, pairs);
        Ok(())
    }

    /// # Errors
    /// Fails once the response is finalized.
    pub fn set_mocks(&mut self, mocks: BTreeMap<String, PathBuf>) -> Result<()> {
        self.ensure_open()?;
        self.mocks = mocks;
        Ok(())
    }

    /// # Errors
    /// Fails once the response is finalized.
    pub fn set_main_module_id(&mut self, id: String) -> Result<()> {
        self.ensure_open()?;
        self.main_module_id = Some(id);
        Ok(())
    }

    /// # Errors
    /// Fails if called twice.
    pub fn finalize(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.finalized = true;
        Ok(())
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// `(name, module)` pairs resolved from `module`, in declaration order.
    #[must_use]
    pub fn resolved_dependency_pairs(&self, module: &Module) -> &[(String, Arc<Module>)] {
        self.resolved_pairs
            .get(&module.id)
            .map_or(&[], Vec::as_slice)
    }

    /// Absolute paths of every module, in bundle order.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.dependencies.iter().map(|m| m.path.clone()).collect()
    }
}
