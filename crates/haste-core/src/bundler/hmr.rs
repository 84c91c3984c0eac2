//! Hot-update patches.

use super::bundle::ModuleTransport;

/// Accept patches for the modules that changed, in request order.
#[derive(Debug, Clone, Default)]
pub struct HmrBundle {
    modules: Vec<ModuleTransport>,
}

impl HmrBundle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_module(&mut self, module: ModuleTransport) {
        self.modules.push(module);
    }

    #[must_use]
    pub fn modules(&self) -> &[ModuleTransport] {
        &self.modules
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    #[must_use]
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    #[must_use]
    pub fn source(&self) -> String {
        self.modules
            .iter()
            .map(|m| m.code.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
