// Host capability tables injected into every interpreter a package creates.
use std::sync::Arc;

/// A built host table, shareable across every engine of a package.
pub type SharedModule = rhai::Shared<rhai::Module>;

/// A named table of host functions, visible to scripts as `name::function(..)`.
///
/// Implementations own whatever state their functions share; the lifetime of
/// that state is the lifetime of the value handed to the package manager.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn exports(&self) -> rhai::Module;
}

/// Builds each module's table once so instances can share it.
pub fn build_exports(modules: &[Arc<dyn Module>]) -> Vec<(String, SharedModule)> {
    modules
        .iter()
        .map(|module| (module.name().to_string(), module.exports().into()))
        .collect()
}
