//! Purpose: Concurrency-safe registry of loaded packages, addressed by name.
//! Exports: `PackageManager`, `ApiResult`.
//! Role: Shared process-wide state behind the wire dispatcher and the CLI.
//! Invariants: A name maps to at most one live package at a time.
//! Invariants: The registry lock is held only to look a package up, never across a call.
//! Invariants: Removal is all-or-nothing: a package that refuses to close stays registered.
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::info;

use crate::core::error::{Error, ErrorKind};
use crate::core::module::Module;
use crate::core::package::{Package, PackageOptions};
use crate::core::value::Value;

pub type ApiResult<T> = Result<T, Error>;

pub struct PackageManager {
    packages: RwLock<HashMap<String, Arc<Package>>>,
    modules: Vec<Arc<dyn Module>>,
    options: PackageOptions,
}

impl PackageManager {
    pub fn new(modules: Vec<Arc<dyn Module>>) -> Self {
        Self {
            packages: RwLock::new(HashMap::new()),
            modules,
            options: PackageOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PackageOptions) -> Self {
        self.options = options;
        self
    }

    /// Calls `function` in package `name` with the given arguments.
    pub fn call(&self, name: &str, function: &str, args: &[Value]) -> ApiResult<Vec<Value>> {
        let package = self.package(name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!("unknown package '{name}'"))
        })?;
        package.call(function, args)
    }

    /// Loads the directory at `path` and registers it as `name`.
    pub fn add(&self, name: &str, path: impl AsRef<Path>) -> ApiResult<()> {
        let path = path.as_ref();
        let mut packages = self.write();
        if packages.contains_key(name) {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message(format!("package with name '{name}' already exists")));
        }

        let package = Package::load(path, &self.modules, self.options).map_err(|err| {
            let kind = err.kind();
            Error::wrap(kind, "failed to load package", err)
                .with_package(name)
                .with_path(path)
        })?;

        info!(package = name, path = %path.display(), files = package.files().len(), "package added");
        packages.insert(name.to_string(), Arc::new(package));
        Ok(())
    }

    /// Retires and unregisters `name`; unknown names are a no-op.
    /// Calls already queued on the package fail instead of running.
    pub fn remove(&self, name: &str) -> ApiResult<()> {
        let mut packages = self.write();
        let Some(package) = packages.get(name) else {
            return Ok(());
        };

        package.retire().map_err(|err| {
            let kind = err.kind();
            Error::wrap(kind, "failed to remove package", err).with_package(name)
        })?;

        packages.remove(name);
        info!(package = name, "package removed");
        Ok(())
    }

    /// Registered package names, in no particular order.
    pub fn list(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn package(&self, name: &str) -> Option<Arc<Package>> {
        self.read().get(name).cloned()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Package>>> {
        self.packages.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Package>>> {
        self.packages.write().unwrap_or_else(PoisonError::into_inner)
    }
}
