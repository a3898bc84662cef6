//! Purpose: Built-in host modules scripts can reach as `mem::..` and `log::..`.
//! Exports: `MemModule`, `LogModule`.
//! Role: Explicitly constructed capabilities handed to `PackageManager::new`.
//! Invariants: One `MemModule` value (and its clones) is one shared cache.
//! Invariants: The cache lock is independent of pool and registry locks.
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rhai::{Dynamic, EvalAltResult, ImmutableString};

use crate::core::module::Module;

/// In-memory key/value cache shared by every interpreter it is injected into.
#[derive(Clone, Default)]
pub struct MemModule {
    entries: Arc<RwLock<HashMap<String, Dynamic>>>,
}

impl MemModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Dynamic> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Dynamic) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Module for MemModule {
    fn name(&self) -> &str {
        "mem"
    }

    fn exports(&self) -> rhai::Module {
        let mut module = rhai::Module::new();

        let cache = self.clone();
        module.set_native_fn(
            "set",
            move |key: ImmutableString, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
                cache.set(key.as_str(), value);
                Ok(())
            },
        );

        let cache = self.clone();
        module.set_native_fn(
            "get",
            move |key: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
                Ok(cache.get(key.as_str()).unwrap_or(Dynamic::UNIT))
            },
        );

        module
    }
}

/// Routes script diagnostics into the host's tracing subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogModule;

impl Module for LogModule {
    fn name(&self) -> &str {
        "log"
    }

    fn exports(&self) -> rhai::Module {
        let mut module = rhai::Module::new();
        module.set_native_fn("trace", |message: Dynamic| -> Result<(), Box<EvalAltResult>> {
            tracing::trace!(target: "gedis::script", "{message}");
            Ok(())
        });
        module.set_native_fn("info", |message: Dynamic| -> Result<(), Box<EvalAltResult>> {
            tracing::info!(target: "gedis::script", "{message}");
            Ok(())
        });
        module.set_native_fn("warn", |message: Dynamic| -> Result<(), Box<EvalAltResult>> {
            tracing::warn!(target: "gedis::script", "{message}");
            Ok(())
        });
        module.set_native_fn("error", |message: Dynamic| -> Result<(), Box<EvalAltResult>> {
            tracing::error!(target: "gedis::script", "{message}");
            Ok(())
        });
        module
    }
}
