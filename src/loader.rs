//! Entry-script loading seam
//!
//! The worker subsystem does not own module resolution; it consumes a
//! single capability: turn a path string into an executable unit, once,
//! at worker startup. `ModuleLoader` is that seam. `ScriptRegistry` is
//! the in-memory implementation used by embedders and tests: scripts are
//! registered as entry-point factories under path-like names, so one
//! registered script can back any number of workers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::error::ScriptError;
use crate::runtime::WorkerScope;

/// Errors surfaced when an entry script cannot be produced
///
/// Load failures happen on the worker thread and reach the owner through
/// `onerror`, never as a synchronous construction failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("worker script not found: {0}")]
    NotFound(String),

    #[error("failed to load worker script '{path}': {reason}")]
    Parse { path: String, reason: String },
}

/// A worker's entry point, evaluated exactly once at Starting
///
/// The scope argument is the worker-side context object: it carries
/// `post_message`, `close` and the `onmessage`/`onerror`/`onclose` slots
/// that ambient globals would provide in a script runtime.
pub type EntryPoint = Box<dyn FnOnce(&WorkerScope) -> Result<(), ScriptError> + Send + 'static>;

/// Executable script code produced by the loader
pub struct ExecutableUnit {
    path: String,
    entry: EntryPoint,
}

impl ExecutableUnit {
    pub fn new(path: impl Into<String>, entry: EntryPoint) -> Self {
        Self {
            path: path.into(),
            entry,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn into_entry(self) -> EntryPoint {
        self.entry
    }
}

/// The module-resolution capability consumed by the worker subsystem
pub trait ModuleLoader: Send + Sync {
    fn resolve_and_load(&self, path: &str) -> Result<ExecutableUnit, LoadError>;
}

type EntryFactory = Box<dyn Fn() -> EntryPoint + Send + Sync>;

enum ScriptSource {
    Entry(EntryFactory),
    /// Registered but unparsable; resolves to a Parse error, the way a
    /// syntactically invalid script file would
    Invalid(String),
}

/// In-memory script store keyed by path
#[derive(Default)]
pub struct ScriptRegistry {
    scripts: RwLock<HashMap<String, ScriptSource>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry-point factory under a path. Last registration
    /// for a path wins.
    pub fn register<F>(&self, path: impl Into<String>, factory: F)
    where
        F: Fn() -> EntryPoint + Send + Sync + 'static,
    {
        self.scripts
            .write()
            .insert(path.into(), ScriptSource::Entry(Box::new(factory)));
    }

    /// Convenience for the common case of a shareable entry body
    pub fn register_fn<F>(&self, path: impl Into<String>, body: F)
    where
        F: Fn(&WorkerScope) -> Result<(), ScriptError> + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        self.register(path, move || {
            let body = Arc::clone(&body);
            Box::new(move |scope: &WorkerScope| body(scope)) as EntryPoint
        });
    }

    /// Register a path that resolves but cannot be parsed
    pub fn register_invalid(&self, path: impl Into<String>, reason: impl Into<String>) {
        self.scripts
            .write()
            .insert(path.into(), ScriptSource::Invalid(reason.into()));
    }
}

impl ModuleLoader for ScriptRegistry {
    fn resolve_and_load(&self, path: &str) -> Result<ExecutableUnit, LoadError> {
        let scripts = self.scripts.read();
        match scripts.get(path) {
            Some(ScriptSource::Entry(factory)) => Ok(ExecutableUnit::new(path, factory())),
            Some(ScriptSource::Invalid(reason)) => Err(LoadError::Parse {
                path: path.to_string(),
                reason: reason.clone(),
            }),
            None => Err(LoadError::NotFound(path.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_path_is_not_found() {
        let registry = ScriptRegistry::new();
        assert!(matches!(
            registry.resolve_and_load("./idonot-exist.js"),
            Err(LoadError::NotFound(path)) if path == "./idonot-exist.js"
        ));
    }

    #[test]
    fn invalid_script_is_a_parse_error() {
        let registry = ScriptRegistry::new();
        registry.register_invalid("./broken.js", "unexpected token");
        assert!(matches!(
            registry.resolve_and_load("./broken.js"),
            Err(LoadError::Parse { .. })
        ));
    }

    #[test]
    fn registered_script_resolves_repeatedly() {
        let registry = ScriptRegistry::new();
        registry.register_fn("./worker.js", |_| Ok(()));
        let first = registry.resolve_and_load("./worker.js").unwrap();
        assert_eq!(first.path(), "./worker.js");
        // a second worker can load the same script
        assert!(registry.resolve_and_load("./worker.js").is_ok());
    }
}
