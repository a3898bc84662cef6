//! Purpose: Load a package directory once and serve calls from pooled interpreters.
//! Exports: `Package`, `PackageOptions`, `compile_dir`, `check_dir`, `DEFAULT_POOL_SIZE`.
//! Role: Compile-once, instantiate-many bundle behind the package manager.
//! Invariants: Every instance replays the same units in file-name order before use.
//! Invariants: A loan is returned to the pool on every exit path of `call`.
//! Invariants: `close` refuses while any instance is borrowed.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::interpreter::{Interpreter, Unit, compile_file, new_engine};
use crate::core::module::{Module, SharedModule, build_exports};
use crate::core::pool::{Pool, PoolOptions, PoolStats};
use crate::core::value::Value;

pub const DEFAULT_POOL_SIZE: usize = 50;

#[derive(Clone, Copy, Debug)]
pub struct PackageOptions {
    pub pool_size: usize,
}

impl PackageOptions {
    pub fn new(pool_size: usize) -> Self {
        Self { pool_size }
    }
}

impl Default for PackageOptions {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

pub struct Package {
    path: PathBuf,
    units: Arc<Vec<Unit>>,
    pool: Pool<Interpreter>,
}

impl Package {
    pub fn load(
        path: impl AsRef<Path>,
        modules: &[Arc<dyn Module>],
        options: PackageOptions,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let exports = build_exports(modules);
        let units = Arc::new(compile_dir(&path, &exports)?);
        debug!(path = %path.display(), files = units.len(), "compiled package");

        let pool = {
            let units = Arc::clone(&units);
            Pool::new(PoolOptions::new(options.pool_size), move || {
                open_interpreter(&exports, &units)
            })?
        };

        Ok(Self { path, units, pool })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn files(&self) -> Vec<&Path> {
        self.units.iter().map(Unit::path).collect()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Blocks for an instance when the pool is exhausted.
    pub fn call(&self, function: &str, args: &[Value]) -> Result<Vec<Value>, Error> {
        let mut interpreter = self.pool.get().map_err(|err| match err.kind() {
            ErrorKind::NotFound => Error::wrap(ErrorKind::NotFound, "package removed", err),
            _ => err,
        })?;
        interpreter.call(function, args)
    }

    pub fn close(&self) -> Result<(), Error> {
        self.pool.close()
    }

    /// Closes the package for good; pending and later calls fail with `NotFound`.
    pub fn retire(&self) -> Result<(), Error> {
        self.pool.retire()
    }
}

/// Compiles every regular file directly inside `path`, sorted by file name.
/// Subdirectories are skipped; the first failing file aborts the load.
pub fn compile_dir(path: &Path, exports: &[(String, SharedModule)]) -> Result<Vec<Unit>, Error> {
    let entries = std::fs::read_dir(path).map_err(|err| {
        Error::new(map_io_error_kind(&err))
            .with_message("failed to list package directory")
            .with_path(path)
            .with_source(err)
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read package directory entry")
                .with_path(path)
                .with_source(err)
        })?;
        let file = entry.path();
        if file.is_dir() {
            continue;
        }
        files.push(file);
    }
    files.sort();

    let engine = new_engine(exports);
    files
        .iter()
        .map(|file| compile_file(&engine, file))
        .collect()
}

/// Compiles the package at `path` without creating an interpreter.
/// Returns the files a load would replay, in load order.
pub fn check_dir(path: &Path, modules: &[Arc<dyn Module>]) -> Result<Vec<PathBuf>, Error> {
    let units = compile_dir(path, &build_exports(modules))?;
    Ok(units.iter().map(|unit| unit.path().to_path_buf()).collect())
}

fn open_interpreter(
    exports: &[(String, SharedModule)],
    units: &[Unit],
) -> Result<Interpreter, Error> {
    let mut interpreter = Interpreter::new(exports);
    for unit in units {
        interpreter
            .load(unit)
            .map_err(|err| Error::wrap(ErrorKind::Script, "failed to preload package files", err))?;
    }
    Ok(interpreter)
}

fn map_io_error_kind(err: &std::io::Error) -> ErrorKind {
    match err.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::{Package, PackageOptions, check_dir};
    use crate::core::error::ErrorKind;
    use crate::core::module::Module;
    use crate::core::value::Value;
    use rhai::EvalAltResult;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;

    struct Constants;

    impl Module for Constants {
        fn name(&self) -> &str {
            "consts"
        }

        fn exports(&self) -> rhai::Module {
            let mut module = rhai::Module::new();
            module.set_native_fn("answer", || Ok::<_, Box<EvalAltResult>>(42_i64));
            module
        }
    }

    fn write(dir: &Path, name: &str, source: &str) {
        fs::write(dir.join(name), source).expect("write");
    }

    #[test]
    fn files_load_in_name_order_and_share_functions() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "a_util.rhai", "fn double(x) { x * 2 }");
        write(dir.path(), "b_main.rhai", "fn quad(x) { double(double(x)) }");
        fs::create_dir(dir.path().join("nested")).expect("mkdir");

        let package = Package::load(dir.path(), &[], PackageOptions::default()).expect("load");
        assert_eq!(package.files().len(), 2);
        assert_eq!(
            package.call("quad", &[Value::from(3)]).expect("call"),
            vec![Value::Int(12)]
        );
    }

    #[test]
    fn compile_error_names_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "broken.rhai", "fn oops( {");

        let err = Package::load(dir.path(), &[], PackageOptions::default())
            .err()
            .expect("expected compile error");
        assert_eq!(err.kind(), ErrorKind::Compile);
        assert!(err.path().expect("path").ends_with("broken.rhai"));
    }

    #[test]
    fn missing_directory_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Package::load(dir.path().join("absent"), &[], PackageOptions::default())
            .err()
            .expect("expected error");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn top_level_failure_surfaces_on_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "main.rhai", "throw \"init failed\";\nfn ping() { 1 }");

        let package = Package::load(dir.path(), &[], PackageOptions::default()).expect("load");
        let err = package.call("ping", &[]).expect_err("expected error");
        assert_eq!(err.kind(), ErrorKind::Script);
        assert!(err.chain_message().contains("init failed"));
        assert_eq!(package.stats().borrowed, 0);
    }

    #[test]
    fn modules_are_visible_to_scripts() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "main.rhai", "fn answer() { consts::answer() }");
        let modules: Vec<Arc<dyn Module>> = vec![Arc::new(Constants)];

        let package = Package::load(dir.path(), &modules, PackageOptions::default()).expect("load");
        assert_eq!(package.call("answer", &[]).expect("call"), vec![Value::Int(42)]);
    }

    #[test]
    fn concurrent_calls_share_a_small_pool() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "main.rhai", "fn add(a, b) { a + b }");
        let package =
            Arc::new(Package::load(dir.path(), &[], PackageOptions::new(2)).expect("load"));

        let mut workers = Vec::new();
        for i in 0..16_i64 {
            let package = Arc::clone(&package);
            workers.push(thread::spawn(move || {
                package
                    .call("add", &[Value::from(i), Value::from(1)])
                    .expect("call")
            }));
        }
        for (i, worker) in workers.into_iter().enumerate() {
            assert_eq!(worker.join().expect("join"), vec![Value::Int(i as i64 + 1)]);
        }

        let stats = package.stats();
        assert_eq!(stats.borrowed, 0);
        assert!(stats.idle <= 2);
    }

    #[test]
    fn close_is_repeatable_when_idle() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "main.rhai", "fn one() { 1 }");
        let package = Package::load(dir.path(), &[], PackageOptions::default()).expect("load");

        package.call("one", &[]).expect("call");
        package.close().expect("close");
        package.close().expect("close again");
        assert_eq!(package.call("one", &[]).expect("call"), vec![Value::Int(1)]);
    }

    #[test]
    fn retired_package_refuses_calls() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "main.rhai", "fn one() { 1 }");
        let package = Package::load(dir.path(), &[], PackageOptions::default()).expect("load");

        package.call("one", &[]).expect("call");
        package.retire().expect("retire");
        let err = package.call("one", &[]).expect_err("expected error");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("package removed"));
        assert_eq!(package.stats().idle, 0);
    }

    #[test]
    fn check_lists_files_without_running_them() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "b.rhai", "throw \"never runs\";");
        write(dir.path(), "a.rhai", "fn one() { 1 }");

        let files = check_dir(dir.path(), &[]).expect("check");
        let names: Vec<_> = files
            .iter()
            .map(|file| file.file_name().expect("name").to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.rhai", "b.rhai"]);
    }
}
