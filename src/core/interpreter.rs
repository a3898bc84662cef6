//! Purpose: Wrap one embedded rhai engine as a poolable interpreter instance.
//! Exports: `Unit`, `Interpreter`, `compile_file`, `to_dynamic`, `from_dynamic`.
//! Role: Engine boundary for packages: compile once, load units into fresh
//!       instances, call script functions, marshal values both ways.
//! Invariants: A unit is compiled once and may be loaded into any number of instances.
//! Invariants: Every call leaves the instance scope at its post-load length.
//! Invariants: `unpack([..])` is the only way a function yields more than one result.
use std::path::{Path, PathBuf};

use rhai::{AST, Array, CallFnOptions, Dynamic, Engine, ImmutableString, Map, Scope};
use tracing::trace;

use crate::core::error::{Error, ErrorKind};
use crate::core::module::SharedModule;
use crate::core::pool::Instance;
use crate::core::value::Value;

/// Compiled, instance-independent form of one source file.
#[derive(Clone, Debug)]
pub struct Unit {
    path: PathBuf,
    ast: AST,
}

impl Unit {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Marker produced by the script-side `unpack` helper.
#[derive(Clone, Debug)]
struct Unpack(Array);

/// Builds an engine with the host helpers plus the given static modules.
pub fn new_engine(modules: &[(String, SharedModule)]) -> Engine {
    let mut engine = Engine::new();
    engine.register_type_with_name::<Unpack>("Unpack");
    engine.register_fn("unpack", |values: Array| Unpack(values));
    for (name, module) in modules {
        engine.register_static_module(name.as_str(), module.clone());
    }
    engine
}

pub fn compile_file(engine: &Engine, path: &Path) -> Result<Unit, Error> {
    let source = std::fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read source file")
            .with_path(path)
            .with_source(err)
    })?;
    let mut ast = engine.compile(&source).map_err(|err| {
        Error::new(ErrorKind::Compile)
            .with_message(format!("failed to compile file: {err}"))
            .with_path(path)
            .with_source(err)
    })?;
    ast.set_source(path.to_string_lossy().as_ref());
    Ok(Unit {
        path: path.to_path_buf(),
        ast,
    })
}

pub struct Interpreter {
    engine: Engine,
    scope: Scope<'static>,
    functions: AST,
    base: usize,
}

impl Interpreter {
    pub fn new(modules: &[(String, SharedModule)]) -> Self {
        Self {
            engine: new_engine(modules),
            scope: Scope::new(),
            functions: AST::empty(),
            base: 0,
        }
    }

    /// Runs the unit's top-level code against this instance; its functions
    /// become callable and shadow earlier definitions with the same name.
    pub fn load(&mut self, unit: &Unit) -> Result<(), Error> {
        let program = self.functions.merge(&unit.ast);
        self.engine
            .run_ast_with_scope(&mut self.scope, &program)
            .map_err(|err| {
                Error::new(ErrorKind::Script)
                    .with_message(format!("failed to run top-level code: {err}"))
                    .with_path(&unit.path)
                    .with_source(err)
            })?;
        self.functions.combine(unit.ast.clone_functions_only());
        self.base = self.scope.len();
        Ok(())
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.iter_functions().any(|func| func.name == name)
    }

    /// Calls a script function, returning every result in order.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, Error> {
        if !self.has_function(name) {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message(format!("unknown function '{name}'")));
        }
        let args: Vec<Dynamic> = args.iter().map(to_dynamic).collect();
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let returned = self
            .engine
            .call_fn_with_options::<Dynamic>(options, &mut self.scope, &self.functions, name, args)
            .map_err(|err| {
                Error::new(ErrorKind::Script)
                    .with_message(format!("call to '{name}' failed: {err}"))
                    .with_source(err)
            })?;
        results(returned)
    }
}

impl Instance for Interpreter {
    fn reset(&mut self) {
        self.scope.rewind(self.base);
    }

    fn close(self) {
        trace!(functions = self.functions.iter_functions().count(), "closing interpreter");
    }
}

fn results(returned: Dynamic) -> Result<Vec<Value>, Error> {
    if returned.is::<()>() {
        return Ok(Vec::new());
    }
    if returned.is::<Unpack>() {
        let Unpack(values) = returned.cast::<Unpack>();
        return values.into_iter().map(from_dynamic).collect();
    }
    Ok(vec![from_dynamic(returned)?])
}

/// Host -> engine. Integers that fit `i64` stay integers; all other numbers
/// become floats. Records keep exported fields only, in snake case.
pub fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Nil => Dynamic::UNIT,
        Value::Bool(value) => Dynamic::from(*value),
        Value::Int(value) => Dynamic::from(*value),
        Value::UInt(value) => match i64::try_from(*value) {
            Ok(value) => Dynamic::from(value),
            Err(_) => Dynamic::from(*value as f64),
        },
        Value::Float(value) => Dynamic::from(*value),
        Value::Str(value) => Dynamic::from(value.clone()),
        Value::Seq(items) => {
            let array: Array = items.iter().map(to_dynamic).collect();
            Dynamic::from(array)
        }
        Value::Map(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(key.as_str().into(), to_dynamic(value));
            }
            Dynamic::from(map)
        }
        Value::Record(record) => {
            let mut map = Map::new();
            for (key, value) in record.exported() {
                map.insert(key.into(), to_dynamic(value));
            }
            Dynamic::from(map)
        }
    }
}

/// Engine -> host. Values with no host counterpart fail the call.
pub fn from_dynamic(value: Dynamic) -> Result<Value, Error> {
    let value = value.flatten();
    if value.is::<()>() {
        return Ok(Value::Nil);
    }
    if let Ok(flag) = value.as_bool() {
        return Ok(Value::Bool(flag));
    }
    if let Ok(number) = value.as_int() {
        return Ok(Value::Int(number));
    }
    if let Ok(number) = value.as_float() {
        return Ok(Value::Float(number));
    }
    if let Ok(ch) = value.as_char() {
        return Ok(Value::Str(ch.to_string()));
    }
    if value.is::<ImmutableString>() {
        let type_name = value.type_name();
        return value.into_string().map(Value::Str).map_err(|_| unsupported(type_name));
    }
    if value.is::<Array>() {
        let type_name = value.type_name();
        let items = value.into_array().map_err(|_| unsupported(type_name))?;
        return items
            .into_iter()
            .map(from_dynamic)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Seq);
    }
    if value.is::<Map>() {
        let type_name = value.type_name();
        let entries = value.try_cast::<Map>().ok_or_else(|| unsupported(type_name))?;
        let mut out = indexmap::IndexMap::with_capacity(entries.len());
        for (key, value) in entries {
            out.insert(key.to_string(), from_dynamic(value)?);
        }
        return Ok(Value::Map(out));
    }
    Err(unsupported(value.type_name()))
}

fn unsupported(type_name: &str) -> Error {
    Error::new(ErrorKind::Script)
        .with_message(format!("unsupported return value of type '{type_name}'"))
}
