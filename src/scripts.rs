use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail, Context, Result};
use rhai::module_resolvers::{FileModuleResolver, ModuleResolversCollection};
use rhai::{Array, CallFnOptions, Dynamic, Engine, EvalAltResult, FnPtr, Module, Position, Scope, AST, INT};

use crate::bridge::BridgeContext;
use crate::config::BridgeConfig;
use crate::marshal::{DispatchEvent, DISPATCH_SLOTS, SYSCALL_ARG_SLOTS, VM_DISPATCH_ARGS};
use crate::registry::{DispatchTarget, TargetReply};
use crate::sequencer::{EntryReturn, ScriptRuntime};
use crate::syscall::SyscallPort;

pub const SCRIPT_EXTENSION: &str = "rhai";

/// Interpreter state shared between the runtime and the targets it hands out.
struct ScriptCore {
    engine: Engine,
    /// AST of the entry module; dispatch targets are called against it.
    entry_ast: RefCell<Rc<AST>>,
}

impl ScriptCore {
    fn entry_ast(&self) -> Rc<AST> {
        self.entry_ast.borrow().clone()
    }
}

/// Rhai-backed script runtime.
#[derive(Default)]
pub struct RhaiRuntime {
    core: Option<Rc<ScriptCore>>,
    search_paths: Vec<PathBuf>,
}

/// A loaded and executed script module.
#[derive(Debug)]
pub struct ScriptModule {
    ast: Rc<AST>,
    scope: Scope<'static>,
}

#[derive(Debug)]
pub enum ScriptFunction {
    /// `fn name() { ... }` defined in the module.
    Defined { name: String, ast: Rc<AST> },
    /// A top-level variable holding a function pointer or closure.
    Bound(FnPtr),
}

impl RhaiRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.core.is_some()
    }

    /// Drops the interpreter. Targets still registered afterwards fail when invoked.
    pub fn shutdown(&mut self) {
        if self.core.take().is_some() {
            log::debug!("script runtime shut down");
        }
    }

    fn core(&self) -> Result<&Rc<ScriptCore>> {
        self.core.as_ref().ok_or_else(|| anyhow!("script runtime has not been started"))
    }

    /// Finds `pkg.sub` as `<search path>/pkg/sub.rhai`, first match wins.
    pub fn locate_module(&self, name: &str) -> Result<PathBuf> {
        let relative = module_relative_path(name)?;
        self.search_paths
            .iter()
            .map(|dir| dir.join(&relative))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                let searched =
                    self.search_paths.iter().map(|dir| dir.display().to_string()).collect::<Vec<_>>().join(", ");
                anyhow!("no module named '{name}' (searched: {searched})")
            })
    }

    fn make_target(&self, fn_ptr: FnPtr) -> Result<Rc<dyn DispatchTarget>> {
        let core = self.core()?;
        Ok(Rc::new(ScriptTarget::new(fn_ptr, Rc::downgrade(core))))
    }
}

impl ScriptRuntime for RhaiRuntime {
    type Module = ScriptModule;
    type Function = ScriptFunction;

    fn start(&mut self, context: &BridgeContext, config: &BridgeConfig) -> Result<()> {
        if self.core.is_some() {
            bail!("script runtime already started");
        }
        self.search_paths = config.search_paths();
        let core = Rc::new_cyclic(|weak: &Weak<ScriptCore>| {
            let mut engine = Engine::new();
            engine.set_max_operations(config.limits.max_operations);
            engine.set_max_call_levels(config.limits.max_call_levels);
            engine.set_module_resolver(module_resolvers(&self.search_paths));
            engine.on_print(|text| log::info!(target: "script", "{text}"));
            engine.on_debug(|text, source, pos| {
                log::debug!(target: "script", "[{}:{pos}] {text}", source.unwrap_or("script"));
            });
            register_api(&mut engine, context, weak.clone());
            ScriptCore { engine, entry_ast: RefCell::new(Rc::new(AST::empty())) }
        });
        log::debug!("script runtime started (search paths: {:?})", self.search_paths);
        self.core = Some(core);
        Ok(())
    }

    fn resolve_module(&mut self, name: &str) -> Result<ScriptModule> {
        let path = self.locate_module(name)?;
        let core = self.core()?;
        let source = fs::read_to_string(&path).with_context(|| format!("Reading {}", path.display()))?;
        let mut ast = core
            .engine
            .compile(source)
            .with_context(|| format!("Compiling Rhai script {}", path.display()))?;
        ast.set_source(path.display().to_string());
        let ast = Rc::new(ast);
        // Installed before the body runs so targets registered at load time already resolve.
        *core.entry_ast.borrow_mut() = ast.clone();

        let mut scope = Scope::new();
        core.engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|err| script_error(err).context(format!("Running {}", path.display())))?;
        log::debug!("loaded script module '{name}' from {}", path.display());
        Ok(ScriptModule { ast, scope })
    }

    fn resolve_function(&mut self, module: &ScriptModule, name: &str) -> Result<ScriptFunction> {
        if module.ast.iter_functions().any(|func| func.name == name) {
            return Ok(ScriptFunction::Defined { name: name.to_string(), ast: module.ast.clone() });
        }
        match module.scope.get_value::<Dynamic>(name) {
            Some(value) if value.is::<FnPtr>() => Ok(ScriptFunction::Bound(value.cast::<FnPtr>())),
            Some(value) => bail!("'{name}' is a {}, not a function", value.type_name()),
            None => bail!("no function named '{name}'"),
        }
    }

    fn call_entry(&mut self, function: &ScriptFunction) -> Result<EntryReturn> {
        let core = self.core()?.clone();
        let value = match function {
            ScriptFunction::Defined { name, ast } => core
                .engine
                .call_fn_with_options::<Dynamic>(CallFnOptions::new().eval_ast(false), &mut Scope::new(), ast, name, ())
                .map_err(script_error)?,
            ScriptFunction::Bound(fn_ptr) => {
                fn_ptr.call::<Dynamic>(&core.engine, &core.entry_ast(), ()).map_err(script_error)?
            }
        };
        if value.is::<FnPtr>() {
            let fn_ptr = value.cast::<FnPtr>();
            check_invocable(&core, &fn_ptr).map_err(|reason| anyhow!("returned callable {reason}"))?;
            let target = self.make_target(fn_ptr)?;
            Ok(EntryReturn::Handler(target))
        } else {
            Ok(EntryReturn::Value { type_name: value.type_name().to_string() })
        }
    }
}

/// Dispatch target backed by a Rhai function pointer or closure.
pub struct ScriptTarget {
    fn_ptr: FnPtr,
    core: Weak<ScriptCore>,
}

impl ScriptTarget {
    fn new(fn_ptr: FnPtr, core: Weak<ScriptCore>) -> Self {
        Self { fn_ptr, core }
    }
}

impl DispatchTarget for ScriptTarget {
    fn describe(&self) -> String {
        format!("script function '{}'", self.fn_ptr.fn_name())
    }

    fn invoke(&self, event: &DispatchEvent) -> Result<TargetReply> {
        let core = self.core.upgrade().ok_or_else(|| anyhow!("script runtime has been shut down"))?;
        let ast = core.entry_ast();
        let args: Vec<INT> = event.arguments().iter().map(|value| INT::from(*value)).collect();
        let value = self.fn_ptr.call::<Dynamic>(&core.engine, &ast, args).map_err(script_error)?;
        Ok(match value.as_int() {
            Ok(result) => TargetReply::Integer(result),
            Err(type_name) => TargetReply::Other { type_name: type_name.to_string() },
        })
    }
}

/// A target must be a closure or name a function of the entry module that takes the command
/// plus every dispatch argument, counting curried values.
fn check_invocable(core: &ScriptCore, fn_ptr: &FnPtr) -> Result<(), String> {
    if fn_ptr.is_anonymous() {
        return Ok(());
    }
    let name = fn_ptr.fn_name();
    let arity = DISPATCH_SLOTS + fn_ptr.curry().len();
    let ast = core.entry_ast();
    let mut arities = ast.iter_functions().filter(|func| func.name == name).map(|func| func.params.len()).peekable();
    if arities.peek().is_none() {
        return Err(format!("'{name}' does not name a function in the entry module"));
    }
    if arities.any(|params| params == arity) {
        Ok(())
    } else {
        Err(format!("'{name}' does not take {arity} parameters"))
    }
}

fn module_relative_path(name: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for part in name.split('.') {
        if part.is_empty() || part == ".." || part.contains(['/', '\\']) {
            bail!("invalid module name '{name}'");
        }
        relative.push(part);
    }
    relative.set_extension(SCRIPT_EXTENSION);
    Ok(relative)
}

fn module_resolvers(search_paths: &[PathBuf]) -> ModuleResolversCollection {
    let mut resolvers = ModuleResolversCollection::new();
    for path in search_paths {
        resolvers.push(FileModuleResolver::new_with_path(path.clone()));
    }
    resolvers
}

/// Rhai errors carry `Dynamic` values and are not `Send`, so they travel as text.
fn script_error(err: Box<EvalAltResult>) -> anyhow::Error {
    anyhow!("{err}")
}

fn mismatch(expected: &str, actual: &str) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorMismatchDataType(expected.to_string(), actual.to_string(), Position::NONE))
}

fn forward_syscall(port: &SyscallPort, number: INT, args: &[INT]) -> Result<INT, Box<EvalAltResult>> {
    let args: Vec<isize> = args.iter().map(|value| *value as isize).collect();
    port.syscall(number as isize, &args).map(|value| value as INT).map_err(|fault| fault.to_string().into())
}

macro_rules! register_syscall {
    ($engine:expr, $port:expr $(, $arg:ident)*) => {{
        let port = $port.clone();
        $engine.register_fn("syscall", move |number: INT $(, $arg: INT)*| {
            forward_syscall(&port, number, &[$($arg),*])
        });
    }};
}

fn register_api(engine: &mut Engine, context: &BridgeContext, core: Weak<ScriptCore>) {
    let registry = context.registry.clone();
    engine.register_fn("set_dispatch_target", move |target: Dynamic| -> Result<(), Box<EvalAltResult>> {
        let type_name = target.type_name();
        let fn_ptr = target.try_cast::<FnPtr>().ok_or_else(|| mismatch("Fn", type_name))?;
        let live = core.upgrade().ok_or_else(|| -> Box<EvalAltResult> { "script runtime has been shut down".into() })?;
        check_invocable(&live, &fn_ptr).map_err(|reason| mismatch("Fn", &reason))?;
        registry.register(Rc::new(ScriptTarget::new(fn_ptr, core.clone())));
        Ok(())
    });

    let port = &context.syscalls;
    register_syscall!(engine, port);
    register_syscall!(engine, port, a0);
    register_syscall!(engine, port, a0, a1);
    register_syscall!(engine, port, a0, a1, a2);
    register_syscall!(engine, port, a0, a1, a2, a3);
    register_syscall!(engine, port, a0, a1, a2, a3, a4);
    register_syscall!(engine, port, a0, a1, a2, a3, a4, a5);
    register_syscall!(engine, port, a0, a1, a2, a3, a4, a5, a6);
    register_syscall!(engine, port, a0, a1, a2, a3, a4, a5, a6, a7);
    register_syscall!(engine, port, a0, a1, a2, a3, a4, a5, a6, a7, a8);
    register_syscall!(engine, port, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9);
    register_syscall!(engine, port, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10);
    register_syscall!(engine, port, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11);
    register_syscall!(engine, port, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12);
    register_syscall!(engine, port, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13);
    register_syscall!(engine, port, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14);
    // Longer calls are accepted and cut down to the engine's slots.
    register_syscall!(engine, port, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15);
    register_syscall!(engine, port, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15, a16);
    register_syscall!(engine, port, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15, a16, a17);
    register_syscall!(
        engine, port, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15, a16, a17, a18
    );

    let port = context.syscalls.clone();
    engine.register_fn("vsyscall", move |number: INT, args: Array| -> Result<INT, Box<EvalAltResult>> {
        let values = args
            .iter()
            .map(|value| value.as_int().map_err(|type_name| mismatch("i64", type_name)))
            .collect::<Result<Vec<INT>, _>>()?;
        forward_syscall(&port, number, &values)
    });

    engine.register_fn("log", |message: &str| {
        log::info!(target: "script", "{message}");
    });

    let mut vm = Module::new();
    vm.set_var("DISPATCH_ARGS", VM_DISPATCH_ARGS as INT);
    vm.set_var("SYSCALL_ARGS", SYSCALL_ARG_SLOTS as INT);
    engine.register_static_module("vm", vm.into());
}
