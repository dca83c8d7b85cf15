//! One-time startup: validate the engine handle, bring up the script runtime, resolve and call
//! the configured entry point, and make sure a dispatch target ended up registered.

use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use anyhow::Result;

use crate::bridge::BridgeContext;
use crate::config::{BridgeConfig, ENTRY_ENV};
use crate::fault::BridgeFault;
use crate::registry::DispatchTarget;
use crate::syscall::SyscallSink;

/// `module:function` pair naming the script entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub module: String,
    pub function: String,
}

impl FromStr for EntryPoint {
    type Err = BridgeFault;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let malformed = || BridgeFault::EntryPointMalformed { spec: spec.to_string() };
        let (module, function) = spec.trim().split_once(':').ok_or_else(malformed)?;
        let (module, function) = (module.trim(), function.trim());
        if module.is_empty() || function.is_empty() {
            return Err(malformed());
        }
        Ok(Self { module: module.to_string(), function: function.to_string() })
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.function)
    }
}

/// What the entry function returned.
pub enum EntryReturn {
    /// A callable, usable as a dispatch target.
    Handler(Rc<dyn DispatchTarget>),
    /// Any other value; `type_name` is only used for diagnostics.
    Value { type_name: String },
}

/// The script runtime as seen by the sequencer.
///
/// Implementations report plain `anyhow` errors; the sequencer decides which fault class each
/// step maps to.
pub trait ScriptRuntime {
    type Module;
    type Function;

    /// Brings up the interpreter and exposes the bridge's script API on `context`.
    fn start(&mut self, context: &BridgeContext, config: &BridgeConfig) -> Result<()>;

    fn resolve_module(&mut self, name: &str) -> Result<Self::Module>;

    fn resolve_function(&mut self, module: &Self::Module, name: &str) -> Result<Self::Function>;

    /// Calls the entry function with no arguments.
    fn call_entry(&mut self, function: &Self::Function) -> Result<EntryReturn>;
}

/// How the dispatch target got registered during initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The entry point called `set_dispatch_target` itself.
    Explicit,
    /// The entry point returned a callable, which was registered on its behalf.
    Returned,
}

/// Runs the initialization sequence against `context`. Stops at the first fault.
pub fn initialize<R: ScriptRuntime>(
    context: &BridgeContext,
    runtime: &mut R,
    syscall: Option<Rc<dyn SyscallSink>>,
    config: &BridgeConfig,
) -> Result<Registration, BridgeFault> {
    let syscall = syscall.ok_or(BridgeFault::NullSyscall)?;
    context.syscalls.install(syscall);

    runtime
        .start(context, config)
        .map_err(|err| BridgeFault::RuntimeStart { reason: format!("{err:#}") })?;

    let entry: EntryPoint = config
        .entry
        .as_deref()
        .filter(|spec| !spec.trim().is_empty())
        .ok_or(BridgeFault::EntryPointUnset { var: ENTRY_ENV })?
        .parse()?;
    log::info!("loading entry point {entry}");

    // Module top-level code counts as part of the entry point: it may register too.
    let generation = context.registry.generation();
    let module = runtime.resolve_module(&entry.module).map_err(|err| BridgeFault::ModuleUnresolved {
        module: entry.module.clone(),
        reason: format!("{err:#}"),
    })?;
    let function = runtime.resolve_function(&module, &entry.function).map_err(|err| {
        BridgeFault::FunctionUnresolved {
            module: entry.module.clone(),
            function: entry.function.clone(),
            reason: format!("{err:#}"),
        }
    })?;

    let returned = runtime
        .call_entry(&function)
        .map_err(|err| BridgeFault::EntryPointFailed { entry: entry.to_string(), reason: format!("{err:#}") })?;

    let registration = if context.registry.generation() != generation {
        if let EntryReturn::Handler(ignored) = returned {
            log::warn!(
                "entry point {entry} registered a dispatch target and also returned {}; keeping the registered one",
                ignored.describe()
            );
        }
        Some(Registration::Explicit)
    } else {
        match returned {
            EntryReturn::Handler(target) => {
                context.registry.register(target);
                Some(Registration::Returned)
            }
            EntryReturn::Value { type_name } => {
                log::debug!("entry point {entry} returned {type_name}");
                None
            }
        }
    };

    match registration.filter(|_| context.registry.is_ready()) {
        Some(registration) => {
            log::info!("dispatch target ready ({registration:?} registration via {entry})");
            Ok(registration)
        }
        None => Err(BridgeFault::TargetUnset),
    }
}
