use std::fmt;

use thiserror::Error;

/// `sysexits.h` statuses used when the bridge has to take the process down.
pub const EX_USAGE: i32 = 64;
pub const EX_NOINPUT: i32 = 66;
pub const EX_SOFTWARE: i32 = 70;
pub const EX_CONFIG: i32 = 78;

/// Coarse fault classes. Each maps to exactly one process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultClass {
    /// The engine handed over an invalid handle.
    Usage,
    /// Entry point missing or malformed, or no dispatch target was ever registered.
    Config,
    /// A named script module or function could not be resolved.
    Resource,
    /// Script invocation failed or broke the integer result contract.
    Software,
}

impl FaultClass {
    pub const fn exit_code(self) -> i32 {
        match self {
            FaultClass::Usage => EX_USAGE,
            FaultClass::Config => EX_CONFIG,
            FaultClass::Resource => EX_NOINPUT,
            FaultClass::Software => EX_SOFTWARE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FaultClass::Usage => "usage",
            FaultClass::Config => "config",
            FaultClass::Resource => "resource",
            FaultClass::Software => "software",
        }
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum BridgeFault {
    #[error("engine handed over a null syscall pointer")]
    NullSyscall,
    #[error("null argument buffer passed with {count} arguments")]
    NullArguments { count: usize },
    #[error("entry point is not configured (set {var})")]
    EntryPointUnset { var: &'static str },
    #[error("malformed entry point '{spec}': expected module:function")]
    EntryPointMalformed { spec: String },
    #[error("no dispatch target registered")]
    TargetUnset,
    #[error("syscall issued before the engine installed its syscall pointer")]
    SyscallUnavailable,
    #[error("{during} called on thread {caller}, but dllEntry ran on thread {owner}; bridge state lives on that thread")]
    ForeignThread { during: &'static str, caller: String, owner: String },
    #[error("failed to load module '{module}': {reason}")]
    ModuleUnresolved { module: String, reason: String },
    #[error("cannot find function '{function}' in module '{module}': {reason}")]
    FunctionUnresolved { module: String, function: String, reason: String },
    #[error("script runtime failed to start: {reason}")]
    RuntimeStart { reason: String },
    #[error("calling entry point '{entry}' failed: {reason}")]
    EntryPointFailed { entry: String, reason: String },
    #[error("dispatch target failed on command {command}: {reason}")]
    TargetFailed { command: i32, reason: String },
    #[error("dispatch target returned {type_name} for command {command}, expected an integer")]
    TargetResultType { command: i32, type_name: String },
    #[error("dispatch target returned {value} for command {command}, outside the native integer range")]
    TargetResultRange { command: i32, value: i64 },
    #[error("bridge panicked inside {during}: {message}")]
    Panicked { during: &'static str, message: String },
}

impl BridgeFault {
    pub fn class(&self) -> FaultClass {
        match self {
            BridgeFault::NullSyscall | BridgeFault::NullArguments { .. } => FaultClass::Usage,
            BridgeFault::EntryPointUnset { .. }
            | BridgeFault::EntryPointMalformed { .. }
            | BridgeFault::TargetUnset
            | BridgeFault::SyscallUnavailable
            | BridgeFault::ForeignThread { .. } => FaultClass::Config,
            BridgeFault::ModuleUnresolved { .. } | BridgeFault::FunctionUnresolved { .. } => {
                FaultClass::Resource
            }
            BridgeFault::RuntimeStart { .. }
            | BridgeFault::EntryPointFailed { .. }
            | BridgeFault::TargetFailed { .. }
            | BridgeFault::TargetResultType { .. }
            | BridgeFault::TargetResultRange { .. }
            | BridgeFault::Panicked { .. } => FaultClass::Software,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.class().exit_code()
    }

    /// Builds a `Panicked` fault from a `catch_unwind` payload.
    pub fn from_panic(during: &'static str, payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        BridgeFault::Panicked { during, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_class_has_a_distinct_status() {
        let classes = [FaultClass::Usage, FaultClass::Config, FaultClass::Resource, FaultClass::Software];
        let codes: HashSet<i32> = classes.iter().map(|class| class.exit_code()).collect();
        assert_eq!(codes.len(), classes.len());
        assert!(!codes.contains(&0), "fault statuses must never look like success");
    }

    #[test]
    fn faults_map_to_their_class() {
        assert_eq!(BridgeFault::NullSyscall.class(), FaultClass::Usage);
        assert_eq!(BridgeFault::TargetUnset.class(), FaultClass::Config);
        let foreign = BridgeFault::ForeignThread { during: "vmMain", caller: "ThreadId(3)".into(), owner: "ThreadId(1)".into() };
        assert_eq!(foreign.class(), FaultClass::Config);
        assert!(foreign.to_string().contains("dllEntry ran on thread ThreadId(1)"));
        assert_eq!(
            BridgeFault::EntryPointMalformed { spec: "pkg".into() }.exit_code(),
            EX_CONFIG
        );
        assert_eq!(
            BridgeFault::ModuleUnresolved { module: "pkg".into(), reason: "missing".into() }.exit_code(),
            EX_NOINPUT
        );
        assert_eq!(
            BridgeFault::TargetResultType { command: 3, type_name: "string".into() }.exit_code(),
            EX_SOFTWARE
        );
    }

    #[test]
    fn panic_payloads_become_messages() {
        let fault = BridgeFault::from_panic("vmMain", Box::new("boom"));
        assert!(fault.to_string().contains("boom"));
        let fault = BridgeFault::from_panic("dllEntry", Box::new(String::from("owned boom")));
        assert!(fault.to_string().contains("owned boom"));
        assert_eq!(fault.class(), FaultClass::Software);
    }
}
