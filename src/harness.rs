//! Drives the bridge without an engine: loads an entry point, feeds it a list of dispatch
//! events and records every outbound syscall. Used for golden-transcript tests and for poking at
//! scripts from the command line.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::bridge::BridgeContext;
use crate::config::BridgeConfig;
use crate::fault::BridgeFault;
use crate::marshal::{DispatchEvent, SYSCALL_ARG_SLOTS, VM_DISPATCH_ARGS};
use crate::scripts::RhaiRuntime;
use crate::sequencer::{self, Registration};
use crate::syscall::SyscallSink;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessFixture {
    /// `module:function`, same syntax as the environment variable.
    pub entry: String,
    /// Relative entries are resolved against the fixture file's directory by [`load_fixture`].
    #[serde(default)]
    pub script_paths: Vec<PathBuf>,
    #[serde(default)]
    pub events: Vec<FixtureEvent>,
    /// Value the fake engine returns per syscall number; unlisted numbers return 0.
    #[serde(default)]
    pub syscall_returns: BTreeMap<i64, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixtureEvent {
    pub command: i32,
    #[serde(default)]
    pub args: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessOutput {
    pub entry: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<String>,
    /// Syscalls issued while the entry point ran.
    pub init_syscalls: Vec<SyscallRecord>,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step: usize,
    pub command: i32,
    pub result: i64,
    pub syscalls: Vec<SyscallRecord>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyscallRecord {
    pub number: i64,
    pub args: [i64; SYSCALL_ARG_SLOTS],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaultSummary {
    pub class: String,
    pub exit_code: i32,
    pub message: String,
    /// Index of the failing event; absent when initialization faulted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
}

impl FaultSummary {
    fn new(fault: &BridgeFault, step: Option<usize>) -> Self {
        let class = fault.class();
        Self { class: class.label().to_string(), exit_code: class.exit_code(), message: fault.to_string(), step }
    }
}

impl HarnessOutput {
    pub fn exit_code(&self) -> i32 {
        self.fault.as_ref().map_or(0, |fault| fault.exit_code)
    }
}

/// Stand-in for the engine's syscall trampoline.
#[derive(Default)]
pub struct RecordingSink {
    returns: BTreeMap<i64, i64>,
    calls: RefCell<Vec<SyscallRecord>>,
}

impl RecordingSink {
    pub fn new(returns: BTreeMap<i64, i64>) -> Self {
        Self { returns, calls: RefCell::new(Vec::new()) }
    }

    pub fn take_calls(&self) -> Vec<SyscallRecord> {
        self.calls.take()
    }
}

impl SyscallSink for RecordingSink {
    fn call(&self, number: isize, args: &[isize; SYSCALL_ARG_SLOTS]) -> isize {
        let number = number as i64;
        self.calls.borrow_mut().push(SyscallRecord { number, args: args.map(|arg| arg as i64) });
        let value = self.returns.get(&number).copied().unwrap_or(0);
        value as isize
    }
}

pub fn run_fixture(fixture: &HarnessFixture) -> Result<HarnessOutput> {
    let mut events = Vec::with_capacity(fixture.events.len());
    for (step, event) in fixture.events.iter().enumerate() {
        if event.args.len() > VM_DISPATCH_ARGS {
            bail!("event {step} has {} arguments; at most {VM_DISPATCH_ARGS} are allowed", event.args.len());
        }
        events.push(DispatchEvent::from_partial(event.command, &event.args));
    }

    let config = BridgeConfig {
        entry: Some(fixture.entry.clone()),
        script_paths: fixture.script_paths.clone(),
        ..BridgeConfig::default()
    };
    let context = BridgeContext::new();
    let sink = Rc::new(RecordingSink::new(fixture.syscall_returns.clone()));
    let mut runtime = RhaiRuntime::new();
    let mut output = HarnessOutput {
        entry: fixture.entry.clone(),
        registration: None,
        init_syscalls: Vec::new(),
        steps: Vec::with_capacity(events.len()),
        fault: None,
    };

    let initialized = sequencer::initialize(&context, &mut runtime, Some(sink.clone() as Rc<dyn SyscallSink>), &config);
    output.init_syscalls = sink.take_calls();
    match initialized {
        Ok(registration) => output.registration = Some(registration_label(registration).to_string()),
        Err(fault) => {
            log::warn!("harness initialization faulted: {fault}");
            output.fault = Some(FaultSummary::new(&fault, None));
        }
    }

    if output.fault.is_none() {
        for (step, event) in events.iter().enumerate() {
            let dispatched = context.dispatch(event);
            let syscalls = sink.take_calls();
            match dispatched {
                Ok(result) => {
                    output.steps.push(StepResult { step, command: event.command, result: result as i64, syscalls })
                }
                Err(fault) => {
                    log::warn!("harness step {step} faulted: {fault}");
                    output.fault = Some(FaultSummary::new(&fault, Some(step)));
                    break;
                }
            }
        }
    }

    context.teardown();
    runtime.shutdown();
    Ok(output)
}

fn registration_label(registration: Registration) -> &'static str {
    match registration {
        Registration::Explicit => "explicit",
        Registration::Returned => "returned",
    }
}

/// Reads a fixture and anchors its relative script paths at the fixture's directory.
pub fn load_fixture<P: AsRef<Path>>(path: P) -> Result<HarnessFixture> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening fixture '{}'", path.display()))?;
    let mut fixture: HarnessFixture = serde_json::from_reader(file).with_context(|| "parsing fixture JSON")?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    for script_path in &mut fixture.script_paths {
        if script_path.is_relative() {
            *script_path = base.join(&*script_path);
        }
    }
    if fixture.script_paths.is_empty() {
        fixture.script_paths.push(base.to_path_buf());
    }
    Ok(fixture)
}

/// Parses `"cmd a0 a1 ..."` as used on the command line.
pub fn parse_event(text: &str) -> Result<FixtureEvent> {
    let mut fields = text.split_whitespace().map(|field| {
        field.parse::<i32>().with_context(|| format!("'{field}' in event '{text}' is not an integer"))
    });
    let Some(command) = fields.next() else { bail!("event is empty") };
    let command = command?;
    let args = fields.collect::<Result<Vec<_>>>()?;
    if args.len() > VM_DISPATCH_ARGS {
        bail!("event '{text}' has {} arguments; at most {VM_DISPATCH_ARGS} are allowed", args.len());
    }
    Ok(FixtureEvent { command, args })
}
