//! Symbols the engine resolves when it loads the plugin library, and the single place where
//! faults are turned into process termination.

use std::cell::RefCell;
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::rc::Rc;
use std::slice;
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

use crate::bridge::BridgeContext;
use crate::config::BridgeConfig;
use crate::fault::BridgeFault;
use crate::logging;
use crate::marshal::DispatchEvent;
use crate::scripts::RhaiRuntime;
use crate::sequencer;
use crate::syscall::{EngineSyscall, SyscallFn, SyscallSink};

/// Process-wide bridge state, owned by the engine thread.
#[derive(Default)]
struct HostBridge {
    context: BridgeContext,
    runtime: RefCell<Option<RhaiRuntime>>,
}

thread_local! {
    static HOST: HostBridge = HostBridge::default();
}

/// Thread that ran `dllEntry`; the bridge state is only reachable from it.
static ENGINE_THREAD: OnceLock<ThreadId> = OnceLock::new();

fn check_engine_thread(during: &'static str) -> Result<(), BridgeFault> {
    let caller = thread::current().id();
    match ENGINE_THREAD.get() {
        Some(owner) if *owner != caller => Err(BridgeFault::ForeignThread {
            during,
            caller: format!("{caller:?}"),
            owner: format!("{owner:?}"),
        }),
        _ => Ok(()),
    }
}

impl HostBridge {
    fn initialize(&self, syscall: Option<SyscallFn>) -> Result<(), BridgeFault> {
        let config = BridgeConfig::from_env();
        let sink = syscall.map(|raw| Rc::new(EngineSyscall::new(raw)) as Rc<dyn SyscallSink>);
        let mut runtime = RhaiRuntime::new();
        let result = sequencer::initialize(&self.context, &mut runtime, sink, &config);
        // Kept even on failure so teardown releases whatever did come up.
        if let Ok(mut slot) = self.runtime.try_borrow_mut() {
            *slot = Some(runtime);
        }
        result.map(|_| ())
    }

    /// Logs `fault`, releases the script runtime and exits with the fault's status.
    fn terminate(&self, fault: BridgeFault) -> ! {
        let class = fault.class();
        log::error!("[{class}] {fault}");
        self.context.teardown();
        if let Ok(mut slot) = self.runtime.try_borrow_mut() {
            if let Some(mut runtime) = slot.take() {
                runtime.shutdown();
            }
        }
        logging::flush();
        process::exit(class.exit_code())
    }
}

/// Runs `body` on the engine thread's bridge, terminating the process on any fault or panic.
fn with_host<T>(during: &'static str, body: impl FnOnce(&HostBridge) -> Result<T, BridgeFault>) -> T {
    HOST.with(|host| {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(host)))
            .unwrap_or_else(|payload| Err(BridgeFault::from_panic(during, payload)));
        match outcome {
            Ok(value) => value,
            Err(fault) => host.terminate(fault),
        }
    })
}

/// Engine entry: receives the syscall trampoline and brings the bridge up.
///
/// Never returns on failure: the process exits with the fault's status. The bridge state
/// belongs to the calling thread, and every later `vmMain` must come from that same thread.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn dllEntry(syscall: Option<SyscallFn>) {
    logging::init();
    let _ = ENGINE_THREAD.set(thread::current().id());
    with_host("dllEntry", |host| {
        check_engine_thread("dllEntry")?;
        host.initialize(syscall)
    });
}

/// Engine dispatch: one call per VM event.
///
/// Must run on the thread that called [`dllEntry`]; a call from any other thread is a config
/// fault naming both threads.
#[no_mangle]
#[allow(non_snake_case, clippy::too_many_arguments)]
pub extern "C" fn vmMain(
    command: c_int,
    arg0: c_int,
    arg1: c_int,
    arg2: c_int,
    arg3: c_int,
    arg4: c_int,
    arg5: c_int,
    arg6: c_int,
    arg7: c_int,
    arg8: c_int,
    arg9: c_int,
    arg10: c_int,
    arg11: c_int,
) -> isize {
    let event = DispatchEvent::new(
        command,
        [arg0, arg1, arg2, arg3, arg4, arg5, arg6, arg7, arg8, arg9, arg10, arg11],
    );
    with_host("vmMain", |host| {
        check_engine_thread("vmMain")?;
        host.context.dispatch(&event)
    })
}

/// List-based syscall for other native modules sharing the process.
///
/// At most [`crate::marshal::SYSCALL_ARG_SLOTS`] arguments are forwarded; the rest are
/// dropped.
///
/// # Safety
///
/// `args` must point to `count` readable integers, or be null when `count` is zero.
#[no_mangle]
pub unsafe extern "C" fn kestrel_vm_vsyscall(number: isize, args: *const isize, count: usize) -> isize {
    let args = if count == 0 {
        &[][..]
    } else if args.is_null() {
        return with_host("kestrel_vm_vsyscall", |_| Err(BridgeFault::NullArguments { count }));
    } else {
        slice::from_raw_parts(args, count)
    };
    with_host("kestrel_vm_vsyscall", |host| {
        check_engine_thread("kestrel_vm_vsyscall")?;
        host.context.syscalls.syscall(number, args)
    })
}
