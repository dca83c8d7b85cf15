//! Exercises the exported engine symbols. Every fault path ends the process, so each case
//! re-runs this test binary filtered to itself with a marker variable set, and the parent
//! checks the child's exit status.

use std::env;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use kestrel_vmbridge::abi::{dllEntry, kestrel_vm_vsyscall, vmMain};
use kestrel_vmbridge::config::{CONFIG_ENV, ENTRY_ENV, LOG_ENV, SCRIPT_PATH_ENV};
use kestrel_vmbridge::fault::{EX_CONFIG, EX_NOINPUT, EX_SOFTWARE, EX_USAGE};
use kestrel_vmbridge::syscall::SyscallFn;
use tempfile::tempdir;

const CHILD_ENV: &str = "KESTREL_VMBRIDGE_ABI_CHILD";

const HANDLER_SCRIPT: &str = r#"
fn handle(cmd, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11) {
    if cmd == 1 { 42 } else if cmd == 9 { "not a number" } else { a0 + a11 }
}

fn init_handler() {
    set_dispatch_target(Fn("handle"));
}
"#;

fn in_child() -> bool {
    env::var_os(CHILD_ENV).is_some()
}

fn run_child(test: &str, entry: Option<&str>, script_dir: Option<&Path>) -> Output {
    let exe = env::current_exe().expect("current test executable");
    let mut command = Command::new(exe);
    command
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .env_remove(CONFIG_ENV)
        .env_remove(ENTRY_ENV)
        .env_remove(SCRIPT_PATH_ENV)
        .env_remove(LOG_ENV);
    if let Some(entry) = entry {
        command.env(ENTRY_ENV, entry);
    }
    if let Some(dir) = script_dir {
        command.env(SCRIPT_PATH_ENV, dir);
    }
    command.output().expect("spawn child test process")
}

fn assert_exit(output: &Output, code: i32) {
    assert_eq!(
        output.status.code(),
        Some(code),
        "unexpected exit status\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn script_dir() -> tempfile::TempDir {
    let dir = tempdir().expect("temp dir");
    fs::write(dir.path().join("pkg.rhai"), HANDLER_SCRIPT).expect("write script");
    dir
}

unsafe extern "C" fn engine_stub(
    number: isize,
    a0: isize,
    a1: isize,
    _a2: isize,
    _a3: isize,
    _a4: isize,
    _a5: isize,
    _a6: isize,
    _a7: isize,
    _a8: isize,
    _a9: isize,
    _a10: isize,
    _a11: isize,
    _a12: isize,
    _a13: isize,
    _a14: isize,
) -> isize {
    number * 100 + a0 + a1
}

/// The stub is only ever called on targets where a fixed-arity integer function is
/// call-compatible with the variadic trampoline.
fn stub_syscall() -> SyscallFn {
    type FixedSyscall = unsafe extern "C" fn(
        isize,
        isize,
        isize,
        isize,
        isize,
        isize,
        isize,
        isize,
        isize,
        isize,
        isize,
        isize,
        isize,
        isize,
        isize,
        isize,
    ) -> isize;
    let fixed: FixedSyscall = engine_stub;
    unsafe { std::mem::transmute::<FixedSyscall, SyscallFn>(fixed) }
}

#[test]
fn dispatch_before_initialization_exits_with_config_status() {
    if in_child() {
        vmMain(1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0);
        return;
    }
    let output = run_child("dispatch_before_initialization_exits_with_config_status", None, None);
    assert_exit(&output, EX_CONFIG);
}

#[test]
fn null_syscall_pointer_exits_with_usage_status() {
    if in_child() {
        dllEntry(None);
        return;
    }
    let dir = script_dir();
    let output = run_child("null_syscall_pointer_exits_with_usage_status", Some("pkg:init_handler"), Some(dir.path()));
    assert_exit(&output, EX_USAGE);
}

#[test]
fn missing_entry_point_exits_with_config_status() {
    if in_child() {
        dllEntry(Some(stub_syscall()));
        return;
    }
    let output = run_child("missing_entry_point_exits_with_config_status", None, None);
    assert_exit(&output, EX_CONFIG);
}

#[test]
fn malformed_entry_point_exits_with_config_status() {
    if in_child() {
        dllEntry(Some(stub_syscall()));
        return;
    }
    let dir = script_dir();
    let output = run_child("malformed_entry_point_exits_with_config_status", Some("pkg.init_handler"), Some(dir.path()));
    assert_exit(&output, EX_CONFIG);
}

#[test]
fn unknown_module_exits_with_resource_status() {
    if in_child() {
        dllEntry(Some(stub_syscall()));
        return;
    }
    let dir = script_dir();
    let output = run_child("unknown_module_exits_with_resource_status", Some("nowhere:init"), Some(dir.path()));
    assert_exit(&output, EX_NOINPUT);
}

#[test]
fn initialized_bridge_dispatches_through_vm_main() {
    if in_child() {
        dllEntry(Some(stub_syscall()));
        assert_eq!(vmMain(1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0), 42);
        assert_eq!(vmMain(2, 5, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 6), 11);
        return;
    }
    let dir = script_dir();
    let output = run_child("initialized_bridge_dispatches_through_vm_main", Some("pkg:init_handler"), Some(dir.path()));
    assert_exit(&output, 0);
}

#[test]
fn non_integer_result_exits_with_software_status() {
    if in_child() {
        dllEntry(Some(stub_syscall()));
        vmMain(9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0);
        return;
    }
    let dir = script_dir();
    let output =
        run_child("non_integer_result_exits_with_software_status", Some("pkg:init_handler"), Some(dir.path()));
    assert_exit(&output, EX_SOFTWARE);
}

#[test]
fn dispatch_from_another_thread_names_both_threads() {
    if in_child() {
        dllEntry(Some(stub_syscall()));
        let worker = std::thread::spawn(|| vmMain(1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0));
        let _ = worker.join();
        return;
    }
    let dir = script_dir();
    let output =
        run_child("dispatch_from_another_thread_names_both_threads", Some("pkg:init_handler"), Some(dir.path()));
    assert_exit(&output, EX_CONFIG);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("but dllEntry ran on thread"), "stderr:\n{stderr}");
}

#[test]
fn list_syscall_before_initialization_exits_with_config_status() {
    if in_child() {
        unsafe { kestrel_vm_vsyscall(3, std::ptr::null(), 0) };
        return;
    }
    let output = run_child("list_syscall_before_initialization_exits_with_config_status", None, None);
    assert_exit(&output, EX_CONFIG);
}

#[test]
fn list_syscall_with_null_buffer_exits_with_usage_status() {
    if in_child() {
        unsafe { kestrel_vm_vsyscall(3, std::ptr::null(), 2) };
        return;
    }
    let output = run_child("list_syscall_with_null_buffer_exits_with_usage_status", None, None);
    assert_exit(&output, EX_USAGE);
}

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn list_syscall_reaches_the_engine() {
    if in_child() {
        dllEntry(Some(stub_syscall()));
        let args = [4isize, 5, 6];
        let result = unsafe { kestrel_vm_vsyscall(7, args.as_ptr(), args.len()) };
        assert_eq!(result, 709);
        return;
    }
    let dir = script_dir();
    let output = run_child("list_syscall_reaches_the_engine", Some("pkg:init_handler"), Some(dir.path()));
    assert_exit(&output, 0);
}
