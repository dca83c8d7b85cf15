use std::fs::File;
use std::path::Path;

use kestrel_vmbridge::harness::{load_fixture, run_fixture, HarnessOutput};

#[test]
fn echo_fixture_matches_golden() {
    assert_fixture_matches("tests/fixtures/vm_harness/echo.json", "tests/fixtures/vm_harness/echo.golden.json");
}

#[test]
fn init_fault_fixture_matches_golden() {
    assert_fixture_matches(
        "tests/fixtures/vm_harness/init_fault.json",
        "tests/fixtures/vm_harness/init_fault.golden.json",
    );
}

#[test]
fn faulting_step_stops_the_run() {
    let fixture = load_fixture("tests/fixtures/vm_harness/faulting.json").expect("load fixture");
    let output = run_fixture(&fixture).expect("run fixture");
    assert_eq!(output.registration.as_deref(), Some("returned"));
    assert_eq!(output.steps.len(), 1);
    assert_eq!(output.steps[0].result, 11);
    let fault = output.fault.as_ref().expect("fault recorded");
    assert_eq!(fault.class, "software");
    assert_eq!(fault.step, Some(1));
    assert!(fault.message.contains("bad command"), "{}", fault.message);
    assert_eq!(output.exit_code(), 70);
}

#[test]
fn fixture_runs_are_independent() {
    let fixture = load_fixture("tests/fixtures/vm_harness/echo.json").expect("load fixture");
    let first = run_fixture(&fixture).expect("run fixture first time");
    let second = run_fixture(&fixture).expect("run fixture second time");
    assert_eq!(first, second, "a fresh bridge per run should give identical transcripts");
}

#[test]
fn fixture_script_paths_are_relative_to_the_fixture() {
    let fixture = load_fixture("tests/fixtures/vm_harness/echo.json").expect("load fixture");
    assert_eq!(fixture.script_paths, vec![Path::new("tests/fixtures/vm_harness").to_path_buf()]);
}

#[test]
fn hello_demo_reads_the_clock_on_game_init() {
    let fixture = load_fixture("demos/hello.json").expect("load fixture");
    let output = run_fixture(&fixture).expect("run fixture");
    assert!(output.fault.is_none(), "{:?}", output.fault);
    assert_eq!(output.registration.as_deref(), Some("returned"));
    assert!(output.init_syscalls.is_empty());
    assert_eq!(output.steps.len(), 2);
    assert!(output.steps.iter().all(|step| step.result == -1));
    let clock: Vec<_> = output.steps[0].syscalls.iter().map(|call| (call.number, call.args)).collect();
    assert_eq!(clock, vec![(2, [0; 15])]);
    assert!(output.steps[1].syscalls.is_empty());
    assert_eq!(output.exit_code(), 0);
}

fn assert_fixture_matches(fixture_path: &str, golden_path: &str) {
    let fixture = load_fixture(fixture_path).expect("load fixture");
    let output = run_fixture(&fixture).expect("run fixture");
    let golden_file = File::open(Path::new(golden_path)).expect("open golden");
    let golden: HarnessOutput = serde_json::from_reader(golden_file).expect("parse golden");
    assert_eq!(output, golden, "fixture {} diverged from golden {}", fixture_path, golden_path);
}
