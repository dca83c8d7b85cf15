use std::collections::BTreeMap;
use std::env;
use std::fs::{self, File};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use kestrel_vmbridge::fault::EX_USAGE;
use kestrel_vmbridge::harness::{load_fixture, parse_event, run_fixture, HarnessFixture, HarnessOutput};
use kestrel_vmbridge::logging;

fn main() {
    logging::init();
    match run_cli() {
        Ok(code) => {
            logging::flush();
            std::process::exit(code);
        }
        Err(err) => {
            eprintln!("[vm-harness] error: {err:?}");
            std::process::exit(EX_USAGE);
        }
    }
}

fn run_cli() -> Result<i32> {
    let opts = parse_args()?;
    let fixture = match &opts.source {
        Source::Fixture(path) => load_fixture(path)?,
        Source::AdHoc(fixture) => fixture.clone(),
    };
    let output = run_fixture(&fixture)?;

    if let Some(path) = &opts.write_output {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating output directory '{}'", parent.display()))?;
            }
        }
        let file = File::create(path)
            .with_context(|| format!("writing harness output to '{}'", path.display()))?;
        serde_json::to_writer_pretty(file, &output).with_context(|| "serializing harness output")?;
        println!("[vm-harness] wrote {}", path.display());
    }

    if let Some(path) = &opts.check_golden {
        let file = File::open(path).with_context(|| format!("opening golden file '{}'", path.display()))?;
        let expected: HarnessOutput = serde_json::from_reader(file).with_context(|| "parsing golden JSON")?;
        if expected != output {
            bail!(
                "golden mismatch (use --write-output to refresh):\nexpected: {}\nactual:   {}",
                serde_json::to_string(&expected).unwrap_or_default(),
                serde_json::to_string(&output).unwrap_or_default(),
            );
        }
        println!("[vm-harness] matched golden {}", path.display());
    } else if opts.write_output.is_none() {
        serde_json::to_writer_pretty(std::io::stdout(), &output)?;
        println!();
    }

    if let Some(fault) = &output.fault {
        eprintln!("[vm-harness] {} fault: {}", fault.class, fault.message);
    }
    Ok(output.exit_code())
}

enum Source {
    Fixture(PathBuf),
    AdHoc(HarnessFixture),
}

struct CliOptions {
    source: Source,
    write_output: Option<PathBuf>,
    check_golden: Option<PathBuf>,
}

fn parse_args() -> Result<CliOptions> {
    let mut fixture = None;
    let mut entry = None;
    let mut script_paths = Vec::new();
    let mut events = Vec::new();
    let mut syscall_returns = BTreeMap::new();
    let mut write_output = None;
    let mut check_golden = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = || args.next().ok_or_else(|| anyhow!("{arg} expects a value"));
        match arg.as_str() {
            "--fixture" | "-f" => fixture = Some(PathBuf::from(value()?)),
            "--entry" | "-e" => entry = Some(value()?),
            "--path" | "-p" => script_paths.push(PathBuf::from(value()?)),
            "--event" => events.push(parse_event(&value()?)?),
            "--syscall-return" => {
                let pair = value()?;
                let (number, result) =
                    pair.split_once('=').ok_or_else(|| anyhow!("expected NUMBER=VALUE, got '{pair}'"))?;
                let number = number.trim().parse::<i64>().with_context(|| format!("bad syscall number in '{pair}'"))?;
                let result = result.trim().parse::<i64>().with_context(|| format!("bad return value in '{pair}'"))?;
                syscall_returns.insert(number, result);
            }
            "--write-output" | "-o" => write_output = Some(PathBuf::from(value()?)),
            "--golden" | "-g" => check_golden = Some(PathBuf::from(value()?)),
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                return Err(anyhow!("unknown argument '{other}'"));
            }
        }
    }
    let source = match (fixture, entry) {
        (Some(_), Some(_)) => bail!("--fixture and --entry are mutually exclusive"),
        (Some(path), None) => Source::Fixture(path),
        (None, Some(entry)) => Source::AdHoc(HarnessFixture { entry, script_paths, events, syscall_returns }),
        (None, None) => bail!("either --fixture <path> or --entry <module:function> is required"),
    };
    Ok(CliOptions { source, write_output, check_golden })
}

fn print_help() {
    println!("Usage: vm_harness --fixture <path> [--golden <path>] [--write-output <path>]");
    println!("       vm_harness --entry <module:function> [--path <dir>]... [--event \"cmd a0 ..\"]...");
    println!("  -f, --fixture         Path to a harness fixture JSON file");
    println!("  -e, --entry           Entry point for an ad-hoc run");
    println!("  -p, --path            Script search directory (repeatable)");
    println!("      --event           Dispatch event: command followed by up to 12 arguments (repeatable)");
    println!("      --syscall-return  NUMBER=VALUE returned by the fake engine for that syscall");
    println!("  -g, --golden          Optional golden output file to compare against");
    println!("  -o, --write-output    Optional path to write the actual output JSON");
    println!("Exit status is 0, or the fault's sysexits code when the bridge faults.");
    println!("Example: vm_harness --fixture demos/hello.json (annotated module in demos/hello.rhai)");
}
