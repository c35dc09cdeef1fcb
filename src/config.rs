//! Command-line configuration, extending `mttn::main::app()`'s flag set with the target
//! function, command-pipe file descriptors, and the per-execution timeout the command server's
//! `wait_for_child` needs.

use std::convert::TryFrom;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{App, Arg, ArgGroup, ArgMatches};

use crate::executor::EntryStrategy;

pub struct Config {
    pub target_path: Option<PathBuf>,
    pub tracee_pid: Option<i32>,
    pub tracee_args: Vec<String>,
    pub bitness: u32,
    pub ignore_unsupported_memops: bool,
    pub debug_on_fault: bool,
    pub disable_aslr: bool,
    pub collect_coverage: bool,
    pub entry_strategy: EntryStrategy,
    pub timeout_ms: u64,
    pub cmd_in: RawFd,
    pub cmd_out: RawFd,
}

pub fn app<'a, 'b>() -> App<'a, 'b> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("mode")
                .help("The CPU mode to decode instructions with")
                .short("m")
                .long("mode")
                .takes_value(true)
                .possible_values(&["32", "64"])
                .default_value("64"),
        )
        .arg(
            Arg::with_name("ignore-unsupported-memops")
                .help("Ignore unsupported memory ops instead of failing")
                .short("I")
                .long("ignore-unsupported-memops"),
        )
        .arg(
            Arg::with_name("debug-on-fault")
                .help("Suspend the tracee and detach if a memory access faults unexpectedly")
                .short("d")
                .long("debug-on-fault"),
        )
        .arg(
            Arg::with_name("disable-aslr")
                .help("Disable ASLR on the tracee")
                .short("A")
                .long("disable-aslr"),
        )
        .arg(
            Arg::with_name("coverage")
                .help("Report unique instruction pointers observed on each successful execution")
                .short("c")
                .long("coverage"),
        )
        .arg(
            Arg::with_name("entry-strategy")
                .help("How to reach the target function's first instruction")
                .short("e")
                .long("entry-strategy")
                .takes_value(true)
                .possible_values(&["breakpoint", "single-step"])
                .default_value("breakpoint"),
        )
        .arg(
            Arg::with_name("timeout-ms")
                .help("Milliseconds to wait for an execution to finish before killing it")
                .short("t")
                .long("timeout-ms")
                .takes_value(true)
                .default_value("5000"),
        )
        .arg(
            Arg::with_name("command-fd-in")
                .help("Read commands from this already-open file descriptor")
                .long("command-fd-in")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("command-fd-out")
                .help("Write replies to this already-open file descriptor")
                .long("command-fd-out")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("tracee-pid")
                .help("Attach to the given PID for tracing")
                .short("a")
                .long("attach")
                .takes_value(true),
        )
        .arg(Arg::with_name("tracee-name").help("The program to trace").index(1))
        .arg(
            Arg::with_name("tracee-args")
                .help("The command-line arguments to execute the tracee with")
                .raw(true),
        )
        .group(ArgGroup::with_name("target").required(true).args(&["tracee-pid", "tracee-name"]))
}

impl<'a> TryFrom<&ArgMatches<'a>> for Config {
    type Error = anyhow::Error;

    fn try_from(matches: &ArgMatches<'a>) -> Result<Self> {
        let bitness = matches.value_of("mode").unwrap().parse()?;

        let entry_strategy = match matches.value_of("entry-strategy").unwrap() {
            "breakpoint" => EntryStrategy::Breakpoint,
            "single-step" => EntryStrategy::SingleStep,
            other => return Err(anyhow!("unknown entry strategy: {}", other)),
        };

        let timeout_ms = matches.value_of("timeout-ms").unwrap().parse().context("invalid --timeout-ms")?;

        let cmd_in = matches.value_of("command-fd-in").unwrap().parse().context("invalid --command-fd-in")?;
        let cmd_out = matches.value_of("command-fd-out").unwrap().parse().context("invalid --command-fd-out")?;

        let tracee_pid = matches.value_of("tracee-pid").map(str::parse).transpose().context("invalid --attach")?;

        let target_path = matches.value_of("tracee-name").map(PathBuf::from);

        let tracee_args =
            matches.values_of("tracee-args").map(|v| v.map(String::from).collect()).unwrap_or_default();

        Ok(Self {
            target_path,
            tracee_pid,
            tracee_args,
            bitness,
            ignore_unsupported_memops: matches.is_present("ignore-unsupported-memops"),
            debug_on_fault: matches.is_present("debug-on-fault"),
            disable_aslr: matches.is_present("disable-aslr"),
            collect_coverage: matches.is_present("coverage"),
            entry_strategy,
            timeout_ms,
            cmd_in,
            cmd_out,
        })
    }
}
