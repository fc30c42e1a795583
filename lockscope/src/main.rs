//! # lockscope - Main Entry Point
//!
//! Two subcommands:
//! - **`demo`**: contend on a profiled mutex from many threads and write a
//!   contention profile, then compare its estimate with measured waits
//! - **`report`**: symbolize a written profile and rank its call sites

use anyhow::{Context, Result};
use clap::Parser;
use lockscope::analysis::{analyze_contention, AddressTranslator, ContentionProfile};
use lockscope::cli::{Args, Command, DemoArgs, ReportArgs};
use lockscope::demo::{run_demo, DemoOptions};
use lockscope::domain::ConfigError;
use lockscope::profiling::install_global;
use lockscope::symbolization::{find_binary_range, main_executable, Symbolizer};
use log::{info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    match Args::parse().command {
        Command::Demo(args) => demo(&args),
        Command::Report(args) => report(&args),
    }
}

fn demo(args: &DemoArgs) -> Result<()> {
    let options = args.context_options()?;
    let context = install_global(options).context("Failed to configure contention profiling")?;

    if !args.quiet {
        println!("lockscope v{}", env!("CARGO_PKG_VERSION"));
        println!(
            "{} threads x {} acquisitions, holding {} ms",
            args.threads, args.iterations, args.hold_ms
        );
    }

    let outcome = run_demo(
        context,
        &DemoOptions {
            threads: args.threads,
            iterations: args.iterations,
            hold: args.hold(),
            output: args.output.clone(),
        },
    )?;

    if let Some(path) = &args.stats {
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &outcome)
            .with_context(|| format!("Failed to write stats to {}", path.display()))?;
        info!("stats written to {}", path.display());
    }

    if !args.quiet {
        println!("{}", outcome.render());
        if let Some(ratio) = outcome.estimate_ratio() {
            println!("estimate / observed: {ratio:.2}");
        }
    }
    Ok(())
}

fn report(args: &ReportArgs) -> Result<()> {
    let profile = ContentionProfile::load(&args.profile)
        .with_context(|| format!("Failed to read profile {}", args.profile.display()))?;

    let binary = match &args.binary {
        Some(binary) => std::fs::canonicalize(binary)
            .with_context(|| format!("Failed to resolve path: {}", binary.display()))?,
        None => main_executable(&profile.maps)
            .map(PathBuf::from)
            .context("Profile records no executable mapping; pass --binary")?,
    };
    info!("symbolizing against {}", binary.display());
    let symbolizer = Symbolizer::new(&binary).context("Failed to create symbolizer")?;

    let translator = match find_binary_range(&profile.maps, &binary) {
        Ok(range) => AddressTranslator::new(range, symbolizer.is_position_independent()),
        Err(e) => {
            warn!("{e}. Addresses are used as recorded; symbol resolution may not work.");
            AddressTranslator::identity()
        }
    };

    let report = analyze_contention(&profile, &symbolizer, translator);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render(args.top));
    }
    Ok(())
}
