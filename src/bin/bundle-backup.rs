#[macro_use]
extern crate log;

use std::env;
use std::io::{self, Write};
use std::path::Path;
use std::process;

use bundle_backup::driver::Options;
use bundle_backup::{Config, Driver, UpdateFailure};
use chrono::Local;
use env_logger::Builder;
use failure::{Error, ResultExt};
use log::LevelFilter;
use structopt::StructOpt;

const DEFAULT_CONFIG_FILE: &str = "~/.bundle-backup.toml";

fn main() {
    let args = Args::from_args();

    if args.example_config {
        generate_example();
        return;
    }

    if let Err(e) = run(&args) {
        if let Some(outcome_failure) = e.downcast_ref::<UpdateFailure>() {
            let mut stderr = io::stderr();
            outcome_failure.display(&mut stderr).ok();
        } else {
            eprintln!("Error: {}", e);

            for cause in e.iter_causes() {
                eprintln!("\tCaused By: {}", cause);
            }
        }

        process::exit(1);
    }
}

fn generate_example() {
    print!("{}", Config::example());
}

fn run(args: &Args) -> Result<(), Error> {
    initialize_logging(args)?;
    let cfg = args.config()?;

    if log_enabled!(log::Level::Debug) {
        for line in format!("{:#?}", cfg).lines() {
            debug!("{}", line);
        }
    }

    let options = Options {
        dry_run: args.dry_run,
        fail_fast: args.fail_fast || cfg.general.fail_fast,
        timeout: cfg.general.timeout,
    };
    let driver = Driver::with_config(&cfg, options)?;

    let runtime = tokio::runtime::Runtime::new().context("Unable to start the async runtime")?;
    let summary = runtime.block_on(driver.run())?;

    info!(
        "Backed up {} of {} repositories ({} were out of date)",
        summary.backed_up.len(),
        summary.total,
        summary.stale.len()
    );

    Ok(())
}

#[derive(Debug, Clone, PartialEq, StructOpt)]
#[structopt(about = "Back up every GitHub repository you can see into S3.")]
struct Args {
    #[structopt(
        short = "c",
        long = "config",
        help = "The configuration file to use (defaults to ~/.bundle-backup.toml)."
    )]
    config_file: Option<String>,
    #[structopt(
        short = "v",
        long = "verbose",
        parse(from_occurrences),
        help = "Verbose output (repeat for more verbosity)"
    )]
    verbosity: u64,
    #[structopt(
        long = "example-config",
        help = "Generate an example config and immediately exit."
    )]
    example_config: bool,
    #[structopt(
        long = "dry-run",
        help = "Only report which repositories are out of date."
    )]
    dry_run: bool,
    #[structopt(
        long = "fail-fast",
        help = "Stop at the first repository which can't be backed up."
    )]
    fail_fast: bool,
}

impl Args {
    pub fn config(&self) -> Result<Config, Error> {
        let (config_file, must_exist) = match self.config_file {
            Some(ref file) => (file.as_str(), true),
            None => (DEFAULT_CONFIG_FILE, false),
        };

        let config_file =
            shellexpand::full(config_file).context("Unable to expand wildcards")?;

        Config::load(Path::new(&*config_file), must_exist, |key| env::var(key).ok())
            .context("Couldn't load the config")
            .map_err(Into::into)
    }
}

fn initialize_logging(args: &Args) -> Result<(), Error> {
    let mut builder = Builder::new();

    let level = match args.verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    builder.filter(Some("bundle_backup"), level);

    if let Ok(filter) = env::var("RUST_LOG") {
        builder.parse_filters(&filter);
    }

    builder.format(|out, record| match record.line() {
        Some(line) => writeln!(
            out,
            "{} [{:5}] ({}#{}): {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.target(),
            line,
            record.args()
        ),
        None => writeln!(
            out,
            "{} [{:5}] ({}): {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.target(),
            record.args()
        ),
    });

    builder.try_init()?;

    Ok(())
}
