use std::{collections::HashSet, future::Future, io, path::PathBuf, process::ExitCode};

use anyhow::Result;
use clap::{command, value_parser, Arg, ArgAction, ArgMatches, Command};
use tracing::{debug, error, info, warn};

use crate::{
    entry::{RawUrlMode, RunConfig, DEFAULT_MAX_CONCURRENCY},
    fetch::{HyperFetch, RateLimitPolicy},
};

mod dump_tree;
mod entry;
mod fetch;
mod listing_parsing;

/// Exit status after Ctrl-C, as a shell would report it.
const EXIT_INTERRUPTED: u8 = 130;

fn cli() -> Command {
    command!()
        .arg(
            Arg::new("PERMALINK")
                .required(true)
                .help("Url of the folder to mirror, pinned to a revision"),
        )
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .help("Path of the folder inside the repository, as it appears in the permalink"),
        )
        .arg(
            Arg::new("destination")
                .short('d')
                .long("destination")
                .default_value(".")
                .value_parser(value_parser!(PathBuf))
                .help("The directory to download to"),
        )
        .arg(
            Arg::new("no-recursive")
                .long("no-recursive")
                .action(ArgAction::SetTrue)
                .help("Only download the files directly inside the folder"),
        )
        .arg(
            Arg::new("file")
                .short('f')
                .long("file")
                .action(ArgAction::Append)
                .help("Only download files with this name, can be repeated"),
        )
        .arg(
            Arg::new("follow-symlinks")
                .long("follow-symlinks")
                .action(ArgAction::SetTrue)
                .help("Download symlinked files and descend into symlinked directories"),
        )
        .arg(
            Arg::new("max-concurrency")
                .short('j')
                .long("max-concurrency")
                .value_parser(value_parser!(u16).range(1..))
                .help("Maximum number of requests in flight at once [default: 100]"),
        )
        .arg(
            Arg::new("exit-on-rate-limit")
                .long("exit-on-rate-limit")
                .action(ArgAction::SetTrue)
                .help("Stop at the first rate limit instead of waiting and retrying once"),
        )
        .arg(
            Arg::new("rewrite-raw-urls")
                .long("rewrite-raw-urls")
                .action(ArgAction::SetTrue)
                .help("Derive raw file urls from the permalink instead of reading them from each file page"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Increase output verbosity (-v for debug, -vv for trace)"),
        )
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run_config(matches: &ArgMatches) -> RunConfig {
    let allow_list = matches
        .get_many::<String>("file")
        .map(|names| names.cloned().collect::<HashSet<_>>());

    let rate_limit_policy = if matches.get_flag("exit-on-rate-limit") {
        RateLimitPolicy::Abort
    } else {
        RateLimitPolicy::RetryOnce
    };

    let raw_url_mode = if matches.get_flag("rewrite-raw-urls") {
        RawUrlMode::Rewrite
    } else {
        RawUrlMode::Metadata
    };

    RunConfig {
        destination: matches.get_one::<PathBuf>("destination").unwrap().clone(),
        recursive: !matches.get_flag("no-recursive"),
        allow_list,
        follow_symlinks: matches.get_flag("follow-symlinks"),
        max_concurrency: matches
            .get_one::<u16>("max-concurrency")
            .map_or(DEFAULT_MAX_CONCURRENCY, |&n| usize::from(n)),
        rate_limit_policy,
        raw_url_mode,
    }
}

async fn run(matches: &ArgMatches) -> Result<()> {
    let permalink = matches.get_one::<String>("PERMALINK").unwrap();
    let path = matches.get_one::<String>("path").unwrap();

    let config = run_config(matches);
    let origin = dump_tree::derive_origin(permalink, path)?;

    debug!(?config, "Configuration parsed");
    info!(%origin, path = %path, destination = %config.destination.display(), "Mirroring folder");

    dump_tree::download_all(HyperFetch::new(), origin, path, config).await
}

/// Drives `run` until it finishes or `interrupt` fires. `None` means interrupted.
///
/// An interrupt that fails, like a handler that can't be installed, is
/// ignored and the run goes on.
async fn until_interrupted(
    run: impl Future<Output = Result<()>>,
    interrupt: impl Future<Output = io::Result<()>>,
) -> Option<Result<()>> {
    tokio::select! {
        result = run => Some(result),
        Ok(()) = interrupt => None,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_tracing(matches.get_count("verbose"));

    match until_interrupted(run(&matches), tokio::signal::ctrl_c()).await {
        Some(Ok(())) => {
            info!("Done");
            ExitCode::SUCCESS
        }
        Some(Err(e)) => {
            error!("{e:?}");
            ExitCode::FAILURE
        }
        None => {
            warn!("Interrupted, stopping");
            ExitCode::from(EXIT_INTERRUPTED)
        }
    }
}
