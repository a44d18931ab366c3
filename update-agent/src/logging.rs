//! Log output of the agent binary.
//!
//! Running as a service the agent logs to journald. On a terminal, or if journald is
//! unreachable, routine records go to stdout and warnings and errors to stderr.
use std::io::IsTerminal;

use eyre::WrapErr as _;
use tracing::{Level, warn};
use tracing_subscriber::{
    EnvFilter,
    filter::{LevelFilter, filter_fn},
    prelude::*,
};

/// `RUST_LOG`, falling back to INFO.
fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Records below warning severity.
fn is_routine(level: &Level) -> bool {
    *level > Level::WARN
}

fn init_journald(syslog_identifier: &str) -> eyre::Result<()> {
    let journald = tracing_journald::layer()
        .wrap_err("failed connecting to journald")?
        .with_syslog_identifier(syslog_identifier.to_owned());
    tracing_subscriber::registry()
        .with(env_filter())
        .with(journald)
        .try_init()
        .wrap_err("failed installing journald subscriber")
}

fn init_terminal() -> eyre::Result<()> {
    let stdout = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stdout)
        .with_filter(filter_fn(|meta| is_routine(meta.level())));
    let stderr = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::WARN);
    tracing_subscriber::registry()
        .with(env_filter())
        .with(stdout)
        .with(stderr)
        .try_init()
        .wrap_err("failed installing terminal subscriber")
}

pub(crate) fn init(syslog_identifier: &str) {
    if std::io::stdin().is_terminal() {
        if let Err(e) = init_terminal() {
            eprintln!("logging disabled: {e:?}");
        }
        return;
    }
    match init_journald(syslog_identifier) {
        Ok(()) => {}
        Err(journald_err) => match init_terminal() {
            Ok(()) => warn!("logging to terminal instead of journald: {journald_err:?}"),
            Err(e) => eprintln!("logging disabled: {journald_err:?}, {e:?}"),
        },
    }
}
