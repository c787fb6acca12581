//! Tracing subscriber setup for the command line

use std::io::{self, IsTerminal};

use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Error, Result};

/// Filter directive for a `-v` count; `RUST_LOG` takes precedence
pub fn filter_directive(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbosity {
        0 => "mlearn=info,warn",
        1 => "mlearn=debug,info",
        2 => "mlearn=trace,debug",
        _ => "trace",
    }
}

/// Install the global subscriber, writing to stderr
pub fn init_logging(verbosity: u8, quiet: bool, json_output: bool) -> Result<()> {
    let directive = filter_directive(verbosity, quiet);
    let env_filter = if quiet {
        EnvFilter::new(directive)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };

    let result = if json_output {
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stderr)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(layer).try_init()
    } else if io::stderr().is_terminal() {
        let layer = fmt::layer()
            .with_target(false)
            .with_ansi(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(layer).try_init()
    } else {
        let layer = fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .without_time()
            .with_writer(io::stderr)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(layer).try_init()
    };

    result.map_err(|e| Error::internal(format!("Failed to initialise logging: {e}")))
}
