use std::str::FromStr;

use anyhow::anyhow;
use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Abort on panic.
/// Use this instead of `panic = abort` in Cargo.toml, which doesn't show
/// nice backtraces.
pub fn abort_on_panic() {
    let old = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        old(info);
        std::process::abort();
    }));
}

/// Parse a `--log-level` value.  `off` maps to `None`.
pub fn parse_log_level(level: &str) -> anyhow::Result<Option<Level>> {
    if level == "off" {
        return Ok(None);
    }
    Level::from_str(level).map(Some).map_err(|_| anyhow!("unknown log level {}", level))
}

/// A `RUST_LOG` based filter, defaulting to `level_arg`
pub fn env_filter(level_arg: &str) -> anyhow::Result<EnvFilter> {
    let filter = match parse_log_level(level_arg)? {
        Some(level) => EnvFilter::builder().with_default_directive(level.into()).from_env_lossy(),
        None => EnvFilter::builder().parse_lossy("off"),
    };
    Ok(filter)
}

/// Install a console subscriber on stderr.  `log` records from the library crates are
/// bridged into it.
pub fn setup_logging(who: &str, level_arg: &str) -> anyhow::Result<()> {
    let format = fmt::format()
        .with_level(true)
        .with_ansi(true)
        .with_target(false)
        .with_source_location(true)
        .compact();

    let console_layer = fmt::layer().event_format(format).with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(console_layer)
        .with(env_filter(level_arg)?)
        .try_init()
        .map_err(|e| anyhow!("{}: cannot install logger: {}", who, e))?;
    tracing::debug!("{} logging at {}", who, level_arg);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_level_test() {
        assert_eq!(parse_log_level("debug").unwrap(), Some(Level::DEBUG));
        assert_eq!(parse_log_level("warn").unwrap(), Some(Level::WARN));
        assert_eq!(parse_log_level("off").unwrap(), None);
        assert!(parse_log_level("loud").is_err());
    }
}
