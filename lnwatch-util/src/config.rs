use std::ffi::OsStr;
use std::fs;

use anyhow::{anyhow, Context as _};
use clap::{Args, Parser};
use lnwatch::chain::interface::ConfirmationTarget;
use lnwatch::config::MonitorConfig;
use toml::value::{Table, Value};

/// Default data directory, relative to the working directory
pub const DEFAULT_DIR: &str = ".lnwatch";

/// Log levels accepted by `--log-level`
pub const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

/// Options shared by the lnwatch binaries.
///
/// Any option may also be given in a TOML file with `--config FILE`, using the
/// long option name as the key.  Options after `--config` on the command line
/// override the file.
#[derive(Args, Debug, Clone)]
pub struct MonitorArgs {
    // expanded before parsing, declared for usage display
    #[allow(dead_code)]
    #[clap(
        short = 'f',
        long,
        value_parser,
        help = "configuration file, its settings are inserted in place of this argument",
        value_name = "FILE"
    )]
    config: Option<String>,

    #[clap(short, long, value_parser, help = "data directory", value_name = "DIR", default_value = DEFAULT_DIR)]
    pub datadir: String,

    #[clap(
        long,
        help = "set the logging level",
        value_name = "LEVEL",
        default_value = "info",
        value_parser = LOG_LEVELS,
    )]
    pub log_level: String,

    #[clap(long, value_parser, help = "confirmations before outputs are reported spendable", value_name = "BLOCKS")]
    pub anti_reorg_delay: Option<u32>,

    #[clap(long, value_parser, help = "blocks of history retained for reorgs", value_name = "BLOCKS")]
    pub max_reorg_depth: Option<u32>,

    #[clap(long, value_parser = parse_confirmation_target, help = "fee target for justice transactions: background, normal or high-priority", value_name = "TARGET")]
    pub justice_target: Option<ConfirmationTarget>,

    #[clap(long, value_parser, help = "delay before the first persistence retry", value_name = "MS")]
    pub retry_initial_backoff_ms: Option<u64>,

    #[clap(long, value_parser, help = "maximum delay between persistence retries", value_name = "MS")]
    pub retry_max_backoff_ms: Option<u64>,

    #[clap(long, value_parser, help = "failed attempts before a persistence failure is escalated", value_name = "COUNT")]
    pub retry_escalate_after: Option<u32>,
}

impl MonitorArgs {
    /// The monitor configuration: defaults overlaid by the given options
    pub fn monitor_config(&self) -> anyhow::Result<MonitorConfig> {
        let mut config = MonitorConfig::default();
        if let Some(delay) = self.anti_reorg_delay {
            config.anti_reorg_delay = delay;
        }
        if let Some(depth) = self.max_reorg_depth {
            config.max_reorg_depth = depth;
        }
        if let Some(target) = self.justice_target {
            config.justice_confirmation_target = target;
        }
        if let Some(ms) = self.retry_initial_backoff_ms {
            config.retry.initial_backoff_ms = ms;
        }
        if let Some(ms) = self.retry_max_backoff_ms {
            config.retry.max_backoff_ms = ms;
        }
        if let Some(count) = self.retry_escalate_after {
            config.retry.escalate_after = count;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Parse the process arguments, expanding `--config` files
pub fn parse_args_and_config<A: Parser>() -> A {
    let env_args = std::env::args().collect::<Vec<_>>();
    let args = match expand_config_args(&env_args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(2);
        }
    };
    A::parse_from(args)
}

/// Parse `env_args`, expanding `--config` files
pub fn parse_args_and_config_from<A: Parser>(env_args: &[String]) -> anyhow::Result<A> {
    let args = expand_config_args(env_args)?;
    Ok(A::try_parse_from(args)?)
}

/// Replace each `--config FILE` (or `-f FILE`, `--config=FILE`) with the
/// settings in the file, as `--key=value` arguments
pub fn expand_config_args(env_args: &[String]) -> anyhow::Result<Vec<String>> {
    let mut res = Vec::with_capacity(env_args.len());
    let mut iter = env_args.iter();
    while let Some(arg) = iter.next() {
        if let Some(path) = arg.strip_prefix("--config=") {
            res.extend(toml_to_configs(path.as_ref())?);
        } else if arg == "--config" || arg == "-f" {
            let path = iter.next().ok_or_else(|| anyhow!("{} must be followed by a path", arg))?;
            res.extend(toml_to_configs(path.as_ref())?);
        } else {
            res.push(arg.clone());
        }
    }
    Ok(res)
}

fn toml_to_configs(path: &OsStr) -> anyhow::Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.to_string_lossy()))?;
    let config: Table = toml::from_str(contents.as_str())
        .with_context(|| format!("parsing config {}", path.to_string_lossy()))?;
    let configs = config
        .into_iter()
        .flat_map(|(k, value)| convert_toml_value(k, value).into_iter())
        .map(|(k, v)| format!("--{}={}", k, v))
        .collect();
    Ok(configs)
}

fn convert_toml_value(key: String, value: Value) -> Vec<(String, String)> {
    match value {
        Value::String(s) => vec![(key, s)],
        Value::Integer(v) => vec![(key, v.to_string())],
        Value::Float(v) => vec![(key, v.to_string())],
        Value::Boolean(v) => vec![(key, v.to_string())],
        Value::Datetime(v) => vec![(key, v.to_string())],
        Value::Array(a) =>
            a.into_iter().flat_map(|v| convert_toml_value(key.clone(), v)).collect::<Vec<_>>(),
        Value::Table(_) => vec![],
    }
}

/// Parse a confirmation target name
pub fn parse_confirmation_target(s: &str) -> Result<ConfirmationTarget, String> {
    match s {
        "background" => Ok(ConfirmationTarget::Background),
        "normal" => Ok(ConfirmationTarget::Normal),
        "high-priority" | "high_priority" => Ok(ConfirmationTarget::HighPriority),
        _ => Err(format!("unknown confirmation target: {}", s)),
    }
}
