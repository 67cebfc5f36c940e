//! Read-only inspection of an lnwatch monitor store

use std::str::FromStr;

use anyhow::{anyhow, Context as _};
use clap::{Parser, Subcommand};
use lnwatch::channel::ChannelId;
use lnwatch::config::MonitorConfig;
use lnwatch::monitor::ChannelMonitor;
use lnwatch::persist::Persist;
use lnwatch_persist::kvv::redb::RedbKVVStore;
use lnwatch_persist::KVVPersister;
use lnwatch_util::config::{parse_args_and_config, MonitorArgs};
use lnwatch_util::util::{abort_on_panic, setup_logging};
use tracing::info;

#[derive(Parser, Debug)]
#[clap(about, long_about = None, args_override_self = true)]
struct InspectArgs {
    #[clap(flatten)]
    monitor: MonitorArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List active channels
    Channels,
    /// Show claimable balances of active channels
    Balances,
    /// Show one active channel in detail
    Show {
        /// funding outpoint, as txid:vout
        channel: String,
    },
    /// List archived channels
    Archived,
}

fn load_monitors(
    persister: &KVVPersister<RedbKVVStore>,
    config: &MonitorConfig,
) -> anyhow::Result<Vec<ChannelMonitor>> {
    let mut monitors = Vec::new();
    for snapshot in persister.read_channel_monitors()? {
        let monitor = ChannelMonitor::decode(&snapshot.bytes, config)
            .with_context(|| format!("decoding {}", snapshot.channel_id))?;
        monitors.push(monitor);
    }
    Ok(monitors)
}

fn describe(monitor: &ChannelMonitor) -> String {
    let status = match &monitor.chain_state().closing {
        Some(closing) => format!("closed by {} at {} ({:?})", closing.txid, closing.height, closing.reason),
        None if monitor.chain_state().funding_height.is_some() => "open".to_string(),
        None => "unconfirmed".to_string(),
    };
    format!(
        "{} update={} best={} {}{}",
        monitor.channel_id(),
        monitor.latest_update_id(),
        monitor.best_block().height,
        status,
        if monitor.is_fully_resolved() { " resolved" } else { "" }
    )
}

fn run(args: InspectArgs) -> anyhow::Result<()> {
    let config = args.monitor.monitor_config()?;
    let persister = RedbKVVStore::new(&args.monitor.datadir)
        .map_err(|e| anyhow!("opening {}: {}", args.monitor.datadir, e))?;
    info!("inspecting {}", args.monitor.datadir);

    match args.command {
        Command::Channels =>
            for monitor in load_monitors(&persister, &config)? {
                println!("{}", describe(&monitor));
            },
        Command::Balances => {
            let mut total = 0;
            for monitor in load_monitors(&persister, &config)? {
                for balance in monitor.claimable_balances() {
                    total += balance.amount_sat();
                    println!("{} {:?}", monitor.channel_id(), balance);
                }
            }
            println!("total {} sat", total);
        }
        Command::Show { channel } => {
            let channel_id = ChannelId::from_str(&channel)
                .map_err(|e| anyhow!("bad channel {}: {}", channel, e))?;
            let snapshot = persister.read_channel_monitor(&channel_id)?;
            let monitor = ChannelMonitor::decode(&snapshot.bytes, &config)?;
            println!("{}", describe(&monitor));
            println!("snapshot version {}", snapshot.version);
            println!("commitment number {}", monitor.commitment_number());
            for htlc in monitor.htlcs() {
                println!("  {:?}", htlc);
            }
            for output in monitor.chain_state().outputs.values() {
                println!("  {:?}", output);
            }
            for event in monitor.pending_events() {
                println!("  pending {:?}", event);
            }
        }
        Command::Archived =>
            for (channel_id, entry) in persister.list_archived()? {
                println!(
                    "{} update={} version={}",
                    channel_id, entry.latest_update_id, entry.version
                );
            },
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    abort_on_panic();
    let args: InspectArgs = parse_args_and_config();
    setup_logging("lnwatch-inspect", &args.monitor.log_level)?;
    run(args)
}
