// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use offset_bridge::storage::{LocalStorage, LocalSubscriptions};
use offset_bridge::{setup_tracing, AppResult, Bridge, BridgeConfig};
use tokio::{runtime, signal};
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let bridge_config = BridgeConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", bridge_config);
        return Ok(());
    }

    // an explicit RUST_LOG wins over -v
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        };
        if let Some(level) = level {
            std::env::set_var("RUST_LOG", level);
        }
    }

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _otel_guard = rt.block_on(setup_tracing())?;

    rt.block_on(run(bridge_config))
}

async fn run(bridge_config: BridgeConfig) -> AppResult<()> {
    let owner = format!("bridge-{}", bridge_config.general.id);
    let storage = Arc::new(
        LocalStorage::open(owner, &bridge_config.general.cursor_checkpoint_path).await?,
    );
    let subscriptions = Arc::new(LocalSubscriptions::new());

    let partitions: Vec<_> = bridge_config
        .storage
        .topics
        .iter()
        .flat_map(|topic| (0..topic.partitions).map(move |partition| (topic.name.clone(), partition)))
        .map(|(topic, partition)| storage.create_partition(&topic, partition))
        .collect();

    let bridge = Bridge::new(bridge_config, storage.clone(), subscriptions);
    for partition in partitions {
        bridge.manager().register_partition(partition);
    }
    info!(
        "registered {} topics, {} offset entries seeded from cursors",
        bridge.config().storage.topics.len(),
        bridge.manager().table().len()
    );

    bridge
        .run(async {
            if let Err(e) = signal::ctrl_c().await {
                error!("listen for shutdown signal error: {}", e);
            }
        })
        .await?;

    storage.flush().await?;
    info!("cursor checkpoint flushed");
    Ok(())
}
