use crate::config::{DeviceConfig, LogLevel, LoggingConfig};
use crate::device::Device;
use crate::error::DeviceError;
use crate::network::key_to_multicast;
use crate::util::duration::Seconds;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use log::info;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Device configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print every event heard on a group
    Listen {
        /// Device name
        #[arg(short, long, default_value = "listener")]
        name: String,

        /// Group to join
        #[arg(short, long)]
        group: Option<String>,

        /// Only print events matching these patterns
        #[arg(short, long, default_value = "*")]
        pattern: Vec<String>,
    },

    /// Publish an event to a group
    Publish {
        /// Device name, used as the event prefix
        #[arg(short, long, default_value = "cli")]
        name: String,

        /// Group to publish to
        #[arg(short, long)]
        group: Option<String>,

        /// Topic, published as <name>/<topic>
        topic: String,

        /// Event data as JSON
        #[arg(default_value = "null")]
        data: String,

        /// Number of times to publish
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Pause between publications, e.g. 1, 0.5, 250ms
        #[arg(long, default_value = "1s")]
        every: Seconds,
    },

    /// Print the multicast address a group maps to
    Address {
        /// Group name
        group: String,
    },
}

pub fn run() -> Result<()> {
    let args = Args::parse();
    LoggingConfig::new()
        .with_default_level(LogLevel::from_verbosity(args.verbose))
        .apply();

    match args.command {
        Commands::Listen {
            name,
            group,
            pattern,
        } => {
            let config = device_config(args.config.as_ref(), &name, group)?;
            listen(config, &pattern)
        }
        Commands::Publish {
            name,
            group,
            topic,
            data,
            repeat,
            every,
        } => {
            let config = device_config(args.config.as_ref(), &name, group)?;
            let data: Value =
                serde_json::from_str(&data).with_context(|| format!("Invalid JSON data: {}", data))?;
            publish(config, &topic, data, repeat, every)
        }
        Commands::Address { group } => {
            println!("{}", key_to_multicast(&group));
            Ok(())
        }
    }
}

/// Config file if given, with command line values taking precedence
fn device_config(path: Option<&PathBuf>, name: &str, group: Option<String>) -> Result<DeviceConfig> {
    let mut config = match path {
        Some(path) => DeviceConfig::from_file(path)?,
        None => {
            let group = group
                .clone()
                .ok_or_else(|| anyhow!("A group is required (--group or --config)"))?;
            DeviceConfig::new(name, &group)
        }
    };
    if let Some(group) = group {
        config.group = group;
    }
    if path.is_some() && config.name.is_empty() {
        config.name = name.to_string();
    }
    Ok(config)
}

fn listen(config: DeviceConfig, patterns: &[String]) -> Result<()> {
    info!("Listening on group {} ({})", config.group, key_to_multicast(&config.group));
    let mut device = Device::with_config(config);
    for pattern in patterns {
        device.on_sync(pattern, |event, data| {
            println!("{} {}", event, data);
            Ok(())
        })?;
    }

    match device.run() {
        Ok(()) | Err(DeviceError::Interrupted) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn publish(config: DeviceConfig, topic: &str, data: Value, repeat: u32, every: Seconds) -> Result<()> {
    let mut device = Device::with_config(config);
    let event = format!("{}/{}", device.name(), topic);

    // our own publications loop back, which tells us they went out
    let (echo_tx, mut echo_rx) = tokio::sync::mpsc::unbounded_channel();
    device.on_sync(&event, move |_, _| {
        let _ = echo_tx.send(());
        Ok(())
    })?;

    let publisher = device.publisher();
    let topic = topic.to_string();
    device.task(move || async move {
        for i in 0..repeat {
            publisher.publish(&topic, &data)?;
            if i + 1 < repeat {
                Device::sleep(every).await;
            }
        }
        Ok(())
    })?;

    let deadline = publish_deadline(every, repeat);
    let mut echoed = 0;
    device.run_until(async {
        let _ = tokio::time::timeout(deadline, async {
            while echoed < repeat && echo_rx.recv().await.is_some() {
                echoed += 1;
            }
        })
        .await;
    })?;

    if echoed < repeat {
        return Err(anyhow!(
            "Only {} of {} publications were seen on the group",
            echoed,
            repeat
        ));
    }
    info!("Published {} x{}", event, repeat);
    Ok(())
}

/// How long `publish` waits for its own echoes
fn publish_deadline(every: Seconds, repeat: u32) -> Duration {
    every
        .as_duration()
        .checked_mul(repeat)
        .and_then(|total| total.checked_add(Duration::from_secs(2)))
        .unwrap_or(Duration::MAX)
}
