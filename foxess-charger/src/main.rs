//! Command line front-end for the Fox ESS charger core.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use foxess_charger::registers::Control;
use foxess_charger::{Charger, ChargerConfig, ModbusTcpTransport, view};
use std::path::PathBuf;
use tracing::{info, warn};

/// Poll and control a Fox ESS EV charger over Modbus TCP.
#[derive(Parser, Debug)]
#[command(name = "foxess-charger")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "foxess-charger.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Poll continuously and log every snapshot (default)
    Run,
    /// Check that the charger answers
    Probe,
    /// Run one poll cycle and print the result
    Read,
    /// Write a register by name
    Write {
        /// Register name, e.g. max_charging_current
        register: String,
        /// Number, option label or on/off, depending on the register
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ChargerConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let log_config = config
        .logging
        .with_level_override(args.log_level.as_deref());
    foxess_charger_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Loaded configuration from {:?}", args.config);

    let charger = Charger::from_config(&config.device)
        .with_context(|| format!("Invalid device settings for '{}'", config.device.name))?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(charger, &config).await,
        Command::Probe => {
            let address = charger
                .probe()
                .await
                .with_context(|| format!("Charger '{}' did not answer", config.device.name))?;
            println!("Charger '{}' answered, device address {}", config.device.name, address);
            Ok(())
        }
        Command::Read => {
            let report = charger.poll_now().await;
            if !report.is_success() {
                bail!(
                    "No register block could be read from '{}'",
                    config.device.name
                );
            }
            let output = serde_json::json!({
                "snapshot": charger.snapshot().as_ref(),
                "sensors": charger.sensors(),
                "indicators": charger.indicators(),
                "controls": charger.controls(),
                "health": charger.health(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Command::Write { register, value } => write(&charger, &register, &value).await,
    }
}

async fn run(charger: Charger<ModbusTcpTransport>, config: &ChargerConfig) -> Result<()> {
    info!(
        device = %config.device.name,
        host = %config.device.host,
        port = config.device.port,
        "Starting foxess-charger"
    );

    let poll_task = charger.spawn();
    let mut snapshots = charger.subscribe();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                let sensors = view::render(&snapshot);
                info!(
                    device = %config.device.name,
                    status = %charger.health().status,
                    sensors = %serde_json::to_string(&sensors)?,
                    "Snapshot updated"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    poll_task.abort();
    info!("foxess-charger stopped");
    Ok(())
}

async fn write(charger: &Charger<ModbusTcpTransport>, register: &str, value: &str) -> Result<()> {
    let Some(target) = charger.register_map().writable_by_name(register) else {
        let names: Vec<&str> = charger
            .register_map()
            .writable_registers()
            .iter()
            .map(|r| r.name)
            .collect();
        bail!(
            "Unknown register '{}' (expected one of: {})",
            register,
            names.join(", ")
        );
    };

    let raw = match target.control {
        Control::Switch { .. } => {
            let on = match value {
                "on" | "true" | "1" => true,
                "off" | "false" | "0" => false,
                other => bail!("'{}' is not on/off", other),
            };
            charger.set_switch(register, on).await?
        }
        Control::Select { .. } if value.parse::<f64>().is_err() => {
            charger.select_option(register, value).await?
        }
        _ => {
            let logical: f64 = value
                .parse()
                .with_context(|| format!("'{}' is not a number", value))?;
            charger.write_value(register, logical).await?
        }
    };

    info!(register, raw, "Write acknowledged");
    if charger.poll_now().await.is_success() {
        if let Some(state) = charger.controls().get(target.name) {
            println!("{} = {}", register, serde_json::to_string(state)?);
        }
    } else {
        warn!("Could not read back the written register");
    }
    Ok(())
}
