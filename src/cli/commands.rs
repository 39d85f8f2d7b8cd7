use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use log::{info, warn};
use std::collections::HashMap;

use crate::config::Config;
use crate::modbus::crc::{crc16_modbus, crc_bytes};
use crate::modbus::transport::{list_ports, SerialTransport};
use crate::output::{ConsoleSink, JsonSink, ResultSink};
use crate::services::PollScheduler;

pub async fn handle_subcommands(matches: &ArgMatches) -> Result<()> {
    // Global options are visible on the subcommand's matches as well
    let args = matches.subcommand().map(|(_, sub)| sub).unwrap_or(matches);

    match matches.subcommand_name() {
        Some("ports") => print_ports(),
        Some("crc") => print_crc(args),
        Some("init-config") => {
            let path = args
                .get_one::<String>("path")
                .ok_or_else(|| anyhow!("missing configuration path"))?;
            Config::default().save_to_file(path)?;
            println!("✅ Default configuration written to {}", path);
            Ok(())
        }
        Some("once") => poll(args, true).await,
        _ => poll(args, false).await,
    }
}

fn print_ports() -> Result<()> {
    let ports = list_ports()?;
    println!("📡 Available Serial Ports:");
    if ports.is_empty() {
        println!("   ⚠️  No serial ports found");
    }
    for (index, port) in ports.iter().enumerate() {
        println!("   {}. {}", index + 1, port);
    }
    Ok(())
}

/// Parses "01 03 00 00", "01030000" or "0x01,0x03" style input.
pub fn parse_hex_bytes<'a>(parts: impl IntoIterator<Item = &'a str>) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for part in parts {
        for token in part.split(|c: char| c == ',' || c.is_whitespace()) {
            let token = token.trim_start_matches("0x").trim_start_matches("0X");
            if token.is_empty() {
                continue;
            }
            let decoded = hex::decode(token).with_context(|| format!("invalid hex input '{}'", token))?;
            bytes.extend(decoded);
        }
    }
    Ok(bytes)
}

fn print_crc(args: &ArgMatches) -> Result<()> {
    let parts = args
        .get_many::<String>("bytes")
        .ok_or_else(|| anyhow!("no bytes given"))?
        .map(String::as_str);
    let data = parse_hex_bytes(parts)?;

    let crc = crc16_modbus(&data);
    let [lo, hi] = crc_bytes(&data);
    let mut framed = data.clone();
    framed.extend_from_slice(&[lo, hi]);

    println!("🔢 CRC: 0x{:04X} (Low: 0x{:02X}, High: 0x{:02X})", crc, lo, hi);
    println!("📦 Frame: {}", hex::encode_upper(&framed));
    Ok(())
}

fn build_sink(args: &ArgMatches, config: &Config) -> Box<dyn ResultSink> {
    match args.get_one::<String>("format").map(String::as_str) {
        Some("json") => Box::new(JsonSink),
        _ => {
            let labels: HashMap<u16, String> = config
                .registers
                .iter()
                .filter_map(|r| Some((r.register_address()?, r.label.clone()?)))
                .collect();
            Box::new(ConsoleSink::new(labels))
        }
    }
}

async fn poll(args: &ArgMatches, single_cycle: bool) -> Result<()> {
    let config = Config::from_matches(args)?;
    info!(
        "📡 Slave {} on {} @ {} baud, {} register(s) configured",
        config.slave_address,
        config.serial_port,
        config.baud_rate,
        config.registers.len()
    );

    let transport = SerialTransport::open(&config.serial_settings())?;
    let sink = build_sink(args, &config);
    let settings = config.poll_settings();
    let mut scheduler = PollScheduler::new(transport, config, sink, settings)?;

    if single_cycle {
        scheduler.run_cycle().await;
        for entry in scheduler.log().entries() {
            println!("{}", entry);
        }
        scheduler.disconnect().await;
        return Ok(());
    }

    let control = scheduler.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Stopping after the current transaction (Ctrl+C again to disconnect)...");
            control.stop();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🔌 Disconnecting...");
            control.disconnect();
        }
    });

    scheduler.run().await;
    scheduler.disconnect().await;
    info!("👋 Goodbye!");
    Ok(())
}
