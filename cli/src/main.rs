// txrx — command-line front end for the TxRx manager
//
// Scans for, connects to and exchanges terminator-framed commands with BLE peripherals
// exposing the TxRx serial profile.

mod ble;
mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use txrx_core::{
    event_channel, ChannelDelegate, DeviceInfo, DeviceProfile, Manager, ManagerHandle,
    Notification, Phase, TxRxError,
};

#[derive(Parser)]
#[command(name = "txrx")]
#[command(about = "TxRx — serial-style data exchange with BLE peripherals", long_about = None)]
#[command(version)]
struct Cli {
    /// Log manager activity at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for devices until the scan timeout or Ctrl-C
    Scan {
        /// Scan duration, overriding the configured scan timeout
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Send one command and print the replies
    Send {
        device: String,
        message: String,
        /// Message is hex encoded
        #[arg(long)]
        hex: bool,
        /// Send the message as is, without the profile terminator
        #[arg(long)]
        raw: bool,
        /// How long to look for the device
        #[arg(long)]
        scan_seconds: Option<u64>,
        /// How long to wait for replies, in milliseconds
        #[arg(short, long, default_value = "2000")]
        listen_ms: u64,
    },
    /// Connect and exchange commands typed on stdin
    Monitor { device: String },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    Reset,
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "txrx_core=debug,info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Scan { seconds } => cmd_scan(seconds).await,
        Commands::Send {
            device,
            message,
            hex,
            raw,
            scan_seconds,
            listen_ms,
        } => {
            let options = SendOptions {
                hex,
                raw,
                scan_seconds,
                listen_ms,
            };
            cmd_send(device, message, options).await
        }
        Commands::Monitor { device } => cmd_monitor(device).await,
        Commands::Config { action } => cmd_config(action).await,
    }
}

/// A running manager on the system Bluetooth adapter
struct Session {
    handle: ManagerHandle,
    notifications: mpsc::UnboundedReceiver<Notification>,
    profile: DeviceProfile,
}

impl Session {
    async fn start(scan_seconds: Option<u64>) -> Result<Self> {
        let config = config::Config::load()?;
        let (events_tx, events_rx) = event_channel();
        let transport = ble::BtleplugTransport::new(events_tx).await?;
        let (delegate, notifications) = ChannelDelegate::new();

        let handle = Manager::start(
            Arc::new(transport),
            events_rx,
            Arc::new(delegate),
            config.manager_config()?,
        )?;
        if let Some(seconds) = scan_seconds {
            handle
                .configure_timeout(Phase::Scan, seconds.saturating_mul(1000))
                .await?;
        }

        Ok(Self {
            handle,
            notifications,
            profile: config.profile.to_profile()?,
        })
    }

    async fn next(&mut self) -> Result<Notification> {
        self.notifications.recv().await.context("Manager stopped")
    }

    /// Scan until a device matching `target` by name or address shows up
    async fn find(&mut self, target: &str) -> Result<DeviceInfo> {
        self.handle.start_scan().await?;
        loop {
            match self.next().await? {
                Notification::DeviceFound(device)
                    if device.indexed_name == target
                        || device.name == target
                        || device.address == target =>
                {
                    self.handle.stop_scan().await?;
                    return Ok(device);
                }
                Notification::ScanError(e) => bail!("Scan failed: {}", e),
                Notification::ScanEnded => bail!("Device not found: {}", target),
                _ => {}
            }
        }
    }

    /// Find and connect `target`, returning once it is ready
    async fn open(&mut self, target: &str) -> Result<DeviceInfo> {
        let device = self.find(target).await?;
        println!("  {} Found {} ({})", "✓".green(), device.indexed_name.bright_cyan(), device.address.dimmed());

        self.handle.connect(&device.indexed_name).await?;
        loop {
            match self.next().await? {
                Notification::Ready(device) => {
                    println!("  {} Connected", "✓".green());
                    return Ok(device);
                }
                Notification::ConnectError { error, .. } => bail!("Connect failed: {}", error),
                _ => {}
            }
        }
    }

    /// Disconnect `device` and stop the manager
    async fn close(mut self, device: &DeviceInfo) -> Result<()> {
        match self.handle.disconnect(&device.indexed_name).await {
            Ok(()) => loop {
                if let Notification::Disconnected(_) = self.next().await? {
                    break;
                }
            },
            Err(TxRxError::NotConnected) => {}
            Err(e) => return Err(e.into()),
        }
        self.handle.shutdown().await?;
        Ok(())
    }
}

fn format_frame(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) => text.to_string(),
        Err(_) => format!("0x{}", hex::encode(data)),
    }
}

async fn cmd_scan(seconds: Option<u64>) -> Result<()> {
    let mut session = Session::start(seconds).await?;
    session.handle.start_scan().await?;

    println!("{}", "Scanning for devices... (Ctrl-C to stop)".bold());
    println!();

    let mut found = 0;
    loop {
        tokio::select! {
            notification = session.next() => match notification? {
                Notification::DeviceFound(device) => {
                    found += 1;
                    let rssi = device
                        .rssi
                        .map(|r| format!("{} dBm", r))
                        .unwrap_or_else(|| "?".to_string());
                    println!(
                        "  {} {:<24} {}  {}",
                        "•".bright_green(),
                        device.indexed_name.bright_cyan(),
                        device.address.dimmed(),
                        rssi
                    );
                }
                Notification::ScanError(TxRxError::ScanTimedOut) => {}
                Notification::ScanError(e) => println!("{} {}", "✗".red(), e),
                Notification::ScanEnded => break,
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => {
                // The scan may already have timed out
                let _ = session.handle.stop_scan().await;
            }
        }
    }

    println!();
    println!("{} device(s) found", found);
    session.handle.shutdown().await?;
    Ok(())
}

struct SendOptions {
    hex: bool,
    raw: bool,
    scan_seconds: Option<u64>,
    listen_ms: u64,
}

async fn cmd_send(target: String, message: String, options: SendOptions) -> Result<()> {
    let payload = if options.hex {
        hex::decode(message.trim()).context("Message is not valid hex")?
    } else {
        message.into_bytes()
    };

    let mut session = Session::start(options.scan_seconds).await?;
    let device = session.open(&target).await?;

    let command = if options.raw {
        payload.clone()
    } else {
        session.profile.encode_command(&payload)
    };
    session.handle.send(&device.indexed_name, command).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_millis(options.listen_ms);
    loop {
        let notification = match tokio::time::timeout_at(deadline, session.next()).await {
            Ok(notification) => notification?,
            Err(_) => break,
        };
        match notification {
            Notification::SentData(_) => {
                println!("{} {}", "→".bright_green(), format_frame(&payload));
            }
            Notification::ReceivedData { data, .. } => {
                println!("{} {}", "←".bright_blue(), format_frame(&data));
            }
            Notification::WriteError { error, .. } => bail!("Send failed: {}", error),
            Notification::ReadError { error, .. } => {
                println!("{} {}", "✗".red(), error);
            }
            Notification::Disconnected(_) => bail!("Device disconnected"),
            _ => {}
        }
    }

    session.close(&device).await
}

async fn cmd_monitor(target: String) -> Result<()> {
    let mut session = Session::start(None).await?;
    let device = session.open(&target).await?;

    println!();
    println!(
        "{} Type a command and press Enter; Ctrl-D or Ctrl-C to quit.",
        "Monitor:".bold()
    );
    println!();

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.is_empty() {
                    continue;
                }
                let command = session.profile.encode_command(line.as_bytes());
                match session.handle.send(&device.indexed_name, command).await {
                    Ok(()) => {}
                    Err(TxRxError::AlreadySending) => {
                        println!("{}", "Previous command still sending".yellow());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            notification = session.next() => match notification? {
                Notification::SentData(_) => println!("{}", "→ sent".dimmed()),
                Notification::ReceivedData { data, .. } => {
                    println!("{} {}", "←".bright_blue(), format_frame(&data));
                }
                Notification::WriteError { error, .. } | Notification::ReadError { error, .. } => {
                    println!("{} {}", "✗".red(), error);
                }
                Notification::Disconnected(_) => {
                    println!("{}", "Device disconnected".bright_red());
                    return Ok(());
                }
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close(&device).await
}

async fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Reset => {
            config.reset()?;
            println!("{} Configuration reset to defaults", "✓".green());
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
