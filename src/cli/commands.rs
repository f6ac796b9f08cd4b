use crate::cli::args::{Args, Command};
use crate::core::{Bridge, Shutdown};
use crate::domain::config::BridgeConfig;
use crate::domain::error::{BridgeError, BridgeResult};
use crate::infrastructure::config::ConfigManager;
use crate::infrastructure::logging::init_logging;
use crate::infrastructure::serial::driver::list_ports;
use crate::infrastructure::serial::NativeDriver;
use serialport::SerialPortType;
use std::path::Path;
use tracing::{info, warn};

/// Execute CLI command
pub async fn execute_command(args: Args) -> BridgeResult<()> {
    let config_manager = ConfigManager::new();
    let mut config = config_manager.load_effective(args.config.as_deref())?;
    args.apply_overrides(&mut config);
    config.validate()?;

    match args.command() {
        Command::Run => run_bridge(config).await,
        Command::Config { output } => print_config(&config_manager, &config, output.as_deref()),
        Command::Ports => print_ports(),
    }
}

async fn run_bridge(config: BridgeConfig) -> BridgeResult<()> {
    init_logging(&config.logging.level).map_err(|e| BridgeError::Config {
        message: format!("Failed to initialize logging: {}", e),
    })?;

    let shutdown = Shutdown::new();
    let signals = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(()) => info!("Shutdown requested"),
                Err(e) => warn!(error = %e, "Signal handler failed, shutting down"),
            }
            shutdown.trigger();
        })
    };

    let result = Bridge::new(config, NativeDriver::new(), shutdown).run().await;
    signals.abort();
    result
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn print_config(
    config_manager: &ConfigManager,
    config: &BridgeConfig,
    output: Option<&Path>,
) -> BridgeResult<()> {
    let content = toml::to_string_pretty(config).map_err(|e| BridgeError::Config {
        message: format!("Failed to serialize config: {}", e),
    })?;
    println!("{}", content);

    if let Some(path) = output {
        config_manager.save_config_to_path(path, config)?;
        println!("Configuration written to {}", path.display());
    }
    Ok(())
}

fn print_ports() -> BridgeResult<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    for port in ports {
        println!("{:<24} {}", port.port_name, describe_port_type(&port.port_type));
    }
    Ok(())
}

fn describe_port_type(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb) => {
            let product = usb.product.as_deref().unwrap_or("USB device");
            format!("{} ({:04x}:{:04x})", product, usb.vid, usb.pid)
        }
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::Unknown => "unknown".to_string(),
    }
}
