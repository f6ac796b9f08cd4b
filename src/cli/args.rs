use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::domain::config::BridgeConfig;

/// Command line arguments for Serial Bridge
#[derive(Parser, Debug)]
#[command(
    name = "serial-bridge",
    version = env!("CARGO_PKG_VERSION"),
    about = "Broadcast a serial device to TCP clients",
    long_about = "Reads raw bytes from one serial device and forwards every chunk, unmodified, to all connected TCP clients. Survives device unplugs and busy ports by retrying with capped exponential backoff."
)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Serial device, overrides SERIAL_PORT
    #[arg(long, global = true)]
    pub serial_port: Option<String>,

    /// Listening port, overrides TCP_PORT
    #[arg(long, global = true, value_parser = clap::value_parser!(u16).range(1..))]
    pub tcp_port: Option<u16>,

    /// Address to bind the listener to
    #[arg(long, global = true)]
    pub bind: Option<String>,

    /// Command to execute (defaults to `run`)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the bridge until interrupted
    Run,
    /// Print the effective configuration
    Config {
        /// Also write it to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List serial ports visible to the OS
    Ports,
}

impl Args {
    /// Apply command line overrides on top of file and environment settings.
    pub fn apply_overrides(&self, config: &mut BridgeConfig) {
        if let Some(port) = &self.serial_port {
            config.serial.port = port.clone();
        }
        if let Some(port) = self.tcp_port {
            config.tcp.port = port;
        }
        if let Some(bind) = &self.bind {
            config.tcp.bind_address = bind.clone();
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        } else if self.quiet {
            config.logging.level = "error".to_string();
        }
    }

    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_run() {
        let args = Args::try_parse_from(["serial-bridge"]).unwrap();
        assert_eq!(args.command(), Command::Run);
    }

    #[test]
    fn test_overrides() {
        let args = Args::try_parse_from([
            "serial-bridge",
            "--serial-port",
            "/dev/ttyACM1",
            "--tcp-port",
            "7100",
            "--bind",
            "127.0.0.1",
            "-v",
            "run",
        ])
        .unwrap();

        let mut config = BridgeConfig::default();
        args.apply_overrides(&mut config);

        assert_eq!(config.serial.port, "/dev/ttyACM1");
        assert_eq!(config.tcp.port, 7100);
        assert_eq!(config.tcp.bind_address, "127.0.0.1");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_rejects_bad_port() {
        assert!(Args::try_parse_from(["serial-bridge", "--tcp-port", "http"]).is_err());
        assert!(Args::try_parse_from(["serial-bridge", "--tcp-port", "0"]).is_err());
        assert!(Args::try_parse_from(["serial-bridge", "--tcp-port", "70000"]).is_err());
    }

    #[test]
    fn test_config_subcommand() {
        let args = Args::try_parse_from(["serial-bridge", "config", "--output", "out.toml"]).unwrap();
        assert_eq!(
            args.command(),
            Command::Config {
                output: Some(PathBuf::from("out.toml"))
            }
        );
    }
}
