//! Command-line interface definitions and parsing

use clap::Parser;

/// Pose as a WeChat-compatible BLE pedometer reporting a fixed step count
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Step count to report
    #[arg(short, long)]
    pub steps: Option<u32>,

    /// Advertised local name
    #[arg(short, long)]
    pub name: Option<String>,

    /// HCI controller index (hciN)
    #[arg(long)]
    pub hci: Option<u16>,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Validate target writes as step records
    #[arg(long)]
    pub strict_writes: bool,

    /// Run a scripted session against the virtual controller instead of BlueZ
    #[arg(long)]
    pub simulate: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
