//! Command-line argument parsing

use clap::{Parser, ValueEnum};

use crate::core::types::ModelIdFormat;

/// Fast Pair service data layout accepted on the command line
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelIdArg {
    /// Model ID in the first three bytes
    #[default]
    Raw,
    /// Leading zero type byte, then the model ID
    Prefixed,
}

impl From<ModelIdArg> for ModelIdFormat {
    fn from(arg: ModelIdArg) -> Self {
        match arg {
            ModelIdArg::Raw => ModelIdFormat::Raw,
            ModelIdArg::Prefixed => ModelIdFormat::Prefixed,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[clap(name = "fastpair-audit", version, author)]
#[clap(about = "Discover Fast Pair devices and probe their Key-based Pairing handshake")]
pub struct CliArgs {
    /// Bluetooth adapter name (default adapter if omitted)
    #[clap(short, long)]
    pub adapter: Option<String>,

    /// Seconds to scan before listing devices
    #[clap(long, default_value = "10")]
    pub scan_secs: u64,

    /// Index of the listed device to probe
    #[clap(short, long)]
    pub test: Option<usize>,

    /// JSON file holding confirmed pairings
    #[clap(long, default_value = "/var/lib/fastpair-audit/paired.json")]
    pub store: String,

    /// Layout of the model ID inside Fast Pair service data
    #[clap(long, value_enum, default_value = "raw")]
    pub model_id_format: ModelIdArg,

    /// Forget all stored pairings before scanning
    #[clap(long)]
    pub clear_paired: bool,
}
