//! Configuration module

pub mod cli;
pub mod settings;

pub use cli::{CliArgs, ModelIdArg};
pub use settings::{ProtocolTimings, Settings};
