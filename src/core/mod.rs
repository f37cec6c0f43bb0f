//! Core business logic module

pub mod connection;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod reacquire;
pub mod registry;
pub mod scanner;
pub mod service;
pub mod types;
