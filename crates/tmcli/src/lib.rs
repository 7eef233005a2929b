//! tmcli - command line front end for the authenticated gateway
//!
//! This crate wires the CLI flags, settings file and terminal output to
//! [`tmcli_core::Gateway`].

pub mod app;
pub mod cli;
pub mod commands;
pub mod ui;

pub use cli::{Cli, Commands};
