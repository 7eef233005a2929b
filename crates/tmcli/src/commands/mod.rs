//! Command implementations for tmcli

pub mod login;
pub mod models;
