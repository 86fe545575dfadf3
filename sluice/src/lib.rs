//! sluice: HTTP relay and download CLI on top of `sluice_engine`.

pub mod api;
pub mod cli;
pub mod commands;
pub mod logging;
