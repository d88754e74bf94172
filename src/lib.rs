//! sqlfleet - run queries, scripts and server role changes across a fleet of
//! database instances.
//!
//! The binary is a thin layer over these modules; integration tests drive
//! them directly against the in-memory mock server.

pub mod batch;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod instance;
pub mod logging;
pub mod membership;
pub mod output;
pub mod resolve;
pub mod safety;
pub mod secrets;
