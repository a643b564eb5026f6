pub mod classify;
pub mod config;
pub mod doctor;
pub mod errors;
pub mod health;
pub mod markers;
pub mod orchestrator;
pub mod os;
pub mod ports;
pub mod process;
pub mod provision;
pub mod recorder;

/// Default config file name looked up in the current directory.
pub const CONFIG_FILE: &str = "stagehand.yaml";
