//! I/O helpers: process execution, confinement, the sandbox and artifacts.

pub mod artifacts;
pub mod config;
pub mod confine;
pub mod host;
pub mod inventory;
pub mod process;
pub mod sandbox;
