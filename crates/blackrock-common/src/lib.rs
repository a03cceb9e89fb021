//! ---
//! br_section: "01-core-functionality"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Shared primitives and utilities for the node agent and master."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
//! Shared primitives for the Blackrock workspace: configuration types for the
//! slave and the master, and tracing initialisation.

pub mod config;
pub mod logging;

pub use config::{
    AddressFamily, BindSpec, ConfigError, FleetConfig, LoadedFleetConfig, LogSinkSpec,
    LoggingConfig, MachineConfig, MachineRole, SlaveConfig,
};
pub use logging::{init_tracing, LogFormat};
