// Common library for the file transfer engine: protocols, plugins, engine,
// audit log, catalog and scheduler shared by the worker and integration tests

pub mod audit;
pub mod catalog;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod filter;
pub mod models;
pub mod plugins;
pub mod protocol;
pub mod schedule;
pub mod scheduler;
pub mod staging;
pub mod substitution;
pub mod telemetry;
