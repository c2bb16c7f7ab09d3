// src/config/mod.rs
//! Engine configuration (`monitor`) and the standalone catalog (`catalog`).

pub mod catalog;
pub mod monitor;

pub use catalog::{load_catalog_default, load_catalog_from, Catalog};
pub use monitor::MonitorConfig;
