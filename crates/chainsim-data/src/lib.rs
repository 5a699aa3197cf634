//! Loads production definitions and engine settings from RON, TOML or JSON
//! data files.

pub mod loader;
pub mod schema;

pub use loader::{
    load_definitions, load_engine_config, load_production_data, DataLoadError, ProductionData,
};
