//! Application core module
//!
//! Configuration shared by the library lifecycle and the CLI.

mod config;

pub use config::{
    CacheConfig, Config, CryptoConfig, DiagnosticsConfig, ExportConfig, HorizonConfig, ScopeConfig,
};
