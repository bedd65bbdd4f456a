//! Delegation Forge
//!
//! Intercepting-proxy add-on that detects Internet Computer delegation
//! chains in HTTP traffic, rewrites the terminal delegation to an
//! operator-held session key, and exports that key for browser import.
//!
//! The pipeline lives behind the narrow [`host`] contract so any proxy can
//! embed it; [`extension::Extension`] owns all process-scoped state.

pub mod app;
pub mod crypto;
pub mod delegation;
pub mod error;
pub mod export;
pub mod extension;
pub mod forgery;
pub mod host;
pub mod intercept;
pub mod keystore;
pub mod replay;
pub mod scope;

pub use error::*;
pub use extension::Extension;
