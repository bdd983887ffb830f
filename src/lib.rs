//! Builder image assembly and asset caches for Cloud Native Buildpacks.

pub mod archive;
pub mod asset;
pub mod blob;
pub mod builder;
pub mod config;
pub mod constants;
pub mod download;
pub mod error;
pub mod image;
pub mod lifecycle;
pub mod logging;
pub mod module;
pub mod paths;
pub mod stack;

pub use error::{Error, Result};
