//! Tidepool common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all Tidepool components.

pub mod config;
pub mod error;
pub mod page;

pub use config::{BufferConfig, DiskConfig, ReplacerKind};
pub use error::{Result, TidepoolError};
pub use page::{PageHeader, PageId, DEFAULT_PAGE_SIZE};
