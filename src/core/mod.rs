//! Core library modules for sicar-dl
//!
//! This module contains the internal implementation details of the sicar-dl library.

pub mod captcha;
pub mod dom;
pub mod downloader;
pub mod error;
pub mod query;
pub mod request;
pub mod source;
pub mod state;
pub mod stream;
pub mod trigger;

// Re-export main types for internal use
pub use downloader::SicarClient;
pub use source::{resolve_output_path, SourceConfig};
