//! Endpoint configuration for sicar-dl
//!
//! Resolves the registry URLs used for session setup, municipality listing,
//! captcha retrieval and file downloads.

use std::path::{Path, PathBuf};

use crate::core::query::QueryParams;
use crate::core::state::{OutputFormat, State};

/// Public registry root
pub const DEFAULT_BASE_URL: &str = "https://www.car.gov.br/publico";

/// Configuration for registry endpoints
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    /// Base URL all endpoints hang from
    pub base_url: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl SourceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Landing page, visited once to obtain session cookies
    pub fn index_url(&self) -> String {
        format!("{}/imoveis/index", self.base())
    }

    /// Municipality listing of a state
    pub fn downloads_url(&self, state: State) -> String {
        let query = QueryParams::new().push("sigla", state.code()).encode();
        format!("{}/municipios/downloads?{query}", self.base())
    }

    /// Captcha image, `id` only busts caches
    pub fn captcha_url(&self, id: u32) -> String {
        let query = QueryParams::new().push("id", u64::from(id)).encode();
        format!("{}/municipios/captcha?{query}", self.base())
    }

    /// Absolute counterpart of the page's `../municipios`
    pub fn municipios_base(&self) -> String {
        format!("{}/municipios", self.base())
    }

    /// File name the registry answer for municipality `code` is saved under
    pub fn output_filename(&self, code: u64, format: OutputFormat) -> String {
        format.file_name(code)
    }
}

/// Destination of a municipality file inside `folder`
pub fn resolve_output_path(folder: &Path, code: u64, format: OutputFormat) -> PathBuf {
    folder.join(format.file_name(code))
}
