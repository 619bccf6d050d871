//! Municipality download request
//!
//! The transient record sent to the `municipios/<format>` endpoint, both by
//! the page trigger and by the HTTP client.

use crate::core::query::{QueryParams, QueryValue};
use crate::core::state::OutputFormat;

/// Municipality the page script requests (Amapá, AP)
pub const PAGE_MUNICIPALITY_ID: u64 = 1600709;

/// Contact address hardcoded in the page script
pub const PAGE_EMAIL: &str = "test@test.com";

/// Captcha answer hardcoded in the page script
pub const PAGE_CAPTCHA_TOKEN: &str = "u6bsa";

/// Parameters of a single municipality download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub municipality_id: u64,
    pub email: String,
    pub captcha_token: String,
    pub format: OutputFormat,
}

impl DownloadRequest {
    pub fn new(
        municipality_id: u64,
        email: impl Into<String>,
        captcha_token: impl Into<String>,
        format: OutputFormat,
    ) -> Self {
        Self {
            municipality_id,
            email: email.into(),
            captcha_token: captcha_token.into(),
            format,
        }
    }

    /// The record the download page assembles on every click
    pub fn page_default() -> Self {
        Self::new(
            PAGE_MUNICIPALITY_ID,
            PAGE_EMAIL,
            PAGE_CAPTCHA_TOKEN,
            OutputFormat::Shapefile,
        )
    }

    /// Query parameters in assembly order: `municipio[id]`, `email`, `captcha`
    pub fn to_query(&self) -> QueryParams {
        QueryParams::new()
            .push(
                "municipio",
                QueryValue::Map(vec![("id".to_string(), self.municipality_id.into())]),
            )
            .push("email", self.email.as_str())
            .push("captcha", self.captcha_token.as_str())
    }

    /// `<base>/<format>?<query>`
    pub fn url(&self, base: &str) -> String {
        format!(
            "{}/{}?{}",
            base.trim_end_matches('/'),
            self.format.path_segment(),
            self.to_query().encode()
        )
    }
}
