//! # sicar-dl Library
//!
//! Downloads rural property boundaries (shapefiles and CSVs) per municipality
//! from the Brazilian Rural Environmental Registry, and reproduces the
//! registry page's hidden-frame download trigger.
//!
//! ## Features
//!
//! - **Download trigger**: builds the `municipio[id]`/`email`/`captcha` URL and
//!   drives a hidden frame through any [`ElementRegistry`]
//! - **Registry client**: cookie session, municipality listing, captcha retries
//! - **Pluggable captcha solving**: manual prompt, tesseract, or a fixed token
//! - **Progress tracking**: optional progress callbacks for custom UIs
//!
//! ## Triggering a download
//!
//! ```rust
//! use sicar_dl::{Document, ElementRegistry};
//!
//! let mut document = Document::new();
//! sicar_dl::trigger_download(&mut document);
//!
//! let navigations = document.take_navigations();
//! assert_eq!(
//!     navigations[0].url,
//!     "../municipios/shapefile?municipio%5Bid%5D=1600709&email=test%40test.com&captcha=u6bsa"
//! );
//! assert!(document.frames().is_empty());
//! # let _ = document.find_by_id("hiddenDownloader");
//! ```
//!
//! ## Downloading a state
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use sicar_dl::{ClientConfig, DownloadOptions, OutputFormat, SicarClient, State, TesseractSolver};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SicarClient::connect(ClientConfig::default(), Arc::new(TesseractSolver::default())).await?;
//!     let results = client
//!         .download_state(State::AP, OutputFormat::Shapefile, Path::new("out"), &DownloadOptions::default())
//!         .await?;
//!     println!("{} municipalities processed", results.len());
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

// Re-export core types that users might need
pub use crate::core::captcha::{
    preprocess_captcha, sanitize_captcha, CaptchaSolver, FixedSolver, ManualSolver, TesseractSolver, CAPTCHA_LENGTH,
};
pub use crate::core::dom::{Document, ElementRegistry, LoadReport, Navigation, NodeId};
pub use crate::core::downloader::{
    validate_email, City, CityDownload, CityOutcome, ClientConfig, SicarClient, StateDownload, DEFAULT_EMAIL,
};
pub use crate::core::error::{Error, Result};
pub use crate::core::query::{QueryParams, QueryValue};
pub use crate::core::request::DownloadRequest;
pub use crate::core::source::{resolve_output_path, SourceConfig, DEFAULT_BASE_URL};
pub use crate::core::state::{suggest_state, OutputFormat, State};
pub use crate::core::stream::{DownloadOptions, DownloadStream, OverwriteBehavior, ProgressCallback};
pub use crate::core::trigger::{
    on_frame_load, DownloadTrigger, IssuedDownload, DEFAULT_BASE_PATH, HIDDEN_FRAME_ID,
};

// Internal modules
mod core;

/// Run the registry page's download trigger with its built-in request.
///
/// Points the hidden frame at
/// `../municipios/shapefile?municipio%5Bid%5D=1600709&email=test%40test.com&captcha=u6bsa`
/// and then removes every frame from `registry`.
pub fn trigger_download<R: ElementRegistry>(registry: &mut R) {
    DownloadTrigger::default().trigger_download(registry)
}

/// Download one municipality with a fresh session
///
/// # Arguments
/// * `code` - Municipality code as listed by [`SicarClient::get_cities_codes`]
/// * `folder` - Destination folder, created if missing
/// * `solver` - Captcha solver used for every attempt
///
/// Returns [`CityOutcome::Failed`] when every attempt was rejected.
pub async fn get_city(
    code: u64,
    folder: &Path,
    format: OutputFormat,
    solver: Arc<dyn CaptchaSolver>,
    options: &DownloadOptions,
) -> Result<CityOutcome> {
    let client = SicarClient::connect(ClientConfig::default(), solver).await?;
    client.download_city_code(code, format, folder, options).await
}
