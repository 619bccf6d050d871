//! Hidden-frame download trigger
//!
//! Reproduces the download page's behaviour: the request URL is assigned to a
//! hidden frame so the host performs the request and offers the attachment,
//! then every frame in the document is removed.
//!
//! Cleanup runs synchronously right after the navigation is assigned, so a
//! real host may abort the navigation or never deliver the load event. The
//! two phases are exposed separately so callers can observe that race.

use log::debug;

use crate::core::dom::{ElementRegistry, LoadReport};
use crate::core::request::DownloadRequest;

/// Relative path of the municipality endpoints, as seen from the page
pub const DEFAULT_BASE_PATH: &str = "../municipios";

/// Id of the hidden frame used as navigation target
pub const HIDDEN_FRAME_ID: &str = "hiddenDownloader";

/// Load callback attached to the hidden frame.
///
/// Always reports success: nothing about the actual response is inspected.
pub fn on_frame_load() -> LoadReport {
    LoadReport {
        status: "sucesso".to_string(),
        mensagem: "Arquivo gerado com sucesso".to_string(),
    }
}

/// Result of the issue phase
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedDownload<H> {
    /// Frame the navigation was assigned to
    pub frame: H,
    /// URL assigned to the frame
    pub url: String,
    /// Whether the frame had to be created
    pub frame_created: bool,
}

/// Builds the download URL and drives the hidden frame
#[derive(Debug, Clone)]
pub struct DownloadTrigger {
    request: DownloadRequest,
    base_path: String,
    frame_id: String,
}

impl Default for DownloadTrigger {
    fn default() -> Self {
        Self::new(DownloadRequest::page_default())
    }
}

impl DownloadTrigger {
    pub fn new(request: DownloadRequest) -> Self {
        Self {
            request,
            base_path: DEFAULT_BASE_PATH.to_string(),
            frame_id: HIDDEN_FRAME_ID.to_string(),
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn with_frame_id(mut self, frame_id: impl Into<String>) -> Self {
        self.frame_id = frame_id.into();
        self
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn frame_id(&self) -> &str {
        &self.frame_id
    }

    /// `<base>/<format>?municipio%5Bid%5D=..&email=..&captcha=..`
    pub fn url(&self) -> String {
        self.request.url(&self.base_path)
    }

    /// Phase one: get or create the hidden frame and assign the URL to it
    pub fn issue<R: ElementRegistry>(&self, registry: &mut R) -> IssuedDownload<R::Handle> {
        let url = self.url();
        let (frame, frame_created) = registry.get_or_create_frame(&self.frame_id, on_frame_load);
        debug!(
            "Assigning {url} to frame '{}' (created: {frame_created})",
            self.frame_id
        );
        registry.navigate(frame, &url);
        IssuedDownload {
            frame,
            url,
            frame_created,
        }
    }

    /// Phase two: remove every frame element, the one just used included
    pub fn cleanup<R: ElementRegistry>(&self, registry: &mut R) -> usize {
        let removed = registry.remove_all_frames();
        debug!("Removed {removed} frame(s)");
        removed
    }

    /// Issue the navigation, then immediately clean up.
    ///
    /// Nothing is returned and no failure is reported: the outcome of the
    /// request is left entirely to the host.
    pub fn trigger_download<R: ElementRegistry>(&self, registry: &mut R) {
        self.issue(registry);
        self.cleanup(registry);
    }
}
