//! Registry client for sicar-dl
//!
//! Keeps a cookie-carrying session against the registry, lists the
//! municipalities of a state and downloads their shapefiles or CSVs through
//! the captcha-protected `municipios/<format>` endpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, ClientBuilder, Response};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::captcha::{image_extension, CaptchaSolver, CAPTCHA_LENGTH};
use crate::core::error::{Error, Result};
use crate::core::request::DownloadRequest;
use crate::core::source::{resolve_output_path, SourceConfig};
use crate::core::state::{OutputFormat, State};
use crate::core::stream::{create_http_stream, DownloadOptions, DownloadStream, OverwriteBehavior};

/// Maximum number of retry attempts for network errors
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (in milliseconds)
const BASE_RETRY_DELAY_MS: u64 = 1000;

/// Contact address used when none is given
pub const DEFAULT_EMAIL: &str = "sicar@sicar.com";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/88.0.4324.96 Safari/537.36 Edg/88.0.705.56";

const BROWSER_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.9";

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9_\-\.])+@([A-Za-z0-9_\-\.])+\.([A-Za-z]{2,4})$")
        .expect("email pattern is valid")
});

static MUNICIPIO_ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"data-municipio="([^"]*)""#).expect("municipio pattern is valid"));

/// A municipality as listed on a state's download page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct City {
    pub name: String,
    pub code: u64,
}

/// What happened to one municipality
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "path", rename_all = "lowercase")]
pub enum CityOutcome {
    /// Freshly downloaded
    Saved(PathBuf),
    /// Already on disk and left alone by the overwrite policy
    Kept(PathBuf),
    /// Every attempt was rejected
    Failed,
}

impl CityOutcome {
    /// File on disk for this municipality, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            CityOutcome::Saved(path) | CityOutcome::Kept(path) => Some(path),
            CityOutcome::Failed => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CityOutcome::Failed)
    }
}

/// Outcome of one municipality download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityDownload {
    pub city: City,
    pub outcome: CityOutcome,
}

/// Outcome of one state within a country-wide download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDownload {
    pub state: State,
    pub cities: Vec<CityDownload>,
}

/// Session settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Registry endpoints
    pub source: SourceConfig,
    /// Contact address sent with every file request
    pub email: String,
    /// Replaces the browser-like default headers when non-empty
    pub headers: Vec<(String, String)>,
    /// Skip TLS certificate verification
    pub accept_invalid_certs: bool,
    /// Overall request timeout
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            email: DEFAULT_EMAIL.to_string(),
            headers: Vec::new(),
            accept_invalid_certs: false,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Check an email against the pattern the registry accepts
pub fn validate_email(email: &str) -> Result<&str> {
    if EMAIL_PATTERN.is_match(email) {
        Ok(email)
    } else {
        Err(Error::InvalidEmail(email.to_string()))
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static(BROWSER_ACCEPT));
    headers
}

fn build_headers(custom: &[(String, String)]) -> Result<HeaderMap> {
    if custom.is_empty() {
        return Ok(default_headers());
    }
    let mut headers = HeaderMap::new();
    for (name, value) in custom {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidInput(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidInput(format!("invalid header value '{value}': {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Execute an operation with retry logic for network errors
async fn retry_on_network_error<F, Fut, T>(operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(Error::NetworkError(msg)) if attempt < MAX_RETRY_ATTEMPTS => {
                attempt += 1;
                let delay = BASE_RETRY_DELAY_MS * (1 << (attempt - 1)); // Exponential backoff
                warn!("Network error (attempt {attempt}): {msg}. Retrying in {delay}ms...");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Err(e) => return Err(e), // Non-network errors or max retries exceeded
        }
    }
}

/// Check if destination file exists and handle overwrite behavior.
///
/// `Ok(false)` means the existing file stays as it is.
async fn check_overwrite_permission(file_path: &Path, behavior: &OverwriteBehavior) -> Result<bool> {
    if !tokio::fs::try_exists(file_path).await.unwrap_or(false) {
        return Ok(true);
    }

    let display = file_path.display();
    match behavior {
        OverwriteBehavior::Force => {
            warn!("Overwriting existing file: {display}");
            Ok(true)
        }
        OverwriteBehavior::NeverOverwrite => {
            info!("Keeping existing file: {display}");
            Ok(false)
        }
        OverwriteBehavior::Prompt => {
            eprintln!("⚠️  File already exists: {display}");
            eprint!("Overwrite? [y/N]: ");

            use std::io::Write;
            std::io::stderr().flush()?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;

            match input.trim().to_lowercase().as_str() {
                "y" | "yes" => {
                    eprintln!("✅ Overwriting file");
                    Ok(true)
                }
                _ => {
                    eprintln!("⏭️  Keeping existing file");
                    Ok(false)
                }
            }
        }
    }
}

/// Pull `(name, code)` pairs out of a state's download page.
///
/// Every municipality carries three `data-municipio` attributes: its name,
/// its code, then one the listing does not need.
pub fn parse_cities(html: &str) -> Vec<City> {
    let values: Vec<&str> = MUNICIPIO_ATTRIBUTE
        .captures_iter(html)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();

    values
        .chunks(3)
        .filter(|chunk| chunk.len() >= 2)
        .filter_map(|chunk| match chunk[1].trim().parse::<u64>() {
            Ok(code) => Some(City {
                name: html_escape::decode_html_entities(chunk[0]).into_owned(),
                code,
            }),
            Err(_) => {
                warn!("Skipping municipality '{}' with code '{}'", chunk[0], chunk[1]);
                None
            }
        })
        .collect()
}

/// Random pause of at most `jitter`
async fn pause(jitter: Duration) {
    if jitter.is_zero() {
        return;
    }
    let factor: f64 = rand::thread_rng().gen();
    tokio::time::sleep(jitter.mul_f64(factor)).await;
}

/// Session against the registry
pub struct SicarClient {
    http: Client,
    source: SourceConfig,
    email: String,
    solver: Arc<dyn CaptchaSolver>,
}

impl SicarClient {
    /// Validate the configuration and build the HTTP session
    pub fn new(config: ClientConfig, solver: Arc<dyn CaptchaSolver>) -> Result<Self> {
        validate_email(&config.email)?;

        if config.accept_invalid_certs {
            warn!("TLS certificate verification is disabled");
        }

        let http = ClientBuilder::new()
            .default_headers(build_headers(&config.headers)?)
            .cookie_store(true)
            .tcp_keepalive(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        Ok(Self {
            http,
            source: config.source,
            email: config.email,
            solver,
        })
    }

    /// Build the session and visit the landing page to collect cookies
    pub async fn connect(config: ClientConfig, solver: Arc<dyn CaptchaSolver>) -> Result<Self> {
        let client = Self::new(config, solver)?;
        client.initialize_session().await?;
        Ok(client)
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    /// Visit the landing page so the session carries the registry cookies
    pub async fn initialize_session(&self) -> Result<()> {
        self.get(&self.source.index_url()).await?;
        debug!("Session initialized against {}", self.source.base_url);
        Ok(())
    }

    async fn get(&self, url: &str) -> Result<Response> {
        retry_on_network_error(|| async move {
            let response = self.http.get(url).send().await?;
            if !response.status().is_success() {
                return Err(Error::UrlNotOk {
                    url: url.to_string(),
                    status: response.status().as_u16(),
                });
            }
            Ok(response)
        })
        .await
    }

    /// Municipalities of `state`, in page order
    pub async fn get_cities_codes(&self, state: State) -> Result<Vec<City>> {
        let html = self.get(&self.source.downloads_url(state)).await?.text().await?;
        let cities = parse_cities(&html);
        info!("Found {} municipalities in {state}", cities.len());
        Ok(cities)
    }

    /// Fetch a fresh captcha image
    pub async fn download_captcha(&self) -> Result<Bytes> {
        let id = rand::thread_rng().gen_range(0..1_000_000);
        let response = match self.get(&self.source.captcha_url(id)).await {
            Ok(response) => response,
            Err(Error::UrlNotOk { .. }) => return Err(Error::CaptchaDownloadFailed),
            Err(e) => return Err(e),
        };

        let image = response.bytes().await?;
        if image.is_empty() || image_extension(&image).is_none() {
            return Err(Error::CaptchaDownloadFailed);
        }
        Ok(image)
    }

    /// Submit `captcha` for municipality `code` and save the answer in `folder`.
    ///
    /// An existing file the overwrite policy refuses to replace is an
    /// `AlreadyExists` I/O error.
    pub async fn download_file(
        &self,
        code: u64,
        captcha: &str,
        format: OutputFormat,
        folder: &Path,
        options: &DownloadOptions,
    ) -> Result<PathBuf> {
        let path = resolve_output_path(folder, code, format);
        if !check_overwrite_permission(&path, &options.overwrite).await? {
            return Err(Error::IoError(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("File already exists: {} (use --force to overwrite)", path.display()),
            )));
        }
        self.fetch_file(code, captcha, format, &path, options).await
    }

    async fn fetch_file(
        &self,
        code: u64,
        captcha: &str,
        format: OutputFormat,
        path: &Path,
        options: &DownloadOptions,
    ) -> Result<PathBuf> {
        let request = DownloadRequest::new(code, self.email.as_str(), captcha, format);
        let url = request.url(&self.source.municipios_base());
        let failed = |reason: String| Error::FileDownloadFailed {
            format,
            code,
            reason,
        };

        let response = match self.get(&url).await {
            Ok(response) => response,
            Err(Error::UrlNotOk { status, .. }) => return Err(failed(format!("HTTP {status}"))),
            Err(e) => return Err(e),
        };

        // Unknown when reqwest decompressed the body; checked after streaming
        let content_length = response.content_length();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_length == Some(0) {
            return Err(failed("empty response".to_string()));
        }
        if !content_type.starts_with(format.content_type()) {
            // Rejected captchas come back as an HTML page
            return Err(failed(format!("unexpected content type '{content_type}'")));
        }

        let mut file = tokio::fs::File::create(path).await?;
        let stream = create_http_stream(response);
        let written = stream_to_writer(stream, &mut file, content_length.unwrap_or(0), options).await;
        let outcome = match written {
            Ok(0) => Err(failed("empty response".to_string())),
            Ok(_) => file.flush().await.map_err(Error::from),
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            drop(file);
            let _ = tokio::fs::remove_file(path).await;
            return Err(e);
        }

        info!("Saved {}", path.display());
        Ok(path.to_path_buf())
    }

    /// One captcha round: `None` when the solver produced an unusable answer
    async fn attempt_city(
        &self,
        code: u64,
        format: OutputFormat,
        path: &Path,
        options: &DownloadOptions,
        remaining: u32,
    ) -> Result<Option<PathBuf>> {
        let image = self.download_captcha().await?;

        // Solvers prompt on stdin or run an external process
        let solver = Arc::clone(&self.solver);
        let captcha = tokio::task::spawn_blocking(move || solver.solve(&image))
            .await
            .map_err(|e| Error::CaptchaSolver(format!("solver task failed: {e}")))??;

        if captcha.len() != CAPTCHA_LENGTH {
            debug!(
                "[{remaining:02}] - Invalid captcha '{captcha}' from {} solver for municipality {code}",
                self.solver.name()
            );
            return Ok(None);
        }

        debug!("[{remaining:02}] - Requesting municipality {code} in {format} format with captcha '{captcha}'");
        self.fetch_file(code, &captcha, format, path, options)
            .await
            .map(Some)
    }

    /// Download one municipality, retrying with fresh captchas.
    ///
    /// The overwrite policy is settled before any captcha is requested: a
    /// file it refuses to replace is reported as [`CityOutcome::Kept`].
    /// [`CityOutcome::Failed`] means `options.tries` attempts were exhausted.
    pub async fn download_city_code(
        &self,
        code: u64,
        format: OutputFormat,
        folder: &Path,
        options: &DownloadOptions,
    ) -> Result<CityOutcome> {
        tokio::fs::create_dir_all(folder).await?;

        let path = resolve_output_path(folder, code, format);
        if !check_overwrite_permission(&path, &options.overwrite).await? {
            return Ok(CityOutcome::Kept(path));
        }

        for attempt in 1..=options.tries {
            let remaining = options.tries - attempt + 1;
            match self.attempt_city(code, format, &path, options, remaining).await {
                Ok(Some(saved)) => return Ok(CityOutcome::Saved(saved)),
                Ok(None) => {}
                Err(e) if e.is_attempt_failure() => {
                    debug!("[{remaining:02}] - {e} when requesting municipality {code}");
                }
                Err(e) => return Err(e),
            }

            if attempt < options.tries {
                pause(options.retry_jitter).await;
            }
        }

        warn!(
            "Giving up on municipality {code} in {format} format after {} attempt(s)",
            options.tries
        );
        Ok(CityOutcome::Failed)
    }

    /// Download every listed municipality into `folder`
    pub async fn download_cities(
        &self,
        cities: &[City],
        format: OutputFormat,
        folder: &Path,
        options: &DownloadOptions,
    ) -> Result<Vec<CityDownload>> {
        let mut results = Vec::with_capacity(cities.len());
        for city in cities {
            let outcome = self.download_city_code(city.code, format, folder, options).await?;
            results.push(CityDownload {
                city: city.clone(),
                outcome,
            });
        }
        Ok(results)
    }

    /// Download a whole state into `<folder>/<UF>`
    pub async fn download_state(
        &self,
        state: State,
        format: OutputFormat,
        folder: &Path,
        options: &DownloadOptions,
    ) -> Result<Vec<CityDownload>> {
        let cities = self.get_cities_codes(state).await?;
        let state_folder = folder.join(state.code());
        self.download_cities(&cities, format, &state_folder, options).await
    }

    /// Download every state
    pub async fn download_country(
        &self,
        format: OutputFormat,
        folder: &Path,
        options: &DownloadOptions,
    ) -> Result<Vec<StateDownload>> {
        let mut results = Vec::with_capacity(State::ALL.len());
        for state in State::ALL {
            let cities = self.download_state(state, format, folder, options).await?;
            results.push(StateDownload { state, cities });
        }
        Ok(results)
    }
}

/// Copy a response stream into `writer`, reporting progress
async fn stream_to_writer<W: AsyncWrite + Unpin>(
    mut stream: DownloadStream,
    writer: &mut W,
    total_size: u64,
    options: &DownloadOptions,
) -> Result<u64> {
    let mut buffer = vec![0u8; options.buffer_size.max(1)];
    let mut downloaded = 0u64;

    loop {
        let bytes_read = stream
            .read(&mut buffer)
            .await
            .map_err(|e| Error::NetworkError(format!("Stream read error: {e}")))?;

        if bytes_read == 0 {
            break;
        }

        writer.write_all(&buffer[..bytes_read]).await?;
        downloaded += bytes_read as u64;

        if let Some(ref progress) = options.progress {
            progress(downloaded, total_size);
        }
    }

    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::captcha::FixedSolver;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDRcaptcha";
    const ZIP: &[u8] = b"PK\x03\x04shapefile-bytes";

    fn test_options() -> DownloadOptions {
        DownloadOptions {
            tries: 3,
            retry_jitter: Duration::ZERO,
            overwrite: OverwriteBehavior::Force,
            ..Default::default()
        }
    }

    fn client_with(server: &MockServer, solver: Arc<dyn CaptchaSolver>) -> SicarClient {
        let config = ClientConfig {
            source: SourceConfig::new(format!("{}/publico", server.uri())),
            email: "test@test.com".to_string(),
            ..Default::default()
        };
        SicarClient::new(config, solver).unwrap()
    }

    fn client_for(server: &MockServer, token: &str) -> SicarClient {
        client_with(server, Arc::new(FixedSolver::new(token)))
    }

    fn gzip(body: &[u8]) -> Vec<u8> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body).unwrap();
        encoder.finish().unwrap()
    }

    /// Answers through a nested `block_on`, which panics on an async worker
    struct BlockingSolver;

    impl CaptchaSolver for BlockingSolver {
        fn name(&self) -> &'static str {
            "blocking"
        }

        fn solve(&self, _image: &[u8]) -> Result<String> {
            tokio::runtime::Handle::current().block_on(async { Ok("abcde".to_string()) })
        }
    }

    async fn mount_captcha(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/publico/municipios/captcha"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(PNG.to_vec(), "image/png"))
            .mount(server)
            .await;
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("valid@example.com").is_ok());
        assert!(validate_email("first.last-1@sub.domain.br").is_ok());
        assert!(matches!(validate_email("invalid_email"), Err(Error::InvalidEmail(_))));
        assert!(validate_email("a@b.toolongtld").is_err());
    }

    #[test]
    fn test_new_rejects_invalid_email() {
        let config = ClientConfig {
            email: "invalid_email".to_string(),
            ..Default::default()
        };
        let result = SicarClient::new(config, Arc::new(FixedSolver::new("abcde")));
        assert!(matches!(result, Err(Error::InvalidEmail(_))));
    }

    #[test]
    fn test_custom_headers_replace_defaults() {
        let headers = build_headers(&[("Custom-Header".to_string(), "Value".to_string())]).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("custom-header").unwrap(), "Value");

        let defaults = build_headers(&[]).unwrap();
        assert!(defaults.get(USER_AGENT).unwrap().to_str().unwrap().contains("Mozilla"));

        assert!(build_headers(&[("bad header".to_string(), "x".to_string())]).is_err());
    }

    #[test]
    fn test_parse_cities_triples() {
        let html = r#"
            <button data-municipio="Macap&aacute;"></button><span data-municipio="1600303"></span><i data-municipio="x"></i>
            <button data-municipio="Serra do Navio"></button><span data-municipio="1600709"></span><i data-municipio="x"></i>
            <button data-municipio="Ama&#231;&#xE1;ri"></button><span data-municipio="1600055"></span>
        "#;
        assert_eq!(
            parse_cities(html),
            vec![
                City { name: "Macapá".to_string(), code: 1600303 },
                City { name: "Serra do Navio".to_string(), code: 1600709 },
                City { name: "Amaçári".to_string(), code: 1600055 },
            ]
        );
    }

    #[test]
    fn test_parse_cities_skips_bad_codes() {
        let html = r#"data-municipio="Nowhere" data-municipio="n/a" data-municipio="x""#;
        assert!(parse_cities(html).is_empty());
        assert!(parse_cities("<html></html>").is_empty());
    }

    #[test]
    fn test_parse_cities_decodes_entities() {
        let html = concat!(
            r#"<a data-municipio="S&atilde;o Jo&atilde;o d&apos;Alian&ccedil;a"></a><a data-municipio="5220009"></a><a data-municipio="s"></a>"#,
            r#"<a data-municipio="Conc&ntilde;a &amp; N&ordm;1"></a><a data-municipio="1"></a><a data-municipio="s"></a>"#,
        );
        let names: Vec<String> = parse_cities(html).into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["São João d'Aliança", "Concña & Nº1"]);
    }

    #[tokio::test]
    async fn test_initialize_session_visits_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/publico/imoveis/index"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "JSESSIONID=abc; Path=/"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, "abcde");
        client.initialize_session().await.unwrap();
        assert_eq!(client.email(), "test@test.com");
    }

    #[tokio::test]
    async fn test_non_success_status_is_url_not_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/publico/imoveis/index"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server, "abcde");
        match client.initialize_session().await {
            Err(Error::UrlNotOk { url, status }) => {
                assert_eq!(status, 503);
                assert!(url.ends_with("/publico/imoveis/index"));
            }
            other => panic!("Expected UrlNotOk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_cities_codes() {
        let server = MockServer::start().await;
        let html = r#"<li data-municipio="Oiapoque"></li><li data-municipio="1600501"></li><li data-municipio="s"></li>"#;
        Mock::given(method("GET"))
            .and(path("/publico/municipios/downloads"))
            .and(query_param("sigla", "AP"))
            .respond_with(ResponseTemplate::new(200).set_body_string(html))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, "abcde");
        let cities = client.get_cities_codes(State::AP).await.unwrap();
        assert_eq!(
            cities,
            vec![City {
                name: "Oiapoque".to_string(),
                code: 1600501
            }]
        );
    }

    #[tokio::test]
    async fn test_download_captcha_rejects_non_image() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/publico/municipios/captcha"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>busy</html>"))
            .mount(&server)
            .await;

        let client = client_for(&server, "abcde");
        assert!(matches!(
            client.download_captcha().await,
            Err(Error::CaptchaDownloadFailed)
        ));
    }

    #[tokio::test]
    async fn test_download_captcha_returns_image() {
        let server = MockServer::start().await;
        mount_captcha(&server).await;

        let client = client_for(&server, "abcde");
        assert_eq!(client.download_captcha().await.unwrap().as_ref(), PNG);
    }

    #[tokio::test]
    async fn test_download_city_code_saves_shapefile() {
        let server = MockServer::start().await;
        mount_captcha(&server).await;
        Mock::given(method("GET"))
            .and(path("/publico/municipios/shapefile"))
            .and(query_param("municipio[id]", "1600709"))
            .and(query_param("email", "test@test.com"))
            .and(query_param("captcha", "u6bsa"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(ZIP.to_vec(), "application/zip"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("temp");
        let progressed = Arc::new(AtomicU64::new(0));
        let progressed_clone = Arc::clone(&progressed);
        let options = DownloadOptions {
            progress: Some(Arc::new(move |downloaded, _total| {
                progressed_clone.store(downloaded, Ordering::SeqCst);
            })),
            ..test_options()
        };

        let client = client_for(&server, "u6bsa");
        let outcome = client
            .download_city_code(1600709, OutputFormat::Shapefile, &folder, &options)
            .await
            .unwrap();

        let saved = folder.join("SHAPE_1600709.zip");
        assert_eq!(outcome, CityOutcome::Saved(saved.clone()));
        assert_eq!(std::fs::read(&saved).unwrap(), ZIP);
        assert_eq!(progressed.load(Ordering::SeqCst), ZIP.len() as u64);
    }

    #[tokio::test]
    async fn test_download_city_code_gives_up_when_captcha_rejected() {
        let server = MockServer::start().await;
        mount_captcha(&server).await;
        Mock::given(method("GET"))
            .and(path("/publico/municipios/shapefile"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(b"<html>captcha invalido</html>".to_vec(), "text/html"))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = client_for(&server, "wrong");
        let result = client
            .download_city_code(1600709, OutputFormat::Shapefile, dir.path(), &test_options())
            .await
            .unwrap();

        assert_eq!(result, CityOutcome::Failed);
        assert!(!dir.path().join("SHAPE_1600709.zip").exists());
    }

    #[tokio::test]
    async fn test_short_captcha_is_never_submitted() {
        let server = MockServer::start().await;
        mount_captcha(&server).await;
        Mock::given(method("GET"))
            .and(path("/publico/municipios/shapefile"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(ZIP.to_vec(), "application/zip"))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = client_for(&server, "abc");
        let result = client
            .download_city_code(1600709, OutputFormat::Shapefile, dir.path(), &test_options())
            .await
            .unwrap();
        assert_eq!(result, CityOutcome::Failed);
    }

    #[tokio::test]
    async fn test_download_csv_checks_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/publico/municipios/csv"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(b"id;area\n1;2\n".to_vec(), "text/csv; charset=utf-8"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = client_for(&server, "abcde");
        let saved = client
            .download_file(42, "abcde", OutputFormat::Csv, dir.path(), &test_options())
            .await
            .unwrap();
        assert_eq!(saved, dir.path().join("CSV_42.csv"));
        assert_eq!(std::fs::read_to_string(saved).unwrap(), "id;area\n1;2\n");

        // Same body announced as a shapefile is rejected
        let shapefile = client
            .download_file(42, "abcde", OutputFormat::Shapefile, dir.path(), &test_options())
            .await;
        assert!(matches!(shapefile, Err(Error::FileDownloadFailed { .. })));
    }

    #[tokio::test]
    async fn test_download_csv_gzip_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/publico/municipios/csv"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-encoding", "gzip")
                    .set_body_raw(gzip(b"id;area\n1;2\n"), "text/csv"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = client_for(&server, "abcde");
        let saved = client
            .download_file(42, "abcde", OutputFormat::Csv, dir.path(), &test_options())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(saved).unwrap(), "id;area\n1;2\n");
    }

    #[tokio::test]
    async fn test_download_gzip_encoded_empty_body_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/publico/municipios/csv"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-encoding", "gzip")
                    .set_body_raw(gzip(b""), "text/csv"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = client_for(&server, "abcde");
        let result = client
            .download_file(42, "abcde", OutputFormat::Csv, dir.path(), &test_options())
            .await;
        match result {
            Err(Error::FileDownloadFailed { reason, .. }) => assert_eq!(reason, "empty response"),
            other => panic!("Expected FileDownloadFailed, got {other:?}"),
        }
        assert!(!dir.path().join("CSV_42.csv").exists());
    }

    #[tokio::test]
    async fn test_download_file_server_error_is_attempt_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/publico/municipios/shapefile"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = client_for(&server, "abcde");
        let err = client
            .download_file(7, "abcde", OutputFormat::Shapefile, dir.path(), &test_options())
            .await
            .unwrap_err();
        assert!(err.is_attempt_failure());
        assert!(err.to_string().contains("HTTP 500"));
    }

    /// Amapá with two municipalities; returns the shapefile request counter
    async fn mount_two_city_state(server: &MockServer) -> Arc<AtomicUsize> {
        let html = concat!(
            r#"<a data-municipio="Amap&aacute;"></a><a data-municipio="1600105"></a><a data-municipio="s"></a>"#,
            r#"<a data-municipio="Cutias"></a><a data-municipio="1600212"></a><a data-municipio="s"></a>"#,
        );
        Mock::given(method("GET"))
            .and(path("/publico/municipios/downloads"))
            .and(query_param("sigla", "AP"))
            .respond_with(ResponseTemplate::new(200).set_body_string(html))
            .mount(server)
            .await;
        mount_captcha(server).await;
        let file_calls = Arc::new(AtomicUsize::new(0));
        let file_calls_clone = Arc::clone(&file_calls);
        Mock::given(method("GET"))
            .and(path("/publico/municipios/shapefile"))
            .respond_with(move |_: &wiremock::Request| {
                file_calls_clone.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(200).set_body_raw(ZIP.to_vec(), "application/zip")
            })
            .mount(server)
            .await;
        file_calls
    }

    #[tokio::test]
    async fn test_download_state_writes_into_state_folder() {
        let server = MockServer::start().await;
        let file_calls = mount_two_city_state(&server).await;

        let dir = tempfile::tempdir().unwrap();
        let client = client_for(&server, "abcde");
        let results = client
            .download_state(State::AP, OutputFormat::Shapefile, dir.path(), &test_options())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].city.name, "Amapá");
        assert_eq!(
            results[0].outcome,
            CityOutcome::Saved(dir.path().join("AP").join("SHAPE_1600105.zip"))
        );
        assert_eq!(
            results[1].outcome.path(),
            Some(dir.path().join("AP").join("SHAPE_1600212.zip").as_path())
        );
        assert_eq!(file_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_download_state_keeps_existing_file_and_continues() {
        let server = MockServer::start().await;
        let file_calls = mount_two_city_state(&server).await;

        let dir = tempfile::tempdir().unwrap();
        let state_folder = dir.path().join("AP");
        std::fs::create_dir_all(&state_folder).unwrap();
        let existing = state_folder.join("SHAPE_1600105.zip");
        std::fs::write(&existing, "previous run").unwrap();

        let options = DownloadOptions {
            overwrite: OverwriteBehavior::NeverOverwrite,
            ..test_options()
        };
        let client = client_for(&server, "abcde");
        let results = client
            .download_state(State::AP, OutputFormat::Shapefile, dir.path(), &options)
            .await
            .unwrap();

        assert_eq!(results[0].outcome, CityOutcome::Kept(existing.clone()));
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "previous run");
        assert_eq!(
            results[1].outcome,
            CityOutcome::Saved(state_folder.join("SHAPE_1600212.zip"))
        );
        assert_eq!(std::fs::read(state_folder.join("SHAPE_1600212.zip")).unwrap(), ZIP);
        // Only the missing municipality reached the file endpoint
        assert_eq!(file_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_solver_runs_off_the_async_worker() {
        let server = MockServer::start().await;
        mount_captcha(&server).await;
        Mock::given(method("GET"))
            .and(path("/publico/municipios/shapefile"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(ZIP.to_vec(), "application/zip"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = client_with(&server, Arc::new(BlockingSolver));
        let outcome = client
            .download_city_code(7, OutputFormat::Shapefile, dir.path(), &test_options())
            .await
            .unwrap();
        assert_eq!(outcome, CityOutcome::Saved(dir.path().join("SHAPE_7.zip")));
    }

    #[tokio::test]
    async fn test_retry_exponential_backoff() {
        use std::time::Instant;

        let start_time = Instant::now();
        let call_count = Arc::new(AtomicUsize::new(0));

        let result = retry_on_network_error(|| {
            let count_clone = Arc::clone(&call_count);
            async move {
                let call_num = count_clone.fetch_add(1, Ordering::SeqCst) + 1;
                if call_num <= 2 {
                    Err(Error::NetworkError("Simulated network failure".to_string()))
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert!(start_time.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_network_error() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let result: Result<()> = retry_on_network_error(|| {
            let count_clone = Arc::clone(&call_count);
            async move {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Err(Error::CaptchaDownloadFailed)
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overwrite_behavior_force() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "existing content").unwrap();

        let result = check_overwrite_permission(temp_file.path(), &OverwriteBehavior::Force).await;
        assert!(result.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_behavior_never() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "existing content").unwrap();

        let result = check_overwrite_permission(temp_file.path(), &OverwriteBehavior::NeverOverwrite).await;
        assert!(!result.unwrap(), "Existing file must be kept");
    }

    #[tokio::test]
    async fn test_download_file_refuses_existing_without_force() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/publico/municipios/shapefile"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(ZIP.to_vec(), "application/zip"))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SHAPE_9.zip"), "old").unwrap();
        let options = DownloadOptions {
            overwrite: OverwriteBehavior::NeverOverwrite,
            ..test_options()
        };

        let client = client_for(&server, "abcde");
        match client.download_file(9, "abcde", OutputFormat::Shapefile, dir.path(), &options).await {
            Err(Error::IoError(io_err)) => {
                assert_eq!(io_err.kind(), std::io::ErrorKind::AlreadyExists);
                assert!(io_err.to_string().contains("use --force to overwrite"));
            }
            other => panic!("Expected IoError with AlreadyExists kind, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_overwrite_behavior_new_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("SHAPE_1.zip");

        for behavior in [
            OverwriteBehavior::Force,
            OverwriteBehavior::NeverOverwrite,
            OverwriteBehavior::Prompt,
        ] {
            let result = check_overwrite_permission(&file_path, &behavior).await;
            assert!(result.unwrap(), "All behaviors should proceed for a new file");
        }
    }
}
