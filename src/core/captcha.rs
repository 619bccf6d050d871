//! Captcha solvers
//!
//! The registry guards every file download with a short alphanumeric image
//! captcha. Solvers turn the raw image bytes into an answer.

use std::io::{BufRead, Cursor, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use image::{DynamicImage, ImageFormat};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate, erode};
use log::warn;

use crate::core::error::{Error, Result};

/// Length of a well-formed captcha answer
pub const CAPTCHA_LENGTH: usize = 5;

const TESSERACT_WHITELIST: &str =
    "tessedit_char_whitelist=ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Turns a captcha image into its text
pub trait CaptchaSolver: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    /// Read the captcha in `image`
    fn solve(&self, image: &[u8]) -> Result<String>;
}

/// Keep ASCII letters and digits only
pub fn sanitize_captcha(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_alphanumeric).collect()
}

/// Image container detected from the leading bytes
pub fn image_extension(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("gif")
    } else if bytes.starts_with(b"BM") {
        Some("bmp")
    } else {
        None
    }
}

/// Clean a captcha image for OCR and return it as PNG.
///
/// The image is turned to grayscale and binarized at its Otsu level, then
/// the light background is closed so thin dark scratches disappear while
/// glyph strokes keep their width.
pub fn preprocess_captcha(image: &[u8]) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(image)
        .map_err(|e| Error::CaptchaSolver(format!("unreadable captcha image: {e}")))?;

    let mut gray = decoded.to_luma8();
    let level = otsu_level(&gray);
    for pixel in gray.pixels_mut() {
        pixel.0[0] = if pixel.0[0] > level { 255 } else { 0 };
    }
    let cleaned = erode(&dilate(&gray, Norm::L1, 1), Norm::L1, 1);

    let mut png = Vec::new();
    DynamicImage::ImageLuma8(cleaned)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| Error::CaptchaSolver(format!("could not encode cleaned captcha: {e}")))?;
    Ok(png)
}

/// Answers every captcha with the same token
#[derive(Debug, Clone)]
pub struct FixedSolver {
    token: String,
}

impl FixedSolver {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl CaptchaSolver for FixedSolver {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn solve(&self, _image: &[u8]) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Saves the image and asks the user to type what it shows
#[derive(Debug, Clone)]
pub struct ManualSolver {
    image_dir: PathBuf,
}

impl Default for ManualSolver {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl ManualSolver {
    pub fn new(image_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
        }
    }

    /// Solve reading the answer from `input`
    pub fn solve_with(&self, image: &[u8], input: &mut impl BufRead) -> Result<String> {
        let extension = image_extension(image).unwrap_or("img");
        let path = self
            .image_dir
            .join(format!("sicar-captcha-{}.{extension}", std::process::id()));
        std::fs::write(&path, image)?;

        eprintln!("🔐 Captcha saved to {}", path.display());
        eprint!("Captcha: ");
        std::io::stderr().flush()?;

        let mut answer = String::new();
        let read = input.read_line(&mut answer);
        let _ = std::fs::remove_file(&path);
        if read? == 0 {
            return Err(Error::CaptchaSolver("no input".to_string()));
        }
        Ok(sanitize_captcha(&answer))
    }
}

impl CaptchaSolver for ManualSolver {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn solve(&self, image: &[u8]) -> Result<String> {
        let stdin = std::io::stdin();
        let mut lock = stdin.lock();
        self.solve_with(image, &mut lock)
    }
}

/// Runs the `tesseract` OCR executable over the image
#[derive(Debug, Clone)]
pub struct TesseractSolver {
    program: PathBuf,
}

impl Default for TesseractSolver {
    fn default() -> Self {
        Self::new("tesseract")
    }
}

impl TesseractSolver {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl CaptchaSolver for TesseractSolver {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    fn solve(&self, image: &[u8]) -> Result<String> {
        let cleaned = match preprocess_captcha(image) {
            Ok(png) => png,
            Err(e) => {
                warn!("{e}, passing the raw image to {}", self.program.display());
                image.to_vec()
            }
        };

        let mut child = Command::new(&self.program)
            .args(["stdin", "stdout", "-l", "eng", "--psm", "7", "-c", TESSERACT_WHITELIST])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::CaptchaSolver(format!(
                    "could not start {}: {e}",
                    self.program.display()
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&cleaned)?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CaptchaSolver(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }

        Ok(sanitize_captcha(&String::from_utf8_lossy(&output.stdout)))
    }
}
