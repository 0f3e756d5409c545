use image::{DynamicImage, ImageFormat};
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Text recognition unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image encode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Text recognition failed: {0}")]
    Failed(String),
}

/// Phrases printed on "no image" / "coming soon" stand-ins. Matched as
/// substrings of the uppercased recognised text.
pub const PLACEHOLDER_TEXTS: &[&str] = &[
    "NO IMAGE",
    "COMING SOON",
    "NO MASTER PLAN",
    "NO FLOOR PLAN",
    "NOT AVAILABLE",
    "IMAGE NOT FOUND",
    "NO PHOTO",
    "PHOTO NOT AVAILABLE",
    "IMAGE COMING SOON",
    "NO PICTURE",
    "PLACEHOLDER",
    "N/A",
    "NO IMAGE FOUND",
    "IMAGE UNAVAILABLE",
    "NO MASTERPLAN",
    "NO FLOORPLAN",
    "COMING SOON!",
    "STAY TUNED",
    "UPLOADING SOON",
    "WILL BE UPDATED",
    "NOT YET AVAILABLE",
    "IMAGE PENDING",
    "NO IMAGE AVAILABLE",
];

/// Best-effort text extraction. Callers treat any error as "no text".
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, img: &DynamicImage) -> Result<String, OcrError>;
}

pub fn contains_placeholder_phrase(text: &str) -> bool {
    // Recognisers split phrases across lines; fold whitespace first.
    let folded = text.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    PLACEHOLDER_TEXTS.iter().any(|phrase| folded.contains(phrase))
}

/// Runs the `tesseract` command-line tool on a scratch PNG.
pub struct TesseractCli {
    program: PathBuf,
}

impl TesseractCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl TextRecognizer for TesseractCli {
    fn recognize(&self, img: &DynamicImage) -> Result<String, OcrError> {
        let scratch = tempfile::Builder::new().suffix(".png").tempfile()?;
        img.to_rgb8().save_with_format(scratch.path(), ImageFormat::Png)?;

        let output = Command::new(&self.program)
            .arg(scratch.path())
            .arg("stdout")
            .output()
            .map_err(|e| OcrError::Unavailable(format!("{}: {}", self.program.display(), e)))?;

        if !output.status.success() {
            return Err(OcrError::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
