use ::image::DynamicImage;

use crate::core::features::FeatureError;

/// Extensions (lowercase, without the dot) treated as images when scanning a scope.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "tiff", "tif"];

/// Returns the lowercase extension of the last path segment of `key`, if any.
pub fn extension_of(key: &str) -> Option<String> {
    let name = file_name(key);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

pub fn is_supported(key: &str) -> bool {
    extension_of(key)
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Last `/`-separated segment of an object key.
pub fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Splits a filename into `(stem, ".ext")`. The extension part is empty when
/// there is none; dotfiles keep their leading dot in the stem.
pub fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(pos) if pos > 0 => filename.split_at(pos),
        _ => (filename, ""),
    }
}

/// MIME type sent with uploads.
pub fn content_type_for(filename: &str) -> &'static str {
    match extension_of(filename).as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("tiff") | Some("tif") => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// Decode raw object bytes, guessing the format from content.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, FeatureError> {
    let img = ::image::load_from_memory(bytes)?;
    if img.width() == 0 || img.height() == 0 {
        return Err(FeatureError::EmptyImage);
    }
    Ok(img)
}

/// Width over height; a degenerate height counts as square.
pub fn aspect_ratio(img: &DynamicImage) -> f64 {
    if img.height() == 0 {
        1.0
    } else {
        img.width() as f64 / img.height() as f64
    }
}
