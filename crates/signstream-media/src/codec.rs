//! Frame codec — base64 raster decode and quality-driven JPEG encode
//!
//! Both operations are pure and fail on malformed input; the pipeline turns
//! failures into fallback responses.

use base64::Engine;
use image::imageops::FilterType;
use image::DynamicImage;
use signstream_core::QualitySettings;
use thiserror::Error;

/// Anything smaller cannot be a real camera frame.
const MIN_FRAME_BYTES: usize = 500;
/// Inbound frames above this are rejected outright.
const MAX_FRAME_BYTES: usize = 20 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid base64: {0}")]
    InvalidBase64(String),

    #[error("frame too small: {0} bytes")]
    TooSmall(usize),

    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),
}

/// Strip an optional `data:image/*;base64,` prefix.
fn strip_data_url_prefix(data: &str) -> &str {
    if data.starts_with("data:image/") {
        if let Some(idx) = data.find(',') {
            return &data[idx + 1..];
        }
    }
    data
}

fn has_known_magic(bytes: &[u8]) -> bool {
    if bytes.len() < 12 {
        return false;
    }
    // JPEG
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return true;
    }
    // PNG
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        return true;
    }
    // GIF
    if bytes.starts_with(b"GIF8") {
        return true;
    }
    // WebP: RIFF....WEBP
    if bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        return true;
    }
    false
}

/// Decode a base64 image (optionally data-URL-prefixed) into a raster.
///
/// Validates byte-length bounds and magic bytes before handing the buffer to
/// the image decoder.
pub fn decode_base64_frame(base64_data: &str) -> Result<DynamicImage, CodecError> {
    let stripped = strip_data_url_prefix(base64_data.trim());

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(stripped)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;

    if bytes.len() < MIN_FRAME_BYTES {
        return Err(CodecError::TooSmall(bytes.len()));
    }
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(CodecError::TooLarge(bytes.len()));
    }
    if !has_known_magic(&bytes) {
        return Err(CodecError::UnsupportedFormat);
    }

    image::load_from_memory(&bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Encode a raster as a base64 JPEG data URL honoring the profile's quality.
///
/// Progressive encoding stays off; the `image` JPEG encoder is baseline-only,
/// which matches the low-latency requirement. Entropy-coding optimization
/// (enabled on profiles with `compression_level < 5`) is not expressible with
/// this encoder: it writes standard Huffman tables unconditionally, so the
/// flag is computed and logged but cannot change the bitstream.
pub fn encode_frame_to_base64(
    frame: &DynamicImage,
    settings: &QualitySettings,
) -> Result<String, CodecError> {
    let quality = settings.jpeg_quality.clamp(1, 100);
    // optimization knob: on for the higher-quality presets
    let optimize = settings.compression_level < 5;
    tracing::trace!(quality, optimize, "encoding frame");
    let rgb = frame.to_rgb8();

    let mut buffer = Vec::new();
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(std::io::Cursor::new(&mut buffer), quality);
    rgb.write_with_encoder(encoder)
        .map_err(|e| CodecError::Encode(e.to_string()))?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(&buffer);
    Ok(format!("data:image/jpeg;base64,{}", encoded))
}

/// Bilinear resize by the profile's resolution scale. A scale of 1.0 (or
/// anything out of range) returns the frame untouched.
pub fn scale_frame(frame: DynamicImage, scale: f32) -> DynamicImage {
    if !(0.0..1.0).contains(&scale) {
        return frame;
    }
    let width = ((frame.width() as f32 * scale) as u32).max(1);
    let height = ((frame.height() as f32 * scale) as u32).max(1);
    frame.resize_exact(width, height, FilterType::Triangle)
}
