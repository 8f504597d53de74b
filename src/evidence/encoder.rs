//! Clip encoding. The default container is a `multipart/x-mixed-replace`
//! stream: one JPEG part per video frame and one `audio/L16` part per audio
//! block, each stamped with its offset from the start of the recording.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbaImage};
use thiserror::Error;

use crate::device::AudioBlock;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("empty frame")]
    EmptyFrame,
}

pub trait ClipEncoder: Send {
    fn content_type(&self) -> String;

    fn file_extension(&self) -> &'static str;

    fn encode_frame(&mut self, frame: &RgbaImage, offset_ms: u64) -> Result<Vec<u8>, EncodeError>;

    fn encode_audio(&mut self, block: &AudioBlock, offset_ms: u64) -> Result<Vec<u8>, EncodeError>;

    /// Trailer appended once the recording stops.
    fn finish(&mut self) -> Vec<u8>;
}

pub struct MjpegEncoder {
    boundary: String,
    quality: u8,
}

impl MjpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            boundary: format!("safeguard-{}", uuid::Uuid::new_v4().simple()),
            quality: quality.clamp(1, 100),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    fn part(&self, content_type: &str, offset_ms: u64, body: &[u8]) -> Vec<u8> {
        let header = format!(
            "--{}\r\nContent-Type: {}\r\nContent-Length: {}\r\nX-Offset-Ms: {}\r\n\r\n",
            self.boundary,
            content_type,
            body.len(),
            offset_ms
        );
        let mut out = Vec::with_capacity(header.len() + body.len() + 2);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out
    }
}

impl ClipEncoder for MjpegEncoder {
    fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }

    fn file_extension(&self) -> &'static str {
        "mjpeg"
    }

    fn encode_frame(&mut self, frame: &RgbaImage, offset_ms: u64) -> Result<Vec<u8>, EncodeError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(EncodeError::EmptyFrame);
        }
        // JPEG has no alpha channel.
        let rgb = DynamicImage::ImageRgba8(frame.clone()).to_rgb8();
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality).encode_image(&rgb)?;
        Ok(self.part("image/jpeg", offset_ms, &jpeg))
    }

    fn encode_audio(&mut self, block: &AudioBlock, offset_ms: u64) -> Result<Vec<u8>, EncodeError> {
        // L16 is big-endian signed 16-bit PCM.
        let pcm: Vec<u8> = block.samples.iter().flat_map(|s| s.to_be_bytes()).collect();
        let content_type = format!("audio/L16; rate={}; channels={}", block.sample_rate, block.channels);
        Ok(self.part(&content_type, offset_ms, &pcm))
    }

    fn finish(&mut self) -> Vec<u8> {
        format!("--{}--\r\n", self.boundary).into_bytes()
    }
}
