use std::io::Cursor;
use std::sync::Arc;

use image::{ImageFormat, ImageReader};

use crate::error::StreamError;

/// A single JPEG-encoded video frame.
///
/// The bytes sit behind an `Arc` so handing a frame to a blocking writer
/// does not copy the image.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub seq: u64,
}

impl Frame {
    /// Build a frame from JPEG bytes, checking the header parses.
    ///
    /// Only the header is read, the scan data is not decoded.
    pub fn from_jpeg(bytes: Vec<u8>, seq: u64) -> Result<Self, StreamError> {
        let reader = ImageReader::with_format(Cursor::new(bytes.as_slice()), ImageFormat::Jpeg);
        let (width, height) = reader
            .into_dimensions()
            .map_err(|err| StreamError::Corrupt(format!("frame {seq}: {err}")))?;

        if width == 0 || height == 0 {
            return Err(StreamError::Corrupt(format!("frame {seq}: zero-sized image")));
        }

        Ok(Self {
            data: Arc::new(bytes),
            width,
            height,
            seq,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
