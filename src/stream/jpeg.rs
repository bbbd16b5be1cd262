use crate::error::StreamError;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Cuts an MJPEG byte stream (`image2pipe` output) into whole JPEG images.
///
/// Bytes before a start-of-image marker are dropped. A frame that grows past
/// `max_frame_bytes` without an end-of-image marker is discarded and
/// reported as corrupt; scanning resumes at the next start marker.
pub struct JpegSplitter {
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl JpegSplitter {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(256 * 1024),
            max_frame_bytes,
        }
    }

    /// Feed a chunk of pipe output. Returns the complete images it closed,
    /// in stream order, with an error in place of each oversize frame.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Vec<u8>, StreamError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buf, SOI, 0) else {
                self.keep_dangling_marker_byte();
                break;
            };
            if start > 0 {
                self.buf.drain(..start);
            }

            let end = find_marker(&self.buf, EOI, SOI.len());
            let size = end.map_or(self.buf.len(), |end| end + EOI.len());
            if size > self.max_frame_bytes {
                out.push(Err(StreamError::Corrupt(format!(
                    "frame exceeds {} bytes ({size} bytes before resync)",
                    self.max_frame_bytes
                ))));
                self.resync();
                continue;
            }

            match end {
                Some(end) => out.push(Ok(self.buf.drain(..end + EOI.len()).collect())),
                None => break,
            }
        }

        out
    }

    /// Drop the oversize frame at the front, up to the next start marker.
    fn resync(&mut self) {
        match find_marker(&self.buf, SOI, SOI.len()) {
            Some(next) => {
                self.buf.drain(..next);
            }
            None => self.keep_dangling_marker_byte(),
        }
    }

    /// Clear the buffer except a trailing 0xFF, which may be the first half
    /// of the next SOI.
    fn keep_dangling_marker_byte(&mut self) {
        let keep = usize::from(self.buf.last() == Some(&0xFF));
        let cut = self.buf.len() - keep;
        self.buf.drain(..cut);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|pair| pair == marker)
        .map(|pos| pos + from)
}
