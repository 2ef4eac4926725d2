//! HTTP MJPEG reader.
//!
//! Handles both `multipart/x-mixed-replace` streams and plain JPEG snapshot endpoints
//! (polled at the target frame rate). JPEGs are located by SOI/EOI markers and
//! decoded in-memory with `image`.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use image::GenericImageView;

use super::frame_interval;
use super::network::{RawImage, StreamReader};
use crate::config::SourceSettings;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub(crate) struct MjpegReader {
    url: String,
    agent: ureq::Agent,
    min_interval: Duration,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
}

enum HttpStream {
    Multipart(JpegScanner),
    Snapshot,
}

impl MjpegReader {
    pub(crate) fn new(url: String, settings: &SourceSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.read_timeout)
            .timeout_read(settings.read_timeout)
            .build();
        Self {
            url,
            agent,
            min_interval: frame_interval(settings.target_fps),
            stream: None,
            last_frame_at: None,
        }
    }

    fn fetch_snapshot(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .context("fetch jpeg snapshot")?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        Ok(bytes)
    }
}

impl StreamReader for MjpegReader {
    fn open(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .context("connect to http stream")?;
        let content_type = response.header("Content-Type").unwrap_or("");
        self.stream = if content_type.to_lowercase().contains("multipart") {
            Some(HttpStream::Multipart(JpegScanner::new(response.into_reader())))
        } else {
            Some(HttpStream::Snapshot)
        };
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawImage>> {
        loop {
            let jpeg = match self.stream.as_mut() {
                None => return Err(anyhow!("http stream not connected")),
                Some(HttpStream::Multipart(scanner)) => match scanner.next_jpeg()? {
                    Some(jpeg) => jpeg,
                    None => return Ok(None),
                },
                Some(HttpStream::Snapshot) => {
                    if let Some(last) = self.last_frame_at {
                        let since = last.elapsed();
                        if since < self.min_interval {
                            std::thread::sleep(self.min_interval - since);
                        }
                    }
                    self.fetch_snapshot()?
                }
            };

            let now = Instant::now();
            if let Some(last) = self.last_frame_at {
                if now.duration_since(last) < self.min_interval {
                    continue;
                }
            }
            self.last_frame_at = Some(now);
            return decode_jpeg(&jpeg).map(Some);
        }
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

/// Pulls complete JPEG images out of a multipart byte stream.
struct JpegScanner {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl JpegScanner {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// `Ok(None)` once the server closes the stream.
    fn next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let jpeg = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(jpeg));
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let drain_len = self.buffer.len() - 2;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn decode_jpeg(bytes: &[u8]) -> Result<RawImage> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    Ok(RawImage {
        pixels: image.into_rgb8().into_raw(),
        width,
        height,
    })
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_jpeg_between_multipart_headers() {
        let mut stream = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        stream.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        stream.extend_from_slice(b"\r\n--frame");
        let (start, end) = find_jpeg_bounds(&stream).unwrap();
        assert_eq!(&stream[start..end], &[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
    }

    #[test]
    fn incomplete_jpeg_is_not_returned() {
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 1, 2]), None);
        assert_eq!(find_jpeg_bounds(b"no markers"), None);
    }

    #[test]
    fn scanner_reports_closed_stream() -> Result<()> {
        let mut body = vec![0xFF, 0xD8, 9, 0xFF, 0xD9];
        body.extend_from_slice(b"trailing");
        let mut scanner = JpegScanner::new(Box::new(std::io::Cursor::new(body)));
        assert_eq!(scanner.next_jpeg()?, Some(vec![0xFF, 0xD8, 9, 0xFF, 0xD9]));
        assert_eq!(scanner.next_jpeg()?, None);
        Ok(())
    }
}
