//! Recorded-video frame source.
//!
//! Plays a local video file once, start to finish, then reports end of stream. The
//! pipeline treats that as a clean stop. Decoding needs the `ingest-file-ffmpeg`
//! feature; without it, naming a file source is a configuration failure.
//!
//! The file source MUST NOT:
//! - Fetch remote URLs
//! - Write decoded frames anywhere

use anyhow::Result;
use std::path::Path;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileDecoder;
use super::{Capture, FrameSource, SourceStats};
use crate::config::SourceSettings;
use crate::error::FatalError;

pub struct FileSource {
    path: String,
    #[cfg(feature = "ingest-file-ffmpeg")]
    decoder: FfmpegFileDecoder,
    frame_count: u64,
    finished: bool,
    last_error: Option<String>,
}

impl FileSource {
    pub fn open(path: &str, settings: &SourceSettings) -> Result<Self> {
        if path.trim().is_empty() || path.contains("://") {
            return Err(FatalError::config(format!(
                "file source only supports local paths, got '{}'",
                path
            ))
            .into());
        }
        if !Path::new(path).is_file() {
            return Err(FatalError::config(format!("video file not found: {}", path)).into());
        }

        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            let decoder = FfmpegFileDecoder::open(path, settings)
                .map_err(|e| FatalError::wrap(crate::error::FailureKind::FrameSource, e))?;
            Ok(Self {
                path: path.to_string(),
                decoder,
                frame_count: 0,
                finished: false,
                last_error: None,
            })
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            let _ = settings;
            Err(FatalError::config(format!(
                "cannot play {}: file sources require the ingest-file-ffmpeg feature",
                path
            ))
            .into())
        }
    }
}

impl FrameSource for FileSource {
    fn describe(&self) -> String {
        self.path.clone()
    }

    fn connect(&mut self) -> Result<()> {
        log::info!("FileSource: opened {}", self.path);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Capture> {
        if self.finished {
            return Ok(Capture::EndOfStream);
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            match self.decoder.next_image() {
                Ok(Some((pixels, width, height))) => {
                    let seq = self.frame_count;
                    self.frame_count += 1;
                    Ok(Capture::Frame(crate::frame::Frame::new(
                        pixels,
                        width,
                        height,
                        seq,
                        crate::now_ms(),
                    )))
                }
                Ok(None) => {
                    self.finished = true;
                    log::info!(
                        "FileSource: {} finished after {} frames",
                        self.path,
                        self.frame_count
                    );
                    Ok(Capture::EndOfStream)
                }
                Err(err) => {
                    self.last_error = Some(format!("{:#}", err));
                    Err(FatalError::wrap(crate::error::FailureKind::FrameSource, err))
                }
            }
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            self.finished = true;
            Ok(Capture::EndOfStream)
        }
    }

    fn is_healthy(&self) -> bool {
        self.last_error.is_none()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            source: self.path.clone(),
            frames_captured: self.frame_count,
            reconnects: 0,
            last_error: self.last_error.clone(),
        }
    }
}
