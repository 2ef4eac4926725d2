//! Synthetic (`stub://`) frame source.
//!
//! `stub://name` streams forever, paced at the target frame rate like a live camera.
//! `stub://name?frames=N` behaves like a short recorded clip: N frames delivered as
//! fast as they are asked for, then end of stream.

use anyhow::Result;
use std::time::Duration;

use super::{frame_interval, Capture, FrameSource, SourceStats};
use crate::config::SourceSettings;
use crate::frame::Frame;
use crate::ShutdownSignal;

pub struct SyntheticSource {
    name: String,
    frames: Option<u64>,
    width: u32,
    height: u32,
    pace: Duration,
    shutdown: ShutdownSignal,
    connected: bool,
    frame_count: u64,
    /// Simulated scene; changes every 50 frames.
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(
        name: String,
        frames: Option<u64>,
        settings: &SourceSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        let pace = match frames {
            Some(_) => Duration::ZERO,
            None => frame_interval(settings.target_fps),
        };
        Self {
            name,
            frames,
            width: settings.width,
            height: settings.height,
            pace,
            shutdown,
            connected: false,
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.width as usize) * (self.height as usize) * 3;

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        match self.frames {
            Some(n) => format!("stub://{} ({} frames)", self.name, n),
            None => format!("stub://{}", self.name),
        }
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {} (synthetic)", self.describe());
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Capture> {
        if self.shutdown.is_triggered() {
            return Ok(Capture::EndOfStream);
        }
        if let Some(limit) = self.frames {
            if self.frame_count >= limit {
                return Ok(Capture::EndOfStream);
            }
        }
        if !self.pace.is_zero() && self.frame_count > 0 && !self.shutdown.sleep(self.pace) {
            return Ok(Capture::EndOfStream);
        }

        let pixels = self.generate_synthetic_pixels();
        let seq = self.frame_count;
        self.frame_count += 1;
        Ok(Capture::Frame(Frame::new(
            pixels,
            self.width,
            self.height,
            seq,
            crate::now_ms(),
        )))
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            source: self.describe(),
            frames_captured: self.frame_count,
            reconnects: 0,
            last_error: None,
        }
    }
}
