//! Local camera reader (V4L2).
//!
//! Opens `/dev/videoN`, asks for packed RGB at the configured size and frame rate,
//! and falls back to whatever format the driver keeps if the request is refused.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::network::{RawImage, StreamReader};
use crate::config::SourceSettings;
use crate::frame::pack_rgb_rows;

pub(crate) struct CameraReader {
    device: String,
    width: u32,
    height: u32,
    target_fps: u32,
    state: Option<CameraState>,
    active_width: u32,
    active_height: u32,
    active_stride: usize,
}

#[self_referencing]
struct CameraState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl CameraReader {
    pub(crate) fn new(index: u32, settings: &SourceSettings) -> Self {
        Self {
            device: format!("/dev/video{}", index),
            width: settings.width,
            height: settings.height,
            target_fps: settings.target_fps,
            state: None,
            active_width: settings.width,
            active_height: settings.height,
            active_stride: settings.width as usize * 3,
        }
    }
}

impl StreamReader for CameraReader {
    fn open(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        self.close();
        let mut device = v4l::Device::with_path(&self.device)
            .with_context(|| format!("open camera {}", self.device))?;
        let mut format = device.format().context("read camera format")?;
        format.width = self.width;
        format.height = self.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("CameraReader: failed to set format on {}: {}", self.device, err);
                device
                    .format()
                    .context("read camera format after set failure")?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            return Err(anyhow!(
                "camera {} does not deliver RGB24 (driver chose {})",
                self.device,
                format.fourcc
            ));
        }

        if self.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("CameraReader: failed to set fps on {}: {}", self.device, err);
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.active_stride = (format.stride as usize).max(format.width as usize * 3);

        let state = CameraStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create camera buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "CameraReader: opened {} ({}x{})",
            self.device,
            self.active_width,
            self.active_height
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawImage>> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("camera not opened")?;
        let (width, height, stride) = (self.active_width, self.active_height, self.active_stride);
        let pixels = state
            .with_mut(|fields| {
                fields
                    .stream
                    .next()
                    .map_err(anyhow::Error::new)
                    .and_then(|(buf, _meta)| pack_rgb_rows(buf, stride, width, height))
            })
            .context("capture camera frame")?;
        Ok(Some(RawImage {
            pixels,
            width: self.active_width,
            height: self.active_height,
        }))
    }

    fn close(&mut self) {
        self.state = None;
    }
}
