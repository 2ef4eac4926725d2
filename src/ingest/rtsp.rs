//! RTSP reader on GStreamer.
//!
//! `rtspsrc ! decodebin ! videoconvert ! appsink` negotiated to RGB. A bus error, an
//! end-of-stream message or an appsink that stays empty past the read timeout is a read
//! failure; `StreamSource` then closes the session and reconnects.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use gstreamer::{ClockTime, MessageView, State};
use gstreamer_app::AppSink;
use std::time::Duration;

use super::network::{RawImage, StreamReader};
use crate::config::SourceSettings;
use crate::frame::pack_rgb_rows;

const SINK_NAME: &str = "crowdwatch_sink";

pub(crate) struct RtspReader {
    location: String,
    stall_after: Duration,
    live: Option<(gstreamer::Pipeline, AppSink)>,
}

impl RtspReader {
    pub(crate) fn new(location: String, settings: &SourceSettings) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            location,
            stall_after: settings.read_timeout,
            live: None,
        })
    }

    fn start(&self) -> Result<(gstreamer::Pipeline, AppSink)> {
        let launch = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name={} sync=false max-buffers=1 drop=true",
            self.location, SINK_NAME
        );
        let pipeline = gstreamer::parse::launch(&launch)
            .context("parse RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP launch line did not produce a pipeline"))?;
        let sink = pipeline
            .by_name(SINK_NAME)
            .and_then(|element| element.downcast::<AppSink>().ok())
            .ok_or_else(|| anyhow!("RTSP pipeline has no appsink"))?;

        pipeline
            .set_state(State::Playing)
            .context("start RTSP pipeline")?;
        Ok((pipeline, sink))
    }

    /// Surface pending bus errors and end-of-stream without blocking.
    fn check_bus(pipeline: &gstreamer::Pipeline) -> Result<bool> {
        let Some(bus) = pipeline.bus() else {
            return Ok(true);
        };
        while let Some(message) = bus.timed_pop(ClockTime::ZERO) {
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!("RTSP pipeline error: {}", err.error()));
                }
                MessageView::Eos(_) => return Ok(false),
                _ => {}
            }
        }
        Ok(true)
    }
}

impl StreamReader for RtspReader {
    fn open(&mut self) -> Result<()> {
        self.close();
        self.live = Some(self.start()?);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawImage>> {
        let (pipeline, sink) = self
            .live
            .as_ref()
            .ok_or_else(|| anyhow!("RTSP reader is not open"))?;
        if !Self::check_bus(pipeline)? {
            return Ok(None);
        }

        let wait = ClockTime::from_mseconds(self.stall_after.as_millis() as u64);
        let sample = sink
            .try_pull_sample(wait)
            .ok_or_else(|| anyhow!("no RTSP frame within {:?}", self.stall_after))?;

        let info = sample
            .caps()
            .map(gstreamer_video::VideoInfo::from_caps)
            .transpose()
            .context("read RTSP caps")?
            .ok_or_else(|| anyhow!("RTSP sample carries no caps"))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| anyhow!("RTSP sample carries no buffer"))?;
        let mapped = buffer.map_readable().context("map RTSP buffer")?;
        let pixels = pack_rgb_rows(
            mapped.as_slice(),
            info.stride()[0] as usize,
            info.width(),
            info.height(),
        )?;
        Ok(Some(RawImage {
            pixels,
            width: info.width(),
            height: info.height(),
        }))
    }

    fn close(&mut self) {
        if let Some((pipeline, _)) = self.live.take() {
            let _ = pipeline.set_state(State::Null);
        }
    }
}

impl Drop for RtspReader {
    fn drop(&mut self) {
        self.close();
    }
}
