//! FFmpeg decoder behind `FileSource`.
//!
//! Decodes the best video track of a local file to packed RGB24. When the demuxer has
//! no packets left the decoder is flushed, so trailing buffered pictures are still
//! delivered before the end is reported.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg::software::scaling;
use ffmpeg::util::format::pixel::Pixel;

use crate::config::SourceSettings;
use crate::frame::pack_rgb_rows;

pub(crate) struct FfmpegFileDecoder {
    demuxer: ffmpeg::format::context::Input,
    track: usize,
    decoder: ffmpeg::codec::decoder::Video,
    to_rgb: scaling::Context,
    flushed: bool,
}

impl FfmpegFileDecoder {
    pub(crate) fn open(path: &str, _settings: &SourceSettings) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let demuxer =
            ffmpeg::format::input(&path).with_context(|| format!("open '{}' for decoding", path))?;
        let (track, parameters) = {
            let stream = demuxer
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| anyhow!("'{}' contains no video track", path))?;
            (stream.index(), stream.parameters())
        };
        let decoder = ffmpeg::codec::context::Context::from_parameters(parameters)
            .and_then(|ctx| ctx.decoder().video())
            .with_context(|| format!("no usable video decoder for '{}'", path))?;
        let to_rgb = scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            scaling::Flags::BILINEAR,
        )
        .context("set up RGB conversion")?;

        log::debug!(
            "FfmpegFileDecoder: {} track {} {}x{}",
            path,
            track,
            decoder.width(),
            decoder.height()
        );
        Ok(Self {
            demuxer,
            track,
            decoder,
            to_rgb,
            flushed: false,
        })
    }

    /// Decode the next picture as `(rgb, width, height)`. `Ok(None)` once the file is done.
    pub(crate) fn next_image(&mut self) -> Result<Option<(Vec<u8>, u32, u32)>> {
        loop {
            if let Some(image) = self.take_decoded()? {
                return Ok(Some(image));
            }
            if self.flushed {
                return Ok(None);
            }
            if !self.feed_packet()? {
                self.decoder.send_eof().context("flush decoder")?;
                self.flushed = true;
            }
        }
    }

    fn take_decoded(&mut self) -> Result<Option<(Vec<u8>, u32, u32)>> {
        let mut picture = ffmpeg::frame::Video::empty();
        if self.decoder.receive_frame(&mut picture).is_err() {
            return Ok(None);
        }
        let mut rgb = ffmpeg::frame::Video::empty();
        self.to_rgb
            .run(&picture, &mut rgb)
            .context("convert picture to RGB")?;
        let (width, height) = (rgb.width(), rgb.height());
        let pixels = pack_rgb_rows(rgb.data(0), rgb.stride(0), width, height)?;
        Ok(Some((pixels, width, height)))
    }

    /// Send the next packet of our track to the decoder. `false` when the demuxer is empty.
    fn feed_packet(&mut self) -> Result<bool> {
        let track = self.track;
        let next = self
            .demuxer
            .packets()
            .find(|(stream, _)| stream.index() == track);
        match next {
            Some((_, packet)) => {
                self.decoder
                    .send_packet(&packet)
                    .context("send packet to decoder")?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
