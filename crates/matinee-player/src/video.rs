// crates/matinee-player/src/video.rs
//
// Video lane: the worker half decodes and converts frames into owned pixel
// buffers; the reader half (owned by the player) paces delivery against the
// shared clock and hands frames to the caller's texture or as a raw lock.

use std::sync::Arc;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling;
use log::debug;

use matinee_core::{Area, CodecInfo, PixelFormat, Plane, VideoFormat, VideoFormatRequest, VideoTexture};

use crate::buffer::RingBuffer;
use crate::clock::PlaybackClock;
use crate::config::Settings;
use crate::decoder::{DecoderWorker, SubmitResult};
use crate::error::{Error, Result};
use crate::helpers::formats::{best_output_pixel, from_av_pixel, to_av_pixel};
use crate::hwaccel::{self, HwDevice};
use crate::source::StreamDesc;

/// How far a frame's pts may drift from the clock before it is held back or
/// dropped.
pub(crate) const VIDEO_SYNC_THRESHOLD: f64 = 0.02;

pub(crate) struct OwnedPlane {
    pub data: Vec<u8>,
    pub stride: usize,
}

/// A decoded, converted frame with pixels owned by the pipeline. Frame
/// extent may change mid-stream, so each frame carries its own.
pub(crate) struct VideoFrame {
    pub pts: f64,
    pub width: u32,
    pub height: u32,
    pub sample_aspect_ratio: (i32, i32),
    pub format: PixelFormat,
    pub planes: Vec<OwnedPlane>,
}

impl VideoFrame {
    fn borrow_planes(&self) -> Vec<Plane<'_>> {
        self.planes
            .iter()
            .map(|plane| Plane { data: &plane.data, stride: plane.stride })
            .collect()
    }
}

/// Configure codec threading from the codec's capabilities. Mirrors what
/// the decoders of the reference stack do before opening.
pub(crate) fn apply_threading(
    context: &mut ffmpeg::codec::context::Context,
    codec: &ffmpeg::Codec,
    count: usize,
) {
    use ffmpeg::codec::{threading, Capabilities};
    let capabilities = codec.capabilities();
    let kind = if capabilities.contains(Capabilities::FRAME_THREADS) {
        threading::Type::Frame
    } else if capabilities.contains(Capabilities::SLICE_THREADS) {
        threading::Type::Slice
    } else {
        return;
    };
    context.set_threading(threading::Config { kind, count, ..Default::default() });
}

/// The scaler lives on the worker thread only; the wrapper carries the Send
/// bound its raw-pointer internals cannot declare.
struct SendScaler {
    context: scaling::Context,
    key: (u32, u32, Pixel),
}

unsafe impl Send for SendScaler {}

pub(crate) struct VideoDecoderWorker {
    decoder: ffmpeg::decoder::Video,
    scaler: Option<SendScaler>,
    hw: Option<HwDevice>,
    in_frame: ffmpeg::frame::Video,
    sw_frame: ffmpeg::frame::Video,
    output: Arc<RingBuffer<VideoFrame>>,
    clock: PlaybackClock,
    time_base: f64,
    out_format: PixelFormat,
}

pub(crate) struct VideoReader {
    output: Arc<RingBuffer<VideoFrame>>,
    clock: PlaybackClock,
    format: VideoFormat,
    current: Option<VideoFrame>,
    position: f64,
    /// Aspect ratio of the last delivered frame, when it carried one.
    frame_aspect: Option<(i32, i32)>,
    codec_aspect: (i32, i32),
    container_aspect: (i32, i32),
}

pub(crate) struct VideoLaneParts {
    pub worker: VideoDecoderWorker,
    pub reader: VideoReader,
    pub codec: CodecInfo,
    /// Wake-up handle for the worker's output, used by the decoder thread.
    pub output: Arc<RingBuffer<VideoFrame>>,
}

pub(crate) fn build_video_lane(
    desc: &StreamDesc,
    request: VideoFormatRequest,
    clock: &PlaybackClock,
    writable_clock: bool,
    settings: &Settings,
) -> Result<VideoLaneParts> {
    let codec = ffmpeg::decoder::find(desc.codec_id).ok_or_else(|| Error::UnsupportedCodec {
        index: desc.index,
        codec: desc.codec_name.clone(),
    })?;
    let mut context = ffmpeg::codec::context::Context::from_parameters(desc.parameters.clone())?;
    unsafe {
        (*context.as_mut_ptr()).pkt_timebase = desc.time_base.into();
    }
    apply_threading(&mut context, &codec, settings.thread_count);

    let hw = if request.hardware || settings.hardware_decode {
        hwaccel::setup(&mut context, &codec)
    } else {
        None
    };

    let decoder = context.decoder().video()?;
    let out_format = request
        .pixel_format
        .unwrap_or_else(|| best_output_pixel(decoder.format()));
    let format = VideoFormat {
        width: decoder.width(),
        height: decoder.height(),
        pixel_format: out_format,
    };
    let codec_aspect = unsafe {
        let sar = (*decoder.as_ptr()).sample_aspect_ratio;
        (sar.num, sar.den)
    };

    let output = Arc::new(RingBuffer::new(settings.video_frame_buffer));
    let codec_info = CodecInfo {
        name: codec.name().to_string(),
        description: codec.description().to_string(),
        threads: settings.thread_count,
    };

    Ok(VideoLaneParts {
        output: Arc::clone(&output),
        worker: VideoDecoderWorker {
            decoder,
            scaler: None,
            hw,
            in_frame: ffmpeg::frame::Video::empty(),
            sw_frame: ffmpeg::frame::Video::empty(),
            output: Arc::clone(&output),
            clock: clock.secondary(writable_clock),
            time_base: f64::from(desc.time_base),
            out_format,
        },
        reader: VideoReader {
            output,
            clock: clock.secondary(false),
            format,
            current: None,
            position: 0.0,
            frame_aspect: None,
            codec_aspect,
            container_aspect: desc.sample_aspect_ratio,
        },
        codec: codec_info,
    })
}

impl VideoDecoderWorker {
    fn convert(&mut self, use_sw: bool, pts: f64) -> Option<VideoFrame> {
        let (width, height, src_format, sar) = {
            let frame = if use_sw { &self.sw_frame } else { &self.in_frame };
            let sar = unsafe { (*frame.as_ptr()).sample_aspect_ratio };
            (frame.width(), frame.height(), frame.format(), (sar.num, sar.den))
        };

        // (Re)build the scaler on first use and whenever the source frame
        // geometry changes mid-stream.
        if self.scaler.as_ref().map_or(true, |s| s.key != (width, height, src_format)) {
            let context = scaling::Context::get(
                src_format,
                width,
                height,
                to_av_pixel(self.out_format),
                width,
                height,
                scaling::Flags::BILINEAR,
            );
            match context {
                Ok(context) => {
                    self.scaler = Some(SendScaler { context, key: (width, height, src_format) })
                }
                Err(e) => {
                    debug!("video scaler setup failed: {e}");
                    return None;
                }
            }
        }

        let mut converted = ffmpeg::frame::Video::empty();
        let scaler = &mut self.scaler.as_mut().unwrap().context;
        let source = if use_sw { &self.sw_frame } else { &self.in_frame };
        if let Err(e) = scaler.run(source, &mut converted) {
            debug!("video conversion failed: {e}");
            return None;
        }

        let format = from_av_pixel(converted.format()).unwrap_or(self.out_format);
        let planes = (0..converted.planes())
            .map(|i| OwnedPlane {
                data: converted.data(i).to_vec(),
                stride: converted.stride(i),
            })
            .collect();
        Some(VideoFrame {
            pts,
            width,
            height,
            sample_aspect_ratio: sar,
            format,
            planes,
        })
    }
}

impl DecoderWorker for VideoDecoderWorker {
    fn submit(&mut self, packet: &ffmpeg::Packet) -> SubmitResult {
        match self.decoder.send_packet(packet) {
            Ok(()) => SubmitResult::Consumed,
            // Codec queue full; drain frames first, then take this packet.
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::ffi::EAGAIN => {
                SubmitResult::Retry
            }
            Err(e) => {
                debug!("video decoder rejected packet: {e}");
                SubmitResult::Consumed
            }
        }
    }

    fn decode_next(&mut self) -> Option<f64> {
        if self.decoder.receive_frame(&mut self.in_frame).is_err() {
            return None;
        }
        let pts = self.in_frame.timestamp().unwrap_or(0) as f64 * self.time_base;

        // Device-memory frames come down to system memory first.
        let use_sw = match &self.hw {
            Some(hw) if self.in_frame.format() == hw.pixel_format => {
                if let Err(e) = hwaccel::transfer(&self.in_frame, &mut self.sw_frame) {
                    debug!("hardware frame transfer failed: {e}");
                    return Some(pts);
                }
                true
            }
            _ => false,
        };

        let Some(frame) = self.convert(use_sw, pts) else {
            return Some(pts);
        };
        match self.output.write(frame) {
            Ok(()) => Some(pts),
            Err(_) => None,
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
        self.output.flush();
    }

    fn anchor_clock(&mut self, pts: f64) {
        self.clock.adjust_base(pts);
    }
}

impl VideoReader {
    pub fn format(&self) -> VideoFormat {
        self.format
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn set_position(&mut self, position: f64) {
        self.position = position;
    }

    pub fn buffer_state(&self) -> (usize, usize) {
        (self.output.len(), self.output.capacity())
    }

    /// Wake the worker out of a blocked write into this lane's output.
    pub fn signal(&self) {
        self.output.signal();
    }

    pub fn discard_current(&mut self) {
        self.current = None;
    }

    pub fn is_drained(&self) -> bool {
        self.output.is_empty() && self.current.is_none()
    }

    /// Aspect ratio, preferring the current frame over codec over container.
    pub fn aspect_ratio(&self) -> Option<(i32, i32)> {
        [self.frame_aspect.unwrap_or((0, 0)), self.codec_aspect, self.container_aspect]
            .into_iter()
            .find(|(num, den)| *num > 0 && *den > 0)
    }

    /// Select the frame that should be on screen now, if any. Early frames
    /// stay queued as `current`; late frames are dropped.
    fn advance(&mut self) -> bool {
        if self.current.is_none() {
            match self.output.read(Duration::ZERO) {
                Some(frame) => self.current = Some(frame),
                None => return false,
            }
        }
        let sync_ts = self.clock.elapsed();
        if self.current.as_ref().unwrap().pts > sync_ts + VIDEO_SYNC_THRESHOLD {
            return false;
        }
        while self.current.as_ref().unwrap().pts < sync_ts - VIDEO_SYNC_THRESHOLD {
            match self.output.read(Duration::ZERO) {
                Some(frame) => self.current = Some(frame),
                None => {
                    self.current = None;
                    return false;
                }
            }
        }
        true
    }

    fn note_delivery(&mut self) {
        let frame = self.current.as_ref().unwrap();
        self.position = frame.pts;
        let (num, den) = frame.sample_aspect_ratio;
        self.frame_aspect = (num > 0 && den > 0).then_some((num, den));
    }

    /// Upload the due frame into `texture`; returns its content area.
    pub fn fetch(&mut self, texture: &mut dyn VideoTexture) -> Option<Area> {
        if !self.advance() {
            return None;
        }
        self.note_delivery();
        let frame = self.current.take().unwrap();
        let area = Area::sized(frame.width, frame.height);
        texture.upload(area, &frame.borrow_planes(), frame.format);
        Some(area)
    }

    /// Borrow the due frame's planes directly. The frame stays locked until
    /// the guard drops, which hands it back for reuse.
    pub fn lock_raw(&mut self) -> Option<RawVideoFrame<'_>> {
        if !self.advance() {
            return None;
        }
        self.note_delivery();
        Some(RawVideoFrame { reader: self })
    }
}

/// RAII lock over the current raw video frame.
pub struct RawVideoFrame<'a> {
    reader: &'a mut VideoReader,
}

impl RawVideoFrame<'_> {
    fn frame(&self) -> &VideoFrame {
        self.reader.current.as_ref().unwrap()
    }

    pub fn planes(&self) -> Vec<Plane<'_>> {
        self.frame().borrow_planes()
    }

    pub fn area(&self) -> Area {
        Area::sized(self.frame().width, self.frame().height)
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.frame().format
    }

    pub fn pts(&self) -> f64 {
        self.frame().pts
    }
}

impl Drop for RawVideoFrame<'_> {
    fn drop(&mut self) {
        // Unlock: the frame has been shown (or abandoned); release it.
        self.reader.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pts: f64) -> VideoFrame {
        VideoFrame {
            pts,
            width: 4,
            height: 2,
            sample_aspect_ratio: (0, 1),
            format: PixelFormat::Rgba,
            planes: vec![OwnedPlane { data: vec![0; 32], stride: 16 }],
        }
    }

    fn test_reader() -> VideoReader {
        VideoReader {
            output: Arc::new(RingBuffer::new(8)),
            clock: PlaybackClock::primary().secondary(false),
            format: VideoFormat { width: 4, height: 2, pixel_format: PixelFormat::Rgba },
            current: None,
            position: 0.0,
            frame_aspect: None,
            codec_aspect: (0, 0),
            container_aspect: (0, 0),
        }
    }

    struct NullTexture;

    impl VideoTexture for NullTexture {
        fn upload(&mut self, area: Area, planes: &[Plane<'_>], _format: PixelFormat) {
            assert_eq!(area.w, 4);
            assert_eq!(planes.len(), 1);
        }
    }

    #[test]
    fn test_early_frame_is_held() {
        let mut reader = test_reader();
        reader.clock.secondary(true).adjust_base(0.0);
        reader.output.write(frame(5.0)).unwrap();
        assert!(reader.fetch(&mut NullTexture).is_none());
        // Still queued for later.
        assert!(reader.current.is_some());
    }

    #[test]
    fn test_late_frames_are_skipped() {
        let mut reader = test_reader();
        reader.clock.secondary(true).adjust_base(8.0);
        reader.output.write(frame(1.0)).unwrap();
        reader.output.write(frame(4.0)).unwrap();
        reader.output.write(frame(8.0)).unwrap();
        let area = reader.fetch(&mut NullTexture).unwrap();
        assert_eq!(area, Area::sized(4, 2));
        assert!((reader.position() - 8.0).abs() < 0.001);
        assert!(reader.is_drained());
    }

    #[test]
    fn test_lock_raw_releases_frame_on_drop() {
        let mut reader = test_reader();
        reader.clock.secondary(true).adjust_base(2.0);
        reader.output.write(frame(2.0)).unwrap();
        {
            let lock = reader.lock_raw().unwrap();
            assert_eq!(lock.area(), Area::sized(4, 2));
            assert_eq!(lock.planes()[0].stride, 16);
        }
        assert!(reader.current.is_none());
    }

    #[test]
    fn test_aspect_ratio_priority() {
        let mut reader = test_reader();
        assert_eq!(reader.aspect_ratio(), None);
        reader.container_aspect = (16, 15);
        assert_eq!(reader.aspect_ratio(), Some((16, 15)));
        reader.codec_aspect = (4, 3);
        assert_eq!(reader.aspect_ratio(), Some((4, 3)));
        reader.frame_aspect = Some((1, 1));
        assert_eq!(reader.aspect_ratio(), Some((1, 1)));
    }
}
