// crates/matinee-player/src/audio.rs
//
// Audio lane: the worker half drains packets into resampled PCM segments;
// the reader half (owned by the player) serves caller reads against the
// shared clock, tracking partial consumption of the current segment.

use std::sync::Arc;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::util::format::sample::Sample;
use log::debug;

use matinee_core::{AudioFormat, AudioFormatRequest, CodecInfo, SampleFormat};

use crate::buffer::RingBuffer;
use crate::clock::PlaybackClock;
use crate::config::Settings;
use crate::decoder::{DecoderWorker, SubmitResult};
use crate::error::{Error, Result};
use crate::helpers::formats::{best_output_sample, layout_for, to_av_sample};
use crate::source::StreamDesc;

/// How far a segment's pts may drift from the clock before it is held back
/// or dropped.
pub(crate) const AUDIO_SYNC_THRESHOLD: f64 = 0.05;

/// One run of resampled PCM. `consumed` tracks how much the caller has
/// already read; `pts` always refers to the first unconsumed byte.
pub(crate) struct AudioSegment {
    pub pts: f64,
    pub data: Vec<u8>,
    pub consumed: usize,
}

impl AudioSegment {
    fn remaining(&self) -> usize {
        self.data.len() - self.consumed
    }
}

/// The resampler lives on the worker thread only; the wrapper carries the
/// Send bound its raw-pointer internals cannot declare.
struct SendResampler {
    context: ffmpeg::software::resampling::Context,
    /// Source (rate, sample format, channel count) it was built for.
    key: (u32, Sample, i32),
}

unsafe impl Send for SendResampler {}

pub(crate) struct AudioDecoderWorker {
    decoder: ffmpeg::decoder::Audio,
    resampler: Option<SendResampler>,
    frame: ffmpeg::frame::Audio,
    output: Arc<RingBuffer<AudioSegment>>,
    clock: PlaybackClock,
    time_base: f64,
    format: AudioFormat,
}

pub(crate) struct AudioReader {
    output: Arc<RingBuffer<AudioSegment>>,
    clock: PlaybackClock,
    format: AudioFormat,
    current: Option<AudioSegment>,
    position: f64,
}

pub(crate) struct AudioLaneParts {
    pub worker: AudioDecoderWorker,
    pub reader: AudioReader,
    pub codec: CodecInfo,
    /// Wake-up handle for the worker's output, used by the decoder thread.
    pub output: Arc<RingBuffer<AudioSegment>>,
}

/// Build the audio codec and both lane halves for `desc`.
pub(crate) fn build_audio_lane(
    desc: &StreamDesc,
    request: AudioFormatRequest,
    clock: &PlaybackClock,
    writable_clock: bool,
    settings: &Settings,
) -> Result<AudioLaneParts> {
    let codec = ffmpeg::decoder::find(desc.codec_id).ok_or_else(|| Error::UnsupportedCodec {
        index: desc.index,
        codec: desc.codec_name.clone(),
    })?;
    let mut context = ffmpeg::codec::context::Context::from_parameters(desc.parameters.clone())?;
    unsafe {
        (*context.as_mut_ptr()).pkt_timebase = desc.time_base.into();
    }
    crate::video::apply_threading(&mut context, &codec, settings.thread_count);
    let decoder = context.decoder().audio()?;

    let source_channels =
        unsafe { (*decoder.as_ptr()).ch_layout.nb_channels }.clamp(1, i32::MAX) as u16;
    let format = AudioFormat {
        sample_rate: request.sample_rate.unwrap_or_else(|| decoder.rate()),
        channels: request.channels.unwrap_or_else(|| source_channels.min(2)).clamp(1, 2),
        sample_format: request
            .sample_format
            .unwrap_or_else(|| best_output_sample(decoder.format())),
    };

    let output = Arc::new(RingBuffer::new(settings.audio_frame_buffer));
    let codec_info = CodecInfo {
        name: codec.name().to_string(),
        description: codec.description().to_string(),
        threads: settings.thread_count,
    };

    Ok(AudioLaneParts {
        output: Arc::clone(&output),
        worker: AudioDecoderWorker {
            decoder,
            resampler: None,
            frame: ffmpeg::frame::Audio::empty(),
            output: Arc::clone(&output),
            clock: clock.secondary(writable_clock),
            time_base: f64::from(desc.time_base),
            format,
        },
        reader: AudioReader {
            output,
            clock: clock.secondary(false),
            format,
            current: None,
            position: 0.0,
        },
        codec: codec_info,
    })
}

impl AudioDecoderWorker {
    /// (Re)build the resampler on first use and whenever the source frames
    /// change shape mid-stream, like the scaler on the video side. The
    /// decoder context tracks the latest source parameters, so a rebuild
    /// picks them up.
    fn ensure_resampler(&mut self) -> Result<()> {
        let channels = unsafe { (*self.frame.as_ptr()).ch_layout.nb_channels };
        let key = (self.frame.rate(), self.frame.format(), channels);
        if self.resampler.as_ref().map_or(true, |r| r.key != key) {
            let context = self.decoder.resampler(
                to_av_sample(self.format.sample_format),
                layout_for(self.format.channels),
                self.format.sample_rate,
            )?;
            self.resampler = Some(SendResampler { context, key });
        }
        Ok(())
    }
}

impl DecoderWorker for AudioDecoderWorker {
    fn submit(&mut self, packet: &ffmpeg::Packet) -> SubmitResult {
        match self.decoder.send_packet(packet) {
            Ok(()) => SubmitResult::Consumed,
            // Codec queue full; drain frames first, then take this packet.
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::ffi::EAGAIN => {
                SubmitResult::Retry
            }
            Err(e) => {
                debug!("audio decoder rejected packet: {e}");
                SubmitResult::Consumed
            }
        }
    }

    fn decode_next(&mut self) -> Option<f64> {
        if self.decoder.receive_frame(&mut self.frame).is_err() {
            return None;
        }
        let pts = self.frame.timestamp().unwrap_or(0) as f64 * self.time_base;

        if let Err(e) = self.ensure_resampler() {
            debug!("audio resampler setup failed: {e}");
            return Some(pts);
        }
        let mut resampled = ffmpeg::frame::Audio::empty();
        let resampler = &mut self.resampler.as_mut().unwrap().context;
        if let Err(e) = resampler.run(&self.frame, &mut resampled) {
            debug!("audio resample failed: {e}");
            return Some(pts);
        }
        if resampled.samples() == 0 {
            return Some(pts);
        }

        let bytes = resampled.samples() * self.format.frame_size();
        let mut data = vec![0u8; bytes];
        data.copy_from_slice(&resampled.data(0)[..bytes]);

        // This write blocks while the reader is behind; that is the
        // pipeline's backpressure.
        match self.output.write(AudioSegment { pts, data, consumed: 0 }) {
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

impl AudioReader {
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Last delivered presentation timestamp.
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

    /// True when nothing is queued or held for delivery.
    pub fn is_drained(&self) -> bool {
        self.output.is_empty() && self.current.as_ref().map_or(true, |c| c.remaining() == 0)
    }

    fn pop(&mut self) -> bool {
        match self.output.read(Duration::ZERO) {
            Some(segment) => {
                self.current = Some(segment);
                true
            }
            None => {
                self.current = None;
                false
            }
        }
    }

    /// Copy PCM into `dst`, gated by the shared clock: data ahead of the
    /// sync window is held back (returns 0), data behind it is skipped.
    /// `backend_buffered` is what the audio backend still has queued; it is
    /// informational only.
    pub fn read(&mut self, backend_buffered: usize, dst: &mut [u8]) -> usize {
        let _ = backend_buffered;
        if dst.is_empty() {
            return 0;
        }
        if self.current.as_ref().map_or(true, |c| c.remaining() == 0) && !self.pop() {
            return 0;
        }

        let sync_ts = self.clock.elapsed();
        if self.current.as_ref().unwrap().pts > sync_ts + AUDIO_SYNC_THRESHOLD {
            return 0;
        }
        while self.current.as_ref().unwrap().pts < sync_ts - AUDIO_SYNC_THRESHOLD {
            if !self.pop() {
                return 0;
            }
        }

        let format = self.format;
        let current = self.current.as_mut().unwrap();
        self.position = current.pts;
        let n = dst.len().min(current.remaining());
        dst[..n].copy_from_slice(&current.data[current.consumed..current.consumed + n]);
        current.consumed += n;
        current.pts += format.clip_duration(n);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_reader(format: AudioFormat) -> AudioReader {
        AudioReader {
            output: Arc::new(RingBuffer::new(8)),
            clock: PlaybackClock::primary().secondary(false),
            format,
            current: None,
            position: 0.0,
        }
    }

    fn stereo_s16() -> AudioFormat {
        AudioFormat {
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::S16,
        }
    }

    #[test]
    fn test_read_holds_back_early_segments() {
        let mut reader = test_reader(stereo_s16());
        let clock = reader.clock.secondary(true);
        clock.adjust_base(0.0); // elapsed == 0
        reader
            .output
            .write(AudioSegment { pts: 10.0, data: vec![1; 64], consumed: 0 })
            .unwrap();
        let mut dst = [0u8; 64];
        assert_eq!(reader.read(0, &mut dst), 0);
        // The early segment stays current, nothing was lost.
        assert!(!reader.is_drained());
    }

    #[test]
    fn test_read_skips_late_segments() {
        let mut reader = test_reader(stereo_s16());
        let clock = reader.clock.secondary(true);
        clock.adjust_base(10.0); // elapsed == 10 s
        reader
            .output
            .write(AudioSegment { pts: 1.0, data: vec![1; 16], consumed: 0 })
            .unwrap();
        reader
            .output
            .write(AudioSegment { pts: 10.0, data: vec![2; 16], consumed: 0 })
            .unwrap();
        let mut dst = [0u8; 16];
        assert_eq!(reader.read(0, &mut dst), 16);
        assert_eq!(dst[0], 2);
        assert!((reader.position() - 10.0).abs() < 0.001);
    }

    #[test]
    fn test_partial_reads_advance_consumed_and_pts() {
        let format = stereo_s16(); // 4 bytes per sample frame
        let mut reader = test_reader(format);
        let clock = reader.clock.secondary(true);
        clock.adjust_base(5.0);
        // 48000 sample frames = exactly one second of data.
        let bytes = format.bytes_per_second();
        reader
            .output
            .write(AudioSegment { pts: 5.0, data: vec![0; bytes], consumed: 0 })
            .unwrap();

        let mut dst = vec![0u8; bytes / 2];
        assert_eq!(reader.read(0, &mut dst), bytes / 2);
        let current = reader.current.as_ref().unwrap();
        assert_eq!(current.consumed, bytes / 2);
        assert!((current.pts - 5.5).abs() < 1e-9);

        // Second half; then the segment is exhausted.
        assert_eq!(reader.read(0, &mut dst), bytes / 2);
        assert!(reader.is_drained());
    }

    #[test]
    fn test_read_caps_at_segment_boundary() {
        let mut reader = test_reader(stereo_s16());
        let clock = reader.clock.secondary(true);
        clock.adjust_base(1.0);
        reader
            .output
            .write(AudioSegment { pts: 1.0, data: vec![7; 32], consumed: 0 })
            .unwrap();
        let mut dst = [0u8; 100];
        assert_eq!(reader.read(0, &mut dst), 32);
    }
}
