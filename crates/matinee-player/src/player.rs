// crates/matinee-player/src/player.rs
//
// The player coordinator: owns the demuxer thread, up to three decoder
// threads and the shared clock, drives the state machine, fans out seeks
// and shutdown, and releases decoded data to the caller on demand.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;
use log::debug;

use matinee_core::{
    Area, AtlasTexture, AudioFormat, AudioFormatRequest, CodecInfo, StreamKind, SubtitleFormat,
    Typesetter, VideoFormat, VideoFormatRequest, VideoTexture,
};

use crate::audio::{build_audio_lane, AudioReader};
use crate::clock::PlaybackClock;
use crate::config::{self, Settings};
use crate::decoder::DecoderThread;
use crate::demux::{DemuxerThread, AUDIO_LANE, LANE_COUNT, SUBTITLE_LANE, VIDEO_LANE};
use crate::error::{Error, Result};
use crate::helpers::time::system_time;
use crate::source::Source;
use crate::subtitle::{build_subtitle_lane, RawSubtitle, SubtitleReader};
use crate::video::{build_video_lane, RawVideoFrame, VideoReader};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerState {
    /// Playback stopped or not yet started.
    Stopped,
    /// Actively decoding and handing out data.
    Playing,
    /// Decoding continues in the background but no data is handed out.
    Paused,
    /// Torn down; every call is a no-op.
    Closed,
}

/// Queue lengths and capacities for one lane, output side first.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferState {
    pub output_length: usize,
    pub output_capacity: usize,
    pub input_length: usize,
    pub input_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct VideoStreamInfo {
    pub codec: CodecInfo,
    pub format: VideoFormat,
}

#[derive(Clone, Debug)]
pub struct AudioStreamInfo {
    pub codec: CodecInfo,
    pub format: AudioFormat,
}

#[derive(Clone, Debug)]
pub struct SubtitleStreamInfo {
    pub codec: CodecInfo,
    pub format: SubtitleFormat,
}

/// Codec and output format information for the selected streams.
#[derive(Clone, Debug, Default)]
pub struct PlayerInfo {
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
    pub subtitle: Option<SubtitleStreamInfo>,
}

struct VideoLane {
    stream_index: usize,
    thread: DecoderThread,
    reader: VideoReader,
    codec: CodecInfo,
}

struct AudioLane {
    stream_index: usize,
    thread: DecoderThread,
    reader: AudioReader,
    codec: CodecInfo,
}

struct SubtitleLane {
    stream_index: usize,
    thread: DecoderThread,
    reader: SubtitleReader,
    codec: CodecInfo,
    format: SubtitleFormat,
    typesetter: Option<Arc<Mutex<Box<dyn Typesetter>>>>,
}

pub struct Player {
    source: Source,
    demuxer: DemuxerThread,
    video: Option<VideoLane>,
    audio: Option<AudioLane>,
    subtitle: Option<SubtitleLane>,
    clock: PlaybackClock,
    state: PlayerState,
    pause_started: f64,
    screen_size: (u32, u32),
    video_request: VideoFormatRequest,
    audio_request: AudioFormatRequest,
    settings: Settings,
    primary_kind: StreamKind,
}

impl Player {
    /// Build a player over `source` with the given stream selection. At
    /// least one of video/audio must be selected, and subtitles need video
    /// (they are positioned against it). The source must outlive the
    /// player and must not be shared with another player.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: &Source,
        video_stream: Option<usize>,
        audio_stream: Option<usize>,
        subtitle_stream: Option<usize>,
        video_request: VideoFormatRequest,
        audio_request: AudioFormatRequest,
        screen_w: u32,
        screen_h: u32,
    ) -> Result<Self> {
        if subtitle_stream.is_some() && video_stream.is_none() {
            return Err(Error::SubtitleRequiresVideo);
        }
        if video_stream.is_none() && audio_stream.is_none() {
            return Err(Error::NoStreamSelected);
        }

        let settings = config::settings();
        let clock = PlaybackClock::primary();
        let primary_kind = if audio_stream.is_some() {
            StreamKind::Audio
        } else if video_stream.is_some() {
            StreamKind::Video
        } else {
            StreamKind::Subtitle
        };
        let screen_size = (screen_w, screen_h);

        let audio_parts = match audio_stream {
            Some(index) => {
                let desc = source.expect_stream(index, StreamKind::Audio)?;
                Some(build_audio_lane(
                    desc,
                    audio_request,
                    &clock,
                    primary_kind == StreamKind::Audio,
                    &settings,
                )?)
            }
            None => None,
        };
        let video_parts = match video_stream {
            Some(index) => {
                let desc = source.expect_stream(index, StreamKind::Video)?;
                Some(build_video_lane(
                    desc,
                    video_request,
                    &clock,
                    primary_kind == StreamKind::Video,
                    &settings,
                )?)
            }
            None => None,
        };
        let subtitle_parts = match subtitle_stream {
            Some(index) => {
                let desc = source.expect_stream(index, StreamKind::Subtitle)?;
                let video_format = video_parts.as_ref().expect("validated above").reader.format();
                build_subtitle_lane(
                    desc,
                    source,
                    (video_format.width, video_format.height),
                    screen_size,
                    &clock,
                    primary_kind == StreamKind::Subtitle,
                    &settings,
                )?
            }
            None => None,
        };
        // An unsupported subtitle codec disables the lane entirely.
        let effective_subtitle = subtitle_parts.as_ref().and_then(|_| subtitle_stream);

        let demuxer = DemuxerThread::spawn(
            Arc::clone(&source.inner),
            [video_stream, audio_stream, effective_subtitle],
            &settings,
        )?;

        let video = match video_parts {
            Some(parts) => Some(VideoLane {
                stream_index: video_stream.unwrap(),
                thread: DecoderThread::spawn(
                    "matinee-video-decoder",
                    demuxer.lane(VIDEO_LANE).unwrap(),
                    parts.output.clone(),
                    parts.worker,
                )?,
                reader: parts.reader,
                codec: parts.codec,
            }),
            None => None,
        };
        let audio = match audio_parts {
            Some(parts) => Some(AudioLane {
                stream_index: audio_stream.unwrap(),
                thread: DecoderThread::spawn(
                    "matinee-audio-decoder",
                    demuxer.lane(AUDIO_LANE).unwrap(),
                    parts.output.clone(),
                    parts.worker,
                )?,
                reader: parts.reader,
                codec: parts.codec,
            }),
            None => None,
        };
        let subtitle = match subtitle_parts {
            Some(parts) => Some(SubtitleLane {
                stream_index: subtitle_stream.unwrap(),
                thread: DecoderThread::spawn(
                    "matinee-subtitle-decoder",
                    demuxer.lane(SUBTITLE_LANE).unwrap(),
                    parts.output.clone(),
                    parts.worker,
                )?,
                reader: parts.reader,
                codec: parts.codec,
                format: parts.format,
                typesetter: parts.typesetter,
            }),
            None => None,
        };

        Ok(Self {
            source: source.clone(),
            demuxer,
            video,
            audio,
            subtitle,
            clock,
            state: PlayerState::Stopped,
            pause_started: 0.0,
            screen_size,
            video_request,
            audio_request,
            settings,
            primary_kind,
        })
    }

    // ── State machine ────────────────────────────────────────────────────

    pub fn state(&mut self) -> PlayerState {
        self.refresh_state();
        self.state
    }

    pub fn play(&mut self) {
        match self.state {
            PlayerState::Stopped => {
                self.clock.set_base();
                self.state = PlayerState::Playing;
            }
            PlayerState::Paused => {
                self.clock.add_base(system_time() - self.pause_started);
                self.state = PlayerState::Playing;
            }
            PlayerState::Playing | PlayerState::Closed => {}
        }
    }

    pub fn pause(&mut self) {
        if self.state == PlayerState::Playing {
            self.pause_started = system_time();
            self.state = PlayerState::Paused;
        }
    }

    pub fn stop(&mut self) {
        if matches!(self.state, PlayerState::Playing | PlayerState::Paused) {
            self.state = PlayerState::Stopped;
        }
    }

    /// Once the demuxer has drained the container and every queue and
    /// reader slot is empty, playback is over.
    fn refresh_state(&mut self) {
        if self.state != PlayerState::Playing || !self.demuxer.is_finished() {
            return;
        }
        for lane in 0..LANE_COUNT {
            if let Some((len, _)) = self.demuxer.lane_state(lane) {
                if len > 0 {
                    return;
                }
            }
        }
        let drained = self.video.as_ref().map_or(true, |l| l.reader.is_drained())
            && self.audio.as_ref().map_or(true, |l| l.reader.is_drained())
            && self.subtitle.as_ref().map_or(true, |l| l.reader.is_drained());
        if drained {
            debug!("pipeline drained, stopping");
            self.state = PlayerState::Stopped;
        }
    }

    // ── Timing ───────────────────────────────────────────────────────────

    /// Container duration in seconds.
    pub fn duration(&self) -> f64 {
        self.source.duration()
    }

    /// Presentation timestamp of the most recently delivered video frame
    /// (or audio segment, for audio-only playback).
    pub fn position(&self) -> f64 {
        if let Some(lane) = &self.video {
            return lane.reader.position();
        }
        if let Some(lane) = &self.audio {
            return lane.reader.position();
        }
        0.0
    }

    /// Seek to `position` seconds, clamped to the source duration. The
    /// container seek runs on the demuxer thread; decoders flush and
    /// re-anchor the clock when its barrier packet reaches them.
    pub fn seek(&mut self, position: f64) -> Result<()> {
        if self.state == PlayerState::Closed {
            return Err(Error::PlayerClosed);
        }
        let duration = self.duration();
        let target_secs = if duration > 0.0 {
            position.clamp(0.0, duration)
        } else {
            position.max(0.0)
        };
        let target = (target_secs * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;

        // Wake decoders blocked on full output queues so the barrier
        // packets flow promptly.
        self.signal_outputs();
        self.demuxer.seek(target)?;

        // Stale held frames would gate delivery against pre-seek times.
        if let Some(lane) = &mut self.video {
            lane.reader.discard_current();
            lane.reader.set_position(target_secs);
        }
        if let Some(lane) = &mut self.audio {
            lane.reader.discard_current();
            lane.reader.set_position(target_secs);
        }
        if let Some(lane) = &mut self.subtitle {
            lane.reader.discard_current();
        }
        Ok(())
    }

    // ── Data access ──────────────────────────────────────────────────────

    /// Upload the frame due now into `texture`. Returns its content area,
    /// or `None` when no frame is due (not playing, too early, or dry).
    pub fn video_frame(&mut self, texture: &mut dyn VideoTexture) -> Option<Area> {
        self.refresh_state();
        if self.state != PlayerState::Playing {
            return None;
        }
        self.video.as_mut()?.reader.fetch(texture)
    }

    /// Lock the frame due now for direct plane access. The frame is
    /// released (and the lane unblocked) when the returned guard drops.
    pub fn lock_video_frame(&mut self) -> Option<RawVideoFrame<'_>> {
        self.refresh_state();
        if self.state != PlayerState::Playing {
            return None;
        }
        self.video.as_mut()?.reader.lock_raw()
    }

    /// Copy due PCM into `dst`; returns the byte count. `backend_buffered`
    /// is the amount the audio backend still has queued (informational).
    pub fn audio_data(&mut self, backend_buffered: usize, dst: &mut [u8]) -> usize {
        self.refresh_state();
        if self.state != PlayerState::Playing {
            return 0;
        }
        match &mut self.audio {
            Some(lane) => lane.reader.read(backend_buffered, dst),
            None => 0,
        }
    }

    /// Pack the subtitle surfaces visible now into `texture` (used as an
    /// atlas) and return up to `limit` (source, target) quads. While paused
    /// the previous quads are returned unchanged.
    pub fn subtitle_texture(
        &mut self,
        texture: &mut dyn AtlasTexture,
        limit: usize,
    ) -> &[(Area, Area)] {
        self.refresh_state();
        let now = self.clock.elapsed();
        match (&mut self.subtitle, self.state) {
            (Some(lane), PlayerState::Playing) => lane.reader.fetch_texture(texture, now, limit),
            (Some(lane), PlayerState::Paused) => lane.reader.current_quads(limit),
            _ => &[],
        }
    }

    /// The subtitle surfaces visible now, without touching any texture.
    pub fn subtitle_raw_frames(&mut self) -> Vec<RawSubtitle<'_>> {
        self.refresh_state();
        let now = self.clock.elapsed();
        match (&mut self.subtitle, self.state) {
            (Some(lane), PlayerState::Playing) => lane.reader.fetch_raw(now),
            _ => Vec::new(),
        }
    }

    // ── Introspection ────────────────────────────────────────────────────

    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            video: self.video.as_ref().map(|lane| VideoStreamInfo {
                codec: lane.codec.clone(),
                format: lane.reader.format(),
            }),
            audio: self.audio.as_ref().map(|lane| AudioStreamInfo {
                codec: lane.codec.clone(),
                format: lane.reader.format(),
            }),
            subtitle: self.subtitle.as_ref().map(|lane| SubtitleStreamInfo {
                codec: lane.codec.clone(),
                format: lane.format,
            }),
        }
    }

    /// Aspect ratio as (num, den): current frame first, then codec, then
    /// container level.
    pub fn aspect_ratio(&self) -> Option<(i32, i32)> {
        self.video.as_ref().and_then(|lane| lane.reader.aspect_ratio())
    }

    /// Subtitle rendering resolution. Only script subtitles pick this up;
    /// bitmap subtitles keep the scale chosen at creation.
    pub fn set_screen_size(&mut self, w: u32, h: u32) {
        self.screen_size = (w, h);
        if let Some(lane) = &self.subtitle {
            if let Some(typesetter) = &lane.typesetter {
                typesetter.lock().unwrap().set_frame_size(w, h);
            }
        }
    }

    pub fn video_buffer_state(&self) -> Option<BufferState> {
        let lane = self.video.as_ref()?;
        let (output_length, output_capacity) = lane.reader.buffer_state();
        let (input_length, input_capacity) = self.demuxer.lane_state(VIDEO_LANE)?;
        Some(BufferState { output_length, output_capacity, input_length, input_capacity })
    }

    pub fn audio_buffer_state(&self) -> Option<BufferState> {
        let lane = self.audio.as_ref()?;
        let (output_length, output_capacity) = lane.reader.buffer_state();
        let (input_length, input_capacity) = self.demuxer.lane_state(AUDIO_LANE)?;
        Some(BufferState { output_length, output_capacity, input_length, input_capacity })
    }

    pub fn subtitle_buffer_state(&self) -> Option<BufferState> {
        let lane = self.subtitle.as_ref()?;
        let (output_length, output_capacity) = lane.reader.buffer_state();
        let (input_length, input_capacity) = self.demuxer.lane_state(SUBTITLE_LANE)?;
        Some(BufferState { output_length, output_capacity, input_length, input_capacity })
    }

    /// True when every requested fill rate (a percentage; `None` skips the
    /// check) is reached. Lanes that are not selected always pass.
    pub fn has_buffer_fill_rate(
        &self,
        audio_input: Option<u32>,
        audio_output: Option<u32>,
        video_input: Option<u32>,
        video_output: Option<u32>,
    ) -> bool {
        fn reached(length: usize, capacity: usize, required: Option<u32>) -> bool {
            match required {
                Some(percent) => length * 100 >= capacity * percent.min(100) as usize,
                None => true,
            }
        }
        let audio_ok = match self.audio_buffer_state() {
            Some(state) => {
                reached(state.input_length, state.input_capacity, audio_input)
                    && reached(state.output_length, state.output_capacity, audio_output)
            }
            None => true,
        };
        let video_ok = match self.video_buffer_state() {
            Some(state) => {
                reached(state.input_length, state.input_capacity, video_input)
                    && reached(state.output_length, state.output_capacity, video_output)
            }
            None => true,
        };
        audio_ok && video_ok
    }

    /// Poll [`Self::has_buffer_fill_rate`] until it holds or `timeout`
    /// expires. Returns whether the rate was reached.
    pub fn wait_buffer_fill_rate(
        &self,
        audio_input: Option<u32>,
        audio_output: Option<u32>,
        video_input: Option<u32>,
        video_output: Option<u32>,
        timeout: Duration,
    ) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.has_buffer_fill_rate(audio_input, audio_output, video_input, video_output) {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    // ── Stream selection ─────────────────────────────────────────────────

    /// Currently selected container stream for `kind`.
    pub fn stream(&self, kind: StreamKind) -> Option<usize> {
        match kind {
            StreamKind::Video => self.video.as_ref().map(|lane| lane.stream_index),
            StreamKind::Audio => self.audio.as_ref().map(|lane| lane.stream_index),
            StreamKind::Subtitle => self.subtitle.as_ref().map(|lane| lane.stream_index),
            _ => None,
        }
    }

    /// Switch a lane to a different container stream of the same kind. The
    /// lane must have been selected when the player was created; enabling a
    /// new kind requires a new player.
    ///
    /// The replacement decoder is fully built and running before the old
    /// one is torn down, so a failed switch leaves the previous stream
    /// playing.
    pub fn set_stream(&mut self, kind: StreamKind, index: usize) -> Result<()> {
        if self.state == PlayerState::Closed {
            return Err(Error::PlayerClosed);
        }
        if self.stream(kind) == Some(index) {
            return Ok(());
        }
        let desc = self.source.expect_stream(index, kind)?.clone();

        match kind {
            StreamKind::Video => {
                let previous = self
                    .video
                    .as_ref()
                    .map(|lane| lane.stream_index)
                    .ok_or(Error::StreamNotSelected(kind))?;
                let parts = build_video_lane(
                    &desc,
                    self.video_request,
                    &self.clock,
                    self.primary_kind == StreamKind::Video,
                    &self.settings,
                )?;
                let input = self.demuxer.lane(VIDEO_LANE).expect("lane existed");
                // Starve the lane while both decoder threads exist; the old
                // one only idles on the empty ring from here on.
                self.demuxer.set_stream_index(VIDEO_LANE, None);
                input.flush();
                let thread = match DecoderThread::spawn(
                    "matinee-video-decoder",
                    input,
                    parts.output.clone(),
                    parts.worker,
                ) {
                    Ok(thread) => thread,
                    Err(e) => {
                        self.demuxer.set_stream_index(VIDEO_LANE, Some(previous));
                        return Err(e);
                    }
                };
                self.video = Some(VideoLane {
                    stream_index: index,
                    thread,
                    reader: parts.reader,
                    codec: parts.codec,
                }); // replaced lane drops here, stopping its thread
                self.demuxer.set_stream_index(VIDEO_LANE, Some(index));
            }
            StreamKind::Audio => {
                let previous = self
                    .audio
                    .as_ref()
                    .map(|lane| lane.stream_index)
                    .ok_or(Error::StreamNotSelected(kind))?;
                let parts = build_audio_lane(
                    &desc,
                    self.audio_request,
                    &self.clock,
                    self.primary_kind == StreamKind::Audio,
                    &self.settings,
                )?;
                let input = self.demuxer.lane(AUDIO_LANE).expect("lane existed");
                self.demuxer.set_stream_index(AUDIO_LANE, None);
                input.flush();
                let thread = match DecoderThread::spawn(
                    "matinee-audio-decoder",
                    input,
                    parts.output.clone(),
                    parts.worker,
                ) {
                    Ok(thread) => thread,
                    Err(e) => {
                        self.demuxer.set_stream_index(AUDIO_LANE, Some(previous));
                        return Err(e);
                    }
                };
                self.audio = Some(AudioLane {
                    stream_index: index,
                    thread,
                    reader: parts.reader,
                    codec: parts.codec,
                });
                self.demuxer.set_stream_index(AUDIO_LANE, Some(index));
            }
            StreamKind::Subtitle => {
                let previous = self
                    .subtitle
                    .as_ref()
                    .map(|lane| lane.stream_index)
                    .ok_or(Error::StreamNotSelected(kind))?;
                let video_format = self
                    .video
                    .as_ref()
                    .map(|lane| lane.reader.format())
                    .ok_or(Error::SubtitleRequiresVideo)?;
                let parts = build_subtitle_lane(
                    &desc,
                    &self.source,
                    (video_format.width, video_format.height),
                    self.screen_size,
                    &self.clock,
                    self.primary_kind == StreamKind::Subtitle,
                    &self.settings,
                )?
                .ok_or_else(|| Error::UnsupportedCodec {
                    index,
                    codec: desc.codec_name.clone(),
                })?;
                let input = self.demuxer.lane(SUBTITLE_LANE).expect("lane existed");
                self.demuxer.set_stream_index(SUBTITLE_LANE, None);
                input.flush();
                let thread = match DecoderThread::spawn(
                    "matinee-subtitle-decoder",
                    input,
                    parts.output.clone(),
                    parts.worker,
                ) {
                    Ok(thread) => thread,
                    Err(e) => {
                        self.demuxer.set_stream_index(SUBTITLE_LANE, Some(previous));
                        return Err(e);
                    }
                };
                self.subtitle = Some(SubtitleLane {
                    stream_index: index,
                    thread,
                    reader: parts.reader,
                    codec: parts.codec,
                    format: parts.format,
                    typesetter: parts.typesetter,
                });
                self.demuxer.set_stream_index(SUBTITLE_LANE, Some(index));
            }
            _ => return Err(Error::StreamNotSelected(kind)),
        }
        Ok(())
    }

    /// Stop feeding and decoding a lane. Closing video also closes an
    /// active subtitle lane, which cannot exist without it.
    pub fn close_stream(&mut self, kind: StreamKind) -> Result<()> {
        if self.state == PlayerState::Closed {
            return Err(Error::PlayerClosed);
        }
        match kind {
            StreamKind::Video => {
                if self.subtitle.is_some() {
                    self.close_stream(StreamKind::Subtitle)?;
                }
                let lane = self.video.take().ok_or(Error::StreamNotSelected(kind))?;
                self.demuxer.set_stream_index(VIDEO_LANE, None);
                lane.thread.stop();
                if let Some(input) = self.demuxer.lane(VIDEO_LANE) {
                    input.flush();
                }
            }
            StreamKind::Audio => {
                let lane = self.audio.take().ok_or(Error::StreamNotSelected(kind))?;
                self.demuxer.set_stream_index(AUDIO_LANE, None);
                lane.thread.stop();
                if let Some(input) = self.demuxer.lane(AUDIO_LANE) {
                    input.flush();
                }
            }
            StreamKind::Subtitle => {
                let lane = self.subtitle.take().ok_or(Error::StreamNotSelected(kind))?;
                self.demuxer.set_stream_index(SUBTITLE_LANE, None);
                lane.thread.stop();
                if let Some(input) = self.demuxer.lane(SUBTITLE_LANE) {
                    input.flush();
                }
            }
            _ => return Err(Error::StreamNotSelected(kind)),
        }
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    fn signal_outputs(&self) {
        if let Some(lane) = &self.video {
            lane.reader.signal();
        }
        if let Some(lane) = &self.audio {
            lane.reader.signal();
        }
        if let Some(lane) = &self.subtitle {
            lane.reader.signal();
        }
    }

    /// Shut the pipeline down. Safe to call more than once; also runs on
    /// drop. The source is left open for the caller.
    pub fn close(&mut self) {
        if self.state == PlayerState::Closed {
            return;
        }
        self.state = PlayerState::Closed;

        // Wake every blocked worker first, then tear down in reverse
        // dependency order: subtitle, video, audio, demuxer.
        for lane in 0..LANE_COUNT {
            if let Some(buffer) = self.demuxer.lane(lane) {
                buffer.signal();
            }
        }
        self.signal_outputs();
        if let Some(lane) = &self.subtitle {
            lane.thread.stop();
        }
        if let Some(lane) = &self.video {
            lane.thread.stop();
        }
        if let Some(lane) = &self.audio {
            lane.thread.stop();
        }
        self.demuxer.stop();

        self.subtitle.take();
        self.video.take();
        self.audio.take();
        self.demuxer.join();
        debug!("player closed");
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close();
    }
}
