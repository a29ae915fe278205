// crates/matinee-player/src/config.rs
//
// Process-wide library state: one-shot initialization (network support,
// hardware decoding, the script-subtitle typesetter factory) and tunable
// hints read at source/player construction time.

use std::sync::Mutex;

use ffmpeg_the_third as ffmpeg;
use matinee_core::{FontHinting, TypesetterFactory};

use crate::error::{Error, Result};

/// Numeric tuning knobs. Zero means "library default" for the probe hints
/// and the decoder thread count; buffer capacities are clamped to >= 1.
#[derive(Clone, Copy, Debug)]
pub enum Hint {
    /// Per-decoder codec thread count; 0 lets ffmpeg pick.
    ThreadCount,
    /// Capacity of the demuxed-video packet queue.
    VideoBufferPackets,
    /// Capacity of the demuxed-audio packet queue.
    AudioBufferPackets,
    /// Capacity of the demuxed-subtitle packet queue.
    SubtitleBufferPackets,
    /// Capacity of the decoded-video frame queue.
    VideoBufferFrames,
    /// Capacity of the decoded-audio segment queue.
    AudioBufferFrames,
    /// Capacity of the decoded-subtitle surface queue.
    SubtitleBufferFrames,
    /// Container probe size hint, in bytes.
    ProbeSize,
    /// Container analyze duration hint, in microseconds.
    AnalyzeDuration,
}

/// Snapshot of the hints, taken when a source or player is built so a
/// running pipeline is unaffected by later `set_hint` calls.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Settings {
    pub thread_count: usize,
    pub video_packet_buffer: usize,
    pub audio_packet_buffer: usize,
    pub subtitle_packet_buffer: usize,
    pub video_frame_buffer: usize,
    pub audio_frame_buffer: usize,
    pub subtitle_frame_buffer: usize,
    pub probe_size: usize,
    pub analyze_duration: usize,
    pub font_hinting: FontHinting,
    pub hardware_decode: bool,
}

impl Settings {
    const fn defaults() -> Self {
        Self {
            thread_count: 0,
            video_packet_buffer: 3,
            audio_packet_buffer: 32,
            subtitle_packet_buffer: 32,
            video_frame_buffer: 3,
            audio_frame_buffer: 64,
            subtitle_frame_buffer: 64,
            probe_size: 0,
            analyze_duration: 0,
            font_hinting: FontHinting::None,
            hardware_decode: false,
        }
    }
}

/// Configuration for [`init`]. The typesetter factory enables script
/// (SSA/ASS) subtitle rendering; without one, script streams are rejected.
#[derive(Default)]
pub struct InitConfig {
    /// Initialize ffmpeg's network layer for URL sources.
    pub network: bool,
    /// Allow decoders to try hardware-accelerated decode paths.
    pub hardware_decode: bool,
    pub typesetter: Option<Box<dyn TypesetterFactory>>,
}

enum Phase {
    Fresh,
    Active,
    Closed,
}

struct LibraryState {
    phase: Phase,
    network: bool,
    hardware_decode: bool,
    typesetter: Option<Box<dyn TypesetterFactory>>,
    settings: Settings,
}

static STATE: Mutex<LibraryState> = Mutex::new(LibraryState {
    phase: Phase::Fresh,
    network: false,
    hardware_decode: false,
    typesetter: None,
    settings: Settings::defaults(),
});

/// Initialize the library. May be called at most once per process; a second
/// call (including after [`shutdown`]) is an error.
pub fn init(config: InitConfig) -> Result<()> {
    let mut state = STATE.lock().unwrap();
    if !matches!(state.phase, Phase::Fresh) {
        return Err(Error::AlreadyInitialized);
    }
    ffmpeg::init()?;
    if config.network {
        unsafe {
            ffmpeg::ffi::avformat_network_init();
        }
    }
    state.network = config.network;
    state.hardware_decode = config.hardware_decode;
    state.typesetter = config.typesetter;
    state.phase = Phase::Active;
    Ok(())
}

/// Tear the library down. Players and sources must be closed first.
pub fn shutdown() {
    let mut state = STATE.lock().unwrap();
    if !matches!(state.phase, Phase::Active) {
        return;
    }
    if state.network {
        unsafe {
            ffmpeg::ffi::avformat_network_deinit();
        }
    }
    state.network = false;
    state.hardware_decode = false;
    state.typesetter = None;
    state.phase = Phase::Closed;
}

/// Set a numeric hint. Applies to sources and players created afterwards.
pub fn set_hint(hint: Hint, value: usize) {
    let mut state = STATE.lock().unwrap();
    let settings = &mut state.settings;
    match hint {
        Hint::ThreadCount => settings.thread_count = value,
        Hint::VideoBufferPackets => settings.video_packet_buffer = value.max(1),
        Hint::AudioBufferPackets => settings.audio_packet_buffer = value.max(1),
        Hint::SubtitleBufferPackets => settings.subtitle_packet_buffer = value.max(1),
        Hint::VideoBufferFrames => settings.video_frame_buffer = value.max(1),
        Hint::AudioBufferFrames => settings.audio_frame_buffer = value.max(1),
        Hint::SubtitleBufferFrames => settings.subtitle_frame_buffer = value.max(1),
        Hint::ProbeSize => settings.probe_size = value,
        Hint::AnalyzeDuration => settings.analyze_duration = value,
    }
}

pub fn hint(hint: Hint) -> usize {
    let state = STATE.lock().unwrap();
    let settings = &state.settings;
    match hint {
        Hint::ThreadCount => settings.thread_count,
        Hint::VideoBufferPackets => settings.video_packet_buffer,
        Hint::AudioBufferPackets => settings.audio_packet_buffer,
        Hint::SubtitleBufferPackets => settings.subtitle_packet_buffer,
        Hint::VideoBufferFrames => settings.video_frame_buffer,
        Hint::AudioBufferFrames => settings.audio_frame_buffer,
        Hint::SubtitleBufferFrames => settings.subtitle_frame_buffer,
        Hint::ProbeSize => settings.probe_size,
        Hint::AnalyzeDuration => settings.analyze_duration,
    }
}

/// Hinting mode handed to the typesetter of new subtitle decoders.
pub fn set_font_hinting(hinting: FontHinting) {
    STATE.lock().unwrap().settings.font_hinting = hinting;
}

pub fn font_hinting() -> FontHinting {
    STATE.lock().unwrap().settings.font_hinting
}

pub(crate) fn settings() -> Settings {
    let state = STATE.lock().unwrap();
    let mut settings = state.settings;
    settings.hardware_decode = state.hardware_decode;
    settings
}

/// A fresh typesetter from the installed factory, if any.
pub(crate) fn create_typesetter() -> Option<Box<dyn matinee_core::Typesetter>> {
    let state = STATE.lock().unwrap();
    state.typesetter.as_ref().map(|factory| factory.create_typesetter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use matinee_core::{GlyphBitmap, Typesetter};

    struct NullTypesetter;

    impl Typesetter for NullTypesetter {
        fn set_frame_size(&mut self, _w: u32, _h: u32) {}
        fn set_storage_size(&mut self, _w: u32, _h: u32) {}
        fn set_hinting(&mut self, _hinting: FontHinting) {}
        fn add_font(&mut self, _name: &str, _data: &[u8]) {}
        fn process_header(&mut self, _codec_private: &[u8]) {}
        fn process_line(&mut self, _line: &[u8]) {}

        fn render(&mut self, _now_ms: i64) -> Option<Vec<GlyphBitmap>> {
            None
        }
    }

    struct NullFactory;

    impl TypesetterFactory for NullFactory {
        fn create_typesetter(&self) -> Box<dyn Typesetter> {
            Box::new(NullTypesetter)
        }
    }

    // Library init is once-per-process; keep the whole lifecycle in one
    // test so ordering stays deterministic.
    #[test]
    fn test_init_lifecycle() {
        assert!(create_typesetter().is_none());
        init(InitConfig {
            network: false,
            hardware_decode: false,
            typesetter: Some(Box::new(NullFactory)),
        })
        .unwrap();

        assert!(create_typesetter().is_some());
        assert!(matches!(
            init(InitConfig::default()),
            Err(crate::Error::AlreadyInitialized)
        ));

        shutdown();
        assert!(create_typesetter().is_none());
        // Re-init after teardown stays forbidden.
        assert!(matches!(
            init(InitConfig::default()),
            Err(crate::Error::AlreadyInitialized)
        ));
    }

    // Hint storage is process-global, so keep every assertion about it in a
    // single test to avoid cross-test interference.
    #[test]
    fn test_hints_clamp_and_round_trip() {
        assert_eq!(hint(Hint::VideoBufferPackets), 3);
        assert_eq!(hint(Hint::AudioBufferPackets), 32);
        assert_eq!(hint(Hint::SubtitleBufferPackets), 32);

        set_hint(Hint::AudioBufferPackets, 0);
        assert_eq!(hint(Hint::AudioBufferPackets), 1);

        set_hint(Hint::VideoBufferFrames, 16);
        assert_eq!(hint(Hint::VideoBufferFrames), 16);

        set_hint(Hint::ProbeSize, 0);
        assert_eq!(hint(Hint::ProbeSize), 0);

        set_font_hinting(FontHinting::Light);
        assert_eq!(font_hinting(), FontHinting::Light);

        let snapshot = settings();
        assert_eq!(snapshot.audio_packet_buffer, 1);
        assert_eq!(snapshot.video_frame_buffer, 16);

        // Later hint changes must not affect an existing snapshot.
        set_hint(Hint::AudioBufferPackets, 8);
        assert_eq!(snapshot.audio_packet_buffer, 1);
    }
}
