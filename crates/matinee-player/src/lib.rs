// crates/matinee-player/src/lib.rs
//
// matinee: a pull-based, multi-threaded A/V playback engine. One demuxer
// thread routes container packets into bounded per-stream rings; a decoder
// thread per selected stream turns them into frames, PCM segments and
// subtitle surfaces; the caller pulls everything through `Player`, paced by
// a shared presentation clock.

pub mod config;
pub mod error;
pub mod io;
pub mod player;
pub mod source;

mod atlas;
mod audio;
mod buffer;
mod clock;
mod decoder;
mod demux;
mod helpers;
mod hwaccel;
mod subtitle;
mod video;

pub use config::{font_hinting, hint, init, set_font_hinting, set_hint, shutdown, Hint, InitConfig};
pub use error::{Error, Result};
pub use io::MediaIo;
pub use player::{
    AudioStreamInfo, BufferState, Player, PlayerInfo, PlayerState, SubtitleStreamInfo,
    VideoStreamInfo,
};
pub use source::{Source, SourceStreamInfo};
pub use subtitle::RawSubtitle;
pub use video::RawVideoFrame;

pub use matinee_core::{
    Area, AtlasTexture, AudioFormat, AudioFormatRequest, CodecInfo, FontHinting, GlyphBitmap,
    PixelFormat, Plane, SampleFormat, StreamKind, SubtitleFormat, Typesetter, TypesetterFactory,
    VideoFormat, VideoFormatRequest, VideoTexture,
};
