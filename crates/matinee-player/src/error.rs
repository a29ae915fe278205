// crates/matinee-player/src/error.rs

use ffmpeg_the_third as ffmpeg;
use matinee_core::StreamKind;
use thiserror::Error;

/// Errors surfaced by source opening, player construction and playback
/// control. Decode-time trouble never lands here: workers log transient
/// codec errors at debug level and keep running.
#[derive(Error, Debug)]
pub enum Error {
    #[error("library is already initialized")]
    AlreadyInitialized,

    #[error("invalid stream index {0}")]
    InvalidStream(usize),

    #[error("stream {index} is not a {expected:?} stream")]
    WrongStreamKind { index: usize, expected: StreamKind },

    #[error("no decoder found for codec {codec} of stream {index}")]
    UnsupportedCodec { index: usize, codec: String },

    #[error("subtitle stream selected without a video stream")]
    SubtitleRequiresVideo,

    #[error("at least one of video or audio must be selected")]
    NoStreamSelected,

    #[error("script subtitles need a typesetter installed at init")]
    TypesetterUnavailable,

    #[error("stream kind {0:?} was not selected when the player was created")]
    StreamNotSelected(StreamKind),

    #[error("player is closed")]
    PlayerClosed,

    #[error("seek failed: {0}")]
    Seek(#[source] ffmpeg::Error),

    #[error("custom io setup failed: {0}")]
    CustomIo(String),

    #[error("ffmpeg error: {0}")]
    Ffmpeg(#[from] ffmpeg::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
