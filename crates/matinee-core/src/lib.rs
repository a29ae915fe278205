// crates/matinee-core/src/lib.rs
//
// Shared types for the matinee playback engine: format descriptions, format
// requests, geometry, and the collaborator traits (texture upload targets,
// script typesetter) that the engine talks to instead of a concrete GPU or
// subtitle renderer.

pub mod formats;
pub mod geometry;
pub mod texture;
pub mod typesetter;

pub use formats::{
    AudioFormat, AudioFormatRequest, CodecInfo, FontHinting, PixelFormat, SampleFormat,
    StreamKind, SubtitleFormat, VideoFormat, VideoFormatRequest,
};
pub use geometry::Area;
pub use texture::{AtlasTexture, Plane, VideoTexture};
pub use typesetter::{GlyphBitmap, Typesetter, TypesetterFactory};
