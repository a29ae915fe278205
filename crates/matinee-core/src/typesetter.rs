// crates/matinee-core/src/typesetter.rs
//
// Interface to the external script-subtitle typesetter (an SSA/ASS layout
// engine such as libass). The typesetter keeps persistent state: parsed
// events, codec-private style headers and fonts extracted from container
// attachments. The engine feeds it event lines and asks it to render at a
// given timestamp; compositing of the returned glyph masks is the engine's
// job.

use crate::formats::FontHinting;

/// A single glyph/outline bitmap produced by the typesetter: an 8-bit alpha
/// mask plus the RGBA fill color it should be painted with, positioned at
/// (`x`, `y`) in frame coordinates.
#[derive(Clone, Debug)]
pub struct GlyphBitmap {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
    /// Bytes per mask row; at least `w`.
    pub stride: usize,
    /// Fill color packed as 0xRRGGBBAA, where AA is *inverse* alpha
    /// (0 = opaque), following the SSA convention.
    pub color: u32,
    /// `stride * h` bytes of coverage, one byte per pixel.
    pub alpha: Vec<u8>,
}

/// Stateful script-subtitle layout engine for one subtitle stream.
pub trait Typesetter: Send {
    /// Rendering resolution; also the coordinate space of returned glyphs.
    fn set_frame_size(&mut self, w: u32, h: u32);

    /// Native size of the video the subtitles belong to; lets the
    /// typesetter scale bitmap-based style features correctly.
    fn set_storage_size(&mut self, w: u32, h: u32);

    fn set_hinting(&mut self, hinting: FontHinting);

    /// Register an embedded font under the name it carries in the container.
    fn add_font(&mut self, name: &str, data: &[u8]);

    /// Feed the stream's codec-private data (style and script headers).
    fn process_header(&mut self, codec_private: &[u8]);

    /// Feed one event line from a decoded subtitle packet.
    fn process_line(&mut self, line: &[u8]);

    /// Lay out the subtitle picture at `now_ms`. Returns `None` when nothing
    /// changed visually since the previous call, otherwise the full list of
    /// glyph bitmaps for the new picture (possibly empty, meaning the screen
    /// should be cleared).
    fn render(&mut self, now_ms: i64) -> Option<Vec<GlyphBitmap>>;
}

/// Installed at library initialization; creates one typesetter per subtitle
/// decoder.
pub trait TypesetterFactory: Send + Sync {
    fn create_typesetter(&self) -> Box<dyn Typesetter>;
}
