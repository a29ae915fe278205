// crates/matinee-player/src/subtitle/mod.rs
//
// Subtitle lane. Two rendering modes, picked from the stream's codec id:
// bitmap streams (DVD/DVB/PGS/XSUB) expand paletted rects into additive
// timed surfaces; script streams (SSA/ASS) feed event lines to the external
// typesetter and composite its glyph output. The reader half keeps the set
// of currently visible surfaces and serves them either packed into a
// texture atlas or as raw RGBA frames.

mod bitmap;
mod script;

use std::ffi::CStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;
use log::debug;

use matinee_core::{Area, AtlasTexture, CodecInfo, StreamKind, SubtitleFormat, Typesetter};

use crate::atlas::TextureAtlas;
use crate::buffer::RingBuffer;
use crate::clock::PlaybackClock;
use crate::config::{self, Settings};
use crate::decoder::{DecoderWorker, SubmitResult};
use crate::error::{Error, Result};
use crate::source::{Source, StreamDesc};

/// MIME types of font attachments handed to the typesetter.
const FONT_MIME_TYPES: [&str; 6] = [
    "application/x-font-ttf",
    "application/x-font-truetype",
    "application/x-truetype-font",
    "application/x-font-opentype",
    "application/vnd.ms-opentype",
    "application/font-sfnt",
];

/// One timed surface (or clear event) produced by the worker.
pub(crate) struct SubtitleEvent {
    pub pts_start: f64,
    /// `None` means "sticky": visible until the next event on the stream.
    pub pts_end: Option<f64>,
    /// Clear event: wipe currently visible surfaces, carries no pixels.
    pub clear: bool,
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
    pub pixels: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum RenderMode {
    Bitmap,
    Script,
}

/// Classify a subtitle codec; `None` disables the lane.
pub(crate) fn render_mode(id: ffmpeg::codec::Id) -> Option<RenderMode> {
    use ffmpeg::codec::Id;
    match id {
        Id::SSA | Id::ASS => Some(RenderMode::Script),
        Id::DVD_SUBTITLE | Id::DVB_SUBTITLE | Id::HDMV_PGS_SUBTITLE | Id::XSUB => {
            Some(RenderMode::Bitmap)
        }
        _ => None,
    }
}

enum WorkerMode {
    Bitmap,
    Script(Arc<Mutex<Box<dyn Typesetter>>>),
}

pub(crate) struct SubtitleDecoderWorker {
    decoder: ffmpeg::decoder::Subtitle,
    mode: WorkerMode,
    output: Arc<RingBuffer<SubtitleEvent>>,
    clock: PlaybackClock,
    time_base: f64,
}

/// A currently tracked surface plus its insertion id, used to detect when
/// the on-screen set changes.
struct Entry {
    id: u64,
    event: SubtitleEvent,
}

pub(crate) struct SubtitleReader {
    output: Arc<RingBuffer<SubtitleEvent>>,
    mode: RenderMode,
    scale: (f32, f32),
    entries: Vec<Entry>,
    next_id: u64,
    shown: Vec<u64>,
    atlas: TextureAtlas,
    quads: Vec<(Area, Area)>,
}

pub(crate) struct SubtitleLaneParts {
    pub worker: SubtitleDecoderWorker,
    pub reader: SubtitleReader,
    pub codec: CodecInfo,
    pub format: SubtitleFormat,
    /// Shared with the worker's script renderer; used for screen resizes.
    pub typesetter: Option<Arc<Mutex<Box<dyn Typesetter>>>>,
    /// Wake-up handle for the worker's output, used by the decoder thread.
    pub output: Arc<RingBuffer<SubtitleEvent>>,
}

/// Build the subtitle lane for `desc`, or `Ok(None)` when the codec has no
/// renderer here (text formats and unsupported image formats).
pub(crate) fn build_subtitle_lane(
    desc: &StreamDesc,
    source: &Source,
    video_size: (u32, u32),
    screen_size: (u32, u32),
    clock: &PlaybackClock,
    writable_clock: bool,
    settings: &Settings,
) -> Result<Option<SubtitleLaneParts>> {
    let Some(mode) = render_mode(desc.codec_id) else {
        debug!("subtitle codec {} has no renderer, stream disabled", desc.codec_name);
        return Ok(None);
    };

    let codec = ffmpeg::decoder::find(desc.codec_id).ok_or_else(|| Error::UnsupportedCodec {
        index: desc.index,
        codec: desc.codec_name.clone(),
    })?;
    let mut context = ffmpeg::codec::context::Context::from_parameters(desc.parameters.clone())?;
    unsafe {
        (*context.as_mut_ptr()).pkt_timebase = desc.time_base.into();
    }
    let decoder = context.decoder().subtitle()?;

    let typesetter = match mode {
        RenderMode::Script => {
            let mut typesetter =
                config::create_typesetter().ok_or(Error::TypesetterUnavailable)?;
            typesetter.set_frame_size(screen_size.0, screen_size.1);
            typesetter.set_storage_size(video_size.0, video_size.1);
            typesetter.set_hinting(settings.font_hinting);
            if !desc.extradata.is_empty() {
                typesetter.process_header(&desc.extradata);
            }
            load_attached_fonts(source, typesetter.as_mut());
            Some(Arc::new(Mutex::new(typesetter)))
        }
        RenderMode::Bitmap => None,
    };

    let scale = match mode {
        RenderMode::Bitmap => (
            screen_size.0 as f32 / video_size.0.max(1) as f32,
            screen_size.1 as f32 / video_size.1.max(1) as f32,
        ),
        RenderMode::Script => (1.0, 1.0),
    };

    let output = Arc::new(RingBuffer::new(settings.subtitle_frame_buffer));
    let worker_mode = match &typesetter {
        Some(shared) => WorkerMode::Script(Arc::clone(shared)),
        None => WorkerMode::Bitmap,
    };

    Ok(Some(SubtitleLaneParts {
        output: Arc::clone(&output),
        worker: SubtitleDecoderWorker {
            decoder,
            mode: worker_mode,
            output: Arc::clone(&output),
            clock: clock.secondary(writable_clock),
            time_base: f64::from(desc.time_base),
        },
        reader: SubtitleReader {
            output,
            mode,
            scale,
            entries: Vec::new(),
            next_id: 0,
            shown: Vec::new(),
            atlas: TextureAtlas::new(screen_size.0.max(1), screen_size.1.max(1)),
            quads: Vec::new(),
        },
        codec: CodecInfo {
            name: codec.name().to_string(),
            description: codec.description().to_string(),
            threads: 1,
        },
        format: SubtitleFormat::default(),
        typesetter,
    }))
}

/// Hand every attached font in the container to the typesetter.
fn load_attached_fonts(source: &Source, typesetter: &mut dyn Typesetter) {
    for desc in &source.inner.streams {
        if desc.kind != StreamKind::Attachment || desc.extradata.is_empty() {
            continue;
        }
        let is_font = desc
            .mime_type
            .as_deref()
            .map(|mime| FONT_MIME_TYPES.iter().any(|f| f.eq_ignore_ascii_case(mime)))
            .unwrap_or(false);
        if !is_font {
            continue;
        }
        if let Some(name) = &desc.file_name {
            debug!("registering attached font {name}");
            typesetter.add_font(name, &desc.extradata);
        }
    }
}

impl SubtitleDecoderWorker {
    fn emit(&mut self, event: SubtitleEvent) {
        // Blocks while the reader is behind; a signal drops the event.
        let _ = self.output.write(event);
    }

    fn handle_subtitle(&mut self, decoded: &ffmpeg::codec::subtitle::Subtitle, packet_pts: f64) {
        let raw = unsafe { &*decoded.as_ptr() };
        let pts_start = packet_pts + raw.start_display_time as f64 / 1000.0;
        let pts_end = match raw.end_display_time {
            // Missing or degenerate end: the event holds until the next one.
            0 | u32::MAX => None,
            end => Some(packet_pts + end as f64 / 1000.0),
        };

        match &self.mode {
            WorkerMode::Bitmap => self.render_bitmap(raw, pts_start, pts_end),
            WorkerMode::Script(typesetter) => {
                let typesetter = Arc::clone(typesetter);
                self.render_script(&typesetter, raw, pts_start, pts_end);
            }
        }
    }

    fn render_bitmap(&mut self, raw: &ffi::AVSubtitle, pts_start: f64, pts_end: Option<f64>) {
        if raw.num_rects == 0 {
            // An empty event clears whatever is on screen.
            self.emit(SubtitleEvent {
                pts_start,
                pts_end,
                clear: true,
                x: 0,
                y: 0,
                w: 0,
                h: 0,
                pixels: Vec::new(),
            });
            return;
        }

        for i in 0..raw.num_rects as usize {
            let rect = unsafe { &**raw.rects.add(i) };
            if rect.type_ != ffi::AVSubtitleType::SUBTITLE_BITMAP {
                continue;
            }
            if rect.w <= 0 || rect.h <= 0 || rect.data[0].is_null() || rect.data[1].is_null() {
                continue;
            }
            let (w, h) = (rect.w as u32, rect.h as u32);
            let linesize = rect.linesize[0] as usize;
            let (indexed, palette) = unsafe {
                (
                    std::slice::from_raw_parts(rect.data[0], linesize * h as usize),
                    std::slice::from_raw_parts(rect.data[1], 256 * 4),
                )
            };
            let pixels = bitmap::expand_palette(indexed, linesize, palette, w, h);
            self.emit(SubtitleEvent {
                pts_start,
                pts_end,
                clear: false,
                x: rect.x,
                y: rect.y,
                w,
                h,
                pixels,
            });
        }
    }

    fn render_script(
        &mut self,
        typesetter: &Mutex<Box<dyn Typesetter>>,
        raw: &ffi::AVSubtitle,
        pts_start: f64,
        pts_end: Option<f64>,
    ) {
        let rendered = {
            let mut typesetter = typesetter.lock().unwrap();
            for i in 0..raw.num_rects as usize {
                let rect = unsafe { &**raw.rects.add(i) };
                if rect.type_ != ffi::AVSubtitleType::SUBTITLE_ASS || rect.ass.is_null() {
                    continue;
                }
                let line = unsafe { CStr::from_ptr(rect.ass) };
                typesetter.process_line(line.to_bytes());
            }
            typesetter.render((pts_start * 1000.0) as i64)
        };

        // `None` means no visual change since the last render.
        let Some(glyphs) = rendered else { return };
        match script::compose(&glyphs) {
            Some(surface) => self.emit(SubtitleEvent {
                pts_start,
                pts_end,
                clear: false,
                x: surface.x,
                y: surface.y,
                w: surface.w,
                h: surface.h,
                pixels: surface.pixels,
            }),
            // The picture became empty; wipe the screen.
            None => self.emit(SubtitleEvent {
                pts_start,
                pts_end,
                clear: true,
                x: 0,
                y: 0,
                w: 0,
                h: 0,
                pixels: Vec::new(),
            }),
        }
    }
}

impl DecoderWorker for SubtitleDecoderWorker {
    fn submit(&mut self, packet: &ffmpeg::Packet) -> SubmitResult {
        if packet.size() == 0 {
            return SubmitResult::Consumed;
        }
        let packet_pts = packet.pts().unwrap_or(0) as f64 * self.time_base;
        let mut decoded = ffmpeg::codec::subtitle::Subtitle::new();
        match self.decoder.decode(packet, &mut decoded) {
            Ok(true) => self.handle_subtitle(&decoded, packet_pts),
            Ok(false) => {}
            Err(e) => debug!("subtitle decode failed: {e}"),
        }
        SubmitResult::Consumed
    }

    // Subtitles are produced synchronously in `submit`.
    fn decode_next(&mut self) -> Option<f64> {
        None
    }

    fn flush(&mut self) {
        self.decoder.flush();
        self.output.flush();
    }

    fn anchor_clock(&mut self, pts: f64) {
        self.clock.adjust_base(pts);
    }
}

/// Raw (non-atlas) view of one visible subtitle surface.
pub struct RawSubtitle<'a> {
    /// Straight RGBA pixels, `source.w * 4` bytes per row.
    pub pixels: &'a [u8],
    pub source: Area,
    pub target: Area,
}

impl SubtitleReader {
    pub fn buffer_state(&self) -> (usize, usize) {
        (self.output.len(), self.output.capacity())
    }

    /// Wake the worker out of a blocked write into this lane's output.
    pub fn signal(&self) {
        self.output.signal();
    }

    pub fn is_drained(&self) -> bool {
        self.output.is_empty()
    }

    /// The quads of the last fetch, for paused rendering.
    pub fn current_quads(&self, limit: usize) -> &[(Area, Area)] {
        &self.quads[..self.quads.len().min(limit)]
    }

    pub fn discard_current(&mut self) {
        self.entries.clear();
        self.shown.clear();
        self.atlas.clear();
        self.quads.clear();
    }

    /// Pull decoded events into the visible set and expire stale ones.
    fn ingest(&mut self, now: f64) {
        self.entries
            .retain(|entry| entry.event.pts_end.map_or(true, |end| end >= now));

        while let Some(event) = self.output.read(Duration::ZERO) {
            if event.pts_end.map_or(false, |end| end < now) {
                continue; // already expired, e.g. right after a long pause
            }
            if event.clear {
                self.entries.clear();
                continue;
            }
            match self.mode {
                // A script emission wholly replaces the previous picture.
                RenderMode::Script => self.entries.clear(),
                // Bitmap surfaces are additive, but a new event retires
                // sticky surfaces of older events.
                RenderMode::Bitmap => self.entries.retain(|entry| {
                    !(entry.event.pts_end.is_none() && entry.event.pts_start < event.pts_start)
                }),
            }
            let id = self.next_id;
            self.next_id += 1;
            self.entries.push(Entry { id, event });
        }
    }

    fn target_area(&self, event: &SubtitleEvent) -> Area {
        Area::new(event.x, event.y, event.w, event.h).scaled(self.scale.0, self.scale.1)
    }

    /// Atlas view: pack every surface visible at `now` into `texture` and
    /// return up to `limit` (source, target) quads.
    pub fn fetch_texture(
        &mut self,
        texture: &mut dyn AtlasTexture,
        now: f64,
        limit: usize,
    ) -> &[(Area, Area)] {
        self.ingest(now);
        let shown: Vec<u64> = self
            .entries
            .iter()
            .filter(|entry| entry.event.pts_start <= now)
            .map(|entry| entry.id)
            .collect();
        if shown != self.shown {
            self.atlas.clear();
            for entry in &self.entries {
                if entry.event.pts_start > now {
                    continue;
                }
                let target = self.target_area(&entry.event);
                self.atlas.add_item(
                    entry.event.pixels.clone(),
                    entry.event.w,
                    entry.event.h,
                    target,
                );
            }
            self.shown = shown;
        }
        self.atlas.blit(texture);
        self.quads = self.atlas.items(limit);
        &self.quads
    }

    /// Raw view: the visible surfaces without touching any texture.
    pub fn fetch_raw(&mut self, now: f64) -> Vec<RawSubtitle<'_>> {
        self.ingest(now);
        self.entries
            .iter()
            .filter(|entry| entry.event.pts_start <= now)
            .map(|entry| RawSubtitle {
                pixels: &entry.event.pixels,
                source: Area::sized(entry.event.w, entry.event.h),
                target: self.target_area(&entry.event),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(start: f64, end: Option<f64>, w: u32, h: u32) -> SubtitleEvent {
        SubtitleEvent {
            pts_start: start,
            pts_end: end,
            clear: false,
            x: 8,
            y: 16,
            w,
            h,
            pixels: vec![0xff; (w * h * 4) as usize],
        }
    }

    fn clear_event(start: f64) -> SubtitleEvent {
        SubtitleEvent {
            pts_start: start,
            pts_end: None,
            clear: true,
            x: 0,
            y: 0,
            w: 0,
            h: 0,
            pixels: Vec::new(),
        }
    }

    fn test_reader(mode: RenderMode) -> SubtitleReader {
        SubtitleReader {
            output: Arc::new(RingBuffer::new(16)),
            mode,
            scale: (1.0, 1.0),
            entries: Vec::new(),
            next_id: 0,
            shown: Vec::new(),
            atlas: TextureAtlas::new(512, 512),
            quads: Vec::new(),
        }
    }

    struct NullAtlas;

    impl AtlasTexture for NullAtlas {
        fn size(&self) -> (u32, u32) {
            (512, 512)
        }

        fn upload(&mut self, _area: Area, _pixels: &[u8], _pitch: usize) {}
    }

    #[test]
    fn test_event_visibility_window() {
        let mut reader = test_reader(RenderMode::Bitmap);
        reader.output.write(event(5.0, Some(7.0), 16, 8)).unwrap();

        // Too early: the event is tracked but not shown.
        assert!(reader.fetch_texture(&mut NullAtlas, 4.9, 64).is_empty());
        // In range.
        assert_eq!(reader.fetch_texture(&mut NullAtlas, 5.5, 64).len(), 1);
        // Expired.
        assert!(reader.fetch_texture(&mut NullAtlas, 7.5, 64).is_empty());
    }

    #[test]
    fn test_clear_event_wipes_visible_set() {
        let mut reader = test_reader(RenderMode::Bitmap);
        reader.output.write(event(1.0, None, 8, 8)).unwrap();
        assert_eq!(reader.fetch_texture(&mut NullAtlas, 1.5, 64).len(), 1);
        reader.output.write(clear_event(2.0)).unwrap();
        assert!(reader.fetch_texture(&mut NullAtlas, 2.5, 64).is_empty());
    }

    #[test]
    fn test_sticky_surface_retired_by_next_event() {
        let mut reader = test_reader(RenderMode::Bitmap);
        reader.output.write(event(1.0, None, 8, 8)).unwrap();
        assert_eq!(reader.fetch_texture(&mut NullAtlas, 1.5, 64).len(), 1);
        // A later event replaces the sticky one.
        reader.output.write(event(3.0, Some(6.0), 8, 8)).unwrap();
        assert_eq!(reader.fetch_texture(&mut NullAtlas, 3.5, 64).len(), 1);
        let raw = reader.fetch_raw(3.5);
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].source, Area::sized(8, 8));
    }

    #[test]
    fn test_bitmap_events_are_additive_within_window() {
        let mut reader = test_reader(RenderMode::Bitmap);
        reader.output.write(event(1.0, Some(9.0), 8, 8)).unwrap();
        reader.output.write(event(1.0, Some(9.0), 4, 4)).unwrap();
        assert_eq!(reader.fetch_texture(&mut NullAtlas, 2.0, 64).len(), 2);
    }

    #[test]
    fn test_script_event_replaces_previous() {
        let mut reader = test_reader(RenderMode::Script);
        reader.output.write(event(1.0, Some(9.0), 8, 8)).unwrap();
        assert_eq!(reader.fetch_texture(&mut NullAtlas, 2.0, 64).len(), 1);
        reader.output.write(event(3.0, Some(9.0), 4, 4)).unwrap();
        let quads = reader.fetch_texture(&mut NullAtlas, 3.5, 64);
        assert_eq!(quads.len(), 1);
        assert_eq!(quads[0].0.w, 4);
    }

    #[test]
    fn test_raw_view_scales_target() {
        let mut reader = test_reader(RenderMode::Bitmap);
        reader.scale = (2.0, 0.5);
        reader.output.write(event(1.0, Some(5.0), 10, 10)).unwrap();
        let raw = reader.fetch_raw(2.0);
        assert_eq!(raw[0].source, Area::sized(10, 10));
        assert_eq!(raw[0].target, Area::new(16, 8, 20, 5));
    }
}
