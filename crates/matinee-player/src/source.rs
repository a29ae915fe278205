// crates/matinee-player/src/source.rs
//
// An opened media container plus a snapshot of its stream table. The format
// context lives behind a mutex: the demuxer thread reads packets and seeks
// through it while the coordinator only touches the snapshot.

use std::io::{Read, Seek};
use std::path::Path;
use std::sync::{Arc, Mutex};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::media::Type;
use log::debug;

use matinee_core::StreamKind;

use crate::config;
use crate::error::{Error, Result};
use crate::helpers::formats::stream_kind;
use crate::io::{open_custom, IoBridge, MediaIo, ReaderIo};

/// The format context, touched by one thread at a time through the mutex in
/// `SourceInner`. The wrapper carries the Send bound that the raw-pointer
/// wrapper underneath cannot declare for us.
pub(crate) struct FormatHandle(pub ffmpeg::format::context::Input);

unsafe impl Send for FormatHandle {}

/// Per-stream snapshot taken at open time. Everything decoders need is
/// copied out so they never touch the format context afterwards.
#[derive(Clone)]
pub(crate) struct StreamDesc {
    pub index: usize,
    pub kind: StreamKind,
    pub codec_id: ffmpeg::codec::Id,
    pub codec_name: String,
    pub time_base: ffmpeg::Rational,
    pub parameters: ffmpeg::codec::Parameters,
    /// Container-level sample aspect ratio (may be 0/1 when unset).
    pub sample_aspect_ratio: (i32, i32),
    /// `filename` and `mimetype` metadata tags; set on attachment streams.
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    /// Codec-private data: script headers for subtitle streams, payload
    /// bytes for attachments.
    pub extradata: Vec<u8>,
}

pub(crate) struct SourceInner {
    pub format: Mutex<FormatHandle>,
    /// Keeps the custom-IO callback target alive beside the context. Only
    /// ffmpeg calls into it, through the format mutex; the extra mutex just
    /// carries the Sync bound for sharing the source across threads.
    #[allow(dead_code)]
    io: Option<Mutex<Box<IoBridge>>>,
    pub streams: Vec<StreamDesc>,
    pub duration: f64,
}

/// An opened media source. Cheap to clone; at most one player should borrow
/// it at a time, and it must outlive that player.
#[derive(Clone)]
pub struct Source {
    pub(crate) inner: Arc<SourceInner>,
}

/// Caller-facing stream table entry.
#[derive(Clone, Debug)]
pub struct SourceStreamInfo {
    pub index: usize,
    pub kind: StreamKind,
    pub codec_name: String,
}

fn snapshot_streams(input: &ffmpeg::format::context::Input) -> Vec<StreamDesc> {
    let mut streams = Vec::new();
    for stream in input.streams() {
        let parameters = stream.parameters();
        let codec_id = parameters.id();
        let codec_name = ffmpeg::decoder::find(codec_id)
            .map(|codec| codec.name().to_string())
            .unwrap_or_else(|| format!("{codec_id:?}").to_lowercase());
        let (sar, extradata) = unsafe {
            let par = parameters.as_ptr();
            let sar = (*par).sample_aspect_ratio;
            let extradata = if (*par).extradata.is_null() || (*par).extradata_size <= 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts((*par).extradata, (*par).extradata_size as usize).to_vec()
            };
            ((sar.num, sar.den), extradata)
        };
        let metadata = stream.metadata();
        streams.push(StreamDesc {
            index: stream.index(),
            kind: stream_kind(parameters.medium()),
            codec_id,
            codec_name,
            time_base: stream.time_base(),
            parameters: parameters.clone(),
            sample_aspect_ratio: sar,
            file_name: metadata.get("filename").map(str::to_string),
            mime_type: metadata.get("mimetype").map(str::to_string),
            extradata,
        });
    }
    streams
}

fn container_duration(input: &ffmpeg::format::context::Input) -> f64 {
    let duration = input.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
    if duration > 0.0 {
        return duration;
    }
    // Fall back to the longest stream duration.
    input
        .streams()
        .map(|stream| stream.duration() as f64 * f64::from(stream.time_base()))
        .fold(0.0, f64::max)
}

impl Source {
    /// Open a local path or URL. URL schemes need the library initialized
    /// with network support.
    pub fn from_url<P: AsRef<Path>>(path: P) -> Result<Self> {
        ffmpeg::init()?;
        let settings = config::settings();
        let mut options = ffmpeg::Dictionary::new();
        if settings.probe_size > 0 {
            options.set("probesize", &settings.probe_size.to_string());
        }
        if settings.analyze_duration > 0 {
            options.set("analyzeduration", &settings.analyze_duration.to_string());
        }
        let input = ffmpeg::format::input_with_dictionary(&path, options)?;
        Ok(Self::from_input(input, None))
    }

    /// Open a caller-implemented byte source.
    pub fn from_custom(io: Box<dyn MediaIo>) -> Result<Self> {
        ffmpeg::init()?;
        let settings = config::settings();
        let (input, bridge) = open_custom(io, settings.probe_size, settings.analyze_duration)?;
        Ok(Self::from_input(input, Some(bridge)))
    }

    /// Open anything readable and seekable, e.g. a `File` or a `Cursor`.
    pub fn from_reader<R: Read + Seek + Send + 'static>(reader: R) -> Result<Self> {
        Self::from_custom(Box::new(ReaderIo::new(reader)))
    }

    fn from_input(input: ffmpeg::format::context::Input, io: Option<Box<IoBridge>>) -> Self {
        let streams = snapshot_streams(&input);
        let duration = container_duration(&input);
        debug!("opened source: {} streams, {:.2}s", streams.len(), duration);
        Self {
            inner: Arc::new(SourceInner {
                format: Mutex::new(FormatHandle(input)),
                io: io.map(Mutex::new),
                streams,
                duration,
            }),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn stream_info(&self, index: usize) -> Result<SourceStreamInfo> {
        let desc = self
            .inner
            .streams
            .get(index)
            .ok_or(Error::InvalidStream(index))?;
        Ok(SourceStreamInfo {
            index: desc.index,
            kind: desc.kind,
            codec_name: desc.codec_name.clone(),
        })
    }

    /// Duration of the container in seconds; 0 when unknown.
    pub fn duration(&self) -> f64 {
        self.inner.duration
    }

    /// Pick the stream the container marks as the best candidate for the
    /// given kind. Subtitle streams are scanned for the first codec the
    /// engine can actually render.
    pub fn best_stream(&self, kind: StreamKind) -> Option<usize> {
        match kind {
            StreamKind::Video | StreamKind::Audio => {
                let medium = if kind == StreamKind::Video { Type::Video } else { Type::Audio };
                let format = self.inner.format.lock().unwrap();
                format.0.streams().best(medium).map(|stream| stream.index())
            }
            StreamKind::Subtitle => self
                .inner
                .streams
                .iter()
                .find(|desc| desc.kind == StreamKind::Subtitle && supported_subtitle(desc.codec_id))
                .map(|desc| desc.index),
            _ => None,
        }
    }

    /// Indexes of every stream of the given kind, in container order.
    pub fn streams_of(&self, kind: StreamKind) -> Vec<usize> {
        self.inner
            .streams
            .iter()
            .filter(|desc| desc.kind == kind)
            .map(|desc| desc.index)
            .collect()
    }

    /// Next stream of `kind` after `current` (scanning forward), wrapping
    /// to the start when `wrap` is set. `None` starts from the beginning.
    pub fn next_stream(&self, kind: StreamKind, current: Option<usize>, wrap: bool) -> Option<usize> {
        let start = current.map(|c| c + 1).unwrap_or(0);
        let found = self.inner.streams[start.min(self.inner.streams.len())..]
            .iter()
            .find(|desc| desc.kind == kind)
            .map(|desc| desc.index);
        if found.is_some() || !wrap {
            return found;
        }
        self.inner
            .streams
            .iter()
            .take(current.unwrap_or(0))
            .find(|desc| desc.kind == kind)
            .map(|desc| desc.index)
    }

    pub(crate) fn stream_desc(&self, index: usize) -> Result<&StreamDesc> {
        self.inner.streams.get(index).ok_or(Error::InvalidStream(index))
    }

    /// Checked lookup: the stream must exist and be of `expected` kind.
    pub(crate) fn expect_stream(&self, index: usize, expected: StreamKind) -> Result<&StreamDesc> {
        let desc = self.stream_desc(index)?;
        if desc.kind != expected {
            return Err(Error::WrongStreamKind { index, expected });
        }
        Ok(desc)
    }
}

/// Subtitle codecs the engine can turn into surfaces.
pub(crate) fn supported_subtitle(id: ffmpeg::codec::Id) -> bool {
    use ffmpeg::codec::Id;
    matches!(
        id,
        Id::TEXT
            | Id::HDMV_TEXT_SUBTITLE
            | Id::SRT
            | Id::SUBRIP
            | Id::SSA
            | Id::ASS
            | Id::DVD_SUBTITLE
            | Id::DVB_SUBTITLE
            | Id::HDMV_PGS_SUBTITLE
            | Id::XSUB
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_subtitle_set() {
        use ffmpeg::codec::Id;
        assert!(supported_subtitle(Id::ASS));
        assert!(supported_subtitle(Id::SSA));
        assert!(supported_subtitle(Id::SUBRIP));
        assert!(supported_subtitle(Id::HDMV_PGS_SUBTITLE));
        assert!(supported_subtitle(Id::DVB_SUBTITLE));
        assert!(!supported_subtitle(Id::WEBVTT));
        assert!(!supported_subtitle(Id::H264));
    }
}
