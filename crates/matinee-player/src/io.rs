// crates/matinee-player/src/io.rs
//
// Custom AVIO plumbing: adapts a caller-supplied byte source to an ffmpeg
// input context. The bridge object is the AVIO opaque pointer; it must stay
// alive (and unmoved) for the lifetime of the format context, so the source
// keeps the box next to the context it feeds.

use std::ffi::{c_int, c_void, CString};
use std::io::{self, Read, Seek, SeekFrom};
use std::ptr;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;
use log::debug;

use crate::error::{Error, Result};

const AVIO_BUFFER_SIZE: usize = 32 * 1024;

// avio seek protocol extensions, from libavformat/avio.h.
const AVSEEK_SIZE: c_int = 0x10000;
const AVSEEK_FORCE: c_int = 0x20000;

/// Byte-level access to a caller-owned media object. All calls arrive from
/// the thread currently driving the demuxer, one at a time.
pub trait MediaIo: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    /// Total size in bytes, when known. Containers use this to locate
    /// end-of-file indexes.
    fn size(&mut self) -> Option<u64> {
        None
    }
}

/// Any `Read + Seek` object works as a media source; the size probe uses a
/// seek-to-end round trip.
pub(crate) struct ReaderIo<R: Read + Seek + Send> {
    inner: R,
}

impl<R: Read + Seek + Send> ReaderIo<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read + Seek + Send> MediaIo for ReaderIo<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }

    fn size(&mut self) -> Option<u64> {
        let current = self.inner.stream_position().ok()?;
        let end = self.inner.seek(SeekFrom::End(0)).ok()?;
        self.inner.seek(SeekFrom::Start(current)).ok()?;
        Some(end)
    }
}

/// The opaque object handed to ffmpeg's IO callbacks.
pub(crate) struct IoBridge {
    io: Box<dyn MediaIo>,
}

unsafe extern "C" fn read_packet(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    let bridge = &mut *(opaque as *mut IoBridge);
    let slice = std::slice::from_raw_parts_mut(buf, buf_size as usize);
    match bridge.io.read(slice) {
        Ok(0) => ffi::AVERROR_EOF,
        Ok(n) => n as c_int,
        Err(e) => {
            debug!("custom io read failed: {e}");
            ffi::AVERROR_EOF
        }
    }
}

unsafe extern "C" fn seek_packet(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    let bridge = &mut *(opaque as *mut IoBridge);

    if whence & AVSEEK_SIZE != 0 {
        return bridge.io.size().map(|s| s as i64).unwrap_or(-1);
    }

    let target = match whence & !AVSEEK_FORCE {
        0 => SeekFrom::Start(offset as u64),
        1 => SeekFrom::Current(offset),
        2 => SeekFrom::End(offset),
        _ => return -1,
    };
    match bridge.io.seek(target) {
        Ok(pos) => pos as i64,
        Err(_) => -1,
    }
}

/// Build an opened input context over `io`. Returns the context plus the
/// bridge box keeping the callback target alive.
pub(crate) fn open_custom(
    io: Box<dyn MediaIo>,
    probe_size: usize,
    analyze_duration: usize,
) -> Result<(ffmpeg::format::context::Input, Box<IoBridge>)> {
    let mut bridge = Box::new(IoBridge { io });
    let opaque = &mut *bridge as *mut IoBridge as *mut c_void;

    unsafe {
        let buffer = ffi::av_malloc(AVIO_BUFFER_SIZE) as *mut u8;
        if buffer.is_null() {
            return Err(Error::CustomIo("unable to allocate avio buffer".into()));
        }

        let avio = ffi::avio_alloc_context(
            buffer,
            AVIO_BUFFER_SIZE as c_int,
            0,
            opaque,
            Some(read_packet),
            None,
            Some(seek_packet),
        );
        if avio.is_null() {
            ffi::av_free(buffer as *mut c_void);
            return Err(Error::CustomIo("unable to allocate avio context".into()));
        }

        let mut format_ctx = ffi::avformat_alloc_context();
        if format_ctx.is_null() {
            ffi::av_freep(&mut (*avio).buffer as *mut _ as *mut c_void);
            let mut avio = avio;
            ffi::avio_context_free(&mut avio);
            return Err(Error::CustomIo("unable to allocate format context".into()));
        }
        (*format_ctx).pb = avio;
        if probe_size > 0 {
            (*format_ctx).probesize = probe_size as i64;
        }
        if analyze_duration > 0 {
            (*format_ctx).max_analyze_duration = analyze_duration as i64;
        }

        let empty = CString::new("").unwrap();
        if ffi::avformat_open_input(&mut format_ctx, empty.as_ptr(), ptr::null(), ptr::null_mut()) < 0 {
            // avformat_open_input frees the context on failure, but not the
            // avio context or its buffer.
            let mut avio = avio;
            ffi::av_freep(&mut (*avio).buffer as *mut _ as *mut c_void);
            ffi::avio_context_free(&mut avio);
            return Err(Error::CustomIo("unable to open custom source".into()));
        }

        if ffi::avformat_find_stream_info(format_ctx, ptr::null_mut()) < 0 {
            let mut avio = (*format_ctx).pb;
            ffi::avformat_close_input(&mut format_ctx);
            ffi::av_freep(&mut (*avio).buffer as *mut _ as *mut c_void);
            ffi::avio_context_free(&mut avio);
            return Err(Error::CustomIo("unable to probe custom source".into()));
        }

        Ok((ffmpeg::format::context::Input::wrap(format_ctx), bridge))
    }
}
