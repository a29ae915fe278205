// crates/matinee-player/src/helpers/formats.rs
//
// Mapping between the engine's caller-facing format enums and ffmpeg's.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::util::format::sample::{Sample, Type};
use ffmpeg::ChannelLayout;

use matinee_core::{PixelFormat, SampleFormat, StreamKind};

/// Output pixel formats the engine is willing to hand to a render backend,
/// in preference order for the best-match scan.
const SUPPORTED_PIXELS: [Pixel; 13] = [
    Pixel::YUV420P,
    Pixel::YUYV422,
    Pixel::UYVY422,
    Pixel::NV12,
    Pixel::NV21,
    Pixel::RGB24,
    Pixel::BGR24,
    Pixel::RGB555LE,
    Pixel::BGR555LE,
    Pixel::RGB565LE,
    Pixel::BGR565LE,
    Pixel::BGRA,
    Pixel::RGBA,
];

pub(crate) fn to_av_pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Yuyv422 => Pixel::YUYV422,
        PixelFormat::Uyvy422 => Pixel::UYVY422,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::Nv21 => Pixel::NV21,
        PixelFormat::Rgb24 => Pixel::RGB24,
        PixelFormat::Bgr24 => Pixel::BGR24,
        PixelFormat::Rgb555 => Pixel::RGB555LE,
        PixelFormat::Bgr555 => Pixel::BGR555LE,
        PixelFormat::Rgb565 => Pixel::RGB565LE,
        PixelFormat::Bgr565 => Pixel::BGR565LE,
        PixelFormat::Rgba => Pixel::RGBA,
        PixelFormat::Bgra => Pixel::BGRA,
    }
}

pub(crate) fn from_av_pixel(pixel: Pixel) -> Option<PixelFormat> {
    match pixel {
        Pixel::YUV420P => Some(PixelFormat::Yuv420p),
        Pixel::YUYV422 => Some(PixelFormat::Yuyv422),
        Pixel::UYVY422 => Some(PixelFormat::Uyvy422),
        Pixel::NV12 => Some(PixelFormat::Nv12),
        Pixel::NV21 => Some(PixelFormat::Nv21),
        Pixel::RGB24 => Some(PixelFormat::Rgb24),
        Pixel::BGR24 => Some(PixelFormat::Bgr24),
        Pixel::RGB555LE => Some(PixelFormat::Rgb555),
        Pixel::BGR555LE => Some(PixelFormat::Bgr555),
        Pixel::RGB565LE => Some(PixelFormat::Rgb565),
        Pixel::BGR565LE => Some(PixelFormat::Bgr565),
        Pixel::RGBA => Some(PixelFormat::Rgba),
        Pixel::BGRA => Some(PixelFormat::Bgra),
        _ => None,
    }
}

/// Pick the supported output format that loses the least when converting
/// from `src`. Falls back to RGBA for anything exotic.
pub(crate) fn best_output_pixel(src: Pixel) -> PixelFormat {
    if let Some(direct) = from_av_pixel(src) {
        return direct;
    }
    let list: Vec<ffmpeg::ffi::AVPixelFormat> = SUPPORTED_PIXELS
        .iter()
        .map(|p| (*p).into())
        .chain(std::iter::once(ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_NONE))
        .collect();
    let best = unsafe {
        ffmpeg::ffi::av_find_best_pix_fmt_of_list(list.as_ptr(), src.into(), 0, std::ptr::null_mut())
    };
    from_av_pixel(Pixel::from(best)).unwrap_or(PixelFormat::Rgba)
}

pub(crate) fn to_av_sample(format: SampleFormat) -> Sample {
    match format {
        SampleFormat::U8 => Sample::U8(Type::Packed),
        SampleFormat::S16 => Sample::I16(Type::Packed),
        SampleFormat::S32 => Sample::I32(Type::Packed),
        SampleFormat::F32 => Sample::F32(Type::Packed),
    }
}

/// Closest caller-facing sample format for a codec's native output.
/// Planarity is dropped (the resampler always interleaves) and unusual
/// widths land on S16, like most audio backends expect.
pub(crate) fn best_output_sample(sample: Sample) -> SampleFormat {
    match sample {
        Sample::U8(_) => SampleFormat::U8,
        Sample::I32(_) => SampleFormat::S32,
        Sample::F32(_) | Sample::F64(_) => SampleFormat::F32,
        _ => SampleFormat::S16,
    }
}

/// Channel layout for a clamped output channel count.
pub(crate) fn layout_for(channels: u16) -> ChannelLayout {
    match channels {
        1 => ChannelLayout::MONO,
        _ => ChannelLayout::STEREO,
    }
}

pub(crate) fn stream_kind(medium: ffmpeg::media::Type) -> StreamKind {
    match medium {
        ffmpeg::media::Type::Video => StreamKind::Video,
        ffmpeg::media::Type::Audio => StreamKind::Audio,
        ffmpeg::media::Type::Subtitle => StreamKind::Subtitle,
        ffmpeg::media::Type::Data => StreamKind::Data,
        ffmpeg::media::Type::Attachment => StreamKind::Attachment,
        _ => StreamKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_round_trip() {
        for format in [
            PixelFormat::Yuv420p,
            PixelFormat::Nv12,
            PixelFormat::Rgb24,
            PixelFormat::Rgba,
            PixelFormat::Bgra,
        ] {
            assert_eq!(from_av_pixel(to_av_pixel(format)), Some(format));
        }
    }

    #[test]
    fn test_best_output_pixel_prefers_direct_match() {
        assert_eq!(best_output_pixel(Pixel::YUV420P), PixelFormat::Yuv420p);
        assert_eq!(best_output_pixel(Pixel::RGBA), PixelFormat::Rgba);
    }

    #[test]
    fn test_best_output_sample() {
        assert_eq!(best_output_sample(Sample::U8(Type::Planar)), SampleFormat::U8);
        assert_eq!(best_output_sample(Sample::I16(Type::Packed)), SampleFormat::S16);
        assert_eq!(best_output_sample(Sample::F64(Type::Planar)), SampleFormat::F32);
    }
}
