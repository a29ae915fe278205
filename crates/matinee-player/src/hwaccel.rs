// crates/matinee-player/src/hwaccel.rs
//
// Optional hardware decode support. When enabled, a device context is
// attached to the codec before it opens and a get_format override steers
// the codec toward the device's pixel format. Decoded frames then live in
// device memory and are transferred to system memory before conversion.
// Every failure falls back to software decoding.

use std::ffi::c_void;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;
use ffmpeg::format::Pixel;
use log::debug;

/// An acquired hardware device. Dropping releases the device reference; the
/// codec context holds its own reference while open.
pub(crate) struct HwDevice {
    device: *mut ffi::AVBufferRef,
    pub pixel_format: Pixel,
}

unsafe impl Send for HwDevice {}

impl Drop for HwDevice {
    fn drop(&mut self) {
        unsafe {
            ffi::av_buffer_unref(&mut self.device);
        }
    }
}

unsafe extern "C" fn pick_hw_format(
    ctx: *mut ffi::AVCodecContext,
    list: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    let wanted = (*ctx).opaque as isize as i32;
    let mut cursor = list;
    while *cursor != ffi::AVPixelFormat::AV_PIX_FMT_NONE {
        if *cursor as i32 == wanted {
            return *cursor;
        }
        cursor = cursor.add(1);
    }
    // Device format unavailable; take the codec's first offer (software).
    *list
}

/// Try to attach any usable hardware device to the (not yet opened) codec
/// context. Returns the device handle on success.
pub(crate) fn setup(
    context: &mut ffmpeg::codec::context::Context,
    codec: &ffmpeg::Codec,
) -> Option<HwDevice> {
    unsafe {
        let raw = context.as_mut_ptr();
        let mut index = 0;
        loop {
            let config = ffi::avcodec_get_hw_config(codec.as_ptr(), index);
            index += 1;
            if config.is_null() {
                return None;
            }
            if (*config).methods as u32 & ffi::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as u32 == 0 {
                continue;
            }
            let mut device: *mut ffi::AVBufferRef = std::ptr::null_mut();
            let created = ffi::av_hwdevice_ctx_create(
                &mut device,
                (*config).device_type,
                std::ptr::null(),
                std::ptr::null_mut(),
                0,
            );
            if created < 0 {
                continue;
            }
            (*raw).hw_device_ctx = ffi::av_buffer_ref(device);
            (*raw).opaque = (*config).pix_fmt as i32 as isize as *mut c_void;
            (*raw).get_format = Some(pick_hw_format);
            debug!("hardware decode device attached ({:?})", (*config).device_type);
            return Some(HwDevice {
                device,
                pixel_format: Pixel::from((*config).pix_fmt),
            });
        }
    }
}

/// Copy a device-memory frame into `dst` in system memory, preserving frame
/// properties (timestamps, aspect ratio).
pub(crate) fn transfer(
    src: &ffmpeg::frame::Video,
    dst: &mut ffmpeg::frame::Video,
) -> Result<(), ffmpeg::Error> {
    unsafe {
        ffi::av_frame_unref(dst.as_mut_ptr());
        let ret = ffi::av_hwframe_transfer_data(dst.as_mut_ptr(), src.as_ptr(), 0);
        if ret < 0 {
            return Err(ffmpeg::Error::from(ret));
        }
        ffi::av_frame_copy_props(dst.as_mut_ptr(), src.as_ptr());
    }
    Ok(())
}
