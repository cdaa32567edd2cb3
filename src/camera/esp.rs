//! OV2640 camera on the AI-Thinker ESP32-CAM board.
//!
//! Wraps the `esp32-camera` component (bound through esp-idf-sys as the
//! `camera` bindings module).
//!
//! # Pin Configuration (AI-Thinker ESP32-CAM)
//!
//! | Signal | GPIO |
//! |--------|------|
//! | PWDN | 32 |
//! | XCLK | 0 |
//! | SIOD / SIOC | 26 / 27 |
//! | D7..D0 | 35, 34, 39, 36, 21, 19, 18, 5 |
//! | VSYNC / HREF / PCLK | 25 / 23 / 22 |
//!
//! # Blocking Bridge Pattern
//!
//! `esp_camera_fb_get` blocks until the sensor delivers a frame. Each grab
//! runs in `tokio::task::spawn_blocking` so the control loop's timeout can
//! give up on it.

use super::{Camera, CaptureError};
use crate::config::FrameSize;
use esp_idf_sys::camera;
use esp_idf_sys::{esp, EspError};
use log::{info, warn};

/// XCLK frequency for the OV2640.
const XCLK_FREQ_HZ: i32 = 20_000_000;

/// Frame buffers in PSRAM. Two lets the sensor fill one while we copy the other.
const FB_COUNT: usize = 2;

fn framesize(size: FrameSize) -> camera::framesize_t {
    match size {
        FrameSize::Qqvga => camera::framesize_t_FRAMESIZE_QQVGA,
        FrameSize::Qvga => camera::framesize_t_FRAMESIZE_QVGA,
        FrameSize::Cif => camera::framesize_t_FRAMESIZE_CIF,
        FrameSize::Vga => camera::framesize_t_FRAMESIZE_VGA,
        FrameSize::Svga => camera::framesize_t_FRAMESIZE_SVGA,
        FrameSize::Xga => camera::framesize_t_FRAMESIZE_XGA,
        FrameSize::Sxga => camera::framesize_t_FRAMESIZE_SXGA,
        FrameSize::Uxga => camera::framesize_t_FRAMESIZE_UXGA,
    }
}

/// ESP32-CAM sensor driver handle.
///
/// The driver is global in ESP-IDF; only one `EspCamera` may exist.
pub struct EspCamera {
    _private: (),
}

impl EspCamera {
    /// Initialise the sensor in JPEG mode.
    pub fn new(frame_size: FrameSize, jpeg_quality: u8) -> Result<Self, EspError> {
        // SAFETY: camera_config_t is a plain C struct; all-zero is a valid
        // starting point and every field the driver reads is set below.
        let mut config: camera::camera_config_t = unsafe { core::mem::zeroed() };
        config.pin_pwdn = 32;
        config.pin_reset = -1;
        config.pin_xclk = 0;
        config.__bindgen_anon_1.pin_sccb_sda = 26;
        config.__bindgen_anon_2.pin_sccb_scl = 27;
        config.pin_d7 = 35;
        config.pin_d6 = 34;
        config.pin_d5 = 39;
        config.pin_d4 = 36;
        config.pin_d3 = 21;
        config.pin_d2 = 19;
        config.pin_d1 = 18;
        config.pin_d0 = 5;
        config.pin_vsync = 25;
        config.pin_href = 23;
        config.pin_pclk = 22;
        config.xclk_freq_hz = XCLK_FREQ_HZ;
        config.ledc_timer = camera::ledc_timer_t_LEDC_TIMER_0;
        config.ledc_channel = camera::ledc_channel_t_LEDC_CHANNEL_0;
        config.pixel_format = camera::pixformat_t_PIXFORMAT_JPEG;
        config.frame_size = framesize(frame_size);
        config.jpeg_quality = i32::from(jpeg_quality);
        config.fb_count = FB_COUNT;
        config.fb_location = camera::camera_fb_location_t_CAMERA_FB_IN_PSRAM;
        config.grab_mode = camera::camera_grab_mode_t_CAMERA_GRAB_LATEST;
        config.sccb_i2c_port = -1;

        // SAFETY: config outlives the call; the driver copies what it needs.
        esp!(unsafe { camera::esp_camera_init(&config) })?;

        let (w, h) = frame_size.dimensions();
        info!(
            "Camera initialised: {} ({}x{}), JPEG quality {}",
            frame_size.as_str(),
            w,
            h,
            jpeg_quality
        );
        Ok(Self { _private: () })
    }
}

impl Drop for EspCamera {
    fn drop(&mut self) {
        // SAFETY: the driver was initialised in new()
        if let Err(e) = esp!(unsafe { camera::esp_camera_deinit() }) {
            warn!("Camera deinit failed: {:?}", e);
        }
    }
}

impl Camera for EspCamera {
    async fn grab(&mut self) -> Result<Vec<u8>, CaptureError> {
        tokio::task::spawn_blocking(grab_blocking)
            .await
            .map_err(|e| {
                warn!("Camera grab task panicked: {}", e);
                CaptureError::SensorFault
            })?
    }
}

/// Fetch one frame buffer, copy it out and hand the buffer back to the driver.
fn grab_blocking() -> Result<Vec<u8>, CaptureError> {
    // SAFETY: the driver is initialised while an EspCamera exists
    let fb = unsafe { camera::esp_camera_fb_get() };
    if fb.is_null() {
        return Err(CaptureError::Unavailable);
    }

    // SAFETY: fb is non-null and owned by us until esp_camera_fb_return
    let result = unsafe {
        let frame = &*fb;
        if frame.format != camera::pixformat_t_PIXFORMAT_JPEG || frame.buf.is_null() {
            Err(CaptureError::SensorFault)
        } else {
            Ok(std::slice::from_raw_parts(frame.buf, frame.len).to_vec())
        }
    };

    // SAFETY: returning the buffer we got above, exactly once
    unsafe { camera::esp_camera_fb_return(fb) };
    result
}
