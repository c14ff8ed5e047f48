//! User-space driver for the OV534/OV772x USB camera.
//!
//! The driver programs the OV534 bridge and the OV772x sensor behind it
//! over vendor control transfers, keeps five bulk transfers in flight to
//! pull the UVC-framed bayer stream, and hands reassembled frames to the
//! caller through a bounded lossy ring: a slow consumer loses frames, it
//! never stalls the camera.
//!
//! ```no_run
//! use oveye::{list_devices, OutputFormat, Resolution};
//!
//! let mut cameras = list_devices();
//! let camera = cameras.first_mut().expect("no camera attached");
//! camera.init(Resolution::Vga, 60, OutputFormat::Bgr);
//! camera.start();
//!
//! let mut frame = vec![0u8; (camera.stride() * camera.height()) as usize];
//! loop {
//!     if camera.get_frame(&mut frame) {
//!         // process the frame
//!     }
//! }
//! ```

pub mod camera;
mod controls;
pub mod convert;
pub mod error;
mod pump;
mod ring;
mod tables;
pub mod types;
mod usb;

pub use camera::Camera;
pub use error::{usb_error_code, Error, NO_ERROR};
pub use tables::normalize_framerate;
pub use types::{OutputFormat, Resolution};
pub use usb::{list_devices, set_debug};
