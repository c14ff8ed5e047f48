//! Camera lifecycle and the OV534/SCCB register protocol.
//!
//! All bridge registers are reached through one vendor control request;
//! registers 0xf1..0xf6 tunnel a serial bus (SCCB) transaction to the
//! OV772x sensor behind the bridge. A failed control transfer latches a
//! sticky error that turns every later register access into a no-op, so a
//! dead device collapses to a single observable failure instead of a
//! cascade; `init` is the only reset point.

use std::thread;
use std::time::Duration;

use rusb::{request_type, Context, Device, DeviceHandle, Direction, Recipient, RequestType};

use crate::error::{usb_error_code, Error, NO_ERROR};
use crate::pump::UrbPump;
use crate::tables;
use crate::types::{OutputFormat, Resolution};
use crate::usb;

/// Vendor control request carrying all bridge register access.
const REG_REQUEST: u8 = 0x01;
const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);
const RESET_SETTLE: Duration = Duration::from_millis(10);

// Bridge registers tunneling SCCB transactions to the sensor.
const SCCB_ADDRESS: u16 = 0xf1;
const SCCB_SUBADDR: u16 = 0xf2;
const SCCB_WRITE: u16 = 0xf3;
const SCCB_READ: u16 = 0xf4;
const SCCB_OPERATION: u16 = 0xf5;
const SCCB_STATUS: u16 = 0xf6;

// SCCB operation codes.
const SCCB_OP_WRITE_3: u8 = 0x37;
const SCCB_OP_WRITE_2: u8 = 0x33;
const SCCB_OP_READ_2: u8 = 0xf9;

/// One OV534/OV772x camera.
///
/// Obtained from [`crate::list_devices`]; drive it through
/// `init` → `start` → `get_frame` → `stop`. Dropping the camera stops
/// streaming and releases the device.
pub struct Camera {
    device: Device<Context>,
    handle: Option<DeviceHandle<Context>>,
    pump: Box<UrbPump>,

    resolution: Resolution,
    pub(crate) framerate: u16,
    format: OutputFormat,

    pub(crate) gain: u8,
    pub(crate) exposure: u8,
    pub(crate) sharpness: u8,
    pub(crate) hue: u8,
    pub(crate) brightness: u8,
    pub(crate) contrast: u8,
    pub(crate) blue_balance: u8,
    pub(crate) red_balance: u8,
    pub(crate) green_balance: u8,
    pub(crate) saturation: u8,
    pub(crate) auto_gain: bool,
    pub(crate) awb: bool,
    pub(crate) flip_h: bool,
    pub(crate) flip_v: bool,
    pub(crate) test_pattern: bool,

    streaming: bool,
    initialized: bool,
    error: Option<rusb::Error>,
    usb_buf: [u8; 64],
}

impl Camera {
    pub(crate) fn new(device: Device<Context>) -> Self {
        Self {
            device,
            handle: None,
            pump: UrbPump::new(),
            resolution: Resolution::Vga,
            framerate: 30,
            format: OutputFormat::Bgr,
            gain: 20,
            exposure: 120,
            sharpness: 0,
            hue: 143,
            brightness: 20,
            contrast: 37,
            blue_balance: 128,
            red_balance: 128,
            green_balance: 128,
            saturation: 128,
            auto_gain: false,
            awb: false,
            flip_h: false,
            flip_v: false,
            test_pattern: false,
            streaming: false,
            initialized: false,
            error: None,
            usb_buf: [0; 64],
        }
    }

    /// Open the device, program both chips and record the capture mode.
    /// Clears any sticky error; stops a running stream first.
    pub fn init(&mut self, resolution: Resolution, fps: u16, format: OutputFormat) -> bool {
        if self.handle.is_none() {
            if let Err(err) = self.open_usb() {
                log::error!("device open failed: {err}");
                if let Error::Usb(usb_err) = err {
                    self.error = Some(usb_err);
                }
                return false;
            }
        }

        self.error = None;
        if self.streaming {
            self.stop();
        }

        self.resolution = resolution;
        self.format = format;
        self.framerate = self.apply_frame_rate(fps, true);

        // Reset the bridge, then the sensor behind it.
        self.bridge_write(0xe7, 0x3a);
        self.bridge_write(0xe0, 0x08);
        thread::sleep(RESET_SETTLE);

        self.bridge_write(SCCB_ADDRESS, 0x42);

        self.sccb_write(0x12, 0x80);
        thread::sleep(RESET_SETTLE);

        let sensor_id =
            (u16::from(self.sccb_probe(0x0a)) << 8) | u16::from(self.sccb_probe(0x0b));
        log::debug!("sensor id 0x{sensor_id:04x}");

        self.bridge_write_batch(tables::BRIDGE_INIT);
        self.sccb_write_batch(tables::SENSOR_INIT);
        self.bridge_write(0xe0, 0x09);

        self.initialized = self.error.is_none();
        self.initialized
    }

    /// Program the capture mode and controls, switch the stream on and
    /// start the transfer engine.
    pub fn start(&mut self) -> bool {
        if !self.initialized || self.error.is_some() {
            return false;
        }
        if self.streaming {
            return true;
        }

        match self.resolution {
            Resolution::Qvga => {
                self.bridge_write_batch(tables::BRIDGE_START_QVGA);
                self.sccb_write_batch(tables::SENSOR_START_QVGA);
            }
            Resolution::Vga => {
                self.bridge_write_batch(tables::BRIDGE_START_VGA);
                self.sccb_write_batch(tables::SENSOR_START_VGA);
            }
        }

        let fps = self.framerate;
        self.apply_frame_rate(fps, false);

        // Push every cached control to the sensor. The auto modes win over
        // the manual registers while enabled; the cached values survive for
        // when they are switched back off.
        self.apply_auto_gain();
        self.apply_awb();
        self.apply_gain();
        self.apply_hue();
        self.apply_exposure();
        self.apply_brightness();
        self.apply_contrast();
        self.apply_sharpness();
        self.apply_red_balance();
        self.apply_blue_balance();
        self.apply_green_balance();
        self.apply_saturation();
        self.apply_flip();
        self.apply_test_pattern();

        self.set_led(true);
        self.bridge_write(0xe0, 0x00); // stream on

        let frame_size = self.resolution.frame_size() as usize;
        let handle = match &mut self.handle {
            Some(handle) => handle,
            None => return false,
        };
        if let Err(err) = self.pump.start_transfers(handle, frame_size) {
            log::error!("bulk transfer startup failed: {err}");
            self.pump.close_transfers();
            // The device was already switched on above; put it back.
            self.bridge_write(0xe0, 0x09);
            self.set_led(false);
            return false;
        }

        self.streaming = true;
        true
    }

    /// Switch the stream off and drain the transfer engine. Idempotent.
    pub fn stop(&mut self) {
        if !self.streaming || self.handle.is_none() {
            return;
        }
        self.bridge_write(0xe0, 0x09); // stream off
        self.set_led(false);
        self.pump.close_transfers();
        self.streaming = false;
    }

    /// Stop and hand the device back to the host. Idempotent.
    pub fn release(&mut self) {
        self.stop();
        if let Some(mut handle) = self.handle.take() {
            let _ = handle.release_interface(0);
            let _ = handle.attach_kernel_driver(0);
        }
        self.initialized = false;
    }

    /// Block up to 50 ms for the next frame and decode it into `dest`,
    /// which must hold exactly `stride() * height()` bytes. Returns false
    /// when no frame arrived in time.
    pub fn get_frame(&mut self, dest: &mut [u8]) -> bool {
        if !self.streaming {
            return false;
        }
        if self.error.is_some() {
            // The transfer engine is already down; collapse to closed.
            self.release();
            return false;
        }

        let needed = (self.stride() * self.height()) as usize;
        if dest.len() != needed {
            log::error!("frame buffer is {} bytes, expected {needed}", dest.len());
            return false;
        }

        match self.pump.ring() {
            Some(ring) => ring.dequeue(dest, self.width(), self.height(), self.format),
            None => false,
        }
    }

    pub fn width(&self) -> u32 {
        self.resolution.width()
    }

    pub fn height(&self) -> u32 {
        self.resolution.height()
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.format.bytes_per_pixel()
    }

    pub fn stride(&self) -> u32 {
        self.width() * self.bytes_per_pixel()
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn framerate(&self) -> u16 {
        self.framerate
    }

    /// True while streaming.
    pub fn is_open(&self) -> bool {
        self.streaming
    }

    /// True while the USB handle is owned and the interface claimed.
    pub fn is_initialized(&self) -> bool {
        self.handle.is_some()
    }

    /// The sticky error as a libusb-style code, [`NO_ERROR`] when clear.
    pub fn error_code(&self) -> i32 {
        self.error.map_or(NO_ERROR, usb_error_code)
    }

    pub fn error_string(&self) -> String {
        self.error
            .map_or_else(|| "no error".to_string(), |err| err.to_string())
    }

    /// Physical location of the camera, e.g. `b3_p1.2`.
    pub fn usb_port_path(&self) -> Option<String> {
        let ports = self.device.port_numbers().ok()?;
        if ports.is_empty() {
            return None;
        }
        let mut path = format!("b{}", self.device.bus_number());
        for (index, port) in ports.iter().enumerate() {
            let sep = if index == 0 { "_p" } else { "." };
            path.push_str(&format!("{sep}{port}"));
        }
        Some(path)
    }

    fn open_usb(&mut self) -> Result<(), Error> {
        let mut handle = self.device.open()?;

        // Linux ships a kernel driver for this camera; it has to let go of
        // the interface first. Hosts without one report an error here,
        // which is fine.
        if let Ok(true) = handle.kernel_driver_active(0) {
            if let Err(err) = handle.detach_kernel_driver(0) {
                log::warn!("kernel driver detach failed: {err}");
            }
        }

        handle.claim_interface(0)?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Write one bridge register. No-op once the sticky error is latched.
    pub(crate) fn bridge_write(&mut self, reg: u16, val: u8) {
        if self.error.is_some() {
            return;
        }
        let handle = match &self.handle {
            Some(handle) => handle,
            None => return,
        };
        self.usb_buf[0] = val;
        let rt = request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        if let Err(err) = handle.write_control(
            rt,
            REG_REQUEST,
            0x00,
            reg,
            &self.usb_buf[..1],
            CONTROL_TIMEOUT,
        ) {
            log::warn!("bridge write 0x{reg:04x} failed: {err}");
            self.error = Some(err);
        }
    }

    /// Read one bridge register; 0 once the sticky error is latched.
    pub(crate) fn bridge_read(&mut self, reg: u16) -> u8 {
        if self.error.is_some() {
            return 0;
        }
        let handle = match &self.handle {
            Some(handle) => handle,
            None => return 0,
        };
        let rt = request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        match handle.read_control(
            rt,
            REG_REQUEST,
            0x00,
            reg,
            &mut self.usb_buf[..1],
            CONTROL_TIMEOUT,
        ) {
            Ok(_) => self.usb_buf[0],
            Err(err) => {
                log::warn!("bridge read 0x{reg:04x} failed: {err}");
                self.error = Some(err);
                0
            }
        }
    }

    /// Poll the SCCB status register: 0x00 done, 0x04 failed, 0x03 still
    /// busy. Capped at five attempts; failure is never fatal.
    fn sccb_status_ok(&mut self) -> bool {
        for attempt in 0..5 {
            match self.bridge_read(SCCB_STATUS) {
                0x00 => return true,
                0x04 => return false,
                0x03 => {}
                other => {
                    if usb::debug_enabled() {
                        log::debug!("sccb status 0x{other:02x}, attempt {}/5", attempt + 1);
                    }
                }
            }
            thread::yield_now();
        }
        false
    }

    pub(crate) fn sccb_write(&mut self, reg: u8, val: u8) {
        self.bridge_write(SCCB_SUBADDR, reg);
        self.bridge_write(SCCB_WRITE, val);
        self.bridge_write(SCCB_OPERATION, SCCB_OP_WRITE_3);
        if !self.sccb_status_ok() {
            log::debug!("sccb write 0x{reg:02x} unacknowledged");
        }
    }

    pub(crate) fn sccb_read(&mut self, reg: u8) -> u8 {
        self.bridge_write(SCCB_SUBADDR, reg);
        self.bridge_write(SCCB_OPERATION, SCCB_OP_WRITE_2);
        if !self.sccb_status_ok() {
            log::debug!("sccb read setup 0x{reg:02x} unacknowledged");
        }
        self.bridge_write(SCCB_OPERATION, SCCB_OP_READ_2);
        if !self.sccb_status_ok() {
            log::debug!("sccb read 0x{reg:02x} unacknowledged");
        }
        self.bridge_read(SCCB_READ)
    }

    /// The first read after reset can be stale; read twice.
    fn sccb_probe(&mut self, reg: u8) -> u8 {
        self.sccb_read(reg);
        self.sccb_read(reg)
    }

    fn bridge_write_batch(&mut self, entries: &[(u8, u8)]) {
        for &(reg, val) in entries {
            self.bridge_write(reg.into(), val);
        }
    }

    fn sccb_write_batch(&mut self, entries: &[(u8, u8)]) {
        for &(reg, val) in entries {
            if reg != 0xff {
                self.sccb_write(reg, val);
            } else {
                // 0xff entries encode a read-back delay in the init tables.
                self.sccb_read(val);
                self.sccb_write(0xff, 0x00);
            }
        }
    }

    /// Quantize `fps` against the current resolution's table; unless
    /// `dry_run`, also program the three rate registers.
    pub(crate) fn apply_frame_rate(&mut self, fps: u16, dry_run: bool) -> u16 {
        let entry = tables::rate_entry(fps, self.resolution);
        if !dry_run {
            self.sccb_write(0x11, entry.r11);
            self.sccb_write(0x0d, entry.r0d);
            self.bridge_write(0xe5, entry.re5);
        }
        log::debug!("frame rate {} fps", entry.fps);
        entry.fps
    }

    /// Two bits drive the LED: 0x21 bit 7 (direction) and 0x23 bit 7
    /// (output).
    fn set_led(&mut self, on: bool) {
        let data = self.bridge_read(0x21) | 0x80;
        self.bridge_write(0x21, data);

        let mut data = self.bridge_read(0x23);
        if on {
            data |= 0x80;
        } else {
            data &= !0x80;
        }
        self.bridge_write(0x23, data);

        if !on {
            let data = self.bridge_read(0x21) & !0x80;
            self.bridge_write(0x21, data);
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.release();
    }
}
