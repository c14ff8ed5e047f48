//! Process-wide libusb context and its event-pumping thread.
//!
//! The manager is constructed lazily on first use. The event thread exists
//! only while at least one camera is streaming: the first `camera_started`
//! spawns it, the last `camera_stopped` joins it, and a later restart
//! spawns a fresh one.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use once_cell::sync::Lazy;
use rusb::{Context, UsbContext};

use crate::camera::Camera;

/// How long one event-loop iteration waits for USB activity.
const EVENT_POLL: Duration = Duration::from_millis(100);

const VENDOR_ID: u16 = 0x1415;
const PRODUCT_ID: u16 = 0x2000;

static MANAGER: Lazy<UsbManager> = Lazy::new(UsbManager::new);
static DEBUG: AtomicBool = AtomicBool::new(false);

thread_local! {
    static IS_EVENT_THREAD: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn manager() -> &'static UsbManager {
    &MANAGER
}

pub(crate) fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

/// Toggle verbose driver logging and libusb's own log level.
pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
    if let Some(context) = &MANAGER.context {
        let level = if enabled {
            rusb::LogLevel::Debug
        } else {
            rusb::LogLevel::Warning
        };
        context.clone().set_log_level(level);
    }
}

/// Enumerate the attached OV534 cameras.
///
/// Only devices that can actually be opened are returned, so a camera held
/// by another process silently drops out of the list.
pub fn list_devices() -> Vec<Camera> {
    manager().list_devices()
}

pub(crate) struct UsbManager {
    context: Option<Context>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    active_cameras: AtomicUsize,
    exit_signaled: AtomicBool,
}

impl UsbManager {
    fn new() -> Self {
        let context = match Context::new() {
            Ok(context) => {
                context.clone().set_log_level(rusb::LogLevel::Warning);
                Some(context)
            }
            Err(err) => {
                log::error!("usb context init failed: {err}");
                None
            }
        };
        Self {
            context,
            event_thread: Mutex::new(None),
            active_cameras: AtomicUsize::new(0),
            exit_signaled: AtomicBool::new(false),
        }
    }

    fn list_devices(&self) -> Vec<Camera> {
        let Some(context) = &self.context else {
            return Vec::new();
        };
        let devices = match context.devices() {
            Ok(devices) => devices,
            Err(err) => {
                log::error!("device scan failed: {err}");
                return Vec::new();
            }
        };

        let mut cameras = Vec::new();
        for device in devices.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() != VENDOR_ID || desc.product_id() != PRODUCT_ID {
                continue;
            }
            // Probe that the device can actually be opened before handing
            // it out.
            match device.open() {
                Ok(_) => cameras.push(Camera::new(device)),
                Err(err) => log::warn!("skipping unopenable camera: {err}"),
            }
        }
        cameras
    }

    pub(crate) fn camera_started(&self) {
        if self.active_cameras.fetch_add(1, Ordering::Relaxed) == 0 {
            self.start_event_thread();
        }
    }

    pub(crate) fn camera_stopped(&self) {
        if self.active_cameras.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.stop_event_thread();
        }
    }

    /// True on the thread running the event loop; completion callbacks use
    /// this to avoid draining against themselves.
    pub(crate) fn on_event_thread(&self) -> bool {
        IS_EVENT_THREAD.with(|flag| flag.get())
    }

    fn start_event_thread(&self) {
        let Some(context) = self.context.clone() else {
            return;
        };
        let handle = thread::spawn(move || {
            IS_EVENT_THREAD.with(|flag| flag.set(true));
            while !manager().exit_signaled.load(Ordering::Relaxed) {
                if let Err(err) = context.handle_events(Some(EVENT_POLL)) {
                    log::warn!("usb event loop error: {err}");
                }
            }
        });
        *self.event_thread.lock().unwrap() = Some(handle);
    }

    fn stop_event_thread(&self) {
        let handle = self.event_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            self.exit_signaled.store(true, Ordering::Relaxed);
            let _ = handle.join();
            // Clear the flag so a later start spawns a working loop again.
            self.exit_signaled.store(false, Ordering::Relaxed);
        }
    }
}
