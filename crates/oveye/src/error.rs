use std::fmt;

/// Error code reported by `Camera::error_code` when nothing went wrong.
pub const NO_ERROR: i32 = 0;

#[derive(Debug)]
pub enum Error {
    /// A host-library operation failed.
    Usb(rusb::Error),
    /// The device exposes no bulk-in endpoint to stream from.
    NoBulkEndpoint,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Usb(err) => write!(f, "usb error: {err}"),
            Error::NoBulkEndpoint => write!(f, "no bulk-in endpoint on interface 0"),
        }
    }
}

impl std::error::Error for Error {}

impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Self {
        Error::Usb(err)
    }
}

/// Map a host-library error to the conventional negative libusb code.
pub fn usb_error_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    }
}

/// Inverse of [`usb_error_code`], for raw return codes coming straight out
/// of the host library.
pub(crate) fn usb_error_from_code(code: i32) -> rusb::Error {
    match code {
        -1 => rusb::Error::Io,
        -2 => rusb::Error::InvalidParam,
        -3 => rusb::Error::Access,
        -4 => rusb::Error::NoDevice,
        -5 => rusb::Error::NotFound,
        -6 => rusb::Error::Busy,
        -7 => rusb::Error::Timeout,
        -8 => rusb::Error::Overflow,
        -9 => rusb::Error::Pipe,
        -10 => rusb::Error::Interrupted,
        -11 => rusb::Error::NoMem,
        -12 => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}
