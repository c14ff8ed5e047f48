/// Capture resolution supported by the OV534 bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// 320x240
    Qvga,
    /// 640x480
    Vga,
}

impl Resolution {
    pub const fn width(self) -> u32 {
        match self {
            Resolution::Qvga => 320,
            Resolution::Vga => 640,
        }
    }

    pub const fn height(self) -> u32 {
        match self {
            Resolution::Qvga => 240,
            Resolution::Vga => 480,
        }
    }

    /// Size of one raw bayer frame in bytes.
    pub const fn frame_size(self) -> u32 {
        self.width() * self.height()
    }
}

/// Pixel format written by `Camera::get_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Raw GRBG bayer, `width * height` bytes.
    Bayer,
    /// Interleaved B,G,R, `width * height * 3` bytes.
    Bgr,
    /// Interleaved R,G,B, `width * height * 3` bytes.
    Rgb,
    /// Luminance, `width * height` bytes.
    Gray,
}

impl OutputFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            OutputFormat::Bayer | OutputFormat::Gray => 1,
            OutputFormat::Bgr | OutputFormat::Rgb => 3,
        }
    }
}
