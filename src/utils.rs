use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;
use crate::capture::session::Backend;
use crate::error::{CaptureError, Result};

/// `/dev/videoN` nodes scanned, N in `0..MAX_VIDEO_NODES`.
const MAX_VIDEO_NODES: u32 = 64;

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

impl FoundDevice {
    pub fn new(path: String, format: PixelFormat) -> Self {
        Self { path, format }
    }
}

/// V4L2 capture node enumeration
#[derive(Debug, Clone)]
pub struct V4l2Devices {
    root: PathBuf,
}

impl Default for V4l2Devices {
    fn default() -> Self {
        Self::under("/dev")
    }
}

impl V4l2Devices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look for `videoN` nodes in `root` instead of `/dev`.
    pub fn under(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Existing `videoN` nodes in index order. Nothing is opened; each call
    /// starts a fresh scan.
    pub fn iter(&self) -> impl Iterator<Item = PathBuf> + '_ {
        (0..MAX_VIDEO_NODES)
            .map(|i| self.root.join(format!("video{}", i)))
            .filter(|path| path.exists())
    }
}

/// Identifiers of the devices `backend` can open.
pub fn list_devices(backend: Backend) -> Result<Vec<String>> {
    match backend {
        Backend::V4l2 => Ok(V4l2Devices::new()
            .iter()
            .map(|path| path.display().to_string())
            .collect()),
        #[cfg(feature = "libcamera")]
        Backend::Libcamera => Ok(crate::capture::LibcameraDevices::iter()?.collect()),
        #[cfg(not(feature = "libcamera"))]
        Backend::Libcamera => Err(CaptureError::Manager(
            "built without libcamera support".into(),
        )),
    }
}

/// Auto-detect best capture device
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    for path in V4l2Devices::new().iter() {
        let path = path.display().to_string();
        let Ok(dev) = Device::with_path(&path) else {
            debug!("{} could not be opened, skipping", path);
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };

        // Check for capture capability
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }

        let Ok(formats) = dev.enum_formats() else {
            continue;
        };

        // Prefer MJPEG, fall back to YUYV
        for preferred in [PixelFormat::Mjpeg, PixelFormat::Yuyv4] {
            let fourcc = FourCC::from(preferred);
            if formats.iter().any(|fmt| fmt.fourcc == fourcc) {
                info!("Found {:?} device: {} - {}", preferred, path, caps.card);
                return Ok(FoundDevice::new(path, preferred));
            }
        }
    }

    Err(CaptureError::DeviceNotFound(
        "no MJPEG or YUYV capture device".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_is_ordered_and_restartable() {
        let root = std::env::temp_dir().join(format!("camloop-dev-{}", std::process::id()));
        std::fs::create_dir_all(&root).unwrap();
        for name in ["video3", "video0", "media0"] {
            std::fs::File::create(root.join(name)).unwrap();
        }

        let devices = V4l2Devices::under(&root);
        let first: Vec<_> = devices.iter().collect();
        let second: Vec<_> = devices.iter().collect();
        std::fs::remove_dir_all(&root).unwrap();

        assert_eq!(first, vec![root.join("video0"), root.join("video3")]);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_root_lists_nothing() {
        let devices = V4l2Devices::under("/nonexistent/camloop");
        assert_eq!(devices.iter().count(), 0);
    }
}
