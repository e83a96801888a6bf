use std::fs::File;

use camloop::capture::{open_session, Backend, V4l2Capture, V4l2Device};
use camloop::{CaptureConfig, CaptureError};
use nix::fcntl::{Flock, FlockArg};

const MISSING: &str = "/dev/camloop-does-not-exist";

#[test]
fn missing_node_is_device_not_found() {
    let err = V4l2Device::open(MISSING).unwrap_err();
    assert!(matches!(err, CaptureError::DeviceNotFound(ref path) if path == MISSING));
    assert!(!err.is_fatal());
}

#[test]
fn session_on_missing_node_never_reaches_configured() {
    let config = CaptureConfig {
        device: MISSING.into(),
        ..CaptureConfig::default()
    };

    assert!(matches!(
        V4l2Capture::open(&config),
        Err(CaptureError::DeviceNotFound(_))
    ));
    assert!(matches!(
        open_session(&config),
        Err(CaptureError::DeviceNotFound(_))
    ));
}

#[test]
fn regular_file_is_not_a_capture_device() {
    let path = std::env::temp_dir().join(format!("camloop-not-a-device-{}", std::process::id()));
    std::fs::write(&path, b"not a camera").unwrap();

    let result = V4l2Device::open(&path);
    std::fs::remove_file(&path).unwrap();

    assert!(matches!(result, Err(CaptureError::Configure(_))));
}

#[test]
fn node_held_elsewhere_is_an_acquire_error() {
    let path = std::env::temp_dir().join(format!("camloop-held-{}", std::process::id()));
    std::fs::write(&path, b"held").unwrap();

    let holder = Flock::lock(File::open(&path).unwrap(), FlockArg::LockExclusive)
        .map_err(|(_, errno)| errno)
        .unwrap();
    let held = V4l2Device::open(&path);

    drop(holder);
    let released = V4l2Device::open(&path);
    std::fs::remove_file(&path).unwrap();

    assert!(matches!(held, Err(CaptureError::Acquire { ref device, .. }) if device.contains("camloop-held")));
    assert!(!held.unwrap_err().is_fatal());
    // Lock gone: open gets past acquire and fails on the capability query
    assert!(matches!(released, Err(CaptureError::Configure(_))));
}

#[cfg(not(feature = "libcamera"))]
#[test]
fn libcamera_backend_needs_the_feature() {
    let config = CaptureConfig {
        backend: Backend::Libcamera,
        ..CaptureConfig::default()
    };

    assert!(matches!(
        open_session(&config),
        Err(CaptureError::Manager(_))
    ));
}

#[cfg(feature = "libcamera")]
#[test]
fn unknown_libcamera_id_is_device_not_found() {
    let config = CaptureConfig {
        device: "camloop-no-such-camera".into(),
        backend: Backend::Libcamera,
        ..CaptureConfig::default()
    };

    // Either the camera manager is unavailable here or the id is unknown
    assert!(matches!(
        open_session(&config),
        Err(CaptureError::DeviceNotFound(_) | CaptureError::Manager(_))
    ));
}
