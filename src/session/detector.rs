//! Remote Device-Type Detection
//!
//! One-shot classification of a remote host's platform family over an
//! established session, feeding the device-type cache. A single
//! BusyBox-safe probe command covers stock Unixes and Windows login shells
//! alike; failure degrades to `"unknown"` and is never fatal to the caller.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cache::DeviceTypeCache;
use crate::error::Result;
use crate::ssh::lifecycle::ConnectionManager;
use crate::ssh::target::Target;

/// Detection method stamped into cache entries produced here.
pub const METHOD_PROBE: &str = "probe";

/// Device type recorded when detection fails or output is unrecognizable.
pub const DEVICE_UNKNOWN: &str = "unknown";

/// Total budget for one detection round trip.
const DETECT_TIMEOUT: Duration = Duration::from_secs(8);

/// Single-line, busybox-safe probe. `$PSModulePath` is always set on
/// Windows and never on Unix.
const PROBE_CMD: &str = r#"if [ -n "$PSModulePath" ]; then echo windows; else uname -s 2>/dev/null || echo unknown; fi"#;

/// Probe the target over its established session and classify the result.
///
/// Returns `"unknown"` (without caching) on any failure: missing session,
/// probe timeout, or unrecognizable output with no content.
pub async fn detect_device_type(manager: &ConnectionManager, target: &Target) -> String {
    let output = match timeout(DETECT_TIMEOUT, manager.execute(target, PROBE_CMD)).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!("[Detector] probe failed for {}: {}", target, e);
            return DEVICE_UNKNOWN.to_string();
        }
        Err(_) => {
            warn!(
                "[Detector] probe timed out after {}s for {}",
                DETECT_TIMEOUT.as_secs(),
                target
            );
            return DEVICE_UNKNOWN.to_string();
        }
    };

    let device_type = classify_probe_output(&output.stdout);
    debug!("[Detector] {} classified as {}", target, device_type);
    device_type
}

/// Detect and persist the result, returning the classification.
///
/// An `"unknown"` result is returned but not cached: a transient probe
/// failure must not suppress re-detection for a whole TTL.
pub async fn detect_and_cache(
    manager: &ConnectionManager,
    cache: &DeviceTypeCache,
    target: &Target,
) -> Result<String> {
    let device_type = detect_device_type(manager, target).await;
    if device_type != DEVICE_UNKNOWN {
        cache.save(target, &device_type, METHOD_PROBE).await?;
    }
    Ok(device_type)
}

/// Map raw probe output to a device-type label.
///
/// Known platforms get canonical lowercase labels; unrecognized but
/// non-empty output (vendor network gear tends to answer with its own
/// banner) is passed through lowercased so it still caches distinctly.
pub fn classify_probe_output(output: &str) -> String {
    let s = output.trim();
    let upper = s.to_uppercase();

    if upper.starts_with("MINGW") || upper.starts_with("MSYS") || upper.starts_with("CYGWIN") {
        return "windows".to_string();
    }

    match s {
        "Linux" => "linux".to_string(),
        "Darwin" => "macos".to_string(),
        "FreeBSD" => "freebsd".to_string(),
        "OpenBSD" => "openbsd".to_string(),
        "NetBSD" => "netbsd".to_string(),
        "SunOS" => "sunos".to_string(),
        "windows" => "windows".to_string(),
        "" | "unknown" => DEVICE_UNKNOWN.to_string(),
        other => other.to_lowercase(),
    }
}
