//! Display labels for enrolled passkeys. Coarse user-agent matching, not a
//! security boundary.

pub const UNKNOWN_DEVICE: &str = "Unknown Device";

/// Browser family first, then operating system.
pub fn device_name(user_agent: &str) -> &'static str {
    let ua = user_agent;
    if ua.is_empty() {
        return UNKNOWN_DEVICE;
    }

    if ua.contains("Chrome") {
        return "Chrome Browser";
    }
    if ua.contains("Firefox") {
        return "Firefox Browser";
    }
    if ua.contains("Safari") {
        return "Safari Browser";
    }
    if ua.contains("Edge") {
        return "Edge Browser";
    }
    if ua.contains("Opera") {
        return "Opera Browser";
    }

    if ua.contains("Windows") {
        "Windows Device"
    } else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
        "Mac Device"
    } else if ua.contains("Linux") {
        "Linux Device"
    } else if ua.contains("Android") {
        "Android Device"
    } else if ua.contains("iPhone") || ua.contains("iPad") {
        "iOS Device"
    } else {
        UNKNOWN_DEVICE
    }
}
