//! Visitor fingerprinting and user-agent heuristics

/// Browser, OS and device class guessed from a user-agent string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub browser: &'static str,
    pub os: &'static str,
    pub device: &'static str,
}

/// Approximate visitor id from IP and user agent
///
/// 31x rolling hash over the UTF-16 code units with 32-bit wrap-around.
/// Same client gives the same id without storing the raw identity. It is
/// collidable and must not be used as a security or privacy boundary.
pub fn visitor_id(ip: &str, user_agent: &str) -> String {
    let hash = ip
        .encode_utf16()
        .chain(user_agent.encode_utf16())
        .fold(0i32, |hash, unit| {
            hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(i32::from(unit))
        });
    format!("v{:x}", hash.unsigned_abs())
}

fn browser(ua: &str) -> &'static str {
    if ua.contains("Edg/") || ua.contains("Edge/") {
        "Edge"
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        "Opera"
    } else if ua.contains("SamsungBrowser") {
        "Samsung Internet"
    } else if ua.contains("Firefox/") || ua.contains("FxiOS") {
        "Firefox"
    } else if ua.contains("Chrome/") || ua.contains("CriOS") {
        "Chrome"
    } else if ua.contains("Safari/") {
        "Safari"
    } else {
        "Other"
    }
}

fn os(ua: &str) -> &'static str {
    // iOS before macOS: iPad and iPhone agents also say "like Mac OS X"
    if ua.contains("Windows") {
        "Windows"
    } else if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
        "iOS"
    } else if ua.contains("Android") {
        "Android"
    } else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
        "macOS"
    } else if ua.contains("CrOS") {
        "ChromeOS"
    } else if ua.contains("Linux") {
        "Linux"
    } else {
        "Other"
    }
}

fn device(ua: &str) -> &'static str {
    let lower = ua.to_ascii_lowercase();
    if ["bot", "crawler", "spider", "crawling"].iter().any(|marker| lower.contains(marker)) {
        "Bot"
    } else if ua.contains("iPad") || ua.contains("Tablet") || (ua.contains("Android") && !ua.contains("Mobile")) {
        "Tablet"
    } else if ua.contains("Mobi") || ua.contains("iPhone") {
        "Mobile"
    } else {
        "Desktop"
    }
}

pub fn classify(user_agent: &str) -> UserAgentInfo {
    UserAgentInfo {
        browser: browser(user_agent),
        os: os(user_agent),
        device: device(user_agent),
    }
}

/// Host part of a referrer URL without a leading "www.", or None if empty
pub fn referrer_source(referrer: &str) -> Option<String> {
    let trimmed = referrer.trim();
    let without_scheme = match trimmed.find("://") {
        Some(idx) => &trimmed[idx + 3..],
        None => trimmed,
    };
    let authority = without_scheme
        .split(|c: char| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    // drop userinfo and port
    let host = authority.rsplit('@').next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default().to_ascii_lowercase();
    let host = host.strip_prefix("www.").map(str::to_string).unwrap_or(host);

    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}
