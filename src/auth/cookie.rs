use http::HeaderMap;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "agenthq_session";

/// Build the `Set-Cookie` value for a fresh session.
///
/// Session ids are hex so no encoding is needed for the value itself.
#[must_use]
pub fn set_cookie_header(session_id: &str, max_age_secs: i64, secure: bool) -> String {
    let mut header = format!(
        "{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}"
    );
    if secure {
        header.push_str("; Secure");
    }
    header
}

/// Build the `Set-Cookie` value that clears the session cookie.
#[must_use]
pub fn clear_cookie_header() -> String {
    format!(
        "{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0; \
         Expires=Thu, 01 Jan 1970 00:00:00 GMT"
    )
}

/// Whether the request arrived over HTTPS, directly or behind a proxy.
#[must_use]
pub fn request_is_secure(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
}

/// Extract the session id from a raw `Cookie` header.
///
/// Splits on `;`, trims each pair, URL-decodes the value, and tolerates
/// `=` inside values.
#[must_use]
pub fn session_id_from_header(header: &str) -> Option<String> {
    for part in header.split(';') {
        let part = part.trim();
        let Some((name, value)) = part.split_once('=') else {
            continue;
        };
        if name.trim() == SESSION_COOKIE {
            return Some(percent_decode(value.trim()));
        }
    }
    None
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_the_session_among_other_cookies() {
        let header = "theme=dark; agenthq_session=abc123; other=a=b=c";
        assert_eq!(session_id_from_header(header).as_deref(), Some("abc123"));
    }

    #[test]
    fn decodes_url_encoded_values() {
        let header = "agenthq_session=ab%2Fcd%3D";
        assert_eq!(session_id_from_header(header).as_deref(), Some("ab/cd="));
    }

    #[test]
    fn tolerates_whitespace_and_missing_cookie() {
        assert_eq!(
            session_id_from_header("  agenthq_session = abc ").as_deref(),
            Some("abc")
        );
        assert!(session_id_from_header("other=1").is_none());
        assert!(session_id_from_header("").is_none());
    }

    #[test]
    fn set_cookie_carries_the_required_attributes() {
        let header = set_cookie_header("deadbeef", 604_800, false);
        assert!(header.starts_with("agenthq_session=deadbeef;"));
        assert!(header.contains("Path=/"));
        assert!(header.contains("HttpOnly"));
        assert!(header.contains("SameSite=Lax"));
        assert!(header.contains("Max-Age=604800"));
        assert!(!header.contains("Secure"));

        let secure = set_cookie_header("deadbeef", 60, true);
        assert!(secure.ends_with("; Secure"));
    }

    #[test]
    fn clear_cookie_expires_immediately() {
        let header = clear_cookie_header();
        assert!(header.contains("Max-Age=0"));
        assert!(header.contains("Expires=Thu, 01 Jan 1970"));
    }
}
