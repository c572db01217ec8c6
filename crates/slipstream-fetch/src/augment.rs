//! HTML decoration for game pages
//!
//! Two script blocks are inserted into a page:
//!
//! - right after the opening `<head ...>` tag, a block that publishes the device
//!   profile as `window.__slipstream` together with hook points for page-runtime
//!   telemetry (`recordState`, `recordError`, `optimizations`)
//! - right before the closing `</body>` tag, a block that marks the page as
//!   loaded and wires recovery and visibility hooks
//!
//! Both blocks carry the [`AUGMENT_MARKER`] attribute. A body that already
//! contains the marker is returned untouched, which makes the transform
//! idempotent. Missing anchors skip their block; a page with neither anchor is
//! returned unchanged.

use slipstream_cache::Response;

use crate::device::DeviceProfile;
use crate::error::AugmentError;

/// Attribute present on every inserted block
pub const AUGMENT_MARKER: &str = "data-slipstream-augmented";

const BODY_BLOCK: &str = r#"<script data-slipstream-augmented="body">
(function () {
  var s = window.__slipstream;
  if (!s) return;
  s.complete = true;
  s.recordState('body-ready');
  document.addEventListener('visibilitychange', function () {
    s.recordState(document.hidden ? 'hidden' : 'visible');
    if (!document.hidden && typeof s.onResume === 'function') s.onResume();
  });
  window.addEventListener('error', function (e) {
    s.recordError(e && e.message ? e.message : 'unknown error');
    if (typeof s.onRecover === 'function') s.onRecover(e);
  }, true);
})();
</script>
"#;

fn head_block(profile_json: &str) -> String {
    format!(
        r#"
<script data-slipstream-augmented="head">
window.__slipstream = window.__slipstream || {{
  start: Date.now(),
  complete: false,
  deviceProfile: {profile_json},
  optimizations: [],
  readyStates: [],
  errors: [],
  recordState: function (state) {{ this.readyStates.push({{ state: state, at: Date.now() - this.start }}); }},
  recordError: function (message) {{ this.errors.push({{ message: message, at: Date.now() - this.start }}); }}
}};
</script>
"#
    )
}

/// Byte offset just past the `>` of the first `<head>` or `<head ...>` tag.
fn head_anchor(lower: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = lower[from..].find("<head") {
        let tag_start = from + pos;
        let after = tag_start + "<head".len();
        match lower.as_bytes().get(after) {
            Some(b'>' | b' ' | b'\t' | b'\r' | b'\n' | b'/') => {
                return lower[after..].find('>').map(|end| after + end + 1);
            }
            // `<header`, `<headline` and friends
            _ => from = after,
        }
    }
    None
}

fn body_anchor(lower: &str) -> Option<usize> {
    lower.rfind("</body>")
}

/// True if `html` already went through [`augment_html`].
pub fn is_augmented(html: &str) -> bool {
    html.contains(AUGMENT_MARKER)
}

/// Pure transform of the page text.
///
/// Returns `None` when nothing was inserted.
pub fn augment_html(html: &str, profile: &DeviceProfile) -> Result<Option<String>, AugmentError> {
    if is_augmented(html) {
        return Ok(None);
    }

    let lower = html.to_ascii_lowercase();
    let head = head_anchor(&lower);
    let body = body_anchor(&lower).filter(|b| head.is_none_or(|h| *b >= h));
    if head.is_none() && body.is_none() {
        return Ok(None);
    }

    // `</` inside an inline script would end it early
    let profile_json = serde_json::to_string(profile)?.replace("</", "<\\/");

    let mut out = String::with_capacity(html.len() + 1024);
    let mut cursor = 0;
    if let Some(h) = head {
        out.push_str(&html[..h]);
        out.push_str(&head_block(&profile_json));
        cursor = h;
    }
    if let Some(b) = body {
        out.push_str(&html[cursor..b]);
        out.push_str(BODY_BLOCK);
        cursor = b;
    }
    out.push_str(&html[cursor..]);

    Ok(Some(out))
}

/// Decorates an HTML response.
///
/// The result keeps the original status and headers, with a fresh cache
/// timestamp (`now_ms`), access count 1, and no stale `content-length`.
pub fn augment(
    response: Response,
    profile: &DeviceProfile,
    now_ms: u64,
) -> Result<Response, AugmentError> {
    let html = std::str::from_utf8(&response.body)?;
    let Some(augmented) = augment_html(html, profile)? else {
        return Ok(response);
    };

    let mut headers = response.headers;
    headers.remove("content-length");
    let mut out = Response::new(response.status, headers, augmented);
    out.stamp_fresh(now_ms, false);
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use slipstream_cache::{HEADER_ACCESS_COUNT, HEADER_GAME_CONTENT, HEADER_TIMESTAMP};

    fn page(html: &str) -> Response {
        let mut response = Response::ok("text/html; charset=utf-8", html.to_string());
        response.headers.insert("content-length", html.len().to_string());
        response.headers.insert(HEADER_GAME_CONTENT, "true");
        response.set_access_count(9);
        response
    }

    #[test]
    fn test_inserts_both_blocks() {
        let html = r#"<!doctype html><html><HEAD lang="en"><title>t</title></HEAD><body><header>h</header><p>x</p></BODY></html>"#;
        let out = augment(page(html), &DeviceProfile::conservative(), 1234).unwrap();
        let text = std::str::from_utf8(&out.body).unwrap();

        let head_at = text.find(r#"data-slipstream-augmented="head""#).unwrap();
        let body_at = text.find(r#"data-slipstream-augmented="body""#).unwrap();
        assert!(text[..head_at].ends_with("<HEAD lang=\"en\">\n<script "));
        assert!(head_at < text.find("<title>").unwrap());
        assert!(body_at > text.find("<p>x</p>").unwrap());
        assert!(text.trim_end().ends_with("</script>\n</BODY></html>"));
        assert!(text.contains(r#""classification":"slow""#));

        assert_eq!(out.headers.get(HEADER_TIMESTAMP), Some("1234"));
        assert_eq!(out.headers.get(HEADER_ACCESS_COUNT), Some("1"));
        assert_eq!(out.headers.get(HEADER_GAME_CONTENT), Some("true"));
        assert!(out.headers.get("content-length").is_none());
        assert_eq!(out.status, 200);
    }

    #[test]
    fn test_idempotent() {
        let html = "<html><head></head><body>game</body></html>";
        let profile = DeviceProfile::conservative();
        let once = augment(page(html), &profile, 1).unwrap();
        let twice = augment(once.clone(), &profile, 2).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_missing_anchors() {
        let profile = DeviceProfile::conservative();

        let fragment = page("<div>no document structure</div>");
        assert_eq!(augment(fragment.clone(), &profile, 1).unwrap(), fragment);

        let header_only = augment_html("<header>nav</header><p>x</p></body>", &profile)
            .unwrap()
            .unwrap();
        assert!(!header_only.contains(r#"augmented="head""#));
        assert!(header_only.contains(r#"augmented="body""#));
    }

    #[test]
    fn test_profile_json_cannot_close_script() {
        let mut profile = DeviceProfile::conservative();
        profile.connection_info = Some(crate::device::ConnectionInfo {
            effective_type: Some("</script><b>".into()),
            ..Default::default()
        });
        let out = augment_html("<head></head>", &profile).unwrap().unwrap();
        assert!(!out.contains("</script><b>"));
    }

    #[test]
    fn test_invalid_utf8_is_an_error() {
        let response = Response::ok("text/html", vec![0xff, 0xfe, 0x3c]);
        assert!(augment(response, &DeviceProfile::conservative(), 1).is_err());
    }
}
