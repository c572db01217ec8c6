//! Diagnostic page served when a navigation exhausted every fallback

use slipstream_cache::{Headers, Response};
use std::fmt::Write as _;

use crate::device::{DeviceClass, DeviceProfile};
use crate::error::FetchError;
use crate::registry::ConnectionStats;

const STYLE: &str = "body{font-family:Arial,sans-serif;color:#fff;background:#1b1b1b;margin:0;\
padding:20px;display:flex;align-items:center;justify-content:center;min-height:100vh}\
.container{max-width:600px;background:#333;border-radius:12px;padding:30px;text-align:center}\
h2{color:#f44336;margin-top:0}.device-info{color:#ffeb3b;font-size:14px;padding:10px}\
.advice{border-left:4px solid #4caf50;padding:12px;margin:15px 0;text-align:left}\
.stats{font-size:12px;color:#aaa;margin-top:20px;text-align:left}\
button{padding:12px 20px;background:#2196f3;color:#fff;border:none;border-radius:6px;margin:8px}";

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn device_advice(class: DeviceClass) -> &'static str {
    match class {
        DeviceClass::VerySlow => {
            "<p><strong>Performance tips:</strong> close other tabs, disable browser \
             extensions and make sure nothing else is using your connection.</p>"
        }
        DeviceClass::Slow => {
            "<p><strong>Tip:</strong> closing other tabs or waiting for a less busy time \
             may help.</p>"
        }
        DeviceClass::Medium | DeviceClass::Fast => "",
    }
}

/// Renders the diagnostic page body.
pub fn error_page_html(error: &FetchError, profile: &DeviceProfile, stats: &ConnectionStats) -> String {
    let class = profile.classification;
    let connection = profile
        .connection_info
        .as_ref()
        .and_then(|c| c.effective_type.as_deref())
        .unwrap_or("unknown");

    let mut html = String::with_capacity(4096);
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n\
         <title>Loading Error</title>\n<style>{STYLE}</style>\n</head>\n<body>\n\
         <div class=\"container\">\n<h2>Loading Error</h2>\n"
    );
    let _ = write!(
        html,
        "<div class=\"device-info\">Device performance: {}<br>Hardware: {} cores, {:.1} GB RAM<br>\
         Connection: {}</div>\n",
        class.as_str().to_ascii_uppercase(),
        profile.cores,
        profile.memory_gb,
        escape(connection)
    );
    let _ = write!(
        html,
        "<p>The page could not be loaded. This may be due to network issues or server problems.</p>\n\
         <p class=\"error\">{}</p>\n",
        escape(&error.to_string())
    );
    if class.is_slow_class() {
        html.push_str("<p>Pages may take longer to load on this device. Please be patient.</p>\n");
    }

    html.push_str("<div class=\"advice\">\n");
    html.push_str(device_advice(class));
    html.push_str(
        "<p><strong>What you can try:</strong></p>\n<ul>\n\
         <li>Refresh the page and wait</li>\n<li>Check your internet connection</li>\n",
    );
    if class.is_slow_class() {
        html.push_str("<li>Try again at a less busy time</li>\n");
    }
    html.push_str("<li>Clear your browser cache if problems persist</li>\n</ul>\n</div>\n");
    html.push_str(
        "<div><button onclick=\"window.location.reload()\">Try Again</button>\
         <button onclick=\"window.location.href='/'\">Go Home</button></div>\n",
    );

    let _ = write!(
        html,
        "<div class=\"stats\">Connection stats: {}/{} successful requests<br>\
         Average load time: {}ms<br>Cache hits: {}<br>Device optimizations applied: {}</div>\n",
        stats.successful,
        stats.total,
        stats.average_time_ms.round(),
        stats.cached,
        stats.slow_device_optimizations
    );
    html.push_str("</div>\n</body>\n</html>\n");
    html
}

/// The diagnostic page as a `200 text/html` response.
pub fn error_page(error: &FetchError, profile: &DeviceProfile, stats: &ConnectionStats) -> Response {
    let mut headers = Headers::new();
    headers.insert("content-type", "text/html; charset=utf-8");
    headers.insert("cache-control", "no-store");
    Response::new(200, headers, error_page_html(error, profile, stats))
}
