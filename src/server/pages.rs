//! Inline HTML rendering shared by every dashboard page.

use axum::response::Html;
use chrono::DateTime;
use url::Url;

use crate::context::RequestContext;

const STYLE: &str = r#"
    *, *::before, *::after { box-sizing: border-box; margin: 0; padding: 0; }
    :root {
      --bg: #0b0d10; --surface: #13161b; --raised: #1b1f26;
      --border: #242a33; --border-hi: #343c48;
      --text: #e3e6ea; --text-2: #98a1ad; --text-3: #5d6672;
      --accent: #4fa3ff; --accent-bg: rgba(79,163,255,0.08);
      --green: #4ade80; --red: #f87171; --red-bg: rgba(248,113,113,0.08);
      --mono: ui-monospace, 'SF Mono', Menlo, Consolas, monospace;
      --sans: system-ui, -apple-system, BlinkMacSystemFont, sans-serif;
      --r: 8px; --r-sm: 5px;
    }
    body { font-family: var(--sans); background: var(--bg); color: var(--text); font-size: 14px; line-height: 1.5; min-height: 100vh; }
    header { padding: 0 24px; height: 52px; display: flex; align-items: center; justify-content: space-between; background: var(--surface); border-bottom: 1px solid var(--border); }
    header nav { display: flex; gap: 16px; align-items: center; }
    h1 { font-family: var(--mono); font-size: 15px; font-weight: 700; color: var(--accent); }
    h2 { font-family: var(--mono); font-size: 12px; text-transform: uppercase; letter-spacing: 0.08em; color: var(--text-2); margin-bottom: 10px; }
    a { color: var(--accent); text-decoration: none; }
    a.active { color: var(--text); font-weight: 600; }
    main { padding: 20px 24px; display: grid; gap: 16px; max-width: 1200px; margin: 0 auto; }
    .panel { background: var(--surface); border: 1px solid var(--border); border-radius: var(--r); padding: 14px 16px; }
    .badge { font-family: var(--mono); font-size: 11px; padding: 2px 10px; border-radius: 100px; background: var(--raised); border: 1px solid var(--border); color: var(--text-2); }
    .muted { color: var(--text-3); font-size: 12px; }
    .notice { padding: 8px 12px; border-radius: var(--r-sm); font-family: var(--mono); font-size: 12px; }
    .notice-error { background: var(--red-bg); color: var(--red); }
    .notice-ok { background: var(--accent-bg); color: var(--green); }
    table { width: 100%; border-collapse: collapse; font-family: var(--mono); font-size: 12px; }
    th, td { text-align: left; padding: 6px 8px; border-bottom: 1px solid var(--border); vertical-align: top; }
    th { color: var(--text-2); font-weight: 600; }
    form.inline { display: inline; }
    form.stack { display: grid; gap: 8px; max-width: 480px; }
    label { display: grid; gap: 4px; color: var(--text-2); font-size: 12px; }
    label.check { display: flex; gap: 6px; align-items: center; }
    input, select, textarea { font-family: var(--mono); font-size: 12px; padding: 6px 8px; background: var(--bg); color: var(--text); border: 1px solid var(--border-hi); border-radius: var(--r-sm); }
    button { font-family: var(--mono); font-size: 12px; padding: 5px 12px; border-radius: var(--r-sm); background: var(--raised); color: var(--text); border: 1px solid var(--border-hi); cursor: pointer; }
    button.danger { color: var(--red); }
    pre { font-family: var(--mono); font-size: 11px; line-height: 1.6; color: var(--text-2); background: var(--bg); padding: 10px 12px; border-radius: var(--r-sm); overflow: auto; max-height: 420px; white-space: pre-wrap; word-break: break-all; }
"#;

const NAV: [(&str, &str); 4] = [
    ("/rooms", "Rooms"),
    ("/egress", "Egress"),
    ("/sandbox", "Sandbox"),
    ("/settings", "Settings"),
];

/// Full page with navigation, the selected server and the signed-in user.
pub(crate) fn layout(ctx: &RequestContext, active: &str, title: &str, body: &str) -> Html<String> {
    let mut nav = String::new();
    for (href, label) in NAV {
        let class = if href == active { " class=\"active\"" } else { "" };
        nav.push_str(&format!("<a href=\"{href}\"{class}>{label}</a>"));
    }

    let server = match &ctx.current_server {
        Some(profile) => format!(
            "<span class=\"badge\">{}</span>",
            escape_html(profile.name())
        ),
        None => "<span class=\"badge\">no server</span>".to_string(),
    };
    let sip = if ctx.sip_enabled {
        "<span class=\"badge\">SIP</span>"
    } else {
        ""
    };
    let switch = if ctx.servers.len() > 1 {
        "<a href=\"/select-server\">switch</a>"
    } else {
        ""
    };
    let user = ctx
        .current_user
        .as_deref()
        .map(|user| {
            format!(
                "<span class=\"muted\">{}</span> <a href=\"/logout\">log out</a>",
                escape_html(user)
            )
        })
        .unwrap_or_default();

    document(
        title,
        &format!(
            "<header><h1>LiveKit Dashboard</h1><nav>{nav}</nav><nav>{server}{sip}{switch}{user}</nav></header>\n<main>{body}</main>"
        ),
    )
}

/// Page without navigation, used before a user is signed in.
pub(crate) fn bare(title: &str, body: &str) -> Html<String> {
    document(
        title,
        &format!("<header><h1>LiveKit Dashboard</h1></header>\n<main>{body}</main>"),
    )
}

fn document(title: &str, content: &str) -> Html<String> {
    Html(format!(
        r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>{title} · LiveKit Dashboard</title>
  <style>{STYLE}</style>
</head>
<body>
{content}
</body>
</html>"#,
        title = escape_html(title),
    ))
}

pub(crate) fn csrf_field(token: &str) -> String {
    format!(
        "<input type=\"hidden\" name=\"csrf_token\" value=\"{}\">",
        escape_html(token)
    )
}

pub(crate) fn error_notice(message: &str) -> String {
    format!(
        "<div class=\"notice notice-error\">{}</div>",
        escape_html(message)
    )
}

pub(crate) fn ok_notice(message: &str) -> String {
    format!("<div class=\"notice notice-ok\">{}</div>", escape_html(message))
}

/// Absolute path from raw segments, percent-encoding each one.
pub(crate) fn path(segments: &[&str]) -> String {
    let Ok(mut url) = Url::parse("http://dashboard/") else {
        return "/".to_string();
    };
    if let Ok(mut parts) = url.path_segments_mut() {
        parts.pop_if_empty().extend(segments);
    }
    url.path().to_string()
}

pub(crate) fn format_epoch_seconds(seconds: i64) -> String {
    if seconds <= 0 {
        return "-".to_string();
    }
    DateTime::from_timestamp(seconds, 0)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub(crate) fn checked(value: bool) -> &'static str {
    if value { " checked" } else { "" }
}

pub(crate) fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
