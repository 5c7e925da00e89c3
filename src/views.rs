//! Page rendering for the HTTP plane.
//!
//! The home page is an askama template. The snippet page is assembled at
//! the byte level instead: stored snippets are opaque byte strings with no
//! UTF-8 guarantee, so they cannot pass through a `String`-based template
//! without corruption. Only the HTML-special bytes are escaped; every other
//! byte is served back exactly as stored.

use askama::Template;

/// Home page with the site-wide upload counter.
#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexPage {
    pub count: String,
}

const CODE_PAGE_PREFIX: &[u8] = br#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>codedrop &mdash; snippet</title>
    <link rel="stylesheet" href="/static/styles.css">
</head>
<body>
    <main class="terminal">
        <header class="terminal-bar">
            <span class="dot red"></span>
            <span class="dot yellow"></span>
            <span class="dot green"></span>
            <span class="title">codedrop</span>
        </header>
        <section class="screen">
            <pre class="snippet"><code>"#;

const CODE_PAGE_SUFFIX: &[u8] = br#"</code></pre>
        </section>
    </main>
</body>
</html>
"#;

/// Render the snippet page around the raw stored bytes.
pub fn render_code_page(code: &[u8]) -> Vec<u8> {
    let escaped = escape_html_bytes(code);
    let mut page =
        Vec::with_capacity(CODE_PAGE_PREFIX.len() + escaped.len() + CODE_PAGE_SUFFIX.len());
    page.extend_from_slice(CODE_PAGE_PREFIX);
    page.extend_from_slice(&escaped);
    page.extend_from_slice(CODE_PAGE_SUFFIX);
    page
}

fn escape_html_bytes(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for &byte in raw {
        match byte {
            b'&' => out.extend_from_slice(b"&amp;"),
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            b'"' => out.extend_from_slice(b"&quot;"),
            b'\'' => out.extend_from_slice(b"&#x27;"),
            _ => out.push(byte),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|window| window == needle)
    }

    #[test]
    fn code_page_escapes_html() {
        let page = render_code_page(b"<script>alert(1)</script>");
        assert!(contains_subslice(&page, b"&lt;script&gt;"));
        assert!(!contains_subslice(&page, b"<script>alert"));
    }

    #[test]
    fn code_page_preserves_non_utf8_bytes() {
        let raw = [0x66u8, 0x6e, 0x20, 0xff, 0xfe, 0x00, 0x90, 0x1b];
        let page = render_code_page(&raw);
        assert!(contains_subslice(&page, &raw));
    }

    #[test]
    fn index_page_renders_the_counter() {
        let page = IndexPage { count: "42".into() };
        assert!(page.render().unwrap().contains("42"));
    }
}
