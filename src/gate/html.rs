//! Allow-list HTML sanitizer for free-text product fields.
//!
//! The output is canonical: kept tags are re-emitted in a fixed form and
//! every angle bracket outside a kept tag is escaped, so sanitizing an
//! already sanitized string returns it unchanged.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<\s*(/?)\s*([A-Za-z][A-Za-z0-9]*)([^<>]*)>").expect("tag pattern compiles")
});

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("attribute pattern compiles")
});

/// Elements removed together with everything up to their closing tag.
/// They can never be allow-listed.
pub const CONTENT_DROPPING_TAGS: &[&str] = &[
    "script", "style", "iframe", "frame", "frameset", "object", "embed", "applet", "form",
    "noscript", "template", "textarea", "select", "svg", "math",
];

const URL_ATTRIBUTES: &[&str] = &[
    "href",
    "src",
    "action",
    "formaction",
    "background",
    "cite",
    "poster",
    "longdesc",
    "lowsrc",
    "dynsrc",
    "xlink:href",
];

const STRIPPED_ATTRIBUTES: &[&str] = &["style", "class", "id", "srcdoc", "srcset"];

const SAFE_SCHEMES: &[&str] = &["http", "https", "mailto"];

pub fn sanitize_html(input: &str, allowed_tags: &BTreeSet<String>, max_chars: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_chars.saturating_mul(4)));
    let mut cursor = 0;
    let mut skipping: Option<String> = None;

    for caps in TAG_RE.captures_iter(input) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        let name = caps
            .get(2)
            .map(|m| m.as_str().to_ascii_lowercase())
            .unwrap_or_default();
        let attrs = caps.get(3).map(|m| m.as_str()).unwrap_or("");
        let text = &input[cursor..whole.start()];
        cursor = whole.end();

        if let Some(blocked) = &skipping {
            if closing && name == *blocked {
                skipping = None;
            }
            continue;
        }

        push_text(&mut out, text);

        let self_closing = attrs.trim_end().ends_with('/');
        if CONTENT_DROPPING_TAGS.contains(&name.as_str()) {
            if !closing && !self_closing {
                skipping = Some(name);
            }
            continue;
        }
        if !allowed_tags.contains(&name) {
            continue;
        }

        if closing {
            out.push_str("</");
            out.push_str(&name);
            out.push('>');
        } else {
            out.push('<');
            out.push_str(&name);
            out.push_str(&clean_attributes(attrs));
            if self_closing {
                out.push('/');
            }
            out.push('>');
        }
    }

    if skipping.is_none() {
        push_text(&mut out, &input[cursor..]);
    }

    cap_length(out, max_chars)
}

fn push_text(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\n' | '\t' => out.push(ch),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
}

fn clean_attributes(raw: &str) -> String {
    let mut rendered = String::new();
    let mut seen: Vec<String> = Vec::new();
    for caps in ATTR_RE.captures_iter(raw) {
        let Some(name) = caps.get(1).map(|m| m.as_str().to_ascii_lowercase()) else {
            continue;
        };
        if name.starts_with("on") || STRIPPED_ATTRIBUTES.contains(&name.as_str()) {
            continue;
        }
        if seen.contains(&name) {
            continue;
        }
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map(|m| clean_attribute_value(m.as_str()));

        if URL_ATTRIBUTES.contains(&name.as_str()) {
            match value.as_deref() {
                Some(url) if is_safe_url(url) => {}
                _ => continue,
            }
        }

        rendered.push(' ');
        rendered.push_str(&name);
        if let Some(value) = value {
            rendered.push_str("=\"");
            rendered.push_str(&value);
            rendered.push('"');
        }
        seen.push(name);
    }
    rendered
}

fn clean_attribute_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '"' | '<' | '>' | '`') && !c.is_control())
        .collect()
}

fn is_safe_url(value: &str) -> bool {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    if compact.contains("&#") || compact.contains("&colon") || compact.contains('\\') {
        return false;
    }
    let scheme_end = compact.find(':');
    let path_start = compact.find(['/', '?', '#']);
    match (scheme_end, path_start) {
        (Some(colon), Some(path)) if path < colon => true,
        (Some(colon), _) => SAFE_SCHEMES.contains(&&compact[..colon]),
        (None, _) => true,
    }
}

/// Caps the character count without leaving half a tag at the end.
fn cap_length(out: String, max_chars: usize) -> String {
    let Some((byte_end, _)) = out.char_indices().nth(max_chars) else {
        return out;
    };
    let mut cut = &out[..byte_end];
    if let Some(open) = cut.rfind('<')
        && cut.rfind('>').is_none_or(|close| close < open)
    {
        cut = &cut[..open];
    }
    cut.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> BTreeSet<String> {
        ["p", "b", "strong", "ul", "li", "br", "a", "img", "div", "span"]
            .iter()
            .map(|tag| tag.to_string())
            .collect()
    }

    fn clean(input: &str) -> String {
        sanitize_html(input, &allowed(), 10_000)
    }

    #[test]
    fn keeps_structural_tags() {
        assert_eq!(
            clean("<P>Filtro <b>original</b><br /></P>"),
            "<p>Filtro <b>original</b><br/></p>"
        );
    }

    #[test]
    fn drops_script_blocks_with_their_content() {
        let out = clean("<p>ok</p><script>alert(1)</script><p>after</p>");
        assert_eq!(out, "<p>ok</p><p>after</p>");
        let nested = clean("<SCRIPT type=\"text/javascript\">alert(1)</SCRIPT >tail");
        assert_eq!(nested, "tail");
    }

    #[test]
    fn strips_event_handlers_inside_allowed_tags() {
        let out = clean(r#"<img src="https://cdn.example.com/a.jpg" onerror="alert(1)">"#);
        assert_eq!(out, r#"<img src="https://cdn.example.com/a.jpg">"#);
        let unquoted = clean("<div onmouseover=steal() class=x id=y>hi</div>");
        assert_eq!(unquoted, "<div>hi</div>");
    }

    #[test]
    fn strips_script_urls() {
        let out = clean(r#"<a href="javascript:alert(1)">x</a><a href=" JaVaScRiPt:alert(1)">y</a>"#);
        assert_eq!(out, "<a>x</a><a>y</a>");
        let encoded = clean(r#"<a href="jav&#x61;script:alert(1)">z</a>"#);
        assert_eq!(encoded, "<a>z</a>");
        let data = clean(r#"<img src="data:text/html;base64,AAAA">"#);
        assert_eq!(data, "<img>");
        let fine = clean(r#"<a href="/pecas/123?x=1">p</a>"#);
        assert_eq!(fine, r#"<a href="/pecas/123?x=1">p</a>"#);
    }

    #[test]
    fn strips_unknown_tags_but_keeps_their_text() {
        assert_eq!(clean("<blink>oferta</blink>"), "oferta");
        assert_eq!(clean("<iframe src=x></iframe>texto"), "texto");
        assert_eq!(clean("<form action=x><input name=a></form>fim"), "fim");
    }

    #[test]
    fn escapes_stray_angle_brackets() {
        assert_eq!(clean("5 < 6 > 4"), "5 &lt; 6 &gt; 4");
        assert_eq!(clean("<<b>script>"), "&lt;<b>script&gt;");
    }

    #[test]
    fn split_tags_cannot_reassemble() {
        let out = clean("<scr<b></b>ipt>alert(1)</scr<b></b>ipt>");
        assert!(!out.contains("<script"));
        assert_eq!(clean(&out), out);
    }

    #[test]
    fn sanitizing_twice_is_a_no_op() {
        let inputs = [
            r#"<p class="x" onclick="y">a<img src=x onerror=alert(1)/></p>"#,
            r#"<a title="x>y" onclick=z>q</a>"#,
            "<div><span>a & b</span><unknown>c</unknown></div>",
            "<br/><br /><br>",
            "unterminated <p",
        ];
        for input in inputs {
            let once = clean(input);
            assert_eq!(clean(&once), once, "input: {input}");
        }
    }

    #[test]
    fn length_cap_never_cuts_inside_a_tag() {
        let out = sanitize_html("<p>abcdef</p><b>gh</b>", &allowed(), 15);
        assert_eq!(out, "<p>abcdef</p>");
        assert_eq!(sanitize_html(&out, &allowed(), 15), out);
    }
}
