//! Helper-script injection for the preview's entry HTML.
//!
//! Two fixed scripts go into `index.html` before it reaches the sandbox: a
//! screenshot responder and a visual-element selector. Both talk to the
//! embedding page over `postMessage` using [`protocol`].

pub mod protocol;
pub mod scripts;

use std::borrow::Cow;

use crate::bundle::FileBundle;

pub const ENTRY_HTML: &str = "index.html";

/// Attribute present on every injected tag; its presence makes injection a no-op.
pub const HELPER_MARKER: &str = "data-preview-helper";

fn helper_block() -> String {
    let mut block = String::new();
    for (name, js) in scripts::HELPERS {
        block.push_str(&format!(
            "<script {HELPER_MARKER}=\"{name}\" data-protocol-version=\"{}\">\n{js}</script>\n",
            protocol::PROTOCOL_VERSION
        ));
    }
    block
}

/// Insert the helper scripts before `</body>` (else `</head>`, else at the end).
/// Already-injected documents come back borrowed.
pub fn inject_helpers(html: &str) -> Cow<'_, str> {
    if html.contains(HELPER_MARKER) {
        return Cow::Borrowed(html);
    }

    // ASCII lowercasing keeps byte offsets intact.
    let lower = html.to_ascii_lowercase();
    let at = lower
        .rfind("</body>")
        .or_else(|| lower.rfind("</head>"))
        .unwrap_or(html.len());

    let mut out = String::with_capacity(html.len() + 8 * 1024);
    out.push_str(&html[..at]);
    if at == html.len() && !html.is_empty() && !html.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&helper_block());
    out.push_str(&html[at..]);
    Cow::Owned(out)
}

/// Inject into the bundle's entry HTML if present. Returns whether it changed.
pub fn inject_into_bundle(bundle: &mut FileBundle) -> bool {
    let Some(html) = bundle.get_mut(ENTRY_HTML) else {
        return false;
    };
    let updated = match inject_helpers(html) {
        Cow::Borrowed(_) => return false,
        Cow::Owned(updated) => updated,
    };
    *html = updated;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "<!DOCTYPE html>\n<html>\n  <head><title>x</title></head>\n  <body>\n    <div id=\"root\"></div>\n  </body>\n</html>\n";

    #[test]
    fn scripts_land_before_closing_body() {
        let out = inject_helpers(PAGE);
        let body_close = out.rfind("</body>").unwrap();
        let screenshot = out.find("data-preview-helper=\"screenshot\"").unwrap();
        let editor = out.find("data-preview-helper=\"visual-editor\"").unwrap();
        assert!(screenshot < editor);
        assert!(editor < body_close);
        assert!(out.contains("data-protocol-version=\"1\""));
        assert!(out.contains("<div id=\"root\"></div>"));
    }

    #[test]
    fn injection_is_idempotent() {
        let once = inject_helpers(PAGE).into_owned();
        let twice = inject_helpers(&once);
        assert!(matches!(twice, Cow::Borrowed(_)));
        assert_eq!(twice, once);
    }

    #[test]
    fn falls_back_to_head_then_end() {
        let head_only = "<html><HEAD></HEAD></html>";
        let out = inject_helpers(head_only);
        assert!(out.find(HELPER_MARKER).unwrap() < out.find("</HEAD>").unwrap());

        let fragment = "<div>hi</div>";
        let out = inject_helpers(fragment);
        assert!(out.starts_with("<div>hi</div>\n<script"));
    }

    #[test]
    fn bundle_injection_touches_only_index_html() {
        let mut bundle = FileBundle::new();
        bundle.insert(ENTRY_HTML.into(), PAGE.into());
        bundle.insert("public/other.html".into(), PAGE.into());

        assert!(inject_into_bundle(&mut bundle));
        assert!(bundle[ENTRY_HTML].contains(HELPER_MARKER));
        assert!(!bundle["public/other.html"].contains(HELPER_MARKER));
        assert!(!inject_into_bundle(&mut bundle));
    }

    #[test]
    fn bundle_without_entry_is_untouched() {
        let mut bundle = FileBundle::new();
        bundle.insert("src/App.tsx".into(), "x".into());
        assert!(!inject_into_bundle(&mut bundle));
    }
}
