//! The two helper scripts injected into every preview's `index.html`.

/// Answers `capture-screenshot` with `screenshot-captured` or `screenshot-error`.
pub const SCREENSHOT_RESPONDER: &str = include_str!("../../templates/helpers/screenshot.js");

/// Element hover/selection for the visual editor and quick-inspect modes.
pub const VISUAL_EDITOR_RESPONDER: &str =
    include_str!("../../templates/helpers/visual-editor.js");

/// `(marker name, payload)` in injection order.
pub const HELPERS: [(&str, &str); 2] = [
    ("screenshot", SCREENSHOT_RESPONDER),
    ("visual-editor", VISUAL_EDITOR_RESPONDER),
];
