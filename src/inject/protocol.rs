//! Wire format between the embedding page and the helper scripts running
//! inside the preview frame (`window.postMessage`, JSON objects tagged by
//! `type`).
//!
//! The strings here are matched verbatim by the scripts in
//! `templates/helpers/`; changing one without the other breaks the preview.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bumped whenever a message shape changes. Stamped on every injected script
/// tag as `data-protocol-version`.
pub const PROTOCOL_VERSION: u32 = 1;

pub const CAPTURE_SCREENSHOT: &str = "capture-screenshot";
pub const SCREENSHOT_CAPTURED: &str = "screenshot-captured";
pub const SCREENSHOT_ERROR: &str = "screenshot-error";
pub const VISUAL_EDITOR_TOGGLE_MODE: &str = "visual-editor:toggle-mode";
pub const VISUAL_EDITOR_SELECTED: &str = "visual-editor:selected";
pub const VISUAL_EDITOR_UPDATE_STYLE: &str = "visual-editor:update-style";
pub const QUICK_INSPECT_TOGGLE: &str = "quick-inspect:toggle";
pub const QUICK_INSPECT_SELECTED: &str = "quick-inspect:selected";

/// Messages the embedding page sends into the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    #[serde(rename = "capture-screenshot")]
    CaptureScreenshot,
    #[serde(rename = "visual-editor:toggle-mode")]
    ToggleVisualEditor { enabled: bool },
    #[serde(rename = "visual-editor:update-style")]
    UpdateStyle {
        selector: String,
        styles: BTreeMap<String, String>,
    },
    #[serde(rename = "quick-inspect:toggle")]
    ToggleQuickInspect { enabled: bool },
}

/// Messages the helper scripts post back to the embedding page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FrameMessage {
    #[serde(rename = "screenshot-captured", rename_all = "camelCase")]
    ScreenshotCaptured { data_url: String },
    #[serde(rename = "screenshot-error")]
    ScreenshotError { error: String },
    #[serde(rename = "visual-editor:selected")]
    VisualEditorSelected { element: SelectedElement },
    #[serde(rename = "quick-inspect:selected")]
    QuickInspectSelected { element: SelectedElement },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedElement {
    pub selector: String,
    pub tag_name: String,
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub text_content: String,
    pub rect: ElementRect,
    #[serde(default)]
    pub styles: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl HostMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            HostMessage::CaptureScreenshot => CAPTURE_SCREENSHOT,
            HostMessage::ToggleVisualEditor { .. } => VISUAL_EDITOR_TOGGLE_MODE,
            HostMessage::UpdateStyle { .. } => VISUAL_EDITOR_UPDATE_STYLE,
            HostMessage::ToggleQuickInspect { .. } => QUICK_INSPECT_TOGGLE,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl FrameMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            FrameMessage::ScreenshotCaptured { .. } => SCREENSHOT_CAPTURED,
            FrameMessage::ScreenshotError { .. } => SCREENSHOT_ERROR,
            FrameMessage::VisualEditorSelected { .. } => VISUAL_EDITOR_SELECTED,
            FrameMessage::QuickInspectSelected { .. } => QUICK_INSPECT_SELECTED,
        }
    }

    /// Decode a message posted by the frame. Unknown types are an error.
    pub fn parse(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Every message type string in the protocol.
pub const ALL_MESSAGE_TYPES: [&str; 8] = [
    CAPTURE_SCREENSHOT,
    SCREENSHOT_CAPTURED,
    SCREENSHOT_ERROR,
    VISUAL_EDITOR_TOGGLE_MODE,
    VISUAL_EDITOR_SELECTED,
    VISUAL_EDITOR_UPDATE_STYLE,
    QUICK_INSPECT_TOGGLE,
    QUICK_INSPECT_SELECTED,
];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn host_messages_encode_with_exact_types() {
        let toggle = HostMessage::ToggleVisualEditor { enabled: true };
        assert_eq!(
            serde_json::to_value(&toggle).unwrap(),
            json!({ "type": "visual-editor:toggle-mode", "enabled": true })
        );
        assert_eq!(
            serde_json::to_value(HostMessage::CaptureScreenshot).unwrap(),
            json!({ "type": "capture-screenshot" })
        );
        assert_eq!(toggle.message_type(), VISUAL_EDITOR_TOGGLE_MODE);
    }

    #[test]
    fn frame_screenshot_uses_camel_case() {
        let msg = FrameMessage::parse(r#"{"type":"screenshot-captured","dataUrl":"data:image/png;base64,AA"}"#)
            .unwrap();
        assert_eq!(
            msg,
            FrameMessage::ScreenshotCaptured {
                data_url: "data:image/png;base64,AA".into()
            }
        );
    }

    #[test]
    fn frame_selection_decodes_element() {
        let msg = FrameMessage::parse(
            r##"{
                "type": "visual-editor:selected",
                "element": {
                    "selector": "#cta",
                    "tagName": "button",
                    "className": "btn",
                    "textContent": "Go",
                    "rect": { "x": 1, "y": 2, "width": 30, "height": 10 },
                    "styles": { "color": "rgb(0, 0, 0)" }
                }
            }"##,
        )
        .unwrap();
        let FrameMessage::VisualEditorSelected { element } = msg else {
            panic!("wrong variant");
        };
        assert_eq!(element.selector, "#cta");
        assert_eq!(element.rect.width, 30.0);
        assert_eq!(element.styles["color"], "rgb(0, 0, 0)");
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(FrameMessage::parse(r#"{"type":"visual-editor:explode"}"#).is_err());
    }

    #[test]
    fn message_types_are_unique() {
        let mut types = ALL_MESSAGE_TYPES.to_vec();
        types.sort_unstable();
        types.dedup();
        assert_eq!(types.len(), ALL_MESSAGE_TYPES.len());
    }
}
