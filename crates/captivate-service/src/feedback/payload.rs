use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::remote::StateRecord;

/// The style and bitmap the control surface should show for one feedback.
///
/// Every field is optional. An empty payload leaves the button in its default style.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bgcolor: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment: Option<Value>,
    /// Base64 PNG data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub png64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pngalignment: Option<Value>,
    #[serde(
        default,
        rename = "show_topbar",
        skip_serializing_if = "Option::is_none"
    )]
    pub show_topbar: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_buffer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_position: Option<Value>,
    /// The state of boolean feedbacks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl DisplayPayload {
    /// Copies the fields the control surface understands out of a raw record.
    ///
    /// Everything else in the record is ignored. A `png64` that is not a string is dropped.
    pub fn from_record(record: &StateRecord) -> Self {
        let field = |name: &str| record.get(name).cloned();
        Self {
            text: field("text"),
            size: field("size"),
            color: field("color"),
            bgcolor: field("bgcolor"),
            alignment: field("alignment"),
            png64: record
                .get("png64")
                .and_then(Value::as_str)
                .map(str::to_owned),
            pngalignment: field("pngalignment"),
            show_topbar: field("show_topbar"),
            image_buffer: field("imageBuffer"),
            image_position: field("imagePosition"),
            value: field("value"),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether the payload carries a non-empty bitmap.
    pub fn has_png(&self) -> bool {
        self.png64.as_deref().is_some_and(|png| !png.is_empty())
    }

    /// The `value` of a boolean feedback, by JavaScript truthiness.
    pub fn is_truthy(&self) -> bool {
        self.value.as_ref().is_some_and(is_truthy)
    }
}

/// JavaScript truthiness of a JSON value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
