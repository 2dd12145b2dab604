//! Notification payloads
//!
//! A [`Payload`] serializes to the JSON document APNs expects: an `aps`
//! dictionary with the Apple-defined keys, followed by any custom keys at the
//! top level.
//!
//! ```
//! use apns_h2::apns::{Payload, PayloadAlert};
//!
//! let payload = Payload::new()
//!     .alert(PayloadAlert::new().title("Hello").body("World"))
//!     .badge(3)
//!     .custom("thread", "42".into());
//!
//! let json = payload.to_json().unwrap();
//! assert_eq!(
//!     String::from_utf8(json).unwrap(),
//!     r#"{"aps":{"alert":{"title":"Hello","body":"World"},"badge":3},"thread":"42"}"#
//! );
//! ```

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{Map, Value};

/// Key of the Apple-defined dictionary
const APS: &str = "aps";

/// Structured alert content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayloadAlert {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "title-loc-key", skip_serializing_if = "Option::is_none")]
    pub title_localization_key: Option<String>,
    #[serde(rename = "title-loc-args", skip_serializing_if = "Option::is_none")]
    pub title_localization_args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "loc-key", skip_serializing_if = "Option::is_none")]
    pub body_localization_key: Option<String>,
    #[serde(rename = "loc-args", skip_serializing_if = "Option::is_none")]
    pub body_localization_args: Option<Vec<String>>,
    #[serde(rename = "action-loc-key", skip_serializing_if = "Option::is_none")]
    pub action_localization_key: Option<String>,
    #[serde(rename = "launch-image", skip_serializing_if = "Option::is_none")]
    pub launch_image: Option<String>,
}

impl PayloadAlert {
    pub fn new() -> Self {
        PayloadAlert::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn title_localization(mut self, key: impl Into<String>, args: Vec<String>) -> Self {
        self.title_localization_key = Some(key.into());
        self.title_localization_args = Some(args);
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn body_localization(mut self, key: impl Into<String>, args: Vec<String>) -> Self {
        self.body_localization_key = Some(key.into());
        self.body_localization_args = Some(args);
        self
    }

    pub fn action_localization_key(mut self, key: impl Into<String>) -> Self {
        self.action_localization_key = Some(key.into());
        self
    }

    pub fn launch_image(mut self, image: impl Into<String>) -> Self {
        self.launch_image = Some(image.into());
        self
    }
}

/// The `alert` value: either plain text or a dictionary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Alert {
    Text(String),
    Fields(PayloadAlert),
}

impl From<&str> for Alert {
    fn from(text: &str) -> Self {
        Alert::Text(text.to_string())
    }
}

impl From<String> for Alert {
    fn from(text: String) -> Self {
        Alert::Text(text)
    }
}

impl From<PayloadAlert> for Alert {
    fn from(fields: PayloadAlert) -> Self {
        Alert::Fields(fields)
    }
}

/// A notification payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub alert: Option<Alert>,
    pub badge: Option<u32>,
    pub sound: Option<String>,
    /// Wake the app in the background; emitted as `content-available: 1`
    pub content_available: bool,
    pub category: Option<String>,
    /// Top-level keys beside `aps`. A custom `aps` key is never emitted.
    pub custom: Map<String, Value>,
}

#[derive(Serialize)]
struct Aps<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    alert: Option<&'a Alert>,
    #[serde(skip_serializing_if = "Option::is_none")]
    badge: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<&'a str>,
    #[serde(rename = "content-available", skip_serializing_if = "Option::is_none")]
    content_available: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<&'a str>,
}

impl Payload {
    pub fn new() -> Self {
        Payload::default()
    }

    pub fn alert(mut self, alert: impl Into<Alert>) -> Self {
        self.alert = Some(alert.into());
        self
    }

    pub fn badge(mut self, badge: u32) -> Self {
        self.badge = Some(badge);
        self
    }

    pub fn sound(mut self, sound: impl Into<String>) -> Self {
        self.sound = Some(sound.into());
        self
    }

    pub fn content_available(mut self, available: bool) -> Self {
        self.content_available = available;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn custom(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom.insert(key.into(), value);
        self
    }

    /// Serialize to the request body
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn aps(&self) -> Aps<'_> {
        Aps {
            alert: self.alert.as_ref(),
            badge: self.badge,
            sound: self.sound.as_deref(),
            content_available: self.content_available.then_some(1),
            category: self.category.as_deref(),
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(APS, &self.aps())?;
        for (key, value) in self.custom.iter().filter(|(key, _)| key.as_str() != APS) {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl From<&str> for Payload {
    fn from(alert: &str) -> Self {
        Payload::new().alert(alert)
    }
}

impl From<String> for Payload {
    fn from(alert: String) -> Self {
        Payload::new().alert(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn to_value(payload: &Payload) -> Value {
        serde_json::from_slice(&payload.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_empty_payload() {
        let payload = Payload::new();
        assert!(payload.alert.is_none());
        assert_eq!(to_value(&payload), json!({"aps": {}}));
    }

    #[test]
    fn test_text_alert() {
        let payload = Payload::from("XoXo");
        assert_eq!(to_value(&payload), json!({"aps": {"alert": "XoXo"}}));
    }

    #[test]
    fn test_alert_fields_use_kebab_case() {
        let alert = PayloadAlert::new()
            .title("Title")
            .title_localization("T_KEY", vec!["a".into()])
            .body_localization("B_KEY", vec!["b".into(), "c".into()])
            .action_localization_key("VIEW")
            .launch_image("splash.png");

        assert_eq!(
            to_value(&Payload::new().alert(alert)),
            json!({"aps": {"alert": {
                "title": "Title",
                "title-loc-key": "T_KEY",
                "title-loc-args": ["a"],
                "loc-key": "B_KEY",
                "loc-args": ["b", "c"],
                "action-loc-key": "VIEW",
                "launch-image": "splash.png",
            }}})
        );
    }

    #[test]
    fn test_content_available_only_when_set() {
        let on = to_value(&Payload::new().content_available(true));
        assert_eq!(on["aps"]["content-available"], 1);

        let off = to_value(&Payload::new().content_available(false));
        assert!(off["aps"].get("content-available").is_none());
    }

    #[test]
    fn test_complete_payload() {
        let payload = Payload::new()
            .alert("alert")
            .badge(3)
            .sound("terrible")
            .content_available(true)
            .category("category")
            .custom("hello", json!({"my": "friend"}));

        assert_eq!(
            to_value(&payload),
            json!({
                "hello": {"my": "friend"},
                "aps": {
                    "badge": 3,
                    "category": "category",
                    "content-available": 1,
                    "alert": "alert",
                    "sound": "terrible",
                }
            })
        );
    }

    #[test]
    fn test_aps_comes_first_and_custom_aps_is_dropped() {
        let payload = Payload::new()
            .badge(1)
            .custom("1", json!(1))
            .custom("aps", json!("clobber"));

        let text = String::from_utf8(payload.to_json().unwrap()).unwrap();
        assert_eq!(text, r#"{"aps":{"badge":1},"1":1}"#);
    }
}
