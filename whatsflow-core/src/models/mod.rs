pub mod session;
pub mod webhook;

pub use session::{NewSession, Session, SessionId, SessionPatch, SessionStatus};
pub use webhook::{NewWebhook, Webhook, WebhookId, WebhookPatch};

use serde::{Deserialize, Deserializer};

/// Distinguishes an absent JSON field (`None`) from an explicit `null`
/// (`Some(None)`). Use with `#[serde(default, deserialize_with = "...")]`.
pub fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Probe {
        #[serde(default, deserialize_with = "deserialize_present")]
        field: Option<Option<String>>,
    }

    #[test]
    fn test_absent_null_and_value_are_distinct() {
        let absent: Probe = serde_json::from_str("{}").unwrap();
        let null: Probe = serde_json::from_str(r#"{"field": null}"#).unwrap();
        let value: Probe = serde_json::from_str(r#"{"field": "x"}"#).unwrap();

        assert_eq!(absent.field, None);
        assert_eq!(null.field, Some(None));
        assert_eq!(value.field, Some(Some("x".to_string())));
    }
}
