use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current version of the serialized [`MessagePayload`].
pub const PAYLOAD_VERSION: &str = "1.0";

/// Delivery channel a queued message is sent through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationMethod {
    Smtp,
    Webhook,
    Push,
    Inbox,
}

impl NotificationMethod {
    pub const ALL: [NotificationMethod; 4] = [
        NotificationMethod::Smtp,
        NotificationMethod::Webhook,
        NotificationMethod::Push,
        NotificationMethod::Inbox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationMethod::Smtp => "smtp",
            NotificationMethod::Webhook => "webhook",
            NotificationMethod::Push => "push",
            NotificationMethod::Inbox => "inbox",
        }
    }
}

impl fmt::Display for NotificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMethod(pub String);

impl fmt::Display for UnknownMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown notification method: {}", self.0)
    }
}

impl std::error::Error for UnknownMethod {}

impl FromStr for NotificationMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NotificationMethod::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownMethod(s.to_string()))
    }
}

/// A call to action rendered alongside the notification body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateAction {
    pub label: String,
    pub url: String,
}

/// Everything a delivery handler needs to know about the recipient and the
/// event. Built once at enqueue time and stored alongside the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "_version")]
    pub version: String,

    pub notification_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_template_id: Option<String>,

    pub user_id: String,
    pub user_email: String,
    pub user_name: String,
    pub user_username: String,

    #[serde(default)]
    pub actions: Vec<TemplateAction>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl MessagePayload {
    /// Variables available to title and body templates: the payload fields,
    /// every label as `labels.<key>`, and the deployment helpers.
    pub fn template_vars(&self, helpers: &HashMap<String, String>) -> HashMap<String, String> {
        let mut vars = helpers.clone();
        vars.insert("notification_name".into(), self.notification_name.clone());
        vars.insert("user_id".into(), self.user_id.clone());
        vars.insert("user_email".into(), self.user_email.clone());
        vars.insert("user_name".into(), self.user_name.clone());
        vars.insert("user_username".into(), self.user_username.clone());
        for (key, value) in &self.labels {
            vars.insert(format!("labels.{}", key), value.clone());
        }
        vars
    }
}

/// Outcome of a single delivery attempt, buffered until the next store sync.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub notifier_id: Uuid,
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
    pub retryable: bool,
}

impl DispatchResult {
    pub fn success(notifier_id: Uuid, message_id: Uuid) -> Self {
        Self {
            notifier_id,
            message_id,
            timestamp: Utc::now(),
            error: None,
            retryable: false,
        }
    }

    pub fn failure(
        notifier_id: Uuid,
        message_id: Uuid,
        error: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            notifier_id,
            message_id,
            timestamp: Utc::now(),
            error: Some(error.into()),
            retryable,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> MessagePayload {
        MessagePayload {
            version: PAYLOAD_VERSION.to_string(),
            notification_name: "Workspace Deleted".into(),
            notification_template_id: None,
            user_id: Uuid::nil().to_string(),
            user_email: "bobby@example.com".into(),
            user_name: "Bobby".into(),
            user_username: "bobby".into(),
            actions: vec![],
            labels: HashMap::from([("name".to_string(), "dev".to_string())]),
        }
    }

    #[test]
    fn test_method_round_trips_through_str() {
        for method in NotificationMethod::ALL {
            assert_eq!(method.as_str().parse::<NotificationMethod>(), Ok(method));
        }
        assert_eq!("SMTP".parse::<NotificationMethod>(), Ok(NotificationMethod::Smtp));
        assert!("carrier-pigeon".parse::<NotificationMethod>().is_err());
    }

    #[test]
    fn test_method_serializes_lowercase() {
        let json = serde_json::to_string(&NotificationMethod::Webhook).unwrap();
        assert_eq!(json, "\"webhook\"");
    }

    #[test]
    fn test_payload_serialization_uses_version_tag() {
        let json = serde_json::to_value(payload()).unwrap();
        assert_eq!(json["_version"], "1.0");
        assert!(json.get("notification_template_id").is_none());
    }

    #[test]
    fn test_template_vars_include_labels_and_helpers() {
        let helpers = HashMap::from([("app_name".to_string(), "Ara".to_string())]);
        let vars = payload().template_vars(&helpers);

        assert_eq!(vars["labels.name"], "dev");
        assert_eq!(vars["user_name"], "Bobby");
        assert_eq!(vars["app_name"], "Ara");
    }

    #[test]
    fn test_dispatch_result_constructors() {
        let ok = DispatchResult::success(Uuid::new_v4(), Uuid::new_v4());
        assert!(ok.is_success());

        let failed = DispatchResult::failure(Uuid::new_v4(), Uuid::new_v4(), "boom", true);
        assert!(!failed.is_success());
        assert!(failed.retryable);
    }
}
