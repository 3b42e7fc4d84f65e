//! In-app inbox delivery: the rendered message is written to the recipient's
//! inbox through the store.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::notification::handler::{delivery_fn, DeliveryError, DeliveryFn, Handler, HandlerError};
use crate::notification::types::MessagePayload;
use crate::store::{InboxEntry, Store};

pub struct InboxHandler {
    store: Arc<dyn Store>,
}

impl InboxHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

fn parse_id(field: &str, value: Option<&str>) -> Result<Uuid, HandlerError> {
    let value = value.ok_or_else(|| HandlerError::InvalidPayload(format!("missing {field}")))?;
    Uuid::parse_str(value)
        .map_err(|e| HandlerError::InvalidPayload(format!("malformed {field} {value:?}: {e}")))
}

impl Handler for InboxHandler {
    fn dispatcher(
        &self,
        payload: MessagePayload,
        title: String,
        body: String,
    ) -> Result<DeliveryFn, HandlerError> {
        let user_id = parse_id("user_id", Some(&payload.user_id))?;
        let template_id = parse_id(
            "notification_template_id",
            payload.notification_template_id.as_deref(),
        )?;
        let store = self.store.clone();

        Ok(delivery_fn(move |ctx, msg_id| async move {
            // Keyed by message id so a redelivered message lands once
            let entry = InboxEntry {
                id: msg_id,
                user_id,
                template_id,
                targets: Vec::new(),
                title,
                content: body,
                actions: payload.actions,
                created_at: Utc::now(),
            };

            tokio::select! {
                biased;
                _ = ctx.cancelled() => Err(DeliveryError::Cancelled),
                inserted = store.insert_inbox_notification(entry) => inserted.map_err(|e| {
                    DeliveryError::Temporary(format!("insert inbox notification: {e}"))
                }),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::notification::types::TemplateAction;
    use crate::store::MemoryStore;

    fn payload(user_id: &str, template_id: Option<String>) -> MessagePayload {
        MessagePayload {
            version: "1.0".into(),
            notification_name: "Workspace Deleted".into(),
            notification_template_id: template_id,
            user_id: user_id.into(),
            user_email: "bobby@example.com".into(),
            user_name: "Bobby".into(),
            user_username: "bobby".into(),
            actions: vec![TemplateAction {
                label: "View workspaces".into(),
                url: "http://localhost:3000/workspaces".into(),
            }],
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_inserts_inbox_entry() {
        let store = Arc::new(MemoryStore::new());
        let handler = InboxHandler::new(store.clone());
        let user_id = Uuid::new_v4();
        let template_id = Uuid::new_v4();

        let deliver = handler
            .dispatcher(
                payload(&user_id.to_string(), Some(template_id.to_string())),
                "Title".into(),
                "Body".into(),
            )
            .unwrap();
        let msg_id = Uuid::new_v4();
        deliver(CancellationToken::new(), msg_id).await.unwrap();

        let inbox = store.inbox();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id, msg_id);
        assert_eq!(inbox[0].user_id, user_id);
        assert_eq!(inbox[0].title, "Title");
        assert_eq!(inbox[0].actions.len(), 1);
    }

    #[test]
    fn test_malformed_user_id_is_construction_failure() {
        let handler = InboxHandler::new(Arc::new(MemoryStore::new()));
        let result = handler.dispatcher(
            payload("not-a-uuid", Some(Uuid::new_v4().to_string())),
            "t".into(),
            "b".into(),
        );
        assert!(matches!(result, Err(HandlerError::InvalidPayload(_))));
    }

    #[test]
    fn test_missing_template_id_is_construction_failure() {
        let handler = InboxHandler::new(Arc::new(MemoryStore::new()));
        let result = handler.dispatcher(
            payload(&Uuid::new_v4().to_string(), None),
            "t".into(),
            "b".into(),
        );
        assert!(matches!(result, Err(HandlerError::InvalidPayload(_))));
    }
}
