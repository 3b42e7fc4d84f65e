//! Delivery handlers shipped with the dispatcher.
//!
//! SMTP and push are enumerated methods without a default handler; messages
//! for them fail permanently unless a handler is registered.

mod inbox;
mod webhook;

pub use inbox::InboxHandler;
pub use webhook::{WebhookHandler, WEBHOOK_BODY_VERSION};
