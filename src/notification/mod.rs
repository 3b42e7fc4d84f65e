//! Notification dispatch pipeline.
//!
//! # Architecture
//!
//! - [`Manager`]: owns the notifier pool, the bounded result buffers and the
//!   periodic store sync; sequences shutdown
//! - [`Notifier`]: leases batches from the [`Store`](crate::store::Store),
//!   renders and dispatches them concurrently, and publishes each outcome
//! - [`Handler`]: builds the delivery callable for one method
//!   (see [`dispatch`] for the shipped handlers)
//! - [`Enqueuer`]: producer side, inserts new messages into the store
//!
//! Delivery is at-least-once: a message whose result never reaches the store
//! is leased again once its lease expires.

pub mod dispatch;
mod enqueuer;
mod handler;
mod manager;
mod notifier;
mod types;

pub use enqueuer::{EnqueueError, EnqueueRequest, Enqueuer, NoopEnqueuer, StoreEnqueuer};
pub use handler::{
    delivery_fn, DeliveryError, DeliveryFn, Handler, HandlerError, HandlerRegistry,
};
pub use manager::{Manager, ManagerError};
pub use notifier::{Notifier, NotifierError};
pub use types::{
    DispatchResult, MessagePayload, NotificationMethod, TemplateAction, UnknownMethod,
    PAYLOAD_VERSION,
};
