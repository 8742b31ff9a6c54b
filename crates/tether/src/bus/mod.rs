//! Event bus: fan-out of session and workflow events to subscribed clients.

mod handler;
mod hub;
mod types;

pub use handler::events_ws_handler;
pub use hub::EventBus;
pub use types::{BusEvent, SubscriptionFilters};
