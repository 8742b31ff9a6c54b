//! Mailbox: persistent cross-session queue distinct from chat history.

mod models;
mod repository;
mod service;

pub use models::{MailboxEntry, MailboxMessageType, Recipient};
pub use repository::MailboxRepository;
pub use service::{EmitParams, MailboxService};
