//! Webhook and Gmail push ingress, plus watch renewal.

pub mod gmail;
pub mod gmail_background;
pub mod ingress;

pub use gmail::{pubsub_handler, GmailPubsubState};
pub use ingress::{verify_webhook_signature, WebhookVerificationError};
