//! Webhook subscriptions and delivery.
//!
//! This crate provides:
//! - [`WebhookRegistry`]: per-category subscriber lists with SSRF checks
//! - [`WebhookNotifier`]: concurrent POST fan-out, each delivery run through
//!   the recovery executor under the `api` domain keyed by subscriber URL

pub mod notifier;
pub mod registry;

pub use notifier::{DeliveryReport, DeliveryStatus, NotifyReport, WebhookNotifier};
pub use registry::WebhookRegistry;
