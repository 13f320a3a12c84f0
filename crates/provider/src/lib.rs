//! HTTP clients for the external services the webhook depends on: the
//! identity directory and the transactional mail API.

pub mod identity;
pub mod mail;

pub use identity::{IdentityClient, IdentityError, IdentityUser};
pub use mail::{MailClient, MailError, OutboundEmail};
