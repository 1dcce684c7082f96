//! Shared building blocks for the graylag policy daemon.
//!
//! This crate provides:
//! - Access-policy request framing and response rendering ([`frame`])
//! - Greylist entry value encoding ([`entry`])
//! - Sender/remote normalization and key derivation ([`keys`])
//! - Whitelist matchers and source loading ([`whitelist`])
//! - The key-value store capability and its backends ([`store`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod entry;
pub mod frame;
pub mod keys;
pub mod store;
pub mod whitelist;

pub use entry::Entry;
pub use frame::{Request, Response};
pub use store::Store;
pub use whitelist::WhitelistSet;
