//! Service layer for kinmerge: the merge request lifecycle and the tree-link
//! protocol on top of a [`MergeStore`](kinmerge_storage::MergeStore).
//!
//! Operations are async and safe to call concurrently. Each one takes a
//! per-aggregate lock, checks the caller's version, and commits its change
//! together with history in one store call. Failures surface as
//! [`ServiceError`], whose [`ErrorCategory`] tells the caller how to react.
//!
//! # Modules
//!
//! - [`config`]: environment-driven service configuration
//! - [`error`]: ServiceError and its categories
//! - [`identity`]: acting users and phone lookup
//! - [`lock`]: per-aggregate async locks
//! - [`notifier`]: participant notifications
//! - [`state`]: shared state and timeout-bounded store access
//! - [`state_store`]: MergeService, the merge lifecycle
//! - [`tree_link`]: TreeLinkService, the link request protocol

pub mod config;
pub mod error;
pub mod identity;
pub mod lock;
pub mod notifier;
pub mod state;
pub mod state_store;
pub mod tree_link;

pub use config::ServiceConfig;
pub use error::{ErrorCategory, ServiceError};
pub use identity::{lookup_user_by_phone, Actor, PhoneLookup};
pub use lock::{AggregateKey, AggregateLocks};
pub use notifier::{ChannelNotifier, Notifier, ParticipantEvent, TracingNotifier};
pub use state::AppState;
pub use state_store::{AnalysisReport, DecisionChange, MergeEdit, MergeService};
pub use tree_link::{CreateLink, TreeLinkService};
