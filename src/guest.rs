//! Guest lifecycle handling
//!
//! Provides:
//! - Lifecycle messages tagged with the guest they are meant for
//! - The `GuestService` dispatch trait
//! - `ArcService`, which drives device datapaths and IPv6 for ARC guests

pub mod arc;
pub mod message;
pub mod service;

pub use arc::{ArcService, Ipv6Setup};
pub use message::{GuestEvent, GuestMessage, GuestType};
pub use service::{GuestService, ScheduledRetry};
