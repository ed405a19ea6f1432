//! Channel abstraction: the adapter trait every transport implements, the
//! manager that owns their lifecycle, outbound message splitting, and the
//! admission / invite-code flow applied to inbound senders.

mod admission;
mod channel;
mod error;
mod manager;
mod split;

pub use admission::{Admission, AdmissionService, INVITE_COOLDOWN_SECS, INVITE_MAX_FAILED_ATTEMPTS};
pub use channel::{Channel, ChannelStatus, EnqueueOutcome, InboundHandler};
pub use error::{ChannelError, Result};
pub use manager::ChannelManager;
pub use split::split_message;
