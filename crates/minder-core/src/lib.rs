//! Shared foundation for the Minder workspace: runtime settings, the
//! cross-cutting error taxonomy, the clock abstraction, and the channel
//! message types every other crate speaks.

pub mod clock;
pub mod error;
pub mod settings;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorKind, MinderError, Result};
pub use settings::{Settings, SettingsStore};
pub use types::{ConversationKey, InboundMessage, MessageFormat, OutboundMessage};
