//! Host-to-guest event delivery
//!
//! The OS thread produces events, the guest thread consumes them; the two
//! share nothing but a lock-free byte ring.

pub mod channel;
pub mod record;
pub mod ring;

pub use channel::{EventReceiver, EventSender, MIN_CHANNEL_EXP, event_channel};
pub use record::{Event, EventError, EventHeader, EventKind};
pub use ring::{RingConsumer, RingError, RingProducer, ring_buffer};
