//! Event channel between the OS thread and the guest thread
//!
//! The sender stages the header and every trailer part, then commits once.
//! If any part does not fit, everything staged for that event is rewound and
//! the event is dropped, so the receiver only ever sees whole records.

use super::record::{Event, EventError, EventHeader};
use super::ring::{RingConsumer, RingProducer, ring_buffer};
use std::mem::size_of;
use tracing::error;

/// Smallest ring exponent whose usable bytes fit one bare event header
pub const MIN_CHANNEL_EXP: u32 = 6;

const _: () = assert!((1usize << MIN_CHANNEL_EXP) - 1 >= EventHeader::SIZE);
const _: () = assert!((1usize << (MIN_CHANNEL_EXP - 1)) - 1 < EventHeader::SIZE);

/// Create a channel over a ring of `1 << cap_exp` bytes
pub fn event_channel(cap_exp: u32) -> Result<(EventSender, EventReceiver), EventError> {
    if cap_exp < MIN_CHANNEL_EXP {
        return Err(EventError::RingTooSmall { exp: cap_exp });
    }
    let (producer, consumer) = ring_buffer(cap_exp)?;
    Ok((
        EventSender {
            ring: producer,
            dropped: 0,
        },
        EventReceiver { ring: consumer },
    ))
}

/// OS-thread end
pub struct EventSender {
    ring: RingProducer,
    dropped: u64,
}

impl EventSender {
    /// Enqueue one event, or drop it whole if the ring is full
    pub fn send(&mut self, event: &Event) -> Result<(), EventError> {
        match self.stage(event) {
            Ok(()) => {
                self.ring.commit();
                Ok(())
            }
            Err(err) => {
                self.ring.rewind();
                self.dropped += 1;
                error!(
                    kind = ?event.kind(),
                    size = event.encoded_len(),
                    dropped = self.dropped,
                    "event queue full"
                );
                Err(err.into())
            }
        }
    }

    fn stage(&mut self, event: &Event) -> Result<(), super::ring::RingError> {
        self.ring.reserve(bytemuck::bytes_of(&event.header()))?;
        for path in event.paths() {
            self.ring.reserve(&(path.len() as u64).to_le_bytes())?;
            self.ring.reserve(path.as_bytes())?;
        }
        Ok(())
    }

    /// Events dropped because the ring was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn write_available(&self) -> usize {
        self.ring.write_available()
    }
}

/// Guest-thread end
pub struct EventReceiver {
    ring: RingConsumer,
}

impl EventReceiver {
    /// Take the next whole event, if one is available
    pub fn next_event(&mut self) -> Result<Option<Event>, EventError> {
        let available = self.ring.read_available();
        if available == 0 {
            return Ok(None);
        }

        let mut header = EventHeader::default();
        self.read_exact(bytemuck::bytes_of_mut(&mut header))?;

        let mut paths = Vec::new();
        for _ in 0..header.path_count {
            let mut len = [0u8; size_of::<u64>()];
            self.read_exact(&mut len)?;

            let len = u64::from_le_bytes(len) as usize;
            let mut bytes = vec![0u8; len.min(self.ring.read_available())];
            self.read_exact(&mut bytes)?;
            if bytes.len() < len {
                return Err(EventError::Truncated {
                    needed: len,
                    available: bytes.len(),
                });
            }
            paths.push(String::from_utf8_lossy(&bytes).into_owned());
        }

        Event::from_parts(&header, paths).map(Some)
    }

    fn read_exact(&mut self, out: &mut [u8]) -> Result<(), EventError> {
        let available = self.ring.read_available();
        if available < out.len() {
            return Err(EventError::Truncated {
                needed: out.len(),
                available,
            });
        }
        self.ring.read(out);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read_available() == 0
    }
}
