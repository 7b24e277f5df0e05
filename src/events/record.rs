//! Event records
//!
//! An event travels through the ring as a fixed 32-byte [`EventHeader`],
//! optionally followed by a trailer of `path_count` length-prefixed strings:
//!
//! ```text
//! +----------------+------------------------------+
//! | EventHeader    | [u64 len][len bytes] x count |
//! +----------------+------------------------------+
//! ```
//!
//! The header is also what the guest sees in its raw event slot.

use super::ring::RingError;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("truncated event record: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("event ring of 2^{exp} bytes cannot hold one event header")]
    RingTooSmall { exp: u32 },

    #[error("unknown event kind {kind}")]
    UnknownKind { kind: u32 },
}

/// Event type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    Quit = 1,
    WindowClose = 2,
    WindowResize = 3,
    MouseDown = 4,
    MouseUp = 5,
    MouseEnter = 6,
    MouseLeave = 7,
    MouseMove = 8,
    MouseWheel = 9,
    KeyDown = 10,
    KeyUp = 11,
    FrameRefresh = 12,
    PathDrop = 13,
}

impl EventKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::Quit,
            2 => Self::WindowClose,
            3 => Self::WindowResize,
            4 => Self::MouseDown,
            5 => Self::MouseUp,
            6 => Self::MouseEnter,
            7 => Self::MouseLeave,
            8 => Self::MouseMove,
            9 => Self::MouseWheel,
            10 => Self::KeyDown,
            11 => Self::KeyUp,
            12 => Self::FrameRefresh,
            13 => Self::PathDrop,
            _ => return None,
        })
    }
}

/// Fixed-size record header (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct EventHeader {
    pub kind: u32,
    /// Kind-specific payload; floats are stored as their bit patterns
    pub words: [u32; 4],
    pub _reserved: u32,
    /// Number of length-prefixed paths following the header
    pub path_count: u64,
}

impl EventHeader {
    pub const SIZE: usize = 32;
}

/// A host event destined for the guest
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Quit,
    WindowClose,
    WindowResize { width: u32, height: u32 },
    MouseDown { button: i32 },
    MouseUp { button: i32 },
    MouseEnter,
    MouseLeave,
    MouseMove { x: f32, y: f32, dx: f32, dy: f32 },
    MouseWheel { dx: f32, dy: f32 },
    KeyDown { scan_code: u32, key_code: u32 },
    KeyUp { scan_code: u32, key_code: u32 },
    FrameRefresh,
    PathDrop { paths: Vec<String> },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Quit => EventKind::Quit,
            Event::WindowClose => EventKind::WindowClose,
            Event::WindowResize { .. } => EventKind::WindowResize,
            Event::MouseDown { .. } => EventKind::MouseDown,
            Event::MouseUp { .. } => EventKind::MouseUp,
            Event::MouseEnter => EventKind::MouseEnter,
            Event::MouseLeave => EventKind::MouseLeave,
            Event::MouseMove { .. } => EventKind::MouseMove,
            Event::MouseWheel { .. } => EventKind::MouseWheel,
            Event::KeyDown { .. } => EventKind::KeyDown,
            Event::KeyUp { .. } => EventKind::KeyUp,
            Event::FrameRefresh => EventKind::FrameRefresh,
            Event::PathDrop { .. } => EventKind::PathDrop,
        }
    }

    /// Mouse and keyboard input, which is dropped while the guest is paused
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            Event::MouseDown { .. }
                | Event::MouseUp { .. }
                | Event::MouseEnter
                | Event::MouseLeave
                | Event::MouseMove { .. }
                | Event::MouseWheel { .. }
                | Event::KeyDown { .. }
                | Event::KeyUp { .. }
        )
    }

    /// Events that end the guest's frame loop
    pub fn is_quit(&self) -> bool {
        matches!(self, Event::Quit | Event::WindowClose)
    }

    pub fn paths(&self) -> &[String] {
        match self {
            Event::PathDrop { paths } => paths,
            _ => &[],
        }
    }

    pub fn header(&self) -> EventHeader {
        let words = match *self {
            Event::WindowResize { width, height } => [width, height, 0, 0],
            Event::MouseDown { button } | Event::MouseUp { button } => [button as u32, 0, 0, 0],
            Event::MouseMove { x, y, dx, dy } => [x.to_bits(), y.to_bits(), dx.to_bits(), dy.to_bits()],
            Event::MouseWheel { dx, dy } => [dx.to_bits(), dy.to_bits(), 0, 0],
            Event::KeyDown { scan_code, key_code } | Event::KeyUp { scan_code, key_code } => {
                [scan_code, key_code, 0, 0]
            }
            _ => [0; 4],
        };

        EventHeader {
            kind: self.kind() as u32,
            words,
            _reserved: 0,
            path_count: self.paths().len() as u64,
        }
    }

    /// Rebuild an event from its header and decoded trailer
    pub fn from_parts(header: &EventHeader, paths: Vec<String>) -> Result<Event, EventError> {
        let kind = EventKind::from_u32(header.kind).ok_or(EventError::UnknownKind { kind: header.kind })?;
        let [a, b, c, d] = header.words;

        Ok(match kind {
            EventKind::Quit => Event::Quit,
            EventKind::WindowClose => Event::WindowClose,
            EventKind::WindowResize => Event::WindowResize { width: a, height: b },
            EventKind::MouseDown => Event::MouseDown { button: a as i32 },
            EventKind::MouseUp => Event::MouseUp { button: a as i32 },
            EventKind::MouseEnter => Event::MouseEnter,
            EventKind::MouseLeave => Event::MouseLeave,
            EventKind::MouseMove => Event::MouseMove {
                x: f32::from_bits(a),
                y: f32::from_bits(b),
                dx: f32::from_bits(c),
                dy: f32::from_bits(d),
            },
            EventKind::MouseWheel => Event::MouseWheel {
                dx: f32::from_bits(a),
                dy: f32::from_bits(b),
            },
            EventKind::KeyDown => Event::KeyDown { scan_code: a, key_code: b },
            EventKind::KeyUp => Event::KeyUp { scan_code: a, key_code: b },
            EventKind::FrameRefresh => Event::FrameRefresh,
            EventKind::PathDrop => Event::PathDrop { paths },
        })
    }

    /// Total encoded size including the trailer
    pub fn encoded_len(&self) -> usize {
        EventHeader::SIZE
            + self
                .paths()
                .iter()
                .map(|p| std::mem::size_of::<u64>() + p.len())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(std::mem::size_of::<EventHeader>(), EventHeader::SIZE);

        let header = Event::WindowResize {
            width: 800,
            height: 600,
        }
        .header();
        let bytes = bytemuck::bytes_of(&header);
        assert_eq!(&bytes[0..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &800u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &600u32.to_le_bytes());
    }

    #[test]
    fn test_mouse_move_keeps_float_bits() {
        let event = Event::MouseMove {
            x: 10.5,
            y: -3.25,
            dx: 0.125,
            dy: f32::MIN_POSITIVE,
        };
        let decoded = Event::from_parts(&event.header(), Vec::new()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_negative_button() {
        let event = Event::MouseUp { button: -1 };
        assert_eq!(Event::from_parts(&event.header(), Vec::new()).unwrap(), event);
    }

    #[test]
    fn test_unknown_kind() {
        let header = EventHeader {
            kind: 99,
            ..Default::default()
        };
        assert_eq!(
            Event::from_parts(&header, Vec::new()),
            Err(EventError::UnknownKind { kind: 99 })
        );
    }

    #[test]
    fn test_classification() {
        assert!(Event::KeyDown { scan_code: 1, key_code: 2 }.is_input());
        assert!(!Event::FrameRefresh.is_input());
        assert!(!Event::WindowResize { width: 1, height: 1 }.is_input());
        assert!(Event::WindowClose.is_quit());
    }

    #[test]
    fn test_encoded_len() {
        let event = Event::PathDrop {
            paths: vec!["a.png".into(), "dir/b.txt".into()],
        };
        assert_eq!(event.encoded_len(), 32 + 8 + 5 + 8 + 9);
        assert_eq!(event.header().path_count, 2);
        assert_eq!(Event::Quit.encoded_len(), 32);
    }
}
