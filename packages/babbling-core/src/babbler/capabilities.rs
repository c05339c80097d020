//! Capability flags declared in the LOAD instruction.

use serde::{Deserialize, Serialize};

use super::queue::QueueMode;

const DEFERRED_INFO: u32 = 1;
const QUEUE_NEXT: u32 = 1 << 1;
const QUEUE_PREV: u32 = 1 << 2;

/// Request types the receiver may issue back to the controller.
///
/// Serialized as a bitmask under `customData.capabilities`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u32", from = "u32")]
pub struct Capabilities {
    /// The controller answers `INFO` for content resolved after LOAD.
    pub deferred_info: bool,
    /// The controller answers `QUEUE` with mode `after`.
    pub queue_next: bool,
    /// The controller answers `QUEUE` with mode `before`.
    pub queue_prev: bool,
}

impl Capabilities {
    pub const fn all() -> Self {
        Self {
            deferred_info: true,
            queue_next: true,
            queue_prev: true,
        }
    }

    pub const fn none() -> Self {
        Self {
            deferred_info: false,
            queue_next: false,
            queue_prev: false,
        }
    }

    pub fn bits(self) -> u32 {
        let mut bits = 0;
        if self.deferred_info {
            bits |= DEFERRED_INFO;
        }
        if self.queue_next {
            bits |= QUEUE_NEXT;
        }
        if self.queue_prev {
            bits |= QUEUE_PREV;
        }
        bits
    }

    /// Unknown bits are ignored.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            deferred_info: bits & DEFERRED_INFO != 0,
            queue_next: bits & QUEUE_NEXT != 0,
            queue_prev: bits & QUEUE_PREV != 0,
        }
    }

    pub fn is_empty(self) -> bool {
        self.bits() == 0
    }

    /// Whether a `QUEUE` request in `mode` was declared.
    pub fn allows_queue(self, mode: QueueMode) -> bool {
        match mode {
            QueueMode::After => self.queue_next,
            QueueMode::Before => self.queue_prev,
        }
    }
}

impl From<Capabilities> for u32 {
    fn from(caps: Capabilities) -> Self {
        caps.bits()
    }
}

impl From<u32> for Capabilities {
    fn from(bits: u32) -> Self {
        Self::from_bits(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_bits() {
        assert_eq!(Capabilities::all().bits(), 7);
        assert_eq!(
            Capabilities {
                queue_next: true,
                ..Capabilities::none()
            }
            .bits(),
            2
        );
        assert!(Capabilities::none().is_empty());
    }

    #[test]
    fn queue_modes_follow_their_flags() {
        let next_only = Capabilities {
            queue_next: true,
            ..Capabilities::none()
        };
        assert!(next_only.allows_queue(QueueMode::After));
        assert!(!next_only.allows_queue(QueueMode::Before));
        assert!(!Capabilities::none().allows_queue(QueueMode::After));
    }

    #[test]
    fn serializes_as_number() {
        let caps = Capabilities {
            deferred_info: true,
            queue_prev: true,
            queue_next: false,
        };
        assert_eq!(serde_json::to_value(caps).unwrap(), serde_json::json!(5));
        let back: Capabilities = serde_json::from_value(serde_json::json!(13)).unwrap();
        assert_eq!(back, caps);
    }
}
