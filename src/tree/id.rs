use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use chrono::Utc;
use uuid::Uuid;

use super::NodeId;

const COUNTER_MASK: u32 = 0x00ff_ffff;

/// Generates 24-character hex ids laid out as
/// `seconds (4 bytes) | process random (5 bytes) | counter (3 bytes)`.
///
/// Ids from one generator sort by creation second; within a second the
/// counter keeps them unique.
pub struct NodeIdGenerator {
    process: [u8; 5],
    counter: AtomicU32,
}

impl NodeIdGenerator {
    /// Create a generator with fresh random process bytes and counter start
    pub fn new() -> Self {
        let seed = Uuid::new_v4();
        let bytes = seed.as_bytes();
        let mut process = [0u8; 5];
        process.copy_from_slice(&bytes[..5]);
        let start = u32::from_be_bytes([0, bytes[5], bytes[6], bytes[7]]);

        Self {
            process,
            counter: AtomicU32::new(start),
        }
    }

    /// Allocate the next id
    pub fn next_id(&self) -> NodeId {
        let seconds = Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        self.format(seconds, self.counter.fetch_add(1, Ordering::Relaxed))
    }

    fn format(&self, seconds: u32, counter: u32) -> NodeId {
        let counter = counter & COUNTER_MASK;
        let mut id = String::with_capacity(24);
        for byte in seconds.to_be_bytes() {
            id.push_str(&format!("{:02x}", byte));
        }
        for byte in self.process {
            id.push_str(&format!("{:02x}", byte));
        }
        for byte in &counter.to_be_bytes()[1..] {
            id.push_str(&format!("{:02x}", byte));
        }
        id
    }
}

impl Default for NodeIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate an id from the process-wide generator
pub fn generate_node_id() -> NodeId {
    static GENERATOR: OnceLock<NodeIdGenerator> = OnceLock::new();
    GENERATOR.get_or_init(NodeIdGenerator::new).next_id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_id_shape() {
        let id = generate_node_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_ids_are_unique() {
        let generator = NodeIdGenerator::new();
        let ids: HashSet<NodeId> = (0..10_000).map(|_| generator.next_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_layout_and_ordering_by_time() {
        let generator = NodeIdGenerator {
            process: [0xaa, 0xbb, 0xcc, 0xdd, 0xee],
            counter: AtomicU32::new(0),
        };

        let early = generator.format(0x0000_0001, 0x00ff_ffff);
        let late = generator.format(0x0000_0002, 0);

        assert_eq!(early, "00000001aabbccddeeffffff");
        assert_eq!(late, "00000002aabbccddee000000");
        assert!(early < late);
    }

    #[test]
    fn test_counter_wraps_within_three_bytes() {
        let generator = NodeIdGenerator {
            process: [0; 5],
            counter: AtomicU32::new(COUNTER_MASK),
        };
        assert!(generator.format(5, 0x0100_0000).ends_with("000000"));
    }
}
