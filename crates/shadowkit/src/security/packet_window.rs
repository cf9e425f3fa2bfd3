//! Sliding window over received packet IDs
//!
//! The same bitmap ring as WireGuard's replay filter: the window covers the last
//! `(RING_BLOCKS - 1) * 64` packet IDs below the highest one seen.

const BLOCK_BIT_LOG: u64 = 6;
const BLOCK_BITS: u64 = 1 << BLOCK_BIT_LOG;
const RING_BLOCKS: u64 = 1 << 7;
const WINDOW_SIZE: u64 = (RING_BLOCKS - 1) * BLOCK_BITS;
const BLOCK_MASK: u64 = RING_BLOCKS - 1;
const BIT_MASK: u64 = BLOCK_BITS - 1;

/// Rejects packet IDs that were already received, or that fell behind the window
#[derive(Debug, Clone)]
pub struct PacketWindowFilter {
    highest: u64,
    ring: [u64; RING_BLOCKS as usize],
}

impl Default for PacketWindowFilter {
    fn default() -> PacketWindowFilter {
        PacketWindowFilter::new()
    }
}

impl PacketWindowFilter {
    /// Create an empty filter
    pub fn new() -> PacketWindowFilter {
        PacketWindowFilter {
            highest: 0,
            ring: [0u64; RING_BLOCKS as usize],
        }
    }

    /// Forget every packet ID
    pub fn reset(&mut self) {
        self.highest = 0;
        self.ring = [0u64; RING_BLOCKS as usize];
    }

    /// Remember `packet_id`, returns `false` if it is a replay or too old
    ///
    /// IDs `>= limit` are always rejected.
    pub fn validate_packet_id(&mut self, packet_id: u64, limit: u64) -> bool {
        if packet_id >= limit {
            return false;
        }

        let block = packet_id >> BLOCK_BIT_LOG;
        if packet_id > self.highest {
            let current = self.highest >> BLOCK_BIT_LOG;
            let advance = (block - current).min(RING_BLOCKS);
            for i in current + 1..=current + advance {
                self.ring[(i & BLOCK_MASK) as usize] = 0;
            }
            self.highest = packet_id;
        } else if self.highest - packet_id > WINDOW_SIZE {
            return false;
        }

        let slot = &mut self.ring[(block & BLOCK_MASK) as usize];
        let bit = 1u64 << (packet_id & BIT_MASK);
        let fresh = *slot & bit == 0;
        *slot |= bit;
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicates() {
        let mut filter = PacketWindowFilter::new();
        assert!(filter.validate_packet_id(0, u64::MAX));
        assert!(filter.validate_packet_id(1, u64::MAX));
        assert!(!filter.validate_packet_id(1, u64::MAX));
        assert!(!filter.validate_packet_id(0, u64::MAX));
    }

    #[test]
    fn accepts_out_of_order_inside_window() {
        let mut filter = PacketWindowFilter::new();
        assert!(filter.validate_packet_id(100, u64::MAX));
        assert!(filter.validate_packet_id(50, u64::MAX));
        assert!(filter.validate_packet_id(99, u64::MAX));
        assert!(!filter.validate_packet_id(50, u64::MAX));
    }

    #[test]
    fn rejects_behind_window_and_over_limit() {
        let mut filter = PacketWindowFilter::new();
        assert!(filter.validate_packet_id(WINDOW_SIZE + 10, u64::MAX));
        assert!(!filter.validate_packet_id(5, u64::MAX));
        assert!(!filter.validate_packet_id(10, 10));
    }

    #[test]
    fn jump_clears_old_bits() {
        let mut filter = PacketWindowFilter::new();
        assert!(filter.validate_packet_id(1, u64::MAX));
        let far = 1 + RING_BLOCKS * BLOCK_BITS;
        assert!(filter.validate_packet_id(far, u64::MAX));
        assert!(filter.validate_packet_id(far - 64, u64::MAX));
    }
}
