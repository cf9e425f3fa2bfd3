use std::time::{Duration, Instant};

use bloomfilter::Bloom;
use log::debug;

use crate::config::ServerType;

// Entries and false positive rates, the same as shadowsocks-libev's `ppbloom`
const BF_NUM_ENTRIES_FOR_SERVER: usize = 1_000_000;
const BF_NUM_ENTRIES_FOR_CLIENT: usize = 10_000;
const BF_ERROR_RATE_FOR_SERVER: f64 = 1e-6;
const BF_ERROR_RATE_FOR_CLIENT: f64 = 1e-15;

// A filter is never dropped before it has been the older one for this long
const MIN_RETENTION: Duration = Duration::from_secs(60);

// Two Bloom filters used as a ring of generations.
//
// Inserts go to the current generation. When it is full, and the previous generation has been
// around for at least `MIN_RETENTION`, the previous one is cleared and becomes current.
#[derive(Debug)]
pub struct PingPongBloom {
    blooms: [Bloom<[u8]>; 2],
    bloom_count: [usize; 2],
    item_count: usize,
    current: usize,
    current_since: Instant,
}

impl PingPongBloom {
    pub fn new(ty: ServerType) -> PingPongBloom {
        let (item_count, fp_p) = if ty.is_local() {
            (BF_NUM_ENTRIES_FOR_CLIENT, BF_ERROR_RATE_FOR_CLIENT)
        } else {
            (BF_NUM_ENTRIES_FOR_SERVER, BF_ERROR_RATE_FOR_SERVER)
        };

        let item_count = item_count / 2;

        PingPongBloom {
            blooms: [
                Bloom::new_for_fp_rate(item_count, fp_p).expect("BloomFilter1"),
                Bloom::new_for_fp_rate(item_count, fp_p).expect("BloomFilter2"),
            ],
            bloom_count: [0, 0],
            item_count,
            current: 0,
            current_since: Instant::now(),
        }
    }

    // Returns `true` if `buf` was already in one of the filters, otherwise remembers it.
    pub fn check_and_set(&mut self, buf: &[u8]) -> bool {
        if self.blooms.iter().any(|bloom| bloom.check(buf)) {
            return true;
        }

        if self.bloom_count[self.current] >= self.item_count && self.current_since.elapsed() >= MIN_RETENTION {
            self.current = (self.current + 1) % 2;
            self.current_since = Instant::now();

            self.bloom_count[self.current] = 0;
            self.blooms[self.current].clear();

            debug!(
                "bloom filter based replay protector full, each capacity: {}, total filters: {}",
                self.item_count,
                self.blooms.len(),
            );
        }

        // Every filter has to be checked before setting
        self.blooms[self.current].set(buf);
        self.bloom_count[self.current] += 1;

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_generation_is_retained() {
        let mut bloom = PingPongBloom::new(ServerType::Local);
        let capacity = bloom.item_count;

        for i in 0..capacity * 2 {
            let key = (i as u64).to_be_bytes();
            assert!(!bloom.check_and_set(&key));
        }

        // Nothing was dropped within the retention time
        assert!(bloom.check_and_set(&0u64.to_be_bytes()));
        assert_eq!(bloom.current, 0);
    }
}
