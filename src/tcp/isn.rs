//! Initial sequence numbers per rfc6528: ISN = M + F(localip, localport, remoteip, remoteport, secretkey).
//!
//! F is SipHash-2-4 keyed with a random secret chosen at startup, M a clock ticking every 4 microseconds.
use crate::tcp::defs::FourTuple;
use std::time::Instant;

// "somepseudorandomlygeneratedbytes"
const SIP_IV: [u64; 4] = [
    0x736f_6d65_7073_6575,
    0x646f_7261_6e64_6f6d,
    0x6c79_6765_6e65_7261,
    0x7465_6462_7974_6573,
];
const SIP_C: usize = 2;
const SIP_D: usize = 4;

// 4 microseconds per clock tick.
const ISN_CLOCK_MICROS: u128 = 4;

#[derive(Debug)]
struct SipState {
    v: [u64; 4],
}

impl SipState {
    fn new(k0: u64, k1: u64) -> Self {
        Self {
            v: [SIP_IV[0] ^ k0, SIP_IV[1] ^ k1, SIP_IV[2] ^ k0, SIP_IV[3] ^ k1],
        }
    }

    fn round(&mut self) {
        let [v0, v1, v2, v3] = &mut self.v;
        *v0 = v0.wrapping_add(*v1);
        *v1 = v1.rotate_left(13) ^ *v0;
        *v0 = v0.rotate_left(32);
        *v2 = v2.wrapping_add(*v3);
        *v3 = v3.rotate_left(16) ^ *v2;
        *v0 = v0.wrapping_add(*v3);
        *v3 = v3.rotate_left(21) ^ *v0;
        *v2 = v2.wrapping_add(*v1);
        *v1 = v1.rotate_left(17) ^ *v2;
        *v2 = v2.rotate_left(32);
    }

    fn absorb(&mut self, m: u64) {
        self.v[3] ^= m;
        (0..SIP_C).for_each(|_| self.round());
        self.v[0] ^= m;
    }

    fn finalize(mut self) -> u64 {
        self.v[2] ^= 0xff;
        (0..SIP_D).for_each(|_| self.round());
        self.v.iter().fold(0, |acc, v| acc ^ v)
    }
}

#[derive(Debug)]
pub struct IsnGenerator {
    keys: (u64, u64),
    epoch: Instant,
}

impl IsnGenerator {
    pub fn new() -> Self {
        Self::with_keys(rand::random(), rand::random())
    }

    pub fn with_keys(k0: u64, k1: u64) -> Self {
        Self {
            keys: (k0, k1),
            epoch: Instant::now(),
        }
    }

    fn hash(&self, tuple: &FourTuple) -> u64 {
        let mut state = SipState::new(self.keys.0, self.keys.1);
        let addrs =
            u64::from(u32::from(tuple.src_addr)) | u64::from(u32::from(tuple.dst_addr)) << 32;
        // 12 bytes of message, the length goes into the top byte of the last word.
        let ports =
            u64::from(tuple.src_port) | u64::from(tuple.dst_port) << 16 | 12_u64 << 56;
        state.absorb(addrs);
        state.absorb(ports);
        state.finalize()
    }

    pub fn isn(&self, tuple: &FourTuple) -> u32 {
        self.isn_at(tuple, Instant::now())
    }

    pub fn isn_at(&self, tuple: &FourTuple, now: Instant) -> u32 {
        let clock = now.saturating_duration_since(self.epoch).as_micros() / ISN_CLOCK_MICROS;
        (self.hash(tuple) as u32).wrapping_add(clock as u32)
    }
}

impl Default for IsnGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod isn_tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    // SipHash paper, appendix A.
    #[test]
    fn test_siphash_vector() {
        let k0 = u64::from_le_bytes([0, 1, 2, 3, 4, 5, 6, 7]);
        let k1 = u64::from_le_bytes([8, 9, 10, 11, 12, 13, 14, 15]);
        let mut state = SipState::new(k0, k1);
        state.absorb(u64::from_le_bytes([0, 1, 2, 3, 4, 5, 6, 7]));
        state.absorb(u64::from_le_bytes([8, 9, 10, 11, 12, 13, 14, 15]));
        assert_eq!(state.finalize(), 0xa129_ca61_49be_45e5);
    }

    fn tuple(dst_port: u16) -> FourTuple {
        FourTuple {
            src_addr: Ipv4Addr::new(10, 0, 0, 1),
            src_port: 80,
            dst_addr: Ipv4Addr::new(10, 0, 0, 2),
            dst_port,
        }
    }

    #[test]
    fn test_isn_depends_on_tuple_and_key() {
        let generator = IsnGenerator::with_keys(1, 2);
        let now = generator.epoch;
        assert_eq!(
            generator.isn_at(&tuple(5000), now),
            generator.isn_at(&tuple(5000), now)
        );
        assert_ne!(
            generator.isn_at(&tuple(5000), now),
            generator.isn_at(&tuple(5001), now)
        );
        let other = IsnGenerator::with_keys(3, 4);
        assert_ne!(
            generator.isn_at(&tuple(5000), now),
            other.isn_at(&tuple(5000), other.epoch)
        );
    }

    #[test]
    fn test_isn_clock_advances() {
        let generator = IsnGenerator::with_keys(1, 2);
        let start = generator.epoch;
        let base = generator.isn_at(&tuple(5000), start);
        let later = generator.isn_at(&tuple(5000), start + Duration::from_millis(4));
        assert_eq!(later.wrapping_sub(base), 1000);
    }
}
