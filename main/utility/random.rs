use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// A deterministic random source. Every host gets its own, derived from the
/// global seed, so that host behavior is independent of scheduling order.
pub struct Random(Xoshiro256PlusPlus);

impl Random {
    /// Xoshiro256PlusPlus is not ideal when a seed with many zeros is used, but
    /// `seed_from_u64()` uses SplitMix64 to derive the actual seed, so we are okay here.
    pub fn new(seed: u64) -> Self {
        Self(Xoshiro256PlusPlus::seed_from_u64(seed))
    }
}

impl RngCore for Random {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.0.try_fill_bytes(dest)
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    #[test]
    fn test_determinism() {
        let mut a = Random::new(42);
        let mut b = Random::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }

        let mut c = Random::new(43);
        let vals_a: Vec<u64> = (0..10).map(|_| a.next_u64()).collect();
        let vals_c: Vec<u64> = (0..10).map(|_| c.next_u64()).collect();
        assert_ne!(vals_a, vals_c);
    }

    #[test]
    fn test_gen_range() {
        let mut rng = Random::new(7);
        for _ in 0..1000 {
            let x: f64 = rng.gen();
            assert!((0.0..1.0).contains(&x));
        }
    }
}
