//! The process-wide certificate serial number generator.

use lazy_static::lazy_static;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

lazy_static! {
    static ref GENERATOR: Mutex<StdRng> = Mutex::new(StdRng::from_entropy());
}

/// Returns the next certificate serial number.
///
/// Serials are positive 63-bit integers drawn from a process-wide RNG;
/// zero is rejected. Uniqueness across issuances is statistical, the
/// registry does not deduplicate serials.
pub fn next() -> u64 {
    let mut rng = match GENERATOR.lock() {
        Ok(rng) => rng,
        Err(poisoned) => poisoned.into_inner(),
    };
    loop {
        let serial = rng.gen::<u64>() & 0x7fff_ffff_ffff_ffff;
        if serial != 0 {
            return serial;
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    #[test]
    fn serials_are_positive_63_bit() {
        for _ in 0..1000 {
            let serial = super::next();
            assert!(serial > 0);
            assert!(serial < (1 << 63));
        }
    }

    #[test]
    fn serials_do_not_repeat_in_practice() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(super::next()));
        }
    }
}
