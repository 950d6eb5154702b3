use rand::Rng;

use mix_types::config::GroupConfig;

use crate::error::{CryptoError, Result};

/// Multiplicative group of integers modulo a prime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclicGroup {
    prime: u64,
    generator: u64,
}

impl CyclicGroup {
    pub fn new(prime: u64, generator: u64) -> Result<Self> {
        if prime < 5 || prime >= 1u64 << 63 {
            return Err(CryptoError::InvalidGroup(format!("prime {prime} out of range")));
        }
        if generator <= 1 || generator >= prime {
            return Err(CryptoError::InvalidGroup(format!(
                "generator {generator} must lie in (1, {prime})"
            )));
        }
        Ok(Self { prime, generator })
    }

    pub fn from_config(config: &GroupConfig) -> Result<Self> {
        Self::new(config.prime, config.generator)
    }

    pub fn prime(&self) -> u64 {
        self.prime
    }

    pub fn generator(&self) -> u64 {
        self.generator
    }

    /// True for `1..prime`.
    pub fn inside(&self, value: u64) -> bool {
        value >= 1 && value < self.prime
    }

    pub fn mul(&self, a: u64, b: u64) -> u64 {
        ((a as u128 * b as u128) % self.prime as u128) as u64
    }

    pub fn exp(&self, base: u64, exponent: u64) -> u64 {
        let mut result = 1u64;
        let mut base = base % self.prime;
        let mut e = exponent;
        while e > 0 {
            if e & 1 == 1 {
                result = self.mul(result, base);
            }
            base = self.mul(base, base);
            e >>= 1;
        }
        result
    }

    /// Fermat inverse; `value` must be inside the group.
    pub fn inverse(&self, value: u64) -> u64 {
        self.exp(value, self.prime - 2)
    }

    /// Uniform element of `1..prime`.
    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        rng.gen_range(1..self.prime)
    }

    /// Uniform exponent of `1..prime-1`.
    pub fn random_exponent<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        rng.gen_range(1..self.prime - 1)
    }

    /// Uniform exponent coprime to the group order, so its root exists.
    pub fn random_coprime_exponent<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        loop {
            let e = self.random_exponent(rng);
            if self.invert_exponent(e).is_some() {
                return e;
            }
        }
    }

    /// Order of the multiplicative group, `prime - 1`.
    pub fn order(&self) -> u64 {
        self.prime - 1
    }

    /// `-e mod order`: raising to it undoes raising to `e`.
    pub fn negate_exponent(&self, e: u64) -> u64 {
        let n = self.order();
        (n - e % n) % n
    }

    /// `e⁻¹ mod order`, or `None` when `e` shares a factor with the order.
    pub fn invert_exponent(&self, e: u64) -> Option<u64> {
        let n = i128::from(self.order());
        let (mut old_r, mut r) = (i128::from(e) % n, n);
        let (mut old_s, mut s) = (1i128, 0i128);
        while r != 0 {
            let q = old_r / r;
            (old_r, r) = (r, old_r - q * r);
            (old_s, s) = (s, old_s - q * s);
        }
        if old_r != 1 {
            return None;
        }
        u64::try_from(old_s.rem_euclid(n)).ok()
    }
}
