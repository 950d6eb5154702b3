//! Stateless primitives invoked by module adapters.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{CryptoError, Result};
use crate::group::CyclicGroup;

fn check(grp: &CyclicGroup, value: u64) -> Result<u64> {
    if grp.inside(value) {
        Ok(value)
    } else {
        Err(CryptoError::OutsideOfGroup { value })
    }
}

/// `x · y`
pub fn mul2(grp: &CyclicGroup, x: u64, y: u64) -> Result<u64> {
    Ok(grp.mul(check(grp, x)?, check(grp, y)?))
}

/// `base ^ exponent`
pub fn exp(grp: &CyclicGroup, base: u64, exponent: u64) -> Result<u64> {
    Ok(grp.exp(check(grp, base)?, exponent))
}

pub fn inverse(grp: &CyclicGroup, value: u64) -> Result<u64> {
    Ok(grp.inverse(check(grp, value)?))
}

/// `x^(1/e)` for an exponent coprime to the group order.
pub fn root_coprime(grp: &CyclicGroup, x: u64, e: u64) -> Result<u64> {
    let inv = grp
        .invert_exponent(e)
        .ok_or(CryptoError::NotInvertible { exponent: e })?;
    Ok(grp.exp(check(grp, x)?, inv))
}

/// Random key `g^e` together with `e`.
pub fn generate<R: Rng + ?Sized>(grp: &CyclicGroup, rng: &mut R) -> (u64, u64) {
    let e = grp.random_exponent(rng);
    (grp.exp(grp.generator(), e), e)
}

/// Uniform permutation of `0..len`.
pub fn shuffle<R: Rng + ?Sized>(rng: &mut R, len: u32) -> Vec<u32> {
    let mut perm: Vec<u32> = (0..len).collect();
    perm.shuffle(rng);
    perm
}
