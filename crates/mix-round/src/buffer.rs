use std::sync::atomic::{AtomicU64, Ordering};

use mix_cryptops::IntBuffer;

/// Per-round key material shared by every phase graph of the round.
///
/// Each key is `g^e` for a secret exponent `e` kept next to it. Realtime
/// phases multiply the keys in; precomputation phases fold in `K^-e`, the
/// key's inverse under the shared cypher key `K`, which only the reveal
/// chain can strip again.
///
/// Precomputation phases write these once; realtime phases only read them.
/// All buffers span `capacity` (the largest expanded graph batch) so padding
/// positions are always addressable. Keys start at the group identity with
/// exponent 0 and the permutation starts as the identity map.
#[derive(Debug)]
pub struct RoundBuffer {
    batch_size: u32,
    capacity: u32,

    /// Decrypt keys, by arrival position.
    pub r: IntBuffer,
    pub r_exp: IntBuffer,
    /// Permute keys, by destination position.
    pub s: IntBuffer,
    pub s_exp: IntBuffer,
    /// Encrypt keys, by final position.
    pub t: IntBuffer,
    pub t_exp: IntBuffer,
    pub permutation: IntBuffer,
    /// Revealed product of every inverse key, kept by the last node for
    /// identify.
    pub precomputation: IntBuffer,

    z: AtomicU64,
    cypher_public_key: AtomicU64,
}

impl RoundBuffer {
    pub fn new(batch_size: u32, capacity: u32) -> Self {
        let len = capacity as usize;
        let permutation = IntBuffer::new(len, 0);
        for i in 0..len {
            permutation.set(i, i as u64);
        }
        Self {
            batch_size,
            capacity,
            r: IntBuffer::new(len, 1),
            r_exp: IntBuffer::new(len, 0),
            s: IntBuffer::new(len, 1),
            s_exp: IntBuffer::new(len, 0),
            t: IntBuffer::new(len, 1),
            t_exp: IntBuffer::new(len, 0),
            permutation,
            precomputation: IntBuffer::new(len, 1),
            z: AtomicU64::new(0),
            cypher_public_key: AtomicU64::new(0),
        }
    }

    /// Real (unpadded) batch size of the round.
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Destination of position `index` under this node's permutation.
    pub fn permuted(&self, index: usize) -> usize {
        self.permutation.get(index) as usize
    }

    /// Secret exponent for the shared key, coprime to the group order.
    pub fn z(&self) -> u64 {
        self.z.load(Ordering::Acquire)
    }

    pub fn set_z(&self, z: u64) {
        self.z.store(z, Ordering::Release);
    }

    pub fn cypher_public_key(&self) -> u64 {
        self.cypher_public_key.load(Ordering::Acquire)
    }

    pub fn set_cypher_public_key(&self, key: u64) {
        self.cypher_public_key.store(key, Ordering::Release);
    }
}
