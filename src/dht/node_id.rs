use super::error::DhtError;
use rand::Rng as _;
use std::fmt;
use std::ops::BitXor;

pub const ID_LEN: usize = 20;
pub const ID_BITS: usize = ID_LEN * 8;

/// A 160-bit DHT identifier.
///
/// Node ids and info-hashes share this space. The derived ordering is
/// lexicographic over the bytes, which is the same as comparing the ids as
/// big-endian integers; XOR distances are `NodeId`s too and compare the same
/// way.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    pub const ZERO: NodeId = NodeId([0; ID_LEN]);
    pub const MAX: NodeId = NodeId([0xff; ID_LEN]);

    pub fn generate() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; ID_LEN] = bytes.try_into().map_err(|_| DhtError::InvalidNodeId)?;
        Ok(Self(id))
    }

    /// Lookup target for an info-hash. The two share the id space, so this is a cast.
    pub fn from_info_hash(info_hash: [u8; ID_LEN]) -> Self {
        Self(info_hash)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// XOR distance between two ids.
    pub fn distance(&self, other: &NodeId) -> NodeId {
        *self ^ *other
    }

    /// Value of bit `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub(crate) fn with_bit(mut self, index: usize, value: bool) -> Self {
        let mask = 0x80 >> (index % 8);
        if value {
            self.0[index / 8] |= mask;
        } else {
            self.0[index / 8] &= !mask;
        }
        self
    }

    /// Whether the first `bits` bits of both ids are equal.
    pub fn shares_prefix(&self, other: &NodeId, bits: usize) -> bool {
        let full = bits / 8;
        if self.0[..full] != other.0[..full] {
            return false;
        }
        let rest = bits % 8;
        if rest == 0 {
            return true;
        }
        let mask = !(0xffu8 >> rest);
        (self.0[full] ^ other.0[full]) & mask == 0
    }

    /// A random id whose first `bits` bits are copied from `prefix`.
    pub fn random_with_prefix(prefix: &NodeId, bits: usize) -> Self {
        let mut id = Self::generate();
        for i in 0..bits.min(ID_BITS) {
            id = id.with_bit(i, prefix.bit(i));
        }
        id
    }

    /// Number of leading zero bits; 160 for the zero id.
    pub fn leading_zeros(&self) -> usize {
        self.0
            .iter()
            .position(|&b| b != 0)
            .map(|i| i * 8 + self.0[i].leading_zeros() as usize)
            .unwrap_or(ID_BITS)
    }
}

impl BitXor for NodeId {
    type Output = NodeId;

    fn bitxor(self, rhs: NodeId) -> NodeId {
        let mut out = [0u8; ID_LEN];
        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(rhs.0.iter())) {
            *o = a ^ b;
        }
        NodeId(out)
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
