use crate::constants::{ID_BIT_COUNT, ID_LEN};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::ops::{BitXor, Sub};

/// 160-bit DHT identifier: node ids, infohashes and BEP-44 targets.
/// XOR distance between two ids is the id of their XOR, compared as a
/// big-endian integer.
#[derive(Clone, Copy, Hash, PartialEq, Eq)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    pub fn new(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Some(Self(bytes.try_into().ok()?))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// BEP-42: derive a node id from the node's WAN address, binding the
    /// top 21 bits to a CRC32C of the masked address.
    pub fn from_ip(addr: &IpAddr, rand_byte: u8) -> Self {
        const CRC32C: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);
        const MASK_V4: [u8; 4] = [0x03, 0x0f, 0x3f, 0xff];
        const MASK_V6: [u8; 8] = [0x01, 0x03, 0x07, 0x0f, 0x1f, 0x3f, 0x7f, 0xff];

        let mut masked: Vec<u8> = match addr {
            IpAddr::V4(v4) => v4
                .octets()
                .iter()
                .zip(MASK_V4.iter())
                .map(|(o, m)| o & m)
                .collect(),
            IpAddr::V6(v6) => v6
                .octets()
                .iter()
                .zip(MASK_V6.iter())
                .map(|(o, m)| o & m)
                .collect(),
        };
        masked[0] |= (rand_byte & 0x07) << 5;

        let crc = CRC32C.checksum(&masked);

        let mut id: [u8; ID_LEN] = rand::random();
        id[0] = (crc >> 24) as u8;
        id[1] = (crc >> 16) as u8;
        id[2] = ((crc >> 8) as u8 & 0xf8) | (id[2] & 0x07);
        id[ID_LEN - 1] = rand_byte;

        Self(id)
    }

    pub fn get_bit(&self, i: usize) -> bool {
        self.0[i / 8] & (0b1000_0000 >> (i % 8)) != 0
    }

    pub fn flip_bit(&mut self, i: usize) {
        self.0[i / 8] ^= 0b1000_0000 >> (i % 8);
    }

    pub fn set_bit(&mut self, i: usize, v: bool) {
        let mask = 0b1000_0000u8 >> (i % 8);
        if v {
            self.0[i / 8] |= mask;
        } else {
            self.0[i / 8] &= !mask;
        }
    }

    /// Index of the first bit where `self` and `other` differ.
    pub fn first_diff_bit_idx(&self, other: &Self) -> Option<usize> {
        for (byte_idx, (l, r)) in self.0.iter().zip(other.0.iter()).enumerate() {
            if l != r {
                return Some(byte_idx * 8 + (l ^ r).leading_zeros() as usize);
            }
        }
        None
    }

    /// Randomize every bit strictly below bit `i`; used to generate lookup
    /// targets inside a bucket's range.
    pub fn randomize_after_bit(&mut self, i: usize) {
        if i >= ID_BIT_COUNT {
            return;
        }

        let mut rng = thread_rng();
        let first_whole_byte = i / 8 + 1;

        for byte in &mut self.0[first_whole_byte.min(ID_LEN)..] {
            *byte = rng.gen();
        }
        for bit in (i + 1)..(first_whole_byte * 8).min(ID_BIT_COUNT) {
            if rng.gen() {
                self.flip_bit(bit);
            }
        }
    }

    /// Whether `a` is XOR-closer to `self` than `b` is.
    pub fn closer_to(&self, a: &NodeId, b: &NodeId) -> bool {
        (a - self) < (b - self)
    }

    pub fn distance_to(&self, other: &NodeId) -> NodeId {
        self ^ other
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = NodeId;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("20 byte string")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<NodeId, E> {
                NodeId::from_slice(v)
                    .ok_or_else(|| serde::de::Error::invalid_length(v.len(), &self))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<NodeId, A::Error> {
                let mut bytes = [0u8; ID_LEN];
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(NodeId(bytes))
            }
        }

        deserializer.deserialize_byte_buf(Visitor)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl<'a, 'b> BitXor<&'b NodeId> for &'a NodeId {
    type Output = NodeId;

    fn bitxor(self, rhs: &'b NodeId) -> NodeId {
        let mut out = [0u8; ID_LEN];
        for (o, (l, r)) in out.iter_mut().zip(self.0.iter().zip(rhs.0.iter())) {
            *o = l ^ r;
        }
        NodeId(out)
    }
}

impl<'a, 'b> Sub<&'b NodeId> for &'a NodeId {
    type Output = NodeId;

    fn sub(self, other: &'b NodeId) -> NodeId {
        self ^ other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn bit_ops() {
        let mut id = NodeId::new([0; ID_LEN]);

        id.set_bit(13 * 8 + 3, true);
        assert!(id.get_bit(13 * 8 + 3));
        assert!(!id.get_bit(13 * 8 + 2));
        assert_eq!(id.0[13], 0b0001_0000);

        id.flip_bit(13 * 8 + 3);
        assert_eq!(id.0[13], 0);
    }

    #[test]
    fn first_diff() {
        let a = NodeId::new([0; ID_LEN]);
        let mut b = a;

        assert_eq!(a.first_diff_bit_idx(&b), None);

        b.flip_bit(42);
        assert_eq!(a.first_diff_bit_idx(&b), Some(42));

        b.flip_bit(100);
        assert_eq!(a.first_diff_bit_idx(&b), Some(42));
    }

    #[test]
    fn xor_distance_orders() {
        let target = NodeId::new([0; ID_LEN]);
        let mut near = target;
        near.flip_bit(159);
        let mut far = target;
        far.flip_bit(0);

        assert!(target.closer_to(&near, &far));
        assert!(!target.closer_to(&far, &near));
        assert!((&near - &target) < (&far - &target));
    }

    #[test]
    fn sub_is_xor() {
        let left = NodeId::random();
        let right = NodeId::random();

        assert_eq!(&left ^ &right, &left - &right);
        assert_eq!(&left ^ &right, &right - &left);
    }

    #[test]
    fn randomize_keeps_prefix() {
        let mut id = NodeId::new([0xff; ID_LEN]);

        for _ in 0..64 {
            id.randomize_after_bit(10);
            assert_eq!(id.0[0], 0xff);
            assert_eq!(id.0[1] & 0b1110_0000, 0b1110_0000);
        }
    }

    // BEP-42 reference: for 124.31.75.21 with rand 1 the CRC-bound prefix
    // is 5fbfbf (first 21 bits).
    #[test]
    fn bep42_reference_vector() {
        let addr = IpAddr::V4(Ipv4Addr::new(124, 31, 75, 21));
        let id = NodeId::from_ip(&addr, 1);

        assert_eq!(id.0[0], 0x5f);
        assert_eq!(id.0[1], 0xbf);
        assert_eq!(id.0[2] & 0xf8, 0xb8);
        assert_eq!(id.0[ID_LEN - 1], 1);
    }

    #[test]
    fn bep42_is_stable_per_ip() {
        let addr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 42));

        let a = NodeId::from_ip(&addr, 7);
        let b = NodeId::from_ip(&addr, 7);

        // First 21 bits are a pure function of (ip, rand).
        assert_eq!(a.0[0], b.0[0]);
        assert_eq!(a.0[1], b.0[1]);
        assert_eq!(a.0[2] & 0xf8, b.0[2] & 0xf8);
        assert_eq!(a.0[ID_LEN - 1], 7);
    }
}
