//! Reserved-bytes extension bitmask exchanged in the BitTorrent handshake
//! (spec.md §4.I phase 8), grounded on `bip_handshake::message::extensions`.

use nom::bytes::complete::take;
use nom::IResult;

pub const NUM_EXTENSION_BYTES: usize = 8;

/// A reserved-bit extension this client advertises or a peer advertised.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Extension {
    /// BEP 10 extension protocol, reserved bit 20 (counting from the most
    /// significant bit of byte 5).
    ExtensionProtocol = 43,
    /// BEP 6 fast extension.
    Fast = 61,
    /// BEP 5 DHT port message.
    Dht = 63,
}

/// The 8 reserved handshake bytes, interpreted as a 64-bit flag set.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Extensions {
    bytes: [u8; NUM_EXTENSION_BYTES],
}

impl Extensions {
    pub fn new() -> Extensions {
        Extensions::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> IResult<&[u8], Extensions> {
        let (rest, raw) = take(NUM_EXTENSION_BYTES)(bytes)?;
        let mut arr = [0u8; NUM_EXTENSION_BYTES];
        arr.copy_from_slice(raw);
        Ok((rest, Extensions { bytes: arr }))
    }

    pub fn add(&mut self, extension: Extension) {
        let (byte_index, bit_index) = Self::position(extension);
        self.bytes[byte_index] |= 0x80 >> bit_index;
    }

    pub fn remove(&mut self, extension: Extension) {
        let (byte_index, bit_index) = Self::position(extension);
        self.bytes[byte_index] &= !(0x80 >> bit_index);
    }

    pub fn contains(&self, extension: Extension) -> bool {
        let (byte_index, bit_index) = Self::position(extension);
        self.bytes[byte_index] & (0x80 >> bit_index) != 0
    }

    fn position(extension: Extension) -> (usize, usize) {
        let bit = extension as usize;
        (bit / 8, bit % 8)
    }

    pub fn write_bytes(&self) -> [u8; NUM_EXTENSION_BYTES] {
        self.bytes
    }

    /// Extensions both sides support.
    pub fn intersect(&self, other: &Extensions) -> Extensions {
        let mut result = Extensions::new();
        for i in 0..NUM_EXTENSION_BYTES {
            result.bytes[i] = self.bytes[i] & other.bytes[i];
        }
        result
    }
}

impl From<[u8; NUM_EXTENSION_BYTES]> for Extensions {
    fn from(bytes: [u8; NUM_EXTENSION_BYTES]) -> Extensions {
        Extensions { bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_add_remove_contains_round_trip() {
        let mut ext = Extensions::new();
        assert!(!ext.contains(Extension::ExtensionProtocol));

        ext.add(Extension::ExtensionProtocol);
        assert!(ext.contains(Extension::ExtensionProtocol));

        ext.remove(Extension::ExtensionProtocol);
        assert!(!ext.contains(Extension::ExtensionProtocol));
    }

    #[test]
    fn positive_intersect_keeps_shared_bits_only() {
        let mut a = Extensions::new();
        a.add(Extension::ExtensionProtocol);
        a.add(Extension::Fast);

        let mut b = Extensions::new();
        b.add(Extension::ExtensionProtocol);

        let both = a.intersect(&b);
        assert!(both.contains(Extension::ExtensionProtocol));
        assert!(!both.contains(Extension::Fast));
    }

    #[test]
    fn positive_wire_round_trip() {
        let mut ext = Extensions::new();
        ext.add(Extension::Dht);
        let bytes = ext.write_bytes();

        let (rest, parsed) = Extensions::from_bytes(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, ext);
    }
}
