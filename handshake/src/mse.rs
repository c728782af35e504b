//! Message Stream Encryption key exchange and obfuscation (spec.md §4.I
//! phase 2 "Encryption key exchange"), grounded on the MSE specification's
//! fixed 768-bit Diffie-Hellman parameters and key-derivation formula, with
//! no teacher precedent (`bip_handshake` has no MSE support) — built from
//! `num-bigint` for the modular exponentiation and the `rc4` RustCrypto
//! crate for the obfuscation stream, the way `Luminarys-synapse`'s manifest
//! reaches for `num-bigint`/`num-traits` for the same DH step.

use num_bigint::BigUint;
use num_traits::Num;
use rand::RngCore;
use rc4::{KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};

/// The fixed 768-bit prime specified by MSE (`P`).
const MSE_PRIME_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED";

/// Generator (`G`).
const MSE_GENERATOR: u32 = 2;

/// Byte width of a `Y` value (`P`'s bit length rounded up to a byte count).
pub const DH_KEY_LEN: usize = 96;

fn prime() -> BigUint {
    BigUint::from_str_radix(MSE_PRIME_HEX, 16).expect("MSE_PRIME_HEX is a fixed, valid hex literal")
}

/// One side's Diffie-Hellman keypair for the MSE exchange.
pub struct DiffieHellman {
    private: BigUint,
    public: BigUint,
}

impl DiffieHellman {
    /// Generate a fresh keypair with a 160-bit private exponent, the
    /// minimum MSE recommends.
    pub fn generate(rng: &mut impl RngCore) -> DiffieHellman {
        let mut private_bytes = [0u8; 20];
        rng.fill_bytes(&mut private_bytes);
        let private = BigUint::from_bytes_be(&private_bytes);
        let public = BigUint::from(MSE_GENERATOR).modpow(&private, &prime());

        DiffieHellman { private, public }
    }

    /// `Y = g^x mod p`, left-padded to `DH_KEY_LEN` bytes (spec.md §4.I
    /// phase 2 "each side sends Y ... (96 bytes)").
    pub fn public_key_bytes(&self) -> [u8; DH_KEY_LEN] {
        to_fixed_bytes(&self.public)
    }

    /// Derive the shared secret `S = Y_other^x mod p` from the peer's
    /// public key bytes.
    pub fn shared_secret(&self, their_public: &[u8]) -> [u8; DH_KEY_LEN] {
        let their_public = BigUint::from_bytes_be(their_public);
        let secret = their_public.modpow(&self.private, &prime());
        to_fixed_bytes(&secret)
    }
}

fn to_fixed_bytes(value: &BigUint) -> [u8; DH_KEY_LEN] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; DH_KEY_LEN];
    let start = DH_KEY_LEN.saturating_sub(bytes.len());
    out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(DH_KEY_LEN)..]);
    out
}

/// `HASH('req1' | S)`, used by the initiator to locate the start of the
/// responder's reply in the undifferentiated stream (spec.md §4.I phase 3).
pub fn req1_hash(secret: &[u8]) -> [u8; 20] {
    keyed_hash(b"req1", secret, &[])
}

/// `HASH('req2' | SKEY)`, XORed by the responder against the incoming
/// bytes to recover `HASH('req3' | S)` and thereby the obfuscated
/// info-hash (spec.md §4.I phase 4).
pub fn req2_hash(skey: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(b"req2");
    hasher.update(skey);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub fn req3_hash(secret: &[u8]) -> [u8; 20] {
    keyed_hash(b"req3", secret, &[])
}

fn keyed_hash(label: &[u8], secret: &[u8], extra: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(label);
    hasher.update(secret);
    hasher.update(extra);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Which side of the connection a derived RC4 keystream encrypts for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    /// `HASH('keyA' | S | SKEY)` — the initiator's outgoing stream.
    Initiator,
    /// `HASH('keyB' | S | SKEY)` — the responder's outgoing stream.
    Responder,
}

/// Derive the RC4 key for `side`'s outgoing stream and construct a cipher
/// with the mandatory first-1024-bytes discard already applied (spec.md
/// §4.I phase 2 "each RC4 stream discards its first 1024 bytes").
pub fn derive_rc4(side: Side, secret: &[u8], info_hash: &[u8]) -> Rc4<rc4::consts::U20> {
    let label: &[u8] = match side {
        Side::Initiator => b"keyA",
        Side::Responder => b"keyB",
    };
    let key = keyed_hash(label, secret, info_hash);

    let mut cipher = Rc4::new((&key).into());
    let mut discard = [0u8; 1024];
    cipher.apply_keystream(&mut discard);
    cipher
}

/// Encrypts an all-zero VC with the stream the responder's reply will open
/// with (`Side::Responder`), so the initiator can predict those bytes and
/// locate the start of the responder's reply in an otherwise
/// undifferentiated stream without decrypting anything first (spec.md
/// §4.I phase 3; grounded on `handshake_encryption.cc`'s
/// `encrypt_vc_to_sync`, lines 123–144).
pub fn encrypt_vc_to_sync(secret: &[u8], info_hash: &[u8]) -> [u8; 8] {
    let mut cipher = derive_rc4(Side::Responder, secret, info_hash);
    let mut vc = [0u8; 8];
    cipher.apply_keystream(&mut vc);
    vc
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn positive_both_sides_derive_the_same_shared_secret() {
        let mut rng = thread_rng();
        let a = DiffieHellman::generate(&mut rng);
        let b = DiffieHellman::generate(&mut rng);

        let secret_a = a.shared_secret(&b.public_key_bytes());
        let secret_b = b.shared_secret(&a.public_key_bytes());

        assert_eq!(secret_a, secret_b);
    }

    #[test]
    fn positive_keyA_and_keyB_derive_different_keys() {
        let secret = [7u8; DH_KEY_LEN];
        let info_hash = [1u8; 20];

        let mut a = derive_rc4(Side::Initiator, &secret, &info_hash);
        let mut b = derive_rc4(Side::Responder, &secret, &info_hash);

        let mut buf_a = [0u8; 16];
        let mut buf_b = [0u8; 16];
        a.apply_keystream(&mut buf_a);
        b.apply_keystream(&mut buf_b);

        assert_ne!(buf_a, buf_b);
    }

    #[test]
    fn positive_encrypt_vc_to_sync_matches_a_fresh_responder_stream() {
        let secret = [3u8; DH_KEY_LEN];
        let info_hash = [5u8; 20];

        let needle = encrypt_vc_to_sync(&secret, &info_hash);

        let mut responder_stream = derive_rc4(Side::Responder, &secret, &info_hash);
        let mut expected = [0u8; 8];
        responder_stream.apply_keystream(&mut expected);

        assert_eq!(needle, expected);
    }

    #[test]
    fn positive_initiator_and_responder_streams_are_mirror_images() {
        // What the initiator encrypts with `derive_rc4(Responder, ...)`
        // (the stream it expects back) must match what the responder
        // produces with its own `derive_rc4(Responder, ...)` call.
        let secret = [9u8; DH_KEY_LEN];
        let info_hash = [2u8; 20];

        let mut initiator_side = derive_rc4(Side::Responder, &secret, &info_hash);
        let mut responder_side = derive_rc4(Side::Responder, &secret, &info_hash);

        let mut plaintext = *b"hello from responder";
        let mut expected = plaintext;

        responder_side.apply_keystream(&mut plaintext);
        initiator_side.apply_keystream(&mut expected);

        assert_eq!(plaintext, expected);
    }
}
