//! The Mesh Cryptographic Toolbox
//!
//! This contains the security functions listed in the Bluetooth Mesh Profile specification
//! (v1.0 | Section 3.8), built on the AES-128 block cipher. The derivation functions (`s1`,
//! `k1`, `k2`) feed the network layer with its per-network material and the provisioning layer
//! with its session keys, while AES-CCM carries the authenticated encryption of both network
//! PDUs and the provisioning data.
//!
//! The elliptic curve operations for the provisioning key exchange are NIST P-256, performed
//! through `ring`. A mesh public key travels on the wire as the X coordinate followed by the Y
//! coordinate, both big-endian, without the uncompressed-point indicator octet.
//!
//! All functions here are pure and reentrant; none of them suspend.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use rand_core::{OsRng, RngCore};
use ring::agreement;

use core::fmt;

/// Key size, in bytes, of every symmetric key used by the mesh
pub const KEY_LEN: usize = 16;

/// Size, in bytes, of an AES-CCM nonce
pub const NONCE_LEN: usize = 13;

const BLOCK_LEN: usize = 16;

/// The all-zero key used by [`s1`] and as the No-OOB authentication value
pub const ZERO_KEY: [u8; KEY_LEN] = [0u8; KEY_LEN];

/// The identifier for an uncompressed public key
const UNCOMPRESSED_PUB_KEY_TYPE: u8 = 0x4;

const PUB_KEY_BYTE_LEN: usize = 65;

/// The range in the public key bytes of the x part of the coordinate
const PUB_KEY_X_RANGE: core::ops::Range<usize> = 1..33;

/// The range in the public key bytes of the y part of the coordinate
const PUB_KEY_Y_RANGE: core::ops::Range<usize> = 33..65;

/// The private key type
pub type PrivateKey = agreement::EphemeralPrivateKey;

/// The public key type
pub type PublicKey = agreement::PublicKey;

/// A peer public key as received over the provisioning bearer
pub type PeerPublicKey = agreement::UnparsedPublicKey<Vec<u8>>;

/// Errors of the non-deterministic toolbox functions
///
/// The deterministic functions never fail. Anything here is fatal to the session that invoked
/// the operation; none of these leave partial output behind.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum CryptoError {
    /// The system random number generator failed to produce a P-256 key pair
    KeyGeneration,
    /// The peer public key is not a valid point on the P-256 curve
    InvalidPeerKey,
    /// An AES-CCM message authentication code did not match its content
    MicMismatch,
    /// An AES-CCM input was shorter than the expected message integrity code
    TruncatedCiphertext,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CryptoError::KeyGeneration => write!(f, "failed to generate a P-256 key pair"),
            CryptoError::InvalidPeerKey => write!(f, "peer public key is not on the P-256 curve"),
            CryptoError::MicMismatch => write!(f, "message integrity check failed"),
            CryptoError::TruncatedCiphertext => write!(f, "ciphertext shorter than its integrity code"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// The two message integrity code widths used by the mesh
///
/// Access payloads are authenticated with a 32 bit MIC while control payloads and the
/// provisioning data get the 64 bit MIC.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum MicSize {
    Small,
    Big,
}

impl MicSize {
    pub fn byte_size(self) -> usize {
        match self {
            MicSize::Small => 4,
            MicSize::Big => 8,
        }
    }
}

/// Security function *e*
///
/// AES-128 block encryption of `block` under `key`, both in big-endian order. This is the only
/// place the block cipher is used directly; the network layer uses it to produce the privacy
/// ECB for header obfuscation.
pub fn e(key: &[u8; KEY_LEN], mut block: [u8; BLOCK_LEN]) -> [u8; BLOCK_LEN] {
    let cipher = Aes128::new(GenericArray::from_slice(key));

    cipher.encrypt_block((&mut block).into());

    block
}

/// AES-CMAC per RFC 4493
pub fn aes_cmac(key: &[u8; KEY_LEN], msg: &[u8]) -> [u8; KEY_LEN] {
    // a 16 byte key can never be rejected
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key.as_ref()).unwrap();

    mac.update(msg);

    mac.finalize().into_bytes().into()
}

/// The SALT generation function `s1`
pub fn s1(m: &[u8]) -> [u8; KEY_LEN] {
    aes_cmac(&ZERO_KEY, m)
}

/// The key derivation function `k1`
///
/// Derives a new key from `n`, a salt, and the non-secret differentiator `p` (the mesh uses
/// ASCII labels such as `"prck"` for `p`).
pub fn k1(n: &[u8], salt: &[u8; KEY_LEN], p: &[u8]) -> [u8; KEY_LEN] {
    let t = aes_cmac(salt, n);

    aes_cmac(&t, p)
}

/// The network key material derivation function `k2`
///
/// Produces the 7 bit nid, the encryption key, and the privacy key for a network key `n`. The
/// master security credentials use `p = [0x00]`.
pub fn k2(n: &[u8; KEY_LEN], p: &[u8]) -> (u8, [u8; KEY_LEN], [u8; KEY_LEN]) {
    let salt = s1(b"smk2");

    let t = aes_cmac(&salt, n);

    let t1 = aes_cmac(&t, &[p, &[0x01][..]].concat());
    let t2 = aes_cmac(&t, &[&t1[..], p, &[0x02][..]].concat());
    let t3 = aes_cmac(&t, &[&t2[..], p, &[0x03][..]].concat());

    (t1[15] & 0x7F, t2, t3)
}

/// Fill `bytes` from the system cryptographically secure random number generator
pub fn fill_random(bytes: &mut [u8]) {
    OsRng.fill_bytes(bytes);
}

/// Generate `count` cryptographically secure random bytes
pub fn random(count: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; count];

    fill_random(&mut bytes);

    bytes
}

/// The CBC-MAC half of CCM, producing the untruncated pre-MIC block
fn ccm_mac(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    payload: &[u8],
    aad: &[u8],
    mic_size: MicSize,
) -> [u8; BLOCK_LEN] {
    debug_assert!(payload.len() <= usize::from(u16::max_value()));

    // B_0 flags: Adata bit, 3 bits of encoded MIC length, 3 bits of encoded length-field
    // width. The 13 byte nonce fixes the length field at 2 bytes.
    let mut b0 = [0u8; BLOCK_LEN];

    let adata_flag = if aad.is_empty() { 0x00 } else { 0x40 };

    b0[0] = adata_flag | (((mic_size.byte_size() as u8 - 2) / 2) << 3) | 0x01;
    b0[1..14].copy_from_slice(nonce);
    b0[14..16].copy_from_slice(&(payload.len() as u16).to_be_bytes());

    let mut x = e(key, b0);

    if !aad.is_empty() {
        let mut a = Vec::with_capacity(2 + aad.len());

        a.extend_from_slice(&(aad.len() as u16).to_be_bytes());
        a.extend_from_slice(aad);

        for chunk in a.chunks(BLOCK_LEN) {
            for (x_byte, a_byte) in x.iter_mut().zip(chunk.iter()) {
                *x_byte ^= a_byte;
            }
            x = e(key, x);
        }
    }

    for chunk in payload.chunks(BLOCK_LEN) {
        for (x_byte, p_byte) in x.iter_mut().zip(chunk.iter()) {
            *x_byte ^= p_byte;
        }
        x = e(key, x);
    }

    x
}

/// The counter-mode keystream block `S_i` of CCM
fn ccm_keystream(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], counter: u16) -> [u8; BLOCK_LEN] {
    let mut a = [0u8; BLOCK_LEN];

    a[0] = 0x01;
    a[1..14].copy_from_slice(nonce);
    a[14..16].copy_from_slice(&counter.to_be_bytes());

    e(key, a)
}

/// AES-CCM authenticated encryption
///
/// Returns the ciphertext with the MIC appended. The MIC is 4 bytes for
/// [`MicSize::Small`] and 8 bytes for [`MicSize::Big`].
pub fn aes_ccm_encrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    payload: &[u8],
    aad: &[u8],
    mic_size: MicSize,
) -> Vec<u8> {
    let mic_len = mic_size.byte_size();

    let pre_mic = ccm_mac(key, nonce, payload, aad, mic_size);

    let mut out = Vec::with_capacity(payload.len() + mic_len);

    for (index, chunk) in payload.chunks(BLOCK_LEN).enumerate() {
        let keystream = ccm_keystream(key, nonce, index as u16 + 1);

        out.extend(chunk.iter().zip(keystream.iter()).map(|(p, s)| p ^ s));
    }

    let s0 = ccm_keystream(key, nonce, 0);

    out.extend(pre_mic.iter().zip(s0.iter()).take(mic_len).map(|(t, s)| t ^ s));

    out
}

/// AES-CCM authenticated decryption
///
/// `data` is the ciphertext with its MIC appended, exactly as produced by
/// [`aes_ccm_encrypt`]. On success the plaintext is returned; if the MIC does not validate the
/// plaintext is discarded and [`CryptoError::MicMismatch`] is returned.
pub fn aes_ccm_decrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    data: &[u8],
    aad: &[u8],
    mic_size: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    let mic_len = mic_size.byte_size();

    if data.len() < mic_len {
        return Err( CryptoError::TruncatedCiphertext );
    }

    let (ciphertext, received_mic) = data.split_at(data.len() - mic_len);

    let mut payload = Vec::with_capacity(ciphertext.len());

    for (index, chunk) in ciphertext.chunks(BLOCK_LEN).enumerate() {
        let keystream = ccm_keystream(key, nonce, index as u16 + 1);

        payload.extend(chunk.iter().zip(keystream.iter()).map(|(c, s)| c ^ s));
    }

    let pre_mic = ccm_mac(key, nonce, &payload, aad, mic_size);

    let s0 = ccm_keystream(key, nonce, 0);

    let calculated_mic = pre_mic
        .iter()
        .zip(s0.iter())
        .take(mic_len)
        .map(|(t, s)| t ^ s)
        .collect::<Vec<u8>>();

    if calculated_mic != received_mic {
        return Err( CryptoError::MicMismatch );
    }

    Ok(payload)
}

/// Generate the (private, public) key pair for the elliptic curve
pub fn ecdh_keypair() -> Result<(PrivateKey, PublicKey), CryptoError> {
    let rng = ring::rand::SystemRandom::new();

    let private_key = agreement::EphemeralPrivateKey::generate(&agreement::ECDH_P256, &rng)
        .map_err(|_| CryptoError::KeyGeneration)?;

    let public_key = private_key
        .compute_public_key()
        .map_err(|_| CryptoError::KeyGeneration)?;

    Ok( (private_key, public_key) )
}

/// Split an uncompressed public key into its big-endian (X, Y) coordinates
pub fn public_key_coordinates(key: &PublicKey) -> ([u8; 32], [u8; 32]) {
    let raw = key.as_ref();

    let mut x = [0u8; 32];
    let mut y = [0u8; 32];

    x.copy_from_slice(&raw[PUB_KEY_X_RANGE]);
    y.copy_from_slice(&raw[PUB_KEY_Y_RANGE]);

    (x, y)
}

/// Build a peer public key from the big-endian (X, Y) coordinates received over the bearer
pub fn peer_public_key(x: &[u8; 32], y: &[u8; 32]) -> PeerPublicKey {
    let mut raw = Vec::with_capacity(PUB_KEY_BYTE_LEN);

    raw.push(UNCOMPRESSED_PUB_KEY_TYPE);
    raw.extend_from_slice(x);
    raw.extend_from_slice(y);

    agreement::UnparsedPublicKey::new(&agreement::ECDH_P256, raw)
}

/// Calculate the elliptic curve Diffie-Hellman shared secret from the provided public key
///
/// The mesh shared secret is the X coordinate of the agreed point, 32 bytes big-endian, which
/// is exactly the value `ring` exposes for P-256. The private key is consumed; a provisioning
/// session never reuses its ephemeral key.
pub fn ecdh_p256(private_key: PrivateKey, peer_key: &PeerPublicKey) -> Result<[u8; 32], CryptoError> {
    agreement::agree_ephemeral(private_key, peer_key, CryptoError::InvalidPeerKey, |secret| {
        if secret.len() != 32 {
            return Err( CryptoError::InvalidPeerKey );
        }

        let mut x = [0u8; 32];

        x.copy_from_slice(secret);

        Ok(x)
    })
}

/// Tests
///
/// The AES and AES-CMAC test data comes from FIPS-197 and RFC 4493; the `s1` sample is from
/// the mesh profile sample data. The remaining operations are checked against their own
/// inverses since their published samples depend on the full stack above them.
#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn e_fips_197_vector() {
        let key = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
            0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
        ];

        let plain_text = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
            0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
        ];

        let cipher_text = [
            0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30,
            0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4, 0xc5, 0x5a,
        ];

        assert_eq!( cipher_text, e(&key, plain_text) );
    }

    /// The test data was retrieved from [The AES-CMAC Algorithm](https://datatracker.ietf.org/doc/rfc4493)
    #[test]
    fn aes_cmac_rfc_4493_vectors() {
        let key = [
            0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6,
            0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
        ];

        let m = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96,
            0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17, 0x2a,
            0xae, 0x2d, 0x8a, 0x57, 0x1e, 0x03, 0xac, 0x9c,
            0x9e, 0xb7, 0x6f, 0xac, 0x45, 0xaf, 0x8e, 0x51,
            0x30, 0xc8, 0x1c, 0x46, 0xa3, 0x5c, 0xe4, 0x11,
            0xe5, 0xfb, 0xc1, 0x19, 0x1a, 0x0a, 0x52, 0xef,
            0xf6, 0x9f, 0x24, 0x45, 0xdf, 0x4f, 0x9b, 0x17,
            0xad, 0x2b, 0x41, 0x7b, 0xe6, 0x6c, 0x37, 0x10,
        ];

        assert_eq!(
            [
                0xbb, 0x1d, 0x69, 0x29, 0xe9, 0x59, 0x37, 0x28,
                0x7f, 0xa3, 0x7d, 0x12, 0x9b, 0x75, 0x67, 0x46,
            ],
            aes_cmac(&key, &m[..0])
        );

        assert_eq!(
            [
                0x07, 0x0a, 0x16, 0xb4, 0x6b, 0x4d, 0x41, 0x44,
                0xf7, 0x9b, 0xdd, 0x9d, 0xd0, 0x4a, 0x28, 0x7c,
            ],
            aes_cmac(&key, &m[..16])
        );

        assert_eq!(
            [
                0xdf, 0xa6, 0x67, 0x47, 0xde, 0x9a, 0xe6, 0x30,
                0x30, 0xca, 0x32, 0x61, 0x14, 0x97, 0xc8, 0x27,
            ],
            aes_cmac(&key, &m[..40])
        );

        assert_eq!(
            [
                0x51, 0xf0, 0xbe, 0xbf, 0x7e, 0x3b, 0x9d, 0x92,
                0xfc, 0x49, 0x74, 0x17, 0x79, 0x36, 0x3c, 0xfe,
            ],
            aes_cmac(&key, &m)
        );
    }

    /// Data is from the mesh profile sample data for the s1 SALT generation function
    #[test]
    fn s1_sample() {
        assert_eq!(
            [
                0xb7, 0x3c, 0xef, 0xbd, 0x64, 0x1e, 0xf2, 0xea,
                0x59, 0x8c, 0x2b, 0x6e, 0xfb, 0x62, 0xf7, 0x9c,
            ],
            s1(b"test")
        );
    }

    #[test]
    fn k1_matches_its_definition() {
        let n = [0x32u8; 20];
        let salt = s1(b"salt input");

        assert_eq!( aes_cmac(&aes_cmac(&salt, &n), b"prck"), k1(&n, &salt, b"prck") );
    }

    #[test]
    fn k2_material_shape() {
        let key = [0x7d; KEY_LEN];

        let (nid, encryption_key, privacy_key) = k2(&key, &[0x00]);

        // the nid is 7 bits and the three outputs must all differ
        assert!( nid < 0x80 );
        assert_ne!( encryption_key, privacy_key );

        // deterministic for the same inputs, different for different p
        assert_eq!( (nid, encryption_key, privacy_key), k2(&key, &[0x00]) );
        assert_ne!( k2(&key, &[0x00]).1, k2(&key, &[0x01]).1 );
    }

    #[test]
    fn ccm_round_trip_both_mic_sizes() {
        let key = [0x42u8; KEY_LEN];
        let nonce = [0x13u8; NONCE_LEN];
        let payload = b"\x00\x01\x02\x03 some payload that spans blocks \xff";

        for &mic_size in &[MicSize::Small, MicSize::Big] {
            let sealed = aes_ccm_encrypt(&key, &nonce, payload, &[], mic_size);

            assert_eq!( payload.len() + mic_size.byte_size(), sealed.len() );

            let opened = aes_ccm_decrypt(&key, &nonce, &sealed, &[], mic_size).unwrap();

            assert_eq!( payload.as_ref(), opened.as_slice() );
        }
    }

    #[test]
    fn ccm_detects_tampering() {
        let key = [0x42u8; KEY_LEN];
        let nonce = [0x13u8; NONCE_LEN];

        let mut sealed = aes_ccm_encrypt(&key, &nonce, b"data", &[], MicSize::Small);

        sealed[1] ^= 0x80;

        assert_eq!(
            Err(CryptoError::MicMismatch),
            aes_ccm_decrypt(&key, &nonce, &sealed, &[], MicSize::Small)
        );
    }

    #[test]
    fn ccm_authenticates_additional_data() {
        let key = [0x42u8; KEY_LEN];
        let nonce = [0x13u8; NONCE_LEN];

        let sealed = aes_ccm_encrypt(&key, &nonce, b"data", b"aad", MicSize::Big);

        assert!( aes_ccm_decrypt(&key, &nonce, &sealed, b"aad", MicSize::Big).is_ok() );

        assert_eq!(
            Err(CryptoError::MicMismatch),
            aes_ccm_decrypt(&key, &nonce, &sealed, b"bad", MicSize::Big)
        );
    }

    #[test]
    fn ccm_rejects_truncated_input() {
        let key = [0u8; KEY_LEN];
        let nonce = [0u8; NONCE_LEN];

        assert_eq!(
            Err(CryptoError::TruncatedCiphertext),
            aes_ccm_decrypt(&key, &nonce, &[0xAA; 3], &[], MicSize::Small)
        );
    }

    #[test]
    fn ecdh_agreement_is_symmetric() {
        let (private_a, public_a) = ecdh_keypair().expect("Failed to generate pri-pub key");
        let (private_b, public_b) = ecdh_keypair().expect("Failed to generate pri-pub key");

        let (ax, ay) = public_key_coordinates(&public_a);
        let (bx, by) = public_key_coordinates(&public_b);

        let secret_ab = ecdh_p256(private_a, &peer_public_key(&bx, &by)).unwrap();
        let secret_ba = ecdh_p256(private_b, &peer_public_key(&ax, &ay)).unwrap();

        assert_eq!( secret_ab, secret_ba );
    }

    #[test]
    fn random_is_not_constant() {
        // sixteen bytes colliding would mean the generator is broken
        assert_ne!( random(16), random(16) );

        let mut filled = [0u8; 16];
        fill_random(&mut filled);

        assert_ne!( [0u8; 16], filled );
    }
}
