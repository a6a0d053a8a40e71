//! Packet protection (RFC 9001 Section 5)
//!
//! Key schedule, AEAD payload protection and header protection for the
//! four encryption levels. Initial keys are derived from the client's
//! first destination connection ID; every other level is keyed from
//! traffic secrets supplied by the TLS engine.

use super::error::{Error, Result};
use super::packet::SpaceId;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use openssl::symm::{self, Cipher, Crypter, Mode};
use std::fmt;
use tracing::trace;

/// QUIC v1 Initial salt (RFC 9001 Section 5.2)
pub const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Retry integrity key (RFC 9001 Section 5.8)
const RETRY_KEY: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8,
    0x4e,
];

/// Retry integrity nonce (RFC 9001 Section 5.8)
const RETRY_NONCE: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

/// AEAD authentication tag length for all supported suites
pub const TAG_LEN: usize = 16;

/// Header protection sample length
pub const SAMPLE_LEN: usize = 16;

/// Encryption level of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EncryptionLevel {
    /// Initial packets, keyed from the destination connection ID
    Initial,
    /// 0-RTT early data
    ZeroRtt,
    /// Handshake packets
    Handshake,
    /// 1-RTT application data
    OneRtt,
}

impl EncryptionLevel {
    /// Packet number space used at this level
    pub fn space(self) -> SpaceId {
        match self {
            EncryptionLevel::Initial => SpaceId::Initial,
            EncryptionLevel::Handshake => SpaceId::Handshake,
            EncryptionLevel::ZeroRtt | EncryptionLevel::OneRtt => SpaceId::Data,
        }
    }

    /// Get level name
    pub fn name(&self) -> &'static str {
        match self {
            EncryptionLevel::Initial => "Initial",
            EncryptionLevel::ZeroRtt => "0-RTT",
            EncryptionLevel::Handshake => "Handshake",
            EncryptionLevel::OneRtt => "1-RTT",
        }
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// TLS 1.3 cipher suites usable for QUIC packet protection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CipherSuite {
    /// TLS_AES_128_GCM_SHA256
    Aes128GcmSha256 = 0x1301,
    /// TLS_AES_256_GCM_SHA384
    Aes256GcmSha384 = 0x1302,
    /// TLS_CHACHA20_POLY1305_SHA256
    ChaCha20Poly1305Sha256 = 0x1303,
}

impl CipherSuite {
    /// Convert to the TLS code point
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Create from the TLS code point
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1301 => Some(CipherSuite::Aes128GcmSha256),
            0x1302 => Some(CipherSuite::Aes256GcmSha384),
            0x1303 => Some(CipherSuite::ChaCha20Poly1305Sha256),
            _ => None,
        }
    }

    /// AEAD key length
    pub fn key_len(self) -> usize {
        match self {
            CipherSuite::Aes128GcmSha256 => 16,
            CipherSuite::Aes256GcmSha384 | CipherSuite::ChaCha20Poly1305Sha256 => 32,
        }
    }

    /// AEAD nonce length
    pub fn iv_len(self) -> usize {
        12
    }

    /// Header protection key length
    pub fn hp_key_len(self) -> usize {
        self.key_len()
    }

    /// Hash function backing HKDF
    pub fn digest(self) -> MessageDigest {
        match self {
            CipherSuite::Aes256GcmSha384 => MessageDigest::sha384(),
            _ => MessageDigest::sha256(),
        }
    }

    /// Hash output length (traffic secret length)
    pub fn hash_len(self) -> usize {
        match self {
            CipherSuite::Aes256GcmSha384 => 48,
            _ => 32,
        }
    }

    fn aead(self) -> Cipher {
        match self {
            CipherSuite::Aes128GcmSha256 => Cipher::aes_128_gcm(),
            CipherSuite::Aes256GcmSha384 => Cipher::aes_256_gcm(),
            CipherSuite::ChaCha20Poly1305Sha256 => Cipher::chacha20_poly1305(),
        }
    }

    /// Get suite name
    pub fn name(&self) -> &'static str {
        match self {
            CipherSuite::Aes128GcmSha256 => "TLS_AES_128_GCM_SHA256",
            CipherSuite::Aes256GcmSha384 => "TLS_AES_256_GCM_SHA384",
            CipherSuite::ChaCha20Poly1305Sha256 => "TLS_CHACHA20_POLY1305_SHA256",
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04x})", self.name(), self.as_u16())
    }
}

fn hmac(digest: MessageDigest, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let pkey = PKey::hmac(key)?;
    let mut signer = Signer::new(digest, &pkey)?;
    for part in parts {
        signer.update(part)?;
    }
    Ok(signer.sign_to_vec()?)
}

/// HKDF-Extract (RFC 5869)
pub fn hkdf_extract(digest: MessageDigest, salt: &[u8], ikm: &[u8]) -> Result<Vec<u8>> {
    hmac(digest, salt, &[ikm])
}

/// HKDF-Expand (RFC 5869)
pub fn hkdf_expand(digest: MessageDigest, prk: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
    let hash_len = digest.size();
    if len > 255 * hash_len {
        return Err(Error::Crypto(format!("HKDF output length {} too large", len)));
    }

    let mut out = Vec::with_capacity(len);
    let mut block: Vec<u8> = Vec::new();
    let mut counter = 1u8;
    while out.len() < len {
        block = hmac(digest, prk, &[&block[..], info, &[counter][..]])?;
        let take = (len - out.len()).min(block.len());
        out.extend_from_slice(&block[..take]);
        counter = counter.wrapping_add(1);
    }
    Ok(out)
}

/// HKDF-Expand-Label from TLS 1.3 (RFC 8446 Section 7.1)
pub fn hkdf_expand_label(
    digest: MessageDigest,
    secret: &[u8],
    label: &str,
    context: &[u8],
    len: usize,
) -> Result<Vec<u8>> {
    let full_label_len = 6 + label.len();
    let mut info = Vec::with_capacity(4 + full_label_len + context.len());
    info.extend_from_slice(&(len as u16).to_be_bytes());
    info.push(full_label_len as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label.as_bytes());
    info.push(context.len() as u8);
    info.extend_from_slice(context);
    hkdf_expand(digest, secret, &info, len)
}

/// AEAD key and IV for one direction
#[derive(Clone)]
pub struct PacketKey {
    suite: CipherSuite,
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl PacketKey {
    /// Derive from a traffic secret ("quic key" / "quic iv")
    pub fn from_secret(suite: CipherSuite, secret: &[u8]) -> Result<Self> {
        let digest = suite.digest();
        Ok(PacketKey {
            suite,
            key: hkdf_expand_label(digest, secret, "quic key", &[], suite.key_len())?,
            iv: hkdf_expand_label(digest, secret, "quic iv", &[], suite.iv_len())?,
        })
    }

    /// Create from raw key material
    pub fn new(suite: CipherSuite, key: &[u8], iv: &[u8]) -> Result<Self> {
        if key.len() != suite.key_len() || iv.len() != suite.iv_len() {
            return Err(Error::Crypto("invalid key or IV length".to_string()));
        }
        Ok(PacketKey {
            suite,
            key: key.to_vec(),
            iv: iv.to_vec(),
        })
    }

    /// Cipher suite
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Raw key bytes
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Raw IV bytes
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Nonce for a packet: the IV XOR the packet number, right-aligned
    pub fn nonce(&self, packet_number: u64) -> Vec<u8> {
        let mut nonce = self.iv.clone();
        let offset = nonce.len() - 8;
        for (i, byte) in packet_number.to_be_bytes().iter().enumerate() {
            nonce[offset + i] ^= byte;
        }
        nonce
    }

    /// Encrypt `plaintext`, returning ciphertext followed by the tag
    pub fn seal(&self, packet_number: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce(packet_number);
        let mut tag = [0u8; TAG_LEN];
        let mut out = symm::encrypt_aead(
            self.suite.aead(),
            &self.key,
            Some(&nonce),
            aad,
            plaintext,
            &mut tag,
        )?;
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Decrypt and authenticate `ciphertext` (which ends with the tag)
    ///
    /// Every failure maps to `Error::Decryption`.
    pub fn open(&self, packet_number: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_LEN {
            return Err(Error::Decryption);
        }
        let (data, tag) = ciphertext.split_at(ciphertext.len() - TAG_LEN);
        let nonce = self.nonce(packet_number);
        symm::decrypt_aead(self.suite.aead(), &self.key, Some(&nonce), aad, data, tag)
            .map_err(|_| Error::Decryption)
    }
}

impl fmt::Debug for PacketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketKey").field("suite", &self.suite).finish_non_exhaustive()
    }
}

/// Header protection key (RFC 9001 Section 5.4)
#[derive(Clone)]
pub struct HeaderKey {
    suite: CipherSuite,
    key: Vec<u8>,
}

impl HeaderKey {
    /// Derive from a traffic secret ("quic hp")
    pub fn from_secret(suite: CipherSuite, secret: &[u8]) -> Result<Self> {
        Ok(HeaderKey {
            suite,
            key: hkdf_expand_label(suite.digest(), secret, "quic hp", &[], suite.hp_key_len())?,
        })
    }

    /// Raw key bytes
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Compute the 5-byte mask from a ciphertext sample
    pub fn mask(&self, sample: &[u8]) -> Result<[u8; 5]> {
        if sample.len() < SAMPLE_LEN {
            return Err(Error::InvalidPacket("header protection sample too short".to_string()));
        }
        let sample = &sample[..SAMPLE_LEN];
        let mut mask = [0u8; 5];
        match self.suite {
            CipherSuite::Aes128GcmSha256 | CipherSuite::Aes256GcmSha384 => {
                let cipher = if self.suite == CipherSuite::Aes128GcmSha256 {
                    Cipher::aes_128_ecb()
                } else {
                    Cipher::aes_256_ecb()
                };
                let mut crypter = Crypter::new(cipher, Mode::Encrypt, &self.key, None)?;
                crypter.pad(false);
                let mut block = [0u8; SAMPLE_LEN * 2];
                let n = crypter.update(sample, &mut block)?;
                if n < 5 {
                    return Err(Error::Crypto("short header protection block".to_string()));
                }
                mask.copy_from_slice(&block[..5]);
            }
            CipherSuite::ChaCha20Poly1305Sha256 => {
                // The sample is the 32-bit little-endian counter followed by the nonce,
                // which is exactly the IV layout OpenSSL expects.
                let mut crypter =
                    Crypter::new(Cipher::chacha20(), Mode::Encrypt, &self.key, Some(sample))?;
                let mut block = [0u8; 5 + 64];
                let n = crypter.update(&[0u8; 5], &mut block)?;
                if n < 5 {
                    return Err(Error::Crypto("short header protection block".to_string()));
                }
                mask.copy_from_slice(&block[..5]);
            }
        }
        Ok(mask)
    }
}

impl fmt::Debug for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderKey").field("suite", &self.suite).finish_non_exhaustive()
    }
}

/// Keys for one direction at one encryption level
#[derive(Clone, Debug)]
pub struct DirectionalKeys {
    secret: Vec<u8>,
    pub packet: PacketKey,
    pub header: HeaderKey,
}

impl DirectionalKeys {
    /// Derive the key, IV and header protection key from a traffic secret
    pub fn from_secret(suite: CipherSuite, secret: &[u8]) -> Result<Self> {
        Ok(DirectionalKeys {
            secret: secret.to_vec(),
            packet: PacketKey::from_secret(suite, secret)?,
            header: HeaderKey::from_secret(suite, secret)?,
        })
    }

    /// Cipher suite
    pub fn suite(&self) -> CipherSuite {
        self.packet.suite
    }

    /// Keys for the next key phase ("quic ku")
    ///
    /// The header protection key is not updated.
    pub fn next_generation(&self) -> Result<Self> {
        let suite = self.suite();
        let secret = hkdf_expand_label(suite.digest(), &self.secret, "quic ku", &[], suite.hash_len())?;
        Ok(DirectionalKeys {
            packet: PacketKey::from_secret(suite, &secret)?,
            header: self.header.clone(),
            secret,
        })
    }
}

/// Keys for both directions at one encryption level
#[derive(Clone, Debug)]
pub struct CryptoKeys {
    /// Keys protecting packets we send
    pub local: DirectionalKeys,
    /// Keys removing protection from packets we receive
    pub remote: DirectionalKeys,
}

impl CryptoKeys {
    /// Derive Initial keys from the client's first destination connection ID
    pub fn initial(dcid: &[u8], is_client: bool) -> Result<Self> {
        let suite = CipherSuite::Aes128GcmSha256;
        let digest = suite.digest();
        let initial_secret = hkdf_extract(digest, &INITIAL_SALT, dcid)?;
        let client = hkdf_expand_label(digest, &initial_secret, "client in", &[], suite.hash_len())?;
        let server = hkdf_expand_label(digest, &initial_secret, "server in", &[], suite.hash_len())?;
        trace!(dcid_len = dcid.len(), is_client, "derived initial keys");
        if is_client {
            Self::from_secrets(suite, &client, &server)
        } else {
            Self::from_secrets(suite, &server, &client)
        }
    }

    /// Build keys from the local and remote traffic secrets
    pub fn from_secrets(suite: CipherSuite, local_secret: &[u8], remote_secret: &[u8]) -> Result<Self> {
        Ok(CryptoKeys {
            local: DirectionalKeys::from_secret(suite, local_secret)?,
            remote: DirectionalKeys::from_secret(suite, remote_secret)?,
        })
    }

    /// Cipher suite
    pub fn suite(&self) -> CipherSuite {
        self.local.suite()
    }

    /// Keys for the next key phase in both directions
    pub fn next_generation(&self) -> Result<Self> {
        Ok(CryptoKeys {
            local: self.local.next_generation()?,
            remote: self.remote.next_generation()?,
        })
    }
}

fn first_byte_mask(first: u8) -> u8 {
    if first & 0x80 != 0 {
        0x0F
    } else {
        0x1F
    }
}

/// Seal a packet whose plaintext header and payload are in `packet`
///
/// `packet[..header_len]` is the header (ending with the packet number at
/// `pn_offset`), the rest is plaintext. The returned buffer carries the
/// protected header followed by ciphertext and tag.
pub fn protect_packet(
    keys: &DirectionalKeys,
    packet: &[u8],
    pn_offset: usize,
    packet_number: u64,
) -> Result<Vec<u8>> {
    if packet.is_empty() || pn_offset >= packet.len() {
        return Err(Error::InvalidPacket("packet number offset out of range".to_string()));
    }
    let pn_len = (packet[0] & 0x03) as usize + 1;
    let header_len = pn_offset + pn_len;
    if header_len > packet.len() {
        return Err(Error::InvalidPacket("header longer than packet".to_string()));
    }

    let (header, payload) = packet.split_at(header_len);
    let ciphertext = keys.packet.seal(packet_number, header, payload)?;

    let mut out = Vec::with_capacity(header_len + ciphertext.len());
    out.extend_from_slice(header);
    out.extend_from_slice(&ciphertext);

    let sample_offset = pn_offset + 4;
    if out.len() < sample_offset + SAMPLE_LEN {
        return Err(Error::InvalidPacket("payload too short to sample".to_string()));
    }
    let mask = keys.header.mask(&out[sample_offset..sample_offset + SAMPLE_LEN])?;
    out[0] ^= mask[0] & first_byte_mask(out[0]);
    for i in 0..pn_len {
        out[pn_offset + i] ^= mask[1 + i];
    }
    Ok(out)
}

/// Remove header protection in place
///
/// Returns the truncated packet number and its length in bytes.
pub fn unprotect_header(key: &HeaderKey, packet: &mut [u8], pn_offset: usize) -> Result<(u64, usize)> {
    let sample_offset = pn_offset + 4;
    if packet.len() < sample_offset + SAMPLE_LEN {
        return Err(Error::InvalidPacket("packet too short to sample".to_string()));
    }
    let mask = key.mask(&packet[sample_offset..sample_offset + SAMPLE_LEN])?;
    packet[0] ^= mask[0] & first_byte_mask(packet[0]);
    let pn_len = (packet[0] & 0x03) as usize + 1;

    let mut truncated = 0u64;
    for i in 0..pn_len {
        packet[pn_offset + i] ^= mask[1 + i];
        truncated = (truncated << 8) | packet[pn_offset + i] as u64;
    }
    Ok((truncated, pn_len))
}

/// Open the payload of a packet whose header protection was removed
pub fn open_payload(key: &PacketKey, packet: &[u8], header_len: usize, packet_number: u64) -> Result<Vec<u8>> {
    if header_len > packet.len() {
        return Err(Error::Decryption);
    }
    let (header, ciphertext) = packet.split_at(header_len);
    key.open(packet_number, header, ciphertext)
}

/// Compute the Retry integrity tag over the pseudo-packet
pub fn retry_integrity_tag(original_dcid: &[u8], retry_without_tag: &[u8]) -> Result<[u8; TAG_LEN]> {
    let mut pseudo = Vec::with_capacity(1 + original_dcid.len() + retry_without_tag.len());
    pseudo.push(original_dcid.len() as u8);
    pseudo.extend_from_slice(original_dcid);
    pseudo.extend_from_slice(retry_without_tag);

    let mut tag = [0u8; TAG_LEN];
    symm::encrypt_aead(
        Cipher::aes_128_gcm(),
        &RETRY_KEY,
        Some(&RETRY_NONCE),
        &pseudo,
        &[],
        &mut tag,
    )?;
    Ok(tag)
}

/// Fill a buffer with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<()> {
    openssl::rand::rand_bytes(buf)?;
    Ok(())
}
