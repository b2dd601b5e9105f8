//! QUIC Initial key schedule (RFC 9001 section 5)
//!
//! Initial keys depend only on the client's destination connection id, so
//! an on-path observer can derive both directions without any handshake
//! state.

use super::header::header_mask;
use super::version::QuicVersion;
use crate::error::{Result, SniffError};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes128Gcm;
use hkdf::Hkdf;
use sha2::Sha256;

pub const SECRET_LEN: usize = 32;
pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 12;
pub const HP_KEY_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

const CLIENT_IN: &[u8] = b"client in";
const SERVER_IN: &[u8] = b"server in";

/// Side of the connection the caller plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// HKDF-Expand-Label with an empty context (RFC 8446 section 7.1)
pub fn hkdf_expand_label(secret: &[u8], label: &[u8], len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::from_prk(secret)
        .map_err(|_| SniffError::Crypto("invalid secret length".into()))?;

    let full_label_len = 6 + label.len();
    let mut info = Vec::with_capacity(4 + full_label_len);
    info.extend_from_slice(&(len as u16).to_be_bytes());
    info.push(full_label_len as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label);
    info.push(0);

    let mut out = vec![0u8; len];
    hk.expand(&info, &mut out)
        .map_err(|_| SniffError::Crypto("invalid expand length".into()))?;
    Ok(out)
}

/// Packet protection keys for one direction
#[derive(Clone)]
pub struct DirectionalKeys {
    secret: [u8; SECRET_LEN],
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
    hp: [u8; HP_KEY_LEN],
}

impl DirectionalKeys {
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        if secret.len() != SECRET_LEN {
            return Err(SniffError::Crypto(format!(
                "traffic secret must be {} bytes, got {}",
                SECRET_LEN,
                secret.len()
            )));
        }
        let mut keys = Self {
            secret: [0; SECRET_LEN],
            key: [0; KEY_LEN],
            iv: [0; IV_LEN],
            hp: [0; HP_KEY_LEN],
        };
        keys.secret.copy_from_slice(secret);
        keys.key
            .copy_from_slice(&hkdf_expand_label(secret, b"quic key", KEY_LEN)?);
        keys.iv
            .copy_from_slice(&hkdf_expand_label(secret, b"quic iv", IV_LEN)?);
        keys.hp
            .copy_from_slice(&hkdf_expand_label(secret, b"quic hp", HP_KEY_LEN)?);
        Ok(keys)
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn hp_key(&self) -> &[u8] {
        &self.hp
    }

    /// AEAD nonce: the IV XORed with the left-padded packet number
    pub fn nonce(&self, packet_number: u64) -> [u8; IV_LEN] {
        let mut nonce = self.iv;
        for (n, p) in nonce[IV_LEN - 8..]
            .iter_mut()
            .zip(packet_number.to_be_bytes())
        {
            *n ^= p;
        }
        nonce
    }

    fn cipher(&self) -> Result<Aes128Gcm> {
        Aes128Gcm::new_from_slice(&self.key)
            .map_err(|_| SniffError::Crypto("invalid AEAD key length".into()))
    }

    /// Decrypt and authenticate a packet payload
    pub fn open(&self, packet_number: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_LEN {
            return Err(SniffError::Truncated {
                expected: TAG_LEN,
                actual: ciphertext.len(),
            });
        }
        let nonce = self.nonce(packet_number);
        let plaintext = self.cipher()?.decrypt(
            GenericArray::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )?;
        Ok(plaintext)
    }

    /// Encrypt a packet payload, appending the tag
    pub fn seal(&self, packet_number: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce(packet_number);
        self.cipher()?
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| SniffError::Crypto("encryption failed".into()))
    }

    pub fn header_mask(&self, sample: &[u8]) -> Result<[u8; 5]> {
        header_mask(&self.hp, sample)
    }
}

impl std::fmt::Debug for DirectionalKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionalKeys").finish_non_exhaustive()
    }
}

/// Both directions of Initial packet protection
#[derive(Debug, Clone)]
pub struct InitialSecrets {
    version: QuicVersion,
    client: DirectionalKeys,
    server: DirectionalKeys,
}

impl InitialSecrets {
    /// Derive the Initial keys for `dcid`, the destination connection id of
    /// the client's first Initial packet.
    pub fn derive(version: QuicVersion, dcid: &[u8]) -> Result<Self> {
        let salt = version
            .initial_salt()
            .ok_or(SniffError::UnsupportedVersion(version.wire()))?;
        let (initial_secret, _) = Hkdf::<Sha256>::extract(Some(salt), dcid);

        let client = hkdf_expand_label(&initial_secret, CLIENT_IN, SECRET_LEN)?;
        let server = hkdf_expand_label(&initial_secret, SERVER_IN, SECRET_LEN)?;

        Ok(Self {
            version,
            client: DirectionalKeys::from_secret(&client)?,
            server: DirectionalKeys::from_secret(&server)?,
        })
    }

    pub fn version(&self) -> QuicVersion {
        self.version
    }

    pub fn client(&self) -> &DirectionalKeys {
        &self.client
    }

    pub fn server(&self) -> &DirectionalKeys {
        &self.server
    }

    /// Keys this side writes with
    pub fn local(&self, role: Role) -> &DirectionalKeys {
        match role {
            Role::Client => &self.client,
            Role::Server => &self.server,
        }
    }

    /// Keys the other side writes with; used to open received packets
    pub fn peer(&self, role: Role) -> &DirectionalKeys {
        match role {
            Role::Client => &self.server,
            Role::Server => &self.client,
        }
    }
}
