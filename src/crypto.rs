// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

use sha2::{Digest, Sha256};

use crate::constants::{CRC_TABLE, DLE, ETX, STX};
use crate::device::DeviceKey;
use crate::error::DecodeError;

const KEYSTREAM_LEN: usize = 255;

/// Session cipher for frame bodies.
///
/// XORs the body with a 255-byte keystream built from chained SHA-256
/// digests of the device key. Every frame restarts at keystream offset 0.
#[derive(Clone)]
pub struct DaikinCrypt {
    keystream: [u8; KEYSTREAM_LEN],
}

impl DaikinCrypt {
    pub fn new(key: &DeviceKey) -> Self {
        Self::from_secret(key.expose().as_bytes())
    }

    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            keystream: Self::create_keystream(secret),
        }
    }

    /// `block[0] = sha256(secret)`, `block[n] = sha256(block[n-1])`, truncated to 255 bytes.
    pub fn create_keystream(secret: &[u8]) -> [u8; KEYSTREAM_LEN] {
        let mut keystream = [0u8; KEYSTREAM_LEN];
        let mut block = Sha256::digest(secret);
        let mut filled = 0;
        while filled < KEYSTREAM_LEN {
            let take = (KEYSTREAM_LEN - filled).min(block.len());
            keystream[filled..filled + take].copy_from_slice(&block[..take]);
            filled += take;
            block = Sha256::digest(block);
        }
        keystream
    }

    /// XOR `data` with the keystream. Symmetric.
    pub fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, &b)| b ^ self.keystream[i % KEYSTREAM_LEN])
            .collect()
    }

    /// XOR then DLE-escape, ready to be placed between STX/CRYPT and ETX.
    pub fn encrypt(&self, body: &[u8]) -> Vec<u8> {
        escape(&self.apply(body))
    }

    /// Undo [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, wire: &[u8]) -> Result<Vec<u8>, DecodeError> {
        Ok(self.apply(&unescape(wire)?))
    }
}

/// Prefix every STX, ETX and DLE byte with DLE.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len() + data.len() / 8);
    for &b in data {
        if matches!(b, STX | ETX | DLE) {
            result.push(DLE);
        }
        result.push(b);
    }
    result
}

/// Strip DLE escapes. A DLE must be followed by a framing byte.
pub fn unescape(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut result = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        match b {
            DLE => match iter.next() {
                Some(&next) if matches!(next, STX | ETX | DLE) => result.push(next),
                _ => return Err(DecodeError::BadEscape),
            },
            STX | ETX => return Err(DecodeError::BadEscape),
            _ => result.push(b),
        }
    }
    Ok(result)
}

/// CRC-16/ARC with init 0xFFFF.
pub fn compute_crc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc = (crc >> 8) ^ CRC_TABLE[(crc & 0xFF ^ byte as u16) as usize];
    }
    crc
}
