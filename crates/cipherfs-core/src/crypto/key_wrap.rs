//! RFC 3394 AES key wrapping for the master-key file.
//!
//! The masterkey file stores both 256-bit vault keys wrapped with a key
//! encryption key (KEK) derived from the passphrase. Wrapping uses AES-256
//! with the default initial value `0xA6A6A6A6A6A6A6A6`; the integrity check
//! on unwrap is what turns a wrong passphrase into a detectable failure.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use generic_array::GenericArray;
use secrecy::{ExposeSecret, SecretBox};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

/// RFC 3394 default initial value.
const DEFAULT_IV: [u8; 8] = [0xA6; 8];

/// Semiblock size (64 bits).
const SEMIBLOCK: usize = 8;

#[derive(Error, Debug)]
pub enum WrapError {
    /// Plaintext must be a non-zero multiple of 64 bits and at least 128 bits.
    #[error("Invalid plaintext length for key wrap: {0} bytes")]
    InvalidPlaintextLength(usize),
}

#[derive(Error, Debug)]
pub enum UnwrapError {
    /// The ciphertext length is not a multiple of 64 bits.
    #[error("Invalid ciphertext length for key unwrap")]
    InvalidCiphertextLength,

    /// The ciphertext is shorter than the minimum of three semiblocks.
    #[error("Ciphertext too short for key unwrap")]
    CiphertextTooShort,

    /// The integrity register did not match the expected initial value.
    ///
    /// This typically indicates a wrong passphrase; it is cryptographically
    /// indistinguishable from tampering with the wrapped key.
    #[error("Key unwrap integrity check failed")]
    InvalidIntegrityCheck,
}

/// Wrap `plaintext` (a raw key, length a multiple of 8 and ≥ 16) under `kek`.
///
/// Returns the wrapped key, 8 bytes longer than the input.
pub fn wrap_key(plaintext: &[u8], kek: &SecretBox<[u8; 32]>) -> Result<Vec<u8>, WrapError> {
    if plaintext.len() < 2 * SEMIBLOCK || plaintext.len() % SEMIBLOCK != 0 {
        return Err(WrapError::InvalidPlaintextLength(plaintext.len()));
    }

    let cipher = Aes256::new(GenericArray::from_slice(kek.expose_secret()));
    let n = plaintext.len() / SEMIBLOCK;

    let mut a = DEFAULT_IV;
    let mut r = Zeroizing::new(plaintext.to_vec());
    let mut block = Zeroizing::new([0u8; 16]);

    for j in 0..6u64 {
        for i in 0..n {
            block[..8].copy_from_slice(&a);
            block[8..].copy_from_slice(&r[i * SEMIBLOCK..(i + 1) * SEMIBLOCK]);
            cipher.encrypt_block(GenericArray::from_mut_slice(&mut *block));

            let t = n as u64 * j + (i as u64 + 1);
            a.copy_from_slice(&block[..8]);
            for (dst, src) in a.iter_mut().zip(t.to_be_bytes()) {
                *dst ^= src;
            }
            r[i * SEMIBLOCK..(i + 1) * SEMIBLOCK].copy_from_slice(&block[8..]);
        }
    }

    let mut out = Vec::with_capacity(plaintext.len() + SEMIBLOCK);
    out.extend_from_slice(&a);
    out.extend_from_slice(&r);
    Ok(out)
}

/// Unwrap `ciphertext` under `kek`, verifying the RFC 3394 integrity register.
///
/// Returns the unwrapped key, 8 bytes shorter than the input.
pub fn unwrap_key(
    ciphertext: &[u8],
    kek: &SecretBox<[u8; 32]>,
) -> Result<Zeroizing<Vec<u8>>, UnwrapError> {
    if ciphertext.len() % SEMIBLOCK != 0 {
        return Err(UnwrapError::InvalidCiphertextLength);
    }
    if ciphertext.len() < 3 * SEMIBLOCK {
        return Err(UnwrapError::CiphertextTooShort);
    }

    let cipher = Aes256::new(GenericArray::from_slice(kek.expose_secret()));
    let n = ciphertext.len() / SEMIBLOCK - 1;

    let mut a = [0u8; 8];
    a.copy_from_slice(&ciphertext[..SEMIBLOCK]);
    let mut r = Zeroizing::new(ciphertext[SEMIBLOCK..].to_vec());
    let mut block = Zeroizing::new([0u8; 16]);

    for j in (0..6u64).rev() {
        for i in (0..n).rev() {
            let t = n as u64 * j + (i as u64 + 1);
            block[..8].copy_from_slice(&a);
            for (dst, src) in block[..8].iter_mut().zip(t.to_be_bytes()) {
                *dst ^= src;
            }
            block[8..].copy_from_slice(&r[i * SEMIBLOCK..(i + 1) * SEMIBLOCK]);
            cipher.decrypt_block(GenericArray::from_mut_slice(&mut *block));

            a.copy_from_slice(&block[..8]);
            r[i * SEMIBLOCK..(i + 1) * SEMIBLOCK].copy_from_slice(&block[8..]);
        }
    }

    if !bool::from(a.ct_eq(&DEFAULT_IV)) {
        return Err(UnwrapError::InvalidIntegrityCheck);
    }
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn kek(bytes: [u8; 32]) -> SecretBox<[u8; 32]> {
        SecretBox::new(Box::new(bytes))
    }

    // RFC 3394 §4.6: 256-bit key data wrapped with a 256-bit KEK.
    #[test]
    fn test_rfc3394_vector() {
        let k = kek(hex!(
            "000102030405060708090A0B0C0D0E0F101112131415161718191A1B1C1D1E1F"
        ));
        let plaintext =
            hex!("00112233445566778899AABBCCDDEEFF000102030405060708090A0B0C0D0E0F");
        let expected = hex!(
            "28C9F404C4B810F4CBCCB35CFB87F8263F5786E2D80ED326CBC7F0E71A99F43BFB988B9B7A02DD21"
        );

        let wrapped = wrap_key(&plaintext, &k).unwrap();
        assert_eq!(wrapped, expected);

        let unwrapped = unwrap_key(&wrapped, &k).unwrap();
        assert_eq!(&unwrapped[..], &plaintext);
    }

    #[test]
    fn test_wrong_kek_fails_integrity() {
        let k1 = kek([0x01; 32]);
        let k2 = kek([0x02; 32]);

        let wrapped = wrap_key(&[0x42; 32], &k1).unwrap();
        let result = unwrap_key(&wrapped, &k2);
        assert!(matches!(result, Err(UnwrapError::InvalidIntegrityCheck)));
    }

    #[test]
    fn test_tampered_ciphertext_fails_integrity() {
        let k = kek([0x07; 32]);
        let mut wrapped = wrap_key(&[0x42; 32], &k).unwrap();
        wrapped[11] ^= 0xFF;

        let result = unwrap_key(&wrapped, &k);
        assert!(matches!(result, Err(UnwrapError::InvalidIntegrityCheck)));
    }

    #[test]
    fn test_length_validation() {
        let k = kek([0u8; 32]);
        assert!(matches!(
            wrap_key(&[0u8; 7], &k),
            Err(WrapError::InvalidPlaintextLength(7))
        ));
        assert!(matches!(
            unwrap_key(&[0u8; 9], &k),
            Err(UnwrapError::InvalidCiphertextLength)
        ));
        assert!(matches!(
            unwrap_key(&[0u8; 16], &k),
            Err(UnwrapError::CiphertextTooShort)
        ));
    }
}
