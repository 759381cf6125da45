//! AES key wrap (RFC 3394) with an AES-128 KEK.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use zeroize::{Zeroize, Zeroizing};

use crate::error::Error;
use crate::lorawan::keys::AesKey;

const DEFAULT_IV: [u8; 8] = [0xA6; 8];

/// Wrap `plaintext` (a multiple of 8 bytes, at least 16) under `kek`.
pub fn wrap(kek: &AesKey, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    if plaintext.len() < 16 || plaintext.len() % 8 != 0 {
        return Err(Error::WrapKey(format!(
            "key length {} is not a multiple of 8 bytes",
            plaintext.len()
        )));
    }
    let cipher = Aes128::new(GenericArray::from_slice(kek.as_bytes()));
    let n = plaintext.len() / 8;
    let mut a = DEFAULT_IV;
    let mut r: Vec<[u8; 8]> = plaintext
        .chunks_exact(8)
        .map(|c| c.try_into().unwrap_or([0; 8]))
        .collect();

    let mut block = [0u8; 16];
    for j in 0..6 {
        for (i, ri) in r.iter_mut().enumerate() {
            block[..8].copy_from_slice(&a);
            block[8..].copy_from_slice(ri);
            cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
            let t = (n * j + i + 1) as u64;
            a.copy_from_slice(&block[..8]);
            a.iter_mut()
                .zip(t.to_be_bytes())
                .for_each(|(x, y)| *x ^= y);
            ri.copy_from_slice(&block[8..]);
        }
    }

    let mut out = Vec::with_capacity(8 * (n + 1));
    out.extend_from_slice(&a);
    r.iter().for_each(|ri| out.extend_from_slice(ri));
    block.zeroize();
    r.zeroize();
    Ok(out)
}

/// Unwrap `ciphertext` under `kek`, checking the integrity value.
pub fn unwrap(kek: &AesKey, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    if ciphertext.len() < 24 || ciphertext.len() % 8 != 0 {
        return Err(Error::UnwrapKey(format!(
            "wrapped key length {} is invalid",
            ciphertext.len()
        )));
    }
    let cipher = Aes128::new(GenericArray::from_slice(kek.as_bytes()));
    let n = ciphertext.len() / 8 - 1;
    let mut a = [0u8; 8];
    a.copy_from_slice(&ciphertext[..8]);
    let mut r: Vec<[u8; 8]> = ciphertext[8..]
        .chunks_exact(8)
        .map(|c| c.try_into().unwrap_or([0; 8]))
        .collect();

    let mut block = [0u8; 16];
    for j in (0..6).rev() {
        for i in (0..n).rev() {
            let t = (n * j + i + 1) as u64;
            a.iter_mut()
                .zip(t.to_be_bytes())
                .for_each(|(x, y)| *x ^= y);
            block[..8].copy_from_slice(&a);
            block[8..].copy_from_slice(&r[i]);
            cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
            a.copy_from_slice(&block[..8]);
            r[i].copy_from_slice(&block[8..]);
        }
    }

    block.zeroize();
    if a != DEFAULT_IV {
        r.zeroize();
        return Err(Error::UnwrapKey("integrity check failed".to_string()));
    }
    let plain = r.concat();
    r.zeroize();
    Ok(plain)
}

/// Wrap an AES-128 key.
pub fn wrap_key(kek: &AesKey, key: &AesKey) -> Result<Vec<u8>, Error> {
    wrap(kek, key.as_bytes())
}

/// Unwrap an AES-128 key.
pub fn unwrap_key(kek: &AesKey, ciphertext: &[u8]) -> Result<AesKey, Error> {
    let plain = Zeroizing::new(unwrap(kek, ciphertext)?);
    let key: [u8; 16] = plain
        .as_slice()
        .try_into()
        .map_err(|_| Error::UnwrapKey(format!("unwrapped key has {} bytes", plain.len())))?;
    Ok(AesKey(key))
}
