//! Password scrambling for the hash-challenge plugins and RSA password
//! encryption for `caching_sha2_password` full authentication

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{AuthError, DriverResult};

/// `mysql_native_password`: SHA1(pw) XOR SHA1(seed ‖ SHA1(SHA1(pw)))
pub fn native_password(password: &[u8], seed: &[u8]) -> DriverResult<Vec<u8>> {
    scramble::<Sha1>(password, seed, SeedPosition::Before)
}

/// `caching_sha2_password` fast path: SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) ‖ seed)
pub fn caching_sha2(password: &[u8], seed: &[u8]) -> DriverResult<Vec<u8>> {
    scramble::<Sha256>(password, seed, SeedPosition::After)
}

enum SeedPosition {
    Before,
    After,
}

fn scramble<D: Digest>(
    password: &[u8],
    seed: &[u8],
    position: SeedPosition,
) -> DriverResult<Vec<u8>> {
    let digest1 = D::digest(password);
    let digest2 = D::digest(&digest1);

    let mut hasher = D::new();
    match position {
        SeedPosition::Before => {
            hasher.update(seed);
            hasher.update(&digest2);
        }
        SeedPosition::After => {
            hasher.update(&digest2);
            hasher.update(seed);
        }
    }
    let mix = hasher.finalize();

    if digest1.len() != mix.len() {
        return Err(AuthError::DigestLength {
            digest: digest1.len(),
            mix: mix.len(),
        }
        .into());
    }

    Ok(digest1.iter().zip(mix.iter()).map(|(a, b)| a ^ b).collect())
}

/// Password followed by a NUL terminator, XORed with the seed repeated cyclically
pub fn xor_with_seed(password: &[u8], seed: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(password.len() + 1);
    data.extend_from_slice(password);
    data.push(0);
    if seed.is_empty() {
        return data;
    }
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= seed[i % seed.len()];
    }
    data
}

/// Parse a PEM public key, accepting SubjectPublicKeyInfo or PKCS#1 framing
pub fn parse_public_key(pem: &str) -> DriverResult<RsaPublicKey> {
    let pem = pem.trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| AuthError::InvalidPublicKey(e.to_string()).into())
}

/// RSA-OAEP(SHA-1) encryption of the seed-salted password
pub fn encrypt_password(password: &[u8], seed: &[u8], pem: &str) -> DriverResult<Vec<u8>> {
    let key = parse_public_key(pem)?;
    let data = xor_with_seed(password, seed);
    let mut rng = rand::thread_rng();
    key.encrypt(&mut rng, Oaep::new::<Sha1>(), &data)
        .map_err(|e| AuthError::Encryption(e.to_string()).into())
}
