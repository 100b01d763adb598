use rand::RngCore;
use scrypt::Params;
use subtle::ConstantTimeEq;

/// Salt length in bytes for every stored credential.
const SALT_LEN: usize = 16;

/// Derived key length in bytes.
const KEY_LEN: usize = 64;

// scrypt cost parameters: N = 2^14, r = 8, p = 1.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// A freshly hashed credential, both halves hex-encoded for storage.
#[derive(Debug, Clone)]
pub struct HashedSecret {
    pub hash: String,
    pub salt: String,
}

/// Hash a password or PIN with a fresh random salt.
///
/// # Errors
/// Returns an error if key derivation fails (it cannot with the fixed
/// parameters, but the scrypt API is fallible).
pub fn hash_secret(secret: &str) -> anyhow::Result<HashedSecret> {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    let derived = derive(secret.as_bytes(), &salt)?;
    Ok(HashedSecret {
        hash: hex::encode(derived),
        salt: hex::encode(salt),
    })
}

/// Recompute the hash for `secret` and compare against the stored value.
///
/// The comparison is length check first, then constant-time equality;
/// malformed stored values simply fail verification.
#[must_use]
pub fn verify_secret(secret: &str, salt_hex: &str, hash_hex: &str) -> bool {
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(expected) = hex::decode(hash_hex) else {
        return false;
    };
    let Ok(derived) = derive(secret.as_bytes(), &salt) else {
        return false;
    };
    if derived.len() != expected.len() {
        return false;
    }
    derived[..].ct_eq(&expected[..]).into()
}

fn derive(secret: &[u8], salt: &[u8]) -> anyhow::Result<[u8; KEY_LEN]> {
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
        .map_err(|err| anyhow::anyhow!("invalid scrypt parameters: {err}"))?;
    let mut out = [0u8; KEY_LEN];
    scrypt::scrypt(secret, salt, &params, &mut out)
        .map_err(|err| anyhow::anyhow!("scrypt derivation failed: {err}"))?;
    Ok(out)
}
