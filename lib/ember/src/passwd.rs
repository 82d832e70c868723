//! Argon2id password hashing.
//!
//! Parameters are fixed: t=3 passes, 64 MiB memory, single lane, 16-byte
//! random salt, 32-byte tag. Hashes are stored as PHC strings so the
//! parameters travel with the hash. Verification happens at the `argon2`
//! primitive, which compares tags in constant time.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use thiserror::Error;

pub const T_COST: u32 = 3;
pub const M_COST_KIB: u32 = 65536;
pub const P_COST: u32 = 1;
pub const TAG_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum PasswdError {
    #[error("password hashing failed: {0}")]
    Hash(argon2::password_hash::Error),
}

fn context() -> Argon2<'static> {
    let params = Params::new(M_COST_KIB, T_COST, P_COST, Some(TAG_LEN))
        .expect("fixed argon2 parameters are valid");
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
}

/// Derive an encoded Argon2id hash over `password` with a fresh random salt.
pub fn hash_password(password: &str) -> Result<String, PasswdError> {
    let salt = SaltString::generate(&mut OsRng);
    context()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(PasswdError::Hash)
}

/// Verify `password` against a stored encoded hash. A malformed stored hash
/// verifies false rather than erroring; callers treat both the same way.
pub fn verify_password(password: &str, encoded: &str) -> bool {
    match PasswordHash::new(encoded) {
        Ok(parsed) => context()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}
