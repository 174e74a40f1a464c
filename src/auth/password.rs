use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;

use crate::config::AppConfig;

/// Salted argon2id hashing for login passwords and refresh secrets.
#[derive(Clone)]
pub struct SecretHasher {
    params: Params,
}

impl SecretHasher {
    pub fn new(memory_kib: u32, iterations: u32) -> Result<Self> {
        let params = Params::new(
            memory_kib.max(Params::MIN_M_COST),
            iterations.max(Params::MIN_T_COST),
            Params::DEFAULT_P_COST,
            None,
        )
        .map_err(|err| anyhow!(err))?;
        Ok(Self { params })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(config.secret_hash_memory_kib, config.secret_hash_iterations)
    }

    pub fn hash(&self, secret: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|err| anyhow!(err))?;
        Ok(hash.to_string())
    }

    /// Parameters are read back from the PHC string, so hashes made with
    /// older cost settings keep verifying.
    pub fn verify(&self, secret: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash).map_err(|err| anyhow!(err))?;
        Ok(self
            .argon2()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok())
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl Default for SecretHasher {
    fn default() -> Self {
        Self {
            params: Params::default(),
        }
    }
}
