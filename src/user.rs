//! Cluster and database users with salted password hashes.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::WalError;

const HASH_SCHEME: &str = "sha256";
const SALT_LEN: usize = 16;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum User {
    ClusterAdmin {
        name: String,
        hash: String,
    },
    DbUser {
        name: String,
        db: String,
        is_admin: bool,
        hash: String,
    },
}

impl User {
    pub fn cluster_admin(name: impl Into<String>) -> Self {
        Self::ClusterAdmin {
            name: name.into(),
            hash: String::new(),
        }
    }

    pub fn db_user(name: impl Into<String>, db: impl Into<String>, is_admin: bool) -> Self {
        Self::DbUser {
            name: name.into(),
            db: db.into(),
            is_admin,
            hash: String::new(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::ClusterAdmin { name, .. } | Self::DbUser { name, .. } => name,
        }
    }

    pub fn is_cluster_admin(&self) -> bool {
        matches!(self, Self::ClusterAdmin { .. })
    }

    /// Cluster admins administer every database.
    pub fn is_db_admin(&self, database: &str) -> bool {
        match self {
            Self::ClusterAdmin { .. } => true,
            Self::DbUser { db, is_admin, .. } => *is_admin && db == database,
        }
    }

    /// Replace the stored hash, which must come from [`hash_password`].
    pub fn change_password(&mut self, new_hash: impl Into<String>) -> Result<(), WalError> {
        let new_hash = new_hash.into();
        parse_hash(&new_hash)?;
        match self {
            Self::ClusterAdmin { hash, .. } | Self::DbUser { hash, .. } => *hash = new_hash,
        }
        Ok(())
    }

    pub fn is_valid_password(&self, password: &str) -> bool {
        let hash = match self {
            Self::ClusterAdmin { hash, .. } | Self::DbUser { hash, .. } => hash,
        };
        let Ok((salt, expected)) = parse_hash(hash) else {
            return false;
        };
        constant_time_eq(&digest(&salt, password), &expected)
    }
}

/// Hash `password` with a fresh random salt: `sha256$<salt hex>$<digest hex>`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    format!(
        "{HASH_SCHEME}${}${}",
        hex::encode(salt),
        hex::encode(digest(&salt, password))
    )
}

fn digest(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

fn parse_hash(hash: &str) -> Result<(Vec<u8>, Vec<u8>), WalError> {
    let invalid = || WalError::GeneralError("invalid password hash".to_string());

    let mut parts = hash.split('$');
    let (Some(scheme), Some(salt), Some(digest), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    if scheme != HASH_SCHEME {
        return Err(invalid());
    }
    let salt = hex::decode(salt).map_err(|_| invalid())?;
    let digest = hex::decode(digest).map_err(|_| invalid())?;
    if digest.len() != 32 {
        return Err(invalid());
    }
    Ok((salt, digest))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
