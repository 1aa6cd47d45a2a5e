//! Key hashing and on-disk path resolution.
//!
//! Entries live at:
//! ```text
//! <root>/[<shard1>/<shard2>/...]/<hash><extension>
//! ```
//! where each shard is a two-character slice of the hash. Two distinct full
//! keys only collide on a hash collision, which is accepted and not handled.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::cache::MAX_KEY_LENGTH;
use crate::config::{Config, HashAlgorithm};
use crate::error::{CacheError, Result};

/// Characters that may not appear in a logical key.
pub const RESERVED_KEY_CHARS: &[char] = &['{', '}', '(', ')', '/', '\\', '@', ':'];

/// Subdirectory of the root holding per-key lock files.
pub const LOCK_DIR: &str = "locks";

/// File name of the persisted tag index.
pub const TAG_INDEX_FILE: &str = ".tag_index.json";

// == Validate Key ==
/// Rejects empty, oversized and reserved-character keys.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::Validation("Key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::Validation(format!(
            "Key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    if let Some(c) = key.chars().find(|c| RESERVED_KEY_CHARS.contains(c)) {
        return Err(CacheError::Validation(format!(
            "Key '{}' contains reserved character '{}'",
            key, c
        )));
    }
    Ok(())
}

// == Key Resolver ==
/// Maps logical keys to hashes and file paths for one cache root.
#[derive(Debug, Clone)]
pub struct KeyResolver {
    root: PathBuf,
    namespace: String,
    prefix: String,
    extension: String,
    shard_depth: usize,
    algorithm: HashAlgorithm,
}

impl KeyResolver {
    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.cache_dir.clone(),
            namespace: config.namespace.clone(),
            prefix: config.prefix.clone(),
            extension: config.extension.clone(),
            shard_depth: if config.sharding { config.shard_depth } else { 0 },
            algorithm: config.hash_algorithm,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hex digest of `namespace + prefix + key`.
    pub fn hash(&self, key: &str) -> String {
        let full_key = format!("{}{}{}", self.namespace, self.prefix, key);
        match self.algorithm {
            HashAlgorithm::Sha256 => format!("{:x}", Sha256::digest(full_key.as_bytes())),
            HashAlgorithm::Xxh3 => {
                format!("{:032x}", xxhash_rust::xxh3::xxh3_128(full_key.as_bytes()))
            }
        }
    }

    /// Entry file path for an already computed hash.
    pub fn path_for_hash(&self, hash: &str) -> PathBuf {
        let mut path = self.root.clone();
        for level in 0..self.shard_depth {
            let start = level * 2;
            match hash.get(start..start + 2) {
                Some(shard) => path.push(shard),
                None => break,
            }
        }
        path.push(format!("{}{}", hash, self.extension));
        path
    }

    /// Validates `key` and returns `(hash, entry path)`.
    pub fn resolve(&self, key: &str) -> Result<(String, PathBuf)> {
        validate_key(key)?;
        let hash = self.hash(key);
        let path = self.path_for_hash(&hash);
        Ok((hash, path))
    }

    /// Recovers the hash from an entry file path.
    pub fn hash_of(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let hash = name.strip_suffix(self.extension.as_str())?;
        (!hash.is_empty()).then(|| hash.to_string())
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(LOCK_DIR)
    }

    pub fn tag_index_path(&self) -> PathBuf {
        self.root.join(TAG_INDEX_FILE)
    }

    /// True for files under the root that hold cache entries.
    ///
    /// Excludes the lock directory, the tag index and in-flight temp files.
    pub fn is_entry_file(&self, path: &Path) -> bool {
        if path.starts_with(self.lock_dir()) {
            return false;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') {
            return false;
        }
        if self.extension.is_empty() {
            return true;
        }
        name.len() > self.extension.len() && name.ends_with(&self.extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(depth: usize) -> KeyResolver {
        let mut config = Config::new("/cache");
        config.shard_depth = depth;
        config.sharding = depth > 0;
        KeyResolver::from_config(&config)
    }

    #[test]
    fn test_validate_key_accepts_plain_keys() {
        assert!(validate_key("user.42_profile-v2").is_ok());
        assert!(validate_key(&"x".repeat(MAX_KEY_LENGTH)).is_ok());
    }

    #[test]
    fn test_validate_key_rejections() {
        assert!(validate_key("").is_err());
        assert!(validate_key(&"x".repeat(MAX_KEY_LENGTH + 1)).is_err());
        for c in RESERVED_KEY_CHARS {
            let key = format!("bad{}key", c);
            assert!(
                matches!(validate_key(&key), Err(CacheError::Validation(_))),
                "key with {:?} should be rejected",
                c
            );
        }
    }

    #[test]
    fn test_sha256_hash_is_stable() {
        let r = resolver(0);
        let hash = r.hash("hello");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_xxh3_hash_length() {
        let mut config = Config::new("/cache");
        config.hash_algorithm = HashAlgorithm::Xxh3;
        let r = KeyResolver::from_config(&config);
        assert_eq!(r.hash("hello").len(), 32);
        assert_ne!(r.hash("hello"), r.hash("hello2"));
    }

    #[test]
    fn test_namespace_and_prefix_change_hash() {
        let plain = resolver(0);
        let mut config = Config::new("/cache");
        config.namespace = "app:".into();
        config.prefix = "v1_".into();
        let namespaced = KeyResolver::from_config(&config);

        assert_ne!(plain.hash("k"), namespaced.hash("k"));
        assert_eq!(namespaced.hash("k"), plain.hash("app:v1_k"));
    }

    #[test]
    fn test_path_without_sharding() {
        let r = resolver(0);
        let (hash, path) = r.resolve("hello").unwrap();
        assert_eq!(path, PathBuf::from(format!("/cache/{}.cache", hash)));
    }

    #[test]
    fn test_path_with_two_shard_levels() {
        let r = resolver(2);
        let (_, path) = r.resolve("hello").unwrap();
        assert_eq!(
            path,
            PathBuf::from(
                "/cache/2c/f2/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824.cache"
            )
        );
    }

    #[test]
    fn test_is_entry_file() {
        let r = resolver(2);
        let (_, path) = r.resolve("hello").unwrap();
        assert!(r.is_entry_file(&path));
        assert!(!r.is_entry_file(&r.tag_index_path()));
        assert!(!r.is_entry_file(&r.lock_dir().join("abc.lock")));
        assert!(!r.is_entry_file(Path::new("/cache/2c/f2/.tmpXYZ")));
        assert!(!r.is_entry_file(Path::new("/cache/notes.txt")));
    }

    #[test]
    fn test_hash_of_round_trips_path() {
        let r = resolver(2);
        let (hash, path) = r.resolve("hello").unwrap();
        assert_eq!(r.hash_of(&path), Some(hash));
        assert_eq!(r.hash_of(Path::new("/cache/other.txt")), None);
    }
}
