// 🗄️ Object Storage - buckets of opaque blobs addressed by key
// Uploads never overwrite; downloads go through time-limited signed URLs

use crate::error::{AppError, AppResult};
use chrono::{DateTime, Duration, Utc};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

pub const UPLOADS_BUCKET: &str = "uploads";
pub const EXPORTS_BUCKET: &str = "exports";

/// Signed download links stay valid for one hour
pub const SIGNED_URL_TTL_SECS: i64 = 3600;

// ============================================================================
// OBJECT STORE
// ============================================================================

pub trait ObjectStore: Send + Sync {
    /// Write a new object. Fails if the key already exists.
    fn upload(&self, bucket: &str, key: &str, bytes: &[u8]) -> AppResult<()>;

    fn read(&self, bucket: &str, key: &str) -> AppResult<Vec<u8>>;

    /// Remove objects; keys that do not exist are ignored
    fn remove(&self, bucket: &str, keys: &[&str]) -> AppResult<()>;

    fn exists(&self, bucket: &str, key: &str) -> bool;

    /// Build a signed URL for downloading `key`, valid for `ttl_secs`
    fn signed_url(&self, bucket: &str, key: &str, ttl_secs: i64) -> AppResult<String>;
}

/// Filesystem-backed store: `{root}/{bucket}/{key}`
pub struct LocalObjectStore {
    root: PathBuf,
    public_url: String,
    signer: UrlSigner,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_url: &str, signing_secret: &str) -> Self {
        LocalObjectStore {
            root: root.into(),
            public_url: public_url.trim_end_matches('/').to_string(),
            signer: UrlSigner::new(signing_secret),
        }
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    fn object_path(&self, bucket: &str, key: &str) -> AppResult<PathBuf> {
        validate_segment(bucket)?;
        validate_key(key)?;
        Ok(self.root.join(bucket).join(key))
    }
}

impl ObjectStore for LocalObjectStore {
    fn upload(&self, bucket: &str, key: &str, bytes: &[u8]) -> AppResult<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // create_new gives us the no-overwrite guarantee atomically
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(AppError::Storage(format!(
                    "Object already exists: {}/{}",
                    bucket, key
                )));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(bytes)?;
        file.sync_all()?;

        log::debug!("Stored object {}/{} ({} bytes)", bucket, key, bytes.len());
        Ok(())
    }

    fn read(&self, bucket: &str, key: &str) -> AppResult<Vec<u8>> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("object {}/{}", bucket, key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, bucket: &str, keys: &[&str]) -> AppResult<()> {
        for key in keys {
            let path = self.object_path(bucket, key)?;
            match fs::remove_file(&path) {
                Ok(()) => log::debug!("Removed object {}/{}", bucket, key),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn exists(&self, bucket: &str, key: &str) -> bool {
        self.object_path(bucket, key)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    fn signed_url(&self, bucket: &str, key: &str, ttl_secs: i64) -> AppResult<String> {
        if !self.exists(bucket, key) {
            return Err(AppError::NotFound(format!("object {}/{}", bucket, key)));
        }
        let expires = Utc::now() + Duration::seconds(ttl_secs);
        let signed = self.signer.sign(bucket, key, expires)?;
        Ok(format!(
            "{}/storage/{}/{}?expires={}&signature={}",
            self.public_url,
            bucket,
            key,
            signed.expires,
            signed.signature
        ))
    }
}

// ============================================================================
// URL SIGNING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedParams {
    /// Unix seconds
    pub expires: i64,
    pub signature: String,
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over `{bucket}/{key}\n{expires}`, base64url without padding
#[derive(Clone)]
pub struct UrlSigner {
    secret: String,
}

impl UrlSigner {
    pub fn new(secret: &str) -> Self {
        UrlSigner {
            secret: secret.to_string(),
        }
    }

    pub fn sign(&self, bucket: &str, key: &str, expires: DateTime<Utc>) -> AppResult<SignedParams> {
        let expires = expires.timestamp();
        let tag = self.mac(bucket, key, expires)?.finalize().into_bytes();
        Ok(SignedParams {
            expires,
            signature: URL_SAFE_NO_PAD.encode(tag),
        })
    }

    /// Check signature and expiry against `now`
    pub fn verify(
        &self,
        bucket: &str,
        key: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if now.timestamp() > expires {
            return false;
        }
        let Ok(tag) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        match self.mac(bucket, key, expires) {
            Ok(mac) => mac.verify_slice(&tag).is_ok(),
            Err(_) => false,
        }
    }

    fn mac(&self, bucket: &str, key: &str, expires: i64) -> AppResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| AppError::Storage(format!("Invalid signing key: {}", e)))?;
        mac.update(format!("{}/{}\n{}", bucket, key, expires).as_bytes());
        Ok(mac)
    }
}

fn validate_segment(segment: &str) -> AppResult<()> {
    if segment.is_empty()
        || !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::Storage(format!("Invalid bucket name: {}", segment)));
    }
    Ok(())
}

/// Keys are relative paths without `..`, root or prefix components
fn validate_key(key: &str) -> AppResult<()> {
    let path = Path::new(key);
    let valid = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(AppError::Storage(format!("Invalid object key: {}", key)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> LocalObjectStore {
        LocalObjectStore::new(dir.path(), "http://localhost:3000/", "secret")
    }

    #[test]
    fn test_upload_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        store.upload(UPLOADS_BUCKET, "user/1_a.csv", b"first").unwrap();
        let second = store.upload(UPLOADS_BUCKET, "user/1_a.csv", b"second");

        assert!(matches!(second, Err(AppError::Storage(_))));
        assert_eq!(store.read(UPLOADS_BUCKET, "user/1_a.csv").unwrap(), b"first");
    }

    #[test]
    fn test_remove_ignores_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        store.upload(UPLOADS_BUCKET, "user/1_a.csv", b"x").unwrap();
        store
            .remove(UPLOADS_BUCKET, &["user/1_a.csv", "user/missing.csv"])
            .unwrap();

        assert!(!store.exists(UPLOADS_BUCKET, "user/1_a.csv"));
    }

    #[test]
    fn test_rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        assert!(store.upload(UPLOADS_BUCKET, "../escape.csv", b"x").is_err());
        assert!(store.upload(UPLOADS_BUCKET, "/etc/passwd", b"x").is_err());
        assert!(store.upload("up/loads", "a.csv", b"x").is_err());
    }

    #[test]
    fn test_signed_url_verifies_and_expires() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.upload(UPLOADS_BUCKET, "user/1_a.csv", b"x").unwrap();

        let url = store
            .signed_url(UPLOADS_BUCKET, "user/1_a.csv", SIGNED_URL_TTL_SECS)
            .unwrap();
        assert!(url.starts_with("http://localhost:3000/storage/uploads/user/1_a.csv?expires="));

        let now = Utc::now();
        let signed = store
            .signer()
            .sign(UPLOADS_BUCKET, "user/1_a.csv", now + Duration::seconds(SIGNED_URL_TTL_SECS))
            .unwrap();

        assert!(store.signer().verify(
            UPLOADS_BUCKET,
            "user/1_a.csv",
            signed.expires,
            &signed.signature,
            now
        ));
        // Tampered key
        assert!(!store.signer().verify(
            UPLOADS_BUCKET,
            "user/2_b.csv",
            signed.expires,
            &signed.signature,
            now
        ));
        // Past expiry
        assert!(!store.signer().verify(
            UPLOADS_BUCKET,
            "user/1_a.csv",
            signed.expires,
            &signed.signature,
            now + Duration::seconds(SIGNED_URL_TTL_SECS + 1)
        ));
    }

    #[test]
    fn test_signature_is_keyed_by_secret() {
        let expires = Utc::now() + Duration::seconds(60);
        let signed = UrlSigner::new("secret")
            .sign(UPLOADS_BUCKET, "user/1_a.csv", expires)
            .unwrap();
        let now = Utc::now();

        assert!(!signed.signature.contains('='));
        assert!(!UrlSigner::new("other").verify(
            UPLOADS_BUCKET,
            "user/1_a.csv",
            signed.expires,
            &signed.signature,
            now
        ));
        assert!(!UrlSigner::new("secret").verify(
            UPLOADS_BUCKET,
            "user/1_a.csv",
            signed.expires,
            "not base64!",
            now
        ));
        assert!(!UrlSigner::new("secret").verify(
            EXPORTS_BUCKET,
            "user/1_a.csv",
            signed.expires,
            &signed.signature,
            now
        ));
    }

    #[test]
    fn test_signed_url_requires_existing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let result = store.signed_url(UPLOADS_BUCKET, "user/nothing.pdf", 60);
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
