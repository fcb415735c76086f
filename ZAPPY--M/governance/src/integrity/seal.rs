//! Checksums, signatures, and the shared secret that backs them.

use std::{
    fmt,
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use super::snapshot::{signature_payload, TelemetrySnapshot};
use crate::{
    config::KeySettings,
    error::{GovernanceError, GovernanceResult},
};

type HmacSha256 = Hmac<Sha256>;

/// Shortest accepted key, in bytes.
pub const MIN_KEY_BYTES: usize = 16;
/// Length of keys produced by [`SecretKey::generate`].
pub const GENERATED_KEY_BYTES: usize = 32;
const MAX_KEY_FILE_BYTES: u64 = 4096;

/// Why the secret key is unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// No key file and no environment override.
    #[error("secret key missing at {0}")]
    Missing(PathBuf),
    /// Key file readable by other users.
    #[error("secret key {path} is world-readable (mode {mode:o})")]
    WorldReadable {
        /// Key location.
        path: PathBuf,
        /// Permission bits.
        mode: u32,
    },
    /// Key file writable by its group.
    #[error("secret key {path} is group-writable (mode {mode:o})")]
    GroupWritable {
        /// Key location.
        path: PathBuf,
        /// Permission bits.
        mode: u32,
    },
    /// Key could not be read.
    #[error("secret key unreadable: {0}")]
    Unreadable(String),
    /// Key is not valid hex or is too short.
    #[error("secret key malformed: {0}")]
    Malformed(String),
}

/// Shared HMAC key. The bytes never appear in `Debug` output.
#[derive(Clone)]
pub struct SecretKey(Vec<u8>);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({} bytes)", self.0.len())
    }
}

impl SecretKey {
    /// Decodes a hex-encoded key.
    pub fn from_hex(encoded: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|err| KeyError::Malformed(format!("invalid hex: {err}")))?;
        if bytes.len() < MIN_KEY_BYTES {
            return Err(KeyError::Malformed(format!(
                "{} bytes, need at least {MIN_KEY_BYTES}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Fresh random key from the operating system RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; GENERATED_KEY_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Hex form, as stored on disk.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        <HmacSha256 as Mac>::new_from_slice(&self.0)
            .unwrap_or_else(|_| unreachable!("hmac key length is unrestricted"))
    }
}

/// Loads the key, checking storage hygiene.
///
/// A non-empty environment override wins over the file. The file must not
/// be world-readable or group-writable.
pub fn load_secret_key(settings: &KeySettings, path: &Path) -> Result<SecretKey, KeyError> {
    if let Some(var) = &settings.env_override {
        if let Ok(encoded) = std::env::var(var) {
            if !encoded.trim().is_empty() {
                return SecretKey::from_hex(&encoded);
            }
        }
    }

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(KeyError::Missing(path.to_path_buf()))
        }
        Err(err) => return Err(KeyError::Unreadable(format!("{}: {err}", path.display()))),
    };
    let metadata = file
        .metadata()
        .map_err(|err| KeyError::Unreadable(format!("{}: {err}", path.display())))?;
    check_permissions(path, &metadata)?;
    if metadata.len() > MAX_KEY_FILE_BYTES {
        return Err(KeyError::Malformed(format!(
            "{} exceeds {MAX_KEY_FILE_BYTES} bytes",
            path.display()
        )));
    }
    let mut encoded = String::new();
    file.read_to_string(&mut encoded)
        .map_err(|err| KeyError::Unreadable(format!("{}: {err}", path.display())))?;
    SecretKey::from_hex(&encoded)
}

#[cfg(unix)]
fn check_permissions(path: &Path, metadata: &std::fs::Metadata) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode() & 0o7777;
    if mode & 0o004 != 0 {
        return Err(KeyError::WorldReadable {
            path: path.to_path_buf(),
            mode,
        });
    }
    if mode & 0o020 != 0 {
        return Err(KeyError::GroupWritable {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path, _metadata: &std::fs::Metadata) -> Result<(), KeyError> {
    Ok(())
}

/// Writes `key` as hex with owner-only permissions, atomically.
pub fn write_secret_key(path: &Path, key: &SecretKey) -> GovernanceResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|err| GovernanceError::io(parent, err))?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(parent).map_err(|err| GovernanceError::io(parent, err))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(|err| GovernanceError::io(path, err))?;
    }
    tmp.write_all(key.to_hex().as_bytes())
        .map_err(|err| GovernanceError::io(path, err))?;
    tmp.as_file()
        .sync_all()
        .map_err(|err| GovernanceError::io(path, err))?;
    tmp.persist(path)
        .map_err(|err| GovernanceError::io(path, err.error))?;
    Ok(())
}

/// Hex SHA-256 of the snapshot's canonical encoding.
#[must_use]
pub fn compute_checksum(snapshot: &TelemetrySnapshot) -> String {
    hex::encode(Sha256::digest(snapshot.canonical_encoding().as_bytes()))
}

/// Hex HMAC-SHA256 over schema version, checksum, and wall timestamp.
#[must_use]
pub fn compute_signature(key: &SecretKey, snapshot: &TelemetrySnapshot) -> String {
    let mut mac = key.mac();
    mac.update(
        signature_payload(
            snapshot.schema_version,
            &snapshot.integrity_checksum,
            snapshot.wall_timestamp,
        )
        .as_bytes(),
    );
    hex::encode(mac.finalize().into_bytes())
}

/// Whether the stored checksum matches the recomputed one.
#[must_use]
pub fn checksum_matches(snapshot: &TelemetrySnapshot) -> bool {
    let Ok(stored) = hex::decode(snapshot.integrity_checksum.trim()) else {
        return false;
    };
    let computed = Sha256::digest(snapshot.canonical_encoding().as_bytes());
    stored.len() == computed.len() && bool::from(stored.ct_eq(computed.as_slice()))
}

/// Why a signature failed to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureFault {
    /// No signature on the snapshot.
    Missing,
    /// Signature is not hex.
    Malformed,
    /// Signature does not match.
    Mismatch,
}

impl fmt::Display for SignatureFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Missing => "signature missing",
            Self::Malformed => "signature is not valid hex",
            Self::Mismatch => "signature mismatch",
        })
    }
}

/// Verifies the stored signature in constant time.
pub fn verify_signature(
    key: &SecretKey,
    snapshot: &TelemetrySnapshot,
) -> Result<(), SignatureFault> {
    let stored = snapshot
        .signature
        .as_deref()
        .map(str::trim)
        .filter(|sig| !sig.is_empty())
        .ok_or(SignatureFault::Missing)?;
    let stored = hex::decode(stored).map_err(|_| SignatureFault::Malformed)?;
    let mut mac = key.mac();
    mac.update(
        signature_payload(
            snapshot.schema_version,
            &snapshot.integrity_checksum,
            snapshot.wall_timestamp,
        )
        .as_bytes(),
    );
    mac.verify_slice(&stored)
        .map_err(|_| SignatureFault::Mismatch)
}

/// Recomputes checksum and signature in place. Used by producers and by
/// recovery when it rewrites the freeze flag.
pub fn seal_snapshot(snapshot: &mut TelemetrySnapshot, key: &SecretKey) {
    snapshot.integrity_checksum = compute_checksum(snapshot);
    snapshot.signature = Some(compute_signature(key, snapshot));
}

/// Full seal check: checksum first, then signature.
pub fn verify_seal(key: &SecretKey, snapshot: &TelemetrySnapshot) -> Result<(), String> {
    if !checksum_matches(snapshot) {
        return Err("checksum mismatch".into());
    }
    verify_signature(key, snapshot).map_err(|fault| fault.to_string())
}
