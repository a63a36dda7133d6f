//! Durable ACME account registrations.
//!
//! Registrations live in a JSON array file, one record per
//! `(provider, email)` pair, with the account key embedded as base64
//! encoded PKCS#8. Updates rewrite the whole file under an exclusive
//! lock file so concurrent writers cannot interleave.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::keys::KeyPair;

//------------ ProviderRegistration ------------------------------------------

/// One account registration at an ACME provider.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProviderRegistration {
    pub provider: String,
    pub email: String,
    /// The account key, base64 encoded PKCS#8 DER.
    #[serde(rename = "key")]
    pub encoded_key: String,
    /// The provider's registration resource, kept verbatim.
    pub registration_resource: Option<serde_json::Value>,
}

impl ProviderRegistration {
    pub fn new(
        provider: &str,
        email: &str,
        account_key: &KeyPair,
        registration_resource: serde_json::Value,
    ) -> Self {
        ProviderRegistration {
            provider: provider.to_string(),
            email: email.to_string(),
            encoded_key: BASE64.encode(account_key.to_pkcs8_der()),
            registration_resource: Some(registration_resource),
        }
    }

    /// Decodes the embedded account key.
    pub fn account_key(&self) -> Result<KeyPair, Error> {
        let der = BASE64
            .decode(&self.encoded_key)
            .map_err(|e| Error::protocol(format!("cannot decode account key: {}", e)))?;
        KeyPair::from_pkcs8_der(&der)
    }

    fn matches(&self, provider: &str, email: &str) -> bool {
        self.provider == provider && self.email == email
    }
}

//------------ File handling -------------------------------------------------

/// Reads all registrations; a missing file is an empty list.
pub fn read_all(path: &Path) -> Result<Vec<ProviderRegistration>, Error> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::protocol(format!(
                "cannot read registrations file '{}': {}",
                path.display(),
                e
            )))
        }
    };
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&bytes).map_err(|e| {
        Error::protocol(format!(
            "cannot parse registrations file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Looks up the registration for a `(provider, email)` pair.
pub fn find(
    path: &Path,
    provider: &str,
    email: &str,
) -> Result<Option<ProviderRegistration>, Error> {
    let _lock = FileLock::lock(path)?;
    Ok(read_all(path)?
        .into_iter()
        .find(|registration| registration.matches(provider, email)))
}

/// Returns the registration for `(provider, email)`, creating and
/// persisting one through `make` if none exists yet.
///
/// The lock is held for the whole read-modify-write, so two concurrent
/// callers cannot both register.
pub fn ensure(
    path: &Path,
    provider: &str,
    email: &str,
    make: impl FnOnce() -> Result<ProviderRegistration, Error>,
) -> Result<ProviderRegistration, Error> {
    let _lock = FileLock::lock(path)?;

    if let Some(existing) = read_all(path)?
        .into_iter()
        .find(|registration| registration.matches(provider, email))
    {
        return Ok(existing);
    }

    let registration = make()?;
    write_upsert(path, &registration)?;
    Ok(registration)
}

/// Inserts or replaces the registration matching `(provider, email)`,
/// rewriting the file pretty-printed.
pub fn upsert(path: &Path, registration: &ProviderRegistration) -> Result<(), Error> {
    let _lock = FileLock::lock(path)?;
    write_upsert(path, registration)
}

fn write_upsert(path: &Path, registration: &ProviderRegistration) -> Result<(), Error> {
    let mut registrations = read_all(path)?;
    match registrations
        .iter_mut()
        .find(|existing| existing.matches(&registration.provider, &registration.email))
    {
        Some(existing) => *existing = registration.clone(),
        None => registrations.push(registration.clone()),
    }

    let bytes = serde_json::to_vec_pretty(&registrations)
        .map_err(|e| Error::protocol(format!("cannot marshal registrations: {}", e)))?;
    fs::write(path, bytes).map_err(|e| {
        Error::protocol(format!(
            "cannot write registrations file '{}': {}",
            path.display(),
            e
        ))
    })
}

//------------ FileLock ------------------------------------------------------

/// An exclusive lock on the registrations file, held through a sibling
/// lock file created with `create_new`.
#[derive(Debug)]
struct FileLock {
    _file: File,
    lock_path: PathBuf,
}

impl FileLock {
    const POLL_LOCK_INTERVAL: Duration = Duration::from_millis(10);

    fn lock(path: &Path) -> Result<Self, Error> {
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        if let Some(parent) = path.parent() {
            if !parent.try_exists().unwrap_or_default() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::protocol(format!(
                        "cannot create dir for lock file {}: {}",
                        lock_path.display(),
                        e
                    ))
                })?;
            }
        }

        let file = loop {
            let file = OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&lock_path);

            match file {
                Ok(file) => break file,
                _ => thread::sleep(Self::POLL_LOCK_INTERVAL),
            };
        };

        Ok(FileLock {
            _file: file,
            lock_path,
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        fs::remove_file(&self.lock_path).ok();
    }
}

//------------ Tests ---------------------------------------------------------
