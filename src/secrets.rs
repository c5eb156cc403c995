use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::errors::{AppError, AppResult};

/// Local key-value storage for the values handed over by the backend
/// redirect. Values are kept verbatim with no expiry.
#[derive(Clone)]
pub struct SecretVault {
    service_name: String,
    backend: SecretBackend,
}

#[derive(Clone)]
enum SecretBackend {
    Keyring,
    Memory(Arc<Mutex<HashMap<String, SecretString>>>),
    #[cfg(test)]
    Unavailable,
}

impl SecretVault {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: SecretBackend::Keyring,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: SecretBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    /// Every operation fails, as the keyring does on a host without a
    /// secret service.
    #[cfg(test)]
    pub fn unavailable() -> Self {
        Self {
            service_name: "unavailable".to_string(),
            backend: SecretBackend::Unavailable,
        }
    }

    pub fn read_secret(&self, account: &str) -> AppResult<Option<SecretString>> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.get_password() {
                    Ok(value) => Ok(Some(SecretString::new(value.into()))),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            SecretBackend::Memory(store) => Ok(store.lock().get(account).cloned()),
            #[cfg(test)]
            SecretBackend::Unavailable => Err(unavailable_error()),
        }
    }

    pub fn write_secret(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                entry.set_password(secret.expose_secret())?;
            }
            SecretBackend::Memory(store) => {
                store.lock().insert(account.to_string(), secret.clone());
            }
            #[cfg(test)]
            SecretBackend::Unavailable => return Err(unavailable_error()),
        }
        debug!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            "stored value"
        );
        Ok(())
    }

    pub fn delete(&self, account: &str) -> AppResult<()> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.delete_password() {
                    Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            SecretBackend::Memory(store) => {
                store.lock().remove(account);
                Ok(())
            }
            #[cfg(test)]
            SecretBackend::Unavailable => Err(unavailable_error()),
        }
    }

    pub fn has(&self, account: &str) -> AppResult<bool> {
        self.read_secret(account).map(|secret| secret.is_some())
    }
}

#[cfg(test)]
fn unavailable_error() -> AppError {
    AppError::Keychain(keyring::Error::PlatformFailure(
        "no secret service provider or dbus session found".into(),
    ))
}
