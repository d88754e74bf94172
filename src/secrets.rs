//! Instance passwords in the OS keyring.
//!
//! Passwords are keyed by login and instance so the same login can hold
//! different passwords on different servers.

use keyring::Entry;
use tracing::{debug, warn};

use crate::error::{FleetError, Result};

const SERVICE_NAME: &str = "sqlfleet";

/// Reads and writes instance passwords in the OS keyring.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore;

impl CredentialStore {
    /// Creates a new credential store.
    pub fn new() -> Self {
        Self
    }

    /// Generates the keyring key for a login on an instance.
    pub fn password_key(instance: &str, user: &str) -> String {
        format!("{}@{}", user, instance.to_lowercase())
    }

    /// Stores a password for a login on an instance.
    pub fn store(&self, instance: &str, user: &str, password: &str) -> Result<()> {
        let entry = Self::entry(instance, user)?;
        entry
            .set_password(password)
            .map_err(|e| FleetError::config(format!("Failed to store password: {e}")))
    }

    /// Retrieves a password, returning `None` if nothing is stored or the
    /// keyring is unavailable.
    pub fn lookup(&self, instance: &str, user: &str) -> Option<String> {
        let entry = match Self::entry(instance, user) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Keyring unavailable: {e}");
                return None;
            }
        };

        match entry.get_password() {
            Ok(secret) => Some(secret),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!("Failed to read password for {user} on {instance}: {e}");
                None
            }
        }
    }

    /// Deletes a stored password. Missing entries are not an error.
    pub fn delete(&self, instance: &str, user: &str) -> Result<()> {
        let entry = Self::entry(instance, user)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(FleetError::config(format!("Failed to delete password: {e}"))),
        }
    }

    fn entry(instance: &str, user: &str) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &Self::password_key(instance, user))
            .map_err(|e| FleetError::config(format!("Failed to access keyring: {e}")))
    }

    /// Masks a secret for display, showing only the last 2 characters.
    pub fn mask(secret: &str) -> String {
        let chars: Vec<char> = secret.chars().collect();
        if chars.len() <= 4 {
            "*".repeat(chars.len())
        } else {
            let tail: String = chars[chars.len() - 2..].iter().collect();
            format!("{}{}", "*".repeat(6), tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_key() {
        assert_eq!(
            CredentialStore::password_key(r"SQL01\REPORTING", "sa"),
            r"sa@sql01\reporting"
        );
    }

    #[test]
    fn test_mask_short() {
        assert_eq!(CredentialStore::mask("abc"), "***");
    }

    #[test]
    fn test_mask_long() {
        assert_eq!(CredentialStore::mask("correcthorse"), "******se");
    }
}
