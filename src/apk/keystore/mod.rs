//! Signing credentials out of PKCS#12 and JKS keystores.
use crate::core::error::{CredentialError, SigningError};
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use std::path::Path;

mod jks;
mod pkcs12;

pub use jks::JksKeyStore;
pub use pkcs12::Pkcs12KeyStore;

/// A private key plus its certificate chain, leaf first, as DER.
pub struct Credential {
    pub alias: String,
    pub key: RsaPrivateKey,
    pub chain: Vec<Vec<u8>>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("alias", &self.alias)
            .field("chain", &self.chain.len())
            .finish_non_exhaustive()
    }
}

pub trait KeyStore {
    fn format(&self) -> &'static str;

    /// The form `alias` takes inside this store.
    fn normalize_alias(&self, alias: &str) -> String {
        alias.to_string()
    }

    /// Aliases in the order the keystore lists them.
    fn aliases(&self) -> Vec<String>;

    /// Decrypts the key stored under `alias`, which must exist verbatim.
    fn credential(&self, alias: &str, key_password: &str) -> Result<Credential, CredentialError>;

    /// Resolves `alias` with fallback: exact match, else the first alias in
    /// the store.
    fn resolve(&self, alias: &str, key_password: &str) -> Result<Credential, CredentialError> {
        let aliases = self.aliases();
        let wanted = self.normalize_alias(alias);
        let chosen = pick_alias(&aliases, &wanted)
            .ok_or_else(|| CredentialError::EmptyKeystore(self.format()))?;
        if chosen != wanted {
            log::warn!("Alias `{}` not found, using `{}`", alias, chosen);
        }
        self.credential(chosen, key_password)
    }
}

pub(crate) fn pick_alias<'a>(aliases: &'a [String], wanted: &str) -> Option<&'a str> {
    aliases
        .iter()
        .find(|alias| alias.as_str() == wanted)
        .or_else(|| aliases.first())
        .map(String::as_str)
}

pub(crate) fn rsa_key(alias: &str, pkcs8_der: &[u8]) -> Result<RsaPrivateKey, CredentialError> {
    RsaPrivateKey::from_pkcs8_der(pkcs8_der).map_err(|err| {
        CredentialError::UnsupportedKeyAlgorithm(format!("`{}` is not an RSA key: {}", alias, err))
    })
}

type Loader = fn(&[u8], &str) -> Result<Box<dyn KeyStore>, CredentialError>;

/// Tried in order; the first one that opens the keystore wins.
const LOADERS: [(&str, Loader); 2] = [("PKCS12", pkcs12::load), ("JKS", jks::load)];

pub fn load_keystore(bytes: &[u8], store_password: &str) -> Result<Box<dyn KeyStore>, SigningError> {
    let mut errors = vec![];
    for (format, load) in LOADERS {
        match load(bytes, store_password) {
            Ok(store) => {
                log::debug!("Opened keystore as {}", format);
                return Ok(store);
            }
            Err(err) => {
                log::debug!("Not a {} keystore: {}", format, err);
                errors.push(err);
            }
        }
    }
    Err(SigningError::AllFormatsFailed(errors))
}

/// Loads `path` and resolves one credential from it.
pub fn load_credential(
    path: &Path,
    store_password: &str,
    alias: &str,
    key_password: &str,
) -> Result<Credential, SigningError> {
    if !path.is_file() {
        return Err(SigningError::KeystoreMissing(path.display().to_string()));
    }
    let bytes = std::fs::read(path)
        .map_err(|_| SigningError::KeystoreMissing(path.display().to_string()))?;
    let store = load_keystore(&bytes, store_password)?;
    Ok(store.resolve(alias, key_password)?)
}
