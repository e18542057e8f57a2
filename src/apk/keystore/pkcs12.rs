use super::{rsa_key, Credential, KeyStore};
use crate::core::error::CredentialError;
use p12_keystore::KeyStoreEntry;

const FORMAT: &str = "PKCS12";

/// PKCS#12 store. Keys are protected by the store password only, so the
/// alias password is ignored.
pub struct Pkcs12KeyStore {
    store: p12_keystore::KeyStore,
}

pub(super) fn load(bytes: &[u8], password: &str) -> Result<Box<dyn KeyStore>, CredentialError> {
    Ok(Box::new(Pkcs12KeyStore::load(bytes, password)?))
}

impl Pkcs12KeyStore {
    pub fn load(bytes: &[u8], password: &str) -> Result<Self, CredentialError> {
        let store = p12_keystore::KeyStore::from_pkcs12(bytes, password).map_err(|err| {
            CredentialError::KeystoreLoad {
                format: FORMAT,
                reason: err.to_string(),
            }
        })?;
        if store.entries_count() == 0 {
            return Err(CredentialError::EmptyKeystore(FORMAT));
        }
        Ok(Self { store })
    }
}

impl KeyStore for Pkcs12KeyStore {
    fn format(&self) -> &'static str {
        FORMAT
    }

    fn aliases(&self) -> Vec<String> {
        self.store.entries().map(|(alias, _)| alias.clone()).collect()
    }

    fn credential(&self, alias: &str, _key_password: &str) -> Result<Credential, CredentialError> {
        let chain = match self.store.entry(alias) {
            Some(KeyStoreEntry::PrivateKeyChain(chain)) => chain,
            Some(KeyStoreEntry::Certificate(_)) => {
                return Err(CredentialError::NotAPrivateKey(alias.to_string()))
            }
            None => return Err(CredentialError::KeyNotFound(alias.to_string())),
        };
        if chain.chain().is_empty() {
            return Err(CredentialError::CertificateChainMissing(alias.to_string()));
        }
        Ok(Credential {
            alias: alias.to_string(),
            key: rsa_key(alias, chain.key())?,
            chain: chain.chain().iter().map(|cert| cert.as_der().to_vec()).collect(),
        })
    }
}
