//! Reader for the legacy Java `JKS` keystore format.
//!
//! Layout (big endian): magic, version, entry count, entries, then a SHA-1
//! over `password ‖ "Mighty Aphrodite" ‖ everything before it`. Private keys
//! are `EncryptedPrivateKeyInfo` blobs sealed with Sun's proprietary
//! SHA-1 keystream protector.
use super::{rsa_key, Credential, KeyStore};
use crate::core::error::CredentialError;
use anyhow::Result;
use byteorder::{BigEndian, ReadBytesExt};
use rasn::types::OctetString;
use rasn::{AsnType, Decode, Encode};
use rasn_pkix::AlgorithmIdentifier;
use sha1::{Digest, Sha1};
use std::io::{Cursor, Read};

const FORMAT: &str = "JKS";
const MAGIC: u32 = 0xfeed_feed;
const JCEKS_MAGIC: u32 = 0xcece_cece;
const PRIVATE_KEY_TAG: u32 = 1;
const TRUSTED_CERT_TAG: u32 = 2;
const WHITENER: &[u8] = b"Mighty Aphrodite";
const DIGEST_LEN: usize = 20;
/// DER of OID 1.3.6.1.4.1.42.2.17.1.1, the key protector algorithm.
const KEY_PROTECTOR_OID: &[u8] = &[
    0x06, 0x0a, 0x2b, 0x06, 0x01, 0x04, 0x01, 0x2a, 0x02, 0x11, 0x01, 0x01,
];

#[derive(AsnType, Clone, Debug, Decode, Encode)]
struct EncryptedPrivateKeyInfo {
    algorithm: AlgorithmIdentifier,
    encrypted_data: OctetString,
}

enum Entry {
    PrivateKey {
        protected_key: Vec<u8>,
        chain: Vec<(String, Vec<u8>)>,
    },
    TrustedCertificate,
}

pub struct JksKeyStore {
    entries: Vec<(String, Entry)>,
    store_password: String,
}

pub(super) fn load(bytes: &[u8], password: &str) -> Result<Box<dyn KeyStore>, CredentialError> {
    Ok(Box::new(JksKeyStore::load(bytes, password)?))
}

/// Java chars as big-endian UTF-16, the way the key derivations expect them.
fn password_bytes(password: &str) -> Vec<u8> {
    password.encode_utf16().flat_map(u16::to_be_bytes).collect()
}

fn read_utf<R: Read>(r: &mut R) -> Result<String> {
    let len = r.read_u16::<BigEndian>()?;
    let mut buf = vec![0; len as usize];
    r.read_exact(&mut buf)?;
    Ok(cesu8::from_java_cesu8(&buf)
        .map_err(|_| anyhow::anyhow!("invalid modified UTF-8"))?
        .into_owned())
}

fn read_blob<R: Read>(r: &mut R, remaining: usize) -> Result<Vec<u8>> {
    let len = r.read_u32::<BigEndian>()? as usize;
    anyhow::ensure!(len <= remaining, "entry length {} exceeds keystore size", len);
    let mut buf = vec![0; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_certificate<R: Read>(r: &mut R, version: u32, remaining: usize) -> Result<(String, Vec<u8>)> {
    let ty = if version == 2 {
        read_utf(r)?
    } else {
        "X.509".to_string()
    };
    Ok((ty, read_blob(r, remaining)?))
}

fn parse_entries(body: &[u8]) -> Result<Vec<(String, Entry)>> {
    let mut r = Cursor::new(body);
    let magic = r.read_u32::<BigEndian>()?;
    anyhow::ensure!(magic != JCEKS_MAGIC, "JCEKS keystores are not supported");
    anyhow::ensure!(magic == MAGIC, "bad magic 0x{:08x}", magic);
    let version = r.read_u32::<BigEndian>()?;
    anyhow::ensure!(version == 1 || version == 2, "unknown version {}", version);
    let count = r.read_u32::<BigEndian>()?;
    let mut entries = vec![];
    for _ in 0..count {
        let tag = r.read_u32::<BigEndian>()?;
        let alias = read_utf(&mut r)?;
        let _timestamp = r.read_u64::<BigEndian>()?;
        let entry = match tag {
            PRIVATE_KEY_TAG => {
                let protected_key = read_blob(&mut r, body.len())?;
                let chain_len = r.read_u32::<BigEndian>()?;
                let mut chain = vec![];
                for _ in 0..chain_len {
                    chain.push(read_certificate(&mut r, version, body.len())?);
                }
                Entry::PrivateKey {
                    protected_key,
                    chain,
                }
            }
            TRUSTED_CERT_TAG => {
                read_certificate(&mut r, version, body.len())?;
                Entry::TrustedCertificate
            }
            tag => anyhow::bail!("unknown entry tag {}", tag),
        };
        log::trace!("JKS entry `{}`", alias);
        entries.push((alias, entry));
    }
    anyhow::ensure!(
        r.position() as usize == body.len(),
        "trailing bytes after {} entries",
        count
    );
    Ok(entries)
}

/// Reverses the key protector. Returns `None` when the password is wrong.
fn recover_key(protected: &[u8], password: &str) -> Option<Vec<u8>> {
    if protected.len() < 2 * DIGEST_LEN {
        return None;
    }
    let password = password_bytes(password);
    let (salt, rest) = protected.split_at(DIGEST_LEN);
    let (encrypted, check) = rest.split_at(rest.len() - DIGEST_LEN);

    let mut digest = salt.to_vec();
    let mut plain = Vec::with_capacity(encrypted.len());
    for block in encrypted.chunks(DIGEST_LEN) {
        digest = Sha1::new()
            .chain_update(&password)
            .chain_update(&digest)
            .finalize()
            .to_vec();
        plain.extend(block.iter().zip(&digest).map(|(c, k)| c ^ k));
    }
    let expected = Sha1::new()
        .chain_update(&password)
        .chain_update(&plain)
        .finalize();
    (expected.as_slice() == check).then_some(plain)
}

impl JksKeyStore {
    pub fn load(bytes: &[u8], password: &str) -> Result<Self, CredentialError> {
        let fail = |reason: String| CredentialError::KeystoreLoad {
            format: FORMAT,
            reason,
        };
        if bytes.len() < 12 + DIGEST_LEN {
            return Err(fail("too short".to_string()));
        }
        let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
        let entries = parse_entries(body).map_err(|err| fail(format!("{:#}", err)))?;
        let expected = Sha1::new()
            .chain_update(password_bytes(password))
            .chain_update(WHITENER)
            .chain_update(body)
            .finalize();
        if expected.as_slice() != digest {
            return Err(fail("keystore was tampered with, or password was incorrect".to_string()));
        }
        if entries.is_empty() {
            return Err(CredentialError::EmptyKeystore(FORMAT));
        }
        Ok(Self {
            entries,
            store_password: password.to_string(),
        })
    }
}

impl KeyStore for JksKeyStore {
    fn format(&self) -> &'static str {
        FORMAT
    }

    /// keytool stores aliases lower-cased.
    fn normalize_alias(&self, alias: &str) -> String {
        alias.to_lowercase()
    }

    fn aliases(&self) -> Vec<String> {
        self.entries.iter().map(|(alias, _)| alias.clone()).collect()
    }

    fn credential(&self, alias: &str, key_password: &str) -> Result<Credential, CredentialError> {
        let (protected_key, chain) = match self.entries.iter().find(|(a, _)| a == alias) {
            Some((_, Entry::PrivateKey { protected_key, chain })) => (protected_key, chain),
            Some((_, Entry::TrustedCertificate)) => {
                return Err(CredentialError::NotAPrivateKey(alias.to_string()))
            }
            None => return Err(CredentialError::KeyNotFound(alias.to_string())),
        };
        if chain.is_empty() {
            return Err(CredentialError::CertificateChainMissing(alias.to_string()));
        }
        if let Some((ty, _)) = chain.iter().find(|(ty, _)| ty != "X.509") {
            return Err(CredentialError::UnsupportedCertificateType(ty.clone()));
        }
        for (_, der) in chain {
            rasn::der::decode::<rasn_pkix::Certificate>(der).map_err(|err| {
                CredentialError::UnsupportedCertificateType(format!("`{}`: {}", alias, err))
            })?;
        }

        let info = rasn::der::decode::<EncryptedPrivateKeyInfo>(protected_key)
            .map_err(|_| CredentialError::UnrecoverableKey(alias.to_string()))?;
        let oid = rasn::der::encode(&info.algorithm.algorithm)
            .map_err(|_| CredentialError::UnrecoverableKey(alias.to_string()))?;
        if oid != KEY_PROTECTOR_OID {
            return Err(CredentialError::UnsupportedKeyAlgorithm(format!(
                "`{}` is not protected with the JKS key protector",
                alias
            )));
        }
        let password = if key_password.is_empty() {
            self.store_password.as_str()
        } else {
            key_password
        };
        let plain = recover_key(&info.encrypted_data, password)
            .ok_or_else(|| CredentialError::UnrecoverableKey(alias.to_string()))?;
        Ok(Credential {
            alias: alias.to_string(),
            key: rsa_key(alias, &plain)?,
            chain: chain.iter().map(|(_, der)| der.clone()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::keystore::tests::TESTDATA;
    use std::path::Path;

    fn fixture() -> Vec<u8> {
        std::fs::read(Path::new(TESTDATA).join("release.jks")).unwrap()
    }

    #[test]
    fn should_decrypt_the_private_key() {
        let store = JksKeyStore::load(&fixture(), "jkspass").unwrap();
        assert_eq!(store.aliases(), vec!["foo".to_string()]);
        let credential = store.credential("foo", "keypass").unwrap();
        assert_eq!(credential.chain.len(), 1);
    }

    #[test]
    fn should_match_aliases_case_insensitively() {
        let store = JksKeyStore::load(&fixture(), "jkspass").unwrap();
        assert_eq!(store.resolve("FOO", "keypass").unwrap().alias, "foo");
        assert_eq!(store.normalize_alias("Release"), "release");
    }

    #[test]
    fn should_reject_a_wrong_store_password() {
        let err = JksKeyStore::load(&fixture(), "nope").err().unwrap();
        assert!(matches!(err, CredentialError::KeystoreLoad { format: "JKS", .. }));
    }

    #[test]
    fn should_reject_a_wrong_key_password() {
        let store = JksKeyStore::load(&fixture(), "jkspass").unwrap();
        let err = store.credential("foo", "wrong").err().unwrap();
        assert_eq!(err, CredentialError::UnrecoverableKey("foo".to_string()));
    }

    #[test]
    fn should_reject_other_magic() {
        let mut bytes = fixture();
        bytes[..4].copy_from_slice(&JCEKS_MAGIC.to_be_bytes());
        let err = JksKeyStore::load(&bytes, "jkspass").err().unwrap();
        assert!(err.to_string().contains("JCEKS"), "{}", err);
    }

    #[test]
    fn should_encode_passwords_as_java_chars() {
        assert_eq!(password_bytes("ab"), vec![0, b'a', 0, b'b']);
    }
}
