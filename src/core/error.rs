use std::{fmt, io};

/// Failure of a pipeline stage. Every variant carries enough text for the
/// tool layer to show it verbatim.
#[derive(Debug)]
pub enum PipelineError {
    /// The source is not a readable zip, or an entry would escape the working tree.
    Container(String),
    /// The manifest lacks the `manifest` root or the `application` child.
    ManifestStructure(String),
    /// The manifest is not valid binary XML.
    ManifestFormat(String),
    NoStringsTableFound,
    Icon(String),
    Alignment(String),
    Signing(SigningError),
    Cancelled,
    Io(io::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Container(msg) => write!(f, "Container error: {}", msg),
            PipelineError::ManifestStructure(msg) => {
                write!(f, "Manifest structure error: {}", msg)
            }
            PipelineError::ManifestFormat(msg) => write!(f, "Manifest format error: {}", msg),
            PipelineError::NoStringsTableFound => {
                write!(f, "No strings.xml with an app_name entry could be updated")
            }
            PipelineError::Icon(msg) => write!(f, "Icon error: {}", msg),
            PipelineError::Alignment(msg) => write!(f, "Alignment error: {}", msg),
            PipelineError::Signing(e) => write!(f, "Signing error: {}", e),
            PipelineError::Cancelled => write!(f, "Operation cancelled"),
            PipelineError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Signing(e) => Some(e),
            PipelineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PipelineError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<SigningError> for PipelineError {
    fn from(e: SigningError) -> Self {
        Self::Signing(e)
    }
}

/// Why a keystore could not produce a usable key and certificate chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    KeyNotFound(String),
    NotAPrivateKey(String),
    CertificateChainMissing(String),
    UnsupportedCertificateType(String),
    /// The alias passphrase does not decrypt the key.
    UnrecoverableKey(String),
    UnsupportedKeyAlgorithm(String),
    /// The blob is not a keystore of this format, or the passphrase is wrong.
    KeystoreLoad { format: &'static str, reason: String },
    /// The keystore opened but holds no entries.
    EmptyKeystore(&'static str),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::KeyNotFound(alias) => write!(f, "No key found for alias `{}`", alias),
            CredentialError::NotAPrivateKey(alias) => {
                write!(f, "Entry `{}` is not a private key", alias)
            }
            CredentialError::CertificateChainMissing(alias) => {
                write!(f, "Entry `{}` has no certificate chain", alias)
            }
            CredentialError::UnsupportedCertificateType(msg) => {
                write!(f, "Unsupported certificate type: {}", msg)
            }
            CredentialError::UnrecoverableKey(alias) => {
                write!(f, "Cannot recover key `{}` with the given password", alias)
            }
            CredentialError::UnsupportedKeyAlgorithm(msg) => {
                write!(f, "Unsupported key algorithm: {}", msg)
            }
            CredentialError::KeystoreLoad { format, reason } => {
                write!(f, "Cannot load {} keystore: {}", format, reason)
            }
            CredentialError::EmptyKeystore(format) => {
                write!(f, "{} keystore contains no entries", format)
            }
        }
    }
}

impl std::error::Error for CredentialError {}

#[derive(Debug)]
pub enum SigningError {
    InputMissing(String),
    KeystoreMissing(String),
    Credential(CredentialError),
    /// No loader accepted the keystore. One message per attempted format.
    AllFormatsFailed(Vec<CredentialError>),
    /// Building or verifying the signature block failed.
    Apk(String),
    MinSdkTooLow(u32),
}

impl fmt::Display for SigningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningError::InputMissing(path) => write!(f, "Unsigned APK not found: {}", path),
            SigningError::KeystoreMissing(path) => write!(f, "Keystore not found: {}", path),
            SigningError::Credential(e) => write!(f, "{}", e),
            SigningError::AllFormatsFailed(errors) => {
                write!(f, "Keystore could not be loaded")?;
                for e in errors {
                    write!(f, "; {}", e)?;
                }
                Ok(())
            }
            SigningError::Apk(msg) => write!(f, "APK signing failed: {}", msg),
            SigningError::MinSdkTooLow(sdk) => write!(
                f,
                "Minimum SDK {} requires v1 signatures, which are not produced (need 24 or later)",
                sdk
            ),
        }
    }
}

impl std::error::Error for SigningError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SigningError::Credential(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CredentialError> for SigningError {
    fn from(e: CredentialError) -> Self {
        Self::Credential(e)
    }
}

/// The boolean-plus-diagnostic pair handed to the tool layer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Outcome {
    pub success: bool,
    pub message: Option<String>,
}

impl<T, E: fmt::Display> From<Result<T, E>> for Outcome {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(_) => Self {
                success: true,
                message: None,
            },
            Err(e) => Self {
                success: false,
                message: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_combine_loader_messages() {
        let err = SigningError::AllFormatsFailed(vec![
            CredentialError::KeystoreLoad {
                format: "PKCS12",
                reason: "bad mac".into(),
            },
            CredentialError::KeystoreLoad {
                format: "JKS",
                reason: "bad magic".into(),
            },
        ]);
        let message = err.to_string();
        assert!(message.contains("PKCS12"));
        assert!(message.contains("bad mac"));
        assert!(message.contains("JKS"));
        assert!(message.contains("bad magic"));
    }

    #[test]
    fn should_turn_results_into_outcomes() {
        let ok: Result<(), PipelineError> = Ok(());
        assert_eq!(
            Outcome::from(ok),
            Outcome {
                success: true,
                message: None
            }
        );
        let err: Result<(), PipelineError> = Err(PipelineError::NoStringsTableFound);
        let outcome = Outcome::from(err);
        assert!(!outcome.success);
        assert!(outcome.message.unwrap().contains("strings.xml"));
    }
}
