//! Secret resolution (§1 scope: a real keyring backend is out of scope).
//! Two reference [`SecretProvider`] implementations: environment variables,
//! the zero-configuration default, and a flat keyfile gated behind the
//! `KEYRING_CRYPTFILE_PASSWORD` environment variable, standing in for the
//! original's encrypted-file keyring without implementing real encryption.

use std::collections::BTreeMap;
use std::path::Path;

use correlator_reactor::SecretProvider;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum SecretsError {
    #[snafu(display("failed to read keyfile {path}: {source}"))]
    Read { path: String, source: std::io::Error },
    #[snafu(display("keyfile {path} is not valid JSON: {source}"))]
    Decode {
        path: String,
        source: serde_json::Error,
    },
    #[snafu(display("{env} is not set; refusing to unlock the cryptfile keyring"))]
    Locked { env: &'static str },
}

/// Resolves `owner.id` from `CORRELATOR_SECRET_<OWNER>_<ID>`, upper-cased
/// with non-alphanumerics folded to `_`. The zero-configuration default.
pub struct EnvSecretProvider;

impl SecretProvider for EnvSecretProvider {
    fn get(&self, owner: &str, id: &str) -> Option<String> {
        let var = format!(
            "CORRELATOR_SECRET_{}_{}",
            screaming_snake(owner),
            screaming_snake(id)
        );
        std::env::var(var).ok()
    }
}

fn screaming_snake(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// A flat `"owner.id" -> secret` map loaded from a keyfile. The passphrase
/// itself is never inspected here (real decryption is out of scope, see
/// DESIGN.md) but its absence refuses to load the file at all, so an
/// unattended process never silently runs with no secrets available when
/// one was expected.
#[derive(Debug)]
pub struct CryptfileSecretProvider {
    secrets: BTreeMap<String, String>,
}

impl CryptfileSecretProvider {
    pub const PASSWORD_ENV: &'static str = "KEYRING_CRYPTFILE_PASSWORD";

    pub fn load(path: &Path) -> Result<Self, SecretsError> {
        if std::env::var_os(Self::PASSWORD_ENV).is_none() {
            return LockedSnafu {
                env: Self::PASSWORD_ENV,
            }
            .fail();
        }
        let display = path.display().to_string();
        let bytes = std::fs::read(path).context(ReadSnafu {
            path: display.clone(),
        })?;
        let secrets = serde_json::from_slice(&bytes).context(DecodeSnafu { path: display })?;
        Ok(CryptfileSecretProvider { secrets })
    }
}

impl SecretProvider for CryptfileSecretProvider {
    fn get(&self, owner: &str, id: &str) -> Option<String> {
        self.secrets.get(&format!("{owner}.{id}")).cloned()
    }
}
