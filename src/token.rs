//! Token files for activated service accounts.
//!
//! Activating a service account yields a refresh token. The engine writes
//! it to a file only when the user opts in with `allow_token_file`, and the
//! file is created owner-read/write only.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ProviderError, Result};

/// Contents of a token file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFile {
    /// Kind of token, `Service Account`.
    pub token_type: String,
    /// The refresh token.
    pub refresh_token: String,
    /// Name of the user that activated the account.
    pub updated_by: String,
    /// When the token was issued, as returned by VCD.
    pub updated_on: String,
}

/// Refuse to write a token file unless the user acknowledged it.
pub fn ensure_allowed(allow_token_file: bool, path: &str) -> Result<()> {
    if allow_token_file {
        return Ok(());
    }
    Err(ProviderError::SensitiveInfo(format!(
        "writing the service account token to '{}' stores sensitive information on disk; \
         set allow_token_file = true to acknowledge this",
        path
    )))
}

/// Write the token file with mode 0600.
pub fn write_token_file(path: &Path, token: &TokenFile) -> Result<()> {
    let body = serde_json::to_vec_pretty(token)?;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // An existing file keeps its old mode through `open`.
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(&body)?;
    file.sync_all()?;

    info!(path = %path.display(), "wrote service account token file");
    Ok(())
}
