//! Auth token for the networked transport.
//!
//! The token is generated from the OS random source, persisted under the
//! user's home directory with owner-only permissions, and compared in
//! constant time on every connection.

pub use crate::error::AuthError;
use rand::rngs::OsRng;
use rand::RngCore;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Number of random bytes in a generated token.
pub const TOKEN_BYTES: usize = 32;

/// Where a token lives on disk.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
    /// The parent directory belongs to devbox and is kept owner-only even
    /// if it already existed.
    owns_dir: bool,
}

impl TokenStore {
    /// Store at an explicit path. Only directories created for it are
    /// restricted; an existing parent keeps its mode.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owns_dir: false,
        }
    }

    /// Store at `~/.devbox/auth/auth_token`.
    pub fn default_location() -> Result<Self, AuthError> {
        let dirs = directories::BaseDirs::new().ok_or(AuthError::HomeDirUnavailable)?;
        Ok(Self {
            path: dirs.home_dir().join(".devbox").join("auth").join("auth_token"),
            owns_dir: true,
        })
    }

    /// Path of the token file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted token. A missing or empty file is `None`.
    pub fn read(&self) -> Result<Option<String>, AuthError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(AuthError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Persist a token, replacing any previous one.
    ///
    /// Missing directories are created owner-only, and the file is written
    /// to a sibling opened with mode 0600 and renamed into place, so the
    /// secret is never readable by others at any point.
    pub fn write(&self, token: &str) -> Result<(), AuthError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| AuthError::Io { path, source }
        };

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            create_private_dir(dir, self.owns_dir).map_err(io_err(dir))?;
        }

        let tmp = self
            .path
            .with_extension(format!("tmp.{}", std::process::id()));
        let _ = std::fs::remove_file(&tmp);

        let mut file = open_private(&tmp).map_err(io_err(&tmp))?;
        file.write_all(token.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.sync_all())
            .map_err(io_err(&tmp))?;
        drop(file);

        std::fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;
        tracing::debug!(path = %self.path.display(), "Auth token persisted");
        Ok(())
    }
}

/// Create `dir` and its missing ancestors with mode 0700. Directories that
/// already existed are left alone unless `tighten_existing` is set.
#[cfg(unix)]
fn create_private_dir(dir: &Path, tighten_existing: bool) -> std::io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    let mut restrict: Vec<PathBuf> = dir
        .ancestors()
        .take_while(|p| !p.as_os_str().is_empty() && !p.exists())
        .map(Path::to_path_buf)
        .collect();
    if tighten_existing && restrict.is_empty() {
        restrict.push(dir.to_path_buf());
    }

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    // The umask may have cleared owner bits on the new directories
    for path in &restrict {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path, _tighten_existing: bool) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}

/// Where the active token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Given by the operator.
    Supplied,
    /// Read from the token file.
    Persisted,
    /// Freshly generated and written to the token file.
    Generated,
}

/// The token the server will accept.
#[derive(Clone)]
pub struct ResolvedToken {
    pub token: String,
    pub source: TokenSource,
}

impl std::fmt::Debug for ResolvedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedToken")
            .field("token", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

/// Generate a token: 32 bytes from the OS random source, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Decide the active token.
///
/// Without `regenerate`, a supplied token wins, then a persisted one.
/// Otherwise a new token is generated and persisted.
pub fn resolve_token(
    supplied: Option<&str>,
    regenerate: bool,
    store: &TokenStore,
) -> Result<ResolvedToken, AuthError> {
    if !regenerate {
        if let Some(token) = supplied.map(str::trim).filter(|t| !t.is_empty()) {
            return Ok(ResolvedToken {
                token: token.to_string(),
                source: TokenSource::Supplied,
            });
        }
        if let Some(token) = store.read()? {
            tracing::info!(path = %store.path().display(), "Using persisted auth token");
            return Ok(ResolvedToken {
                token,
                source: TokenSource::Persisted,
            });
        }
    }

    let token = generate_token();
    store.write(&token)?;
    tracing::info!(path = %store.path().display(), regenerate, "Generated new auth token");
    Ok(ResolvedToken {
        token,
        source: TokenSource::Generated,
    })
}

/// Constant-time token comparison.
pub fn verify_token(presented: &str, expected: &str) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    let diff = presented
        .as_bytes()
        .iter()
        .zip(expected.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

/// URL a client connects to: `ws://host:port?token=...`.
pub fn connection_url(host: &str, port: u16, token: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("ws://[{host}]:{port}?token={token}")
    } else {
        format!("ws://{host}:{port}?token={token}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> TokenStore {
        TokenStore::new(dir.path().join("auth").join("auth_token"))
    }

    #[test]
    fn test_generate_token() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_verify_token() {
        assert!(verify_token("abc123", "abc123"));
        assert!(!verify_token("abc124", "abc123"));
        assert!(!verify_token("abc12", "abc123"));
        assert!(!verify_token("", "abc123"));
    }

    #[test]
    fn test_persisted_token_read_back_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let first = resolve_token(None, false, &store).unwrap();
        assert_eq!(first.source, TokenSource::Generated);

        let second = resolve_token(None, false, &store).unwrap();
        assert_eq!(second.source, TokenSource::Persisted);
        assert_eq!(second.token.as_bytes(), first.token.as_bytes());
    }

    #[test]
    fn test_supplied_token_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.write("persisted").unwrap();

        let resolved = resolve_token(Some("operator"), false, &store).unwrap();
        assert_eq!(resolved.token, "operator");
        assert_eq!(resolved.source, TokenSource::Supplied);
        // Blank supplied tokens are ignored
        let resolved = resolve_token(Some("  "), false, &store).unwrap();
        assert_eq!(resolved.token, "persisted");
    }

    #[test]
    fn test_regenerate_overrides_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.write("persisted").unwrap();

        let resolved = resolve_token(Some("operator"), true, &store).unwrap();
        assert_eq!(resolved.source, TokenSource::Generated);
        assert_ne!(resolved.token, "persisted");
        assert_eq!(store.read().unwrap(), Some(resolved.token));
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        resolve_token(None, false, &store).unwrap();

        let file_mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);

        let dir_mode = std::fs::metadata(store.path().parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_parent_keeps_its_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared");
        std::fs::create_dir(&shared).unwrap();
        std::fs::set_permissions(&shared, std::fs::Permissions::from_mode(0o755)).unwrap();

        let store = TokenStore::new(shared.join("token"));
        store.write("abc").unwrap();
        let mode = std::fs::metadata(&shared).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let file_mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);

        // Nested directories created for the token are private
        let nested = TokenStore::new(shared.join("a").join("b").join("token"));
        nested.write("abc").unwrap();
        for created in [shared.join("a"), shared.join("a").join("b")] {
            let mode = std::fs::metadata(&created).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700, "{}", created.display());
        }
        assert_eq!(
            std::fs::metadata(&shared).unwrap().permissions().mode() & 0o777,
            0o755
        );
    }

    #[test]
    fn test_connection_url() {
        assert_eq!(
            connection_url("127.0.0.1", 7681, "abc"),
            "ws://127.0.0.1:7681?token=abc"
        );
        assert_eq!(connection_url("::1", 7681, "abc"), "ws://[::1]:7681?token=abc");
    }

    #[test]
    fn test_resolved_token_debug_redacts() {
        let resolved = ResolvedToken {
            token: "secret".into(),
            source: TokenSource::Supplied,
        };
        assert!(!format!("{resolved:?}").contains("secret"));
    }
}
