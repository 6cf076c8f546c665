//! Credential sources: stored user tokens and interactive prompts.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use snafu::prelude::*;

/// Errors reading or parsing a stored user token.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TokenError {
    /// The token is not of the form `key@host:port`.
    #[snafu(display("Malformed user token, expected key@host:port"))]
    Malformed,

    /// The token file could not be read.
    #[snafu(display("Cannot read user token at {}: {source}", path.display()))]
    Read {
        /// Token file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// A stored session token: an existing session key plus where it is valid.
#[derive(Clone, PartialEq, Eq)]
pub struct UserToken {
    /// Session key to join.
    pub session_key: String,
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
}

impl fmt::Debug for UserToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserToken")
            .field("session_key", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl FromStr for UserToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, address) = s.trim().split_once('@').context(MalformedSnafu)?;
        let (host, port) = address.rsplit_once(':').context(MalformedSnafu)?;
        let port = port.parse::<u16>().ok().context(MalformedSnafu)?;
        ensure!(!key.is_empty() && !host.is_empty(), MalformedSnafu);
        Ok(UserToken {
            session_key: key.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

/// Somewhere a stored user token may be found.
pub trait TokenSource: Send + Sync {
    /// The stored token, `None` if there is none.
    fn get_token(&self) -> Result<Option<UserToken>, TokenError>;
}

/// Token stored as a single line in a local file.
#[derive(Debug, Clone)]
pub struct UserTokenFile {
    path: PathBuf,
}

impl UserTokenFile {
    /// Read the token from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$HOME/.omero_user_token/token`, where the user token tool stores it.
    pub fn default_location() -> Option<Self> {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| Self::new(home.join(".omero_user_token").join("token")))
    }

    /// Token file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenSource for UserTokenFile {
    fn get_token(&self) -> Result<Option<UserToken>, TokenError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(TokenError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if contents.trim().is_empty() {
            return Ok(None);
        }
        contents.parse().map(Some)
    }
}

/// Connection details offered to, and returned from, a prompt.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Server host.
    pub server: Option<String>,
    /// Server port.
    pub port: Option<u16>,
    /// Username.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Answer from a [`CredentialPrompter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// The user supplied details. Unset fields keep their previous values.
    Prompted(Credentials),
    /// The user declined.
    Cancelled,
}

/// Asks the user for connection details.
///
/// Console and notebook front-ends implement this; environment detection
/// happens outside this crate.
pub trait CredentialPrompter: Send + Sync {
    /// Prompt, showing `defaults` as the current values.
    fn prompt_for_credentials(&self, defaults: &Credentials) -> PromptOutcome;
}

/// Prompter that always answers with fixed credentials.
#[derive(Debug, Clone)]
pub struct StaticPrompter(pub PromptOutcome);

impl CredentialPrompter for StaticPrompter {
    fn prompt_for_credentials(&self, _defaults: &Credentials) -> PromptOutcome {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_key_host_port() {
        let token: UserToken = "abc-123@omero.example.org:4064".parse().unwrap();
        assert_eq!(token.session_key, "abc-123");
        assert_eq!(token.host, "omero.example.org");
        assert_eq!(token.port, 4064);
    }

    #[test]
    fn rejects_malformed_tokens() {
        for bad in ["abc", "abc@host", "@host:1", "abc@host:port", "abc@:4064"] {
            assert!(bad.parse::<UserToken>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn token_debug_hides_key() {
        let token: UserToken = "secret@h:1".parse().unwrap();
        assert!(!format!("{token:?}").contains("secret"));
    }

    #[test]
    fn token_file_missing_is_none() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = TempDir::new()?;
        let source = UserTokenFile::new(tmp.path().join("token"));
        assert_eq!(source.get_token()?, None);

        std::fs::write(source.path(), "k@localhost:4064\n")?;
        let token = source.get_token()?.expect("token present");
        assert_eq!(token.host, "localhost");
        Ok(())
    }
}
