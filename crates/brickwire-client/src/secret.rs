//! Where the authentication secret comes from.
//!
//! `connection.secret` in `config.toml` is either the secret itself or a
//! reference to it:
//!
//! | value               | source                                      |
//! |---------------------|---------------------------------------------|
//! | `pass::daemon/home` | first line of `pass show daemon/home`       |
//! | `env::BRICKD_SECRET`| the environment variable                    |
//! | `file::/etc/brickd` | the file, minus its trailing newline        |
//! | anything else       | used as is                                  |

use std::process::Command;

use crate::error::{ClientError, ClientResult};

/// A parsed `connection.secret` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretRef<'a> {
    Literal(&'a str),
    PasswordStore(&'a str),
    Environment(&'a str),
    File(&'a str),
}

impl<'a> SecretRef<'a> {
    pub fn parse(raw: &'a str) -> Self {
        [
            ("pass::", Self::PasswordStore as fn(&'a str) -> Self),
            ("env::", Self::Environment),
            ("file::", Self::File),
        ]
        .into_iter()
        .find_map(|(prefix, make)| raw.strip_prefix(prefix).map(make))
        .unwrap_or(Self::Literal(raw))
    }

    /// Fetches the secret. Failures are reported as configuration errors.
    pub fn load(&self) -> ClientResult<String> {
        match *self {
            Self::Literal(secret) => Ok(secret.to_owned()),
            Self::Environment(name) => std::env::var(name)
                .map_err(|_| secret_error(format!("environment variable `{name}` is not set"))),
            Self::File(path) => std::fs::read_to_string(path)
                .map(|content| content.trim_end_matches(['\r', '\n']).to_owned())
                .map_err(|e| secret_error(format!("cannot read `{path}`: {e}"))),
            Self::PasswordStore(entry) => from_password_store(entry),
        }
    }
}

/// Parses and loads `raw` in one go.
pub fn resolve(raw: &str) -> ClientResult<String> {
    SecretRef::parse(raw).load()
}

fn from_password_store(entry: &str) -> ClientResult<String> {
    let shown = Command::new("pass")
        .args(["show", entry])
        .output()
        .map_err(|e| secret_error(format!("cannot run pass for `{entry}`: {e}")))?;

    if !shown.status.success() {
        let reason = String::from_utf8_lossy(&shown.stderr);
        return Err(secret_error(format!(
            "pass has no entry `{entry}` ({}): {}",
            shown.status,
            reason.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&shown.stdout);
    match stdout.lines().next() {
        Some(line) => Ok(line.to_owned()),
        None => Err(secret_error(format!("pass entry `{entry}` is empty"))),
    }
}

fn secret_error(detail: String) -> ClientError {
    ClientError::Config(format!("failed to resolve secret: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_select_the_source() {
        assert_eq!(SecretRef::parse("s3cret"), SecretRef::Literal("s3cret"));
        assert_eq!(SecretRef::parse(""), SecretRef::Literal(""));
        assert_eq!(
            SecretRef::parse("pass::brickd/lab"),
            SecretRef::PasswordStore("brickd/lab")
        );
        assert_eq!(SecretRef::parse("env::X"), SecretRef::Environment("X"));
        assert_eq!(SecretRef::parse("file::/tmp/s"), SecretRef::File("/tmp/s"));
        // only a leading prefix counts
        assert_eq!(
            SecretRef::parse("my-env::thing"),
            SecretRef::Literal("my-env::thing")
        );
    }

    #[test]
    fn literal_is_returned_unchanged() {
        assert_eq!(resolve("  spaced ").unwrap(), "  spaced ");
    }

    #[test]
    fn reads_environment() {
        unsafe {
            std::env::set_var("_BRICKWIRE_SECRET_UNDER_TEST", "lab-daemon");
        }
        let secret = resolve("env::_BRICKWIRE_SECRET_UNDER_TEST");
        unsafe {
            std::env::remove_var("_BRICKWIRE_SECRET_UNDER_TEST");
        }
        assert_eq!(secret.unwrap(), "lab-daemon");
    }

    #[test]
    fn unset_environment_is_a_config_error() {
        let err = resolve("env::_BRICKWIRE_SECRET_NEVER_SET").unwrap_err();
        assert!(matches!(err, ClientError::Config(ref msg) if msg.contains("is not set")));
    }

    #[test]
    fn file_loses_only_the_line_ending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brickd-secret");
        std::fs::write(&path, " two words \r\n").unwrap();

        let secret = resolve(&format!("file::{}", path.display())).unwrap();
        assert_eq!(secret, " two words ");
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = resolve("file::/nonexistent/brickwire/secret").unwrap_err();
        assert!(matches!(err, ClientError::Config(ref msg) if msg.contains("cannot read")));
    }

    #[test]
    fn unknown_pass_entry_fails() {
        assert!(resolve("pass::brickwire/no/such/entry").is_err());
    }
}
