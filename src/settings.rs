use std::{path::PathBuf, time::Duration};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, TransportError},
    target::{local_home_dir, local_username, Authentication, ConnectionTarget, DEFAULT_SSH_PORT},
};

pub const INPUT_FILE_VARIABLE: &str = "$inFile";
pub const OUTPUT_FILE_VARIABLE: &str = "$outFile";
pub const USER_VARIABLE: &str = "$USER";
pub const HOME_VARIABLE: &str = "$USER_HOME";

static POSIX_ABSOLUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/").expect("valid posix path pattern"));
static WINDOWS_ABSOLUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z]:[\\/]|\\\\)").expect("valid windows path pattern"));

/// Turns stored ciphertext back into a secret.
pub trait CredentialDecryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// For settings whose secrets are stored unencrypted.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCredentials;

impl CredentialDecryptor for PlaintextCredentials {
    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}

/// Persisted settings of a remote execution step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteExecSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    /// Encrypted.
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
    /// Encrypted.
    pub key_passphrase: Option<String>,
    /// Seconds, zero for none.
    pub timeout: u64,
    pub command: String,
    pub remote_input_file: String,
    pub remote_output_file: String,
    pub disable_known_hosts: bool,
}

impl Default for RemoteExecSettings {
    fn default() -> Self {
        RemoteExecSettings {
            host: String::new(),
            port: DEFAULT_SSH_PORT,
            user: None,
            password: None,
            key_file: None,
            key_passphrase: None,
            timeout: 0,
            command: String::new(),
            remote_input_file: String::new(),
            remote_output_file: String::new(),
            disable_known_hosts: false,
        }
    }
}

impl RemoteExecSettings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|err| TransportError::InvalidSettings(err.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|err| TransportError::InvalidSettings(err.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(TransportError::InvalidSettings("No host specified".into()));
        }
        if self.command.trim().is_empty() {
            return Err(TransportError::InvalidSettings("No remote command specified".into()));
        }
        for (label, path) in [
            ("remote input file", &self.remote_input_file),
            ("remote output file", &self.remote_output_file),
        ] {
            if path.trim().is_empty() {
                return Err(TransportError::InvalidSettings(format!("No {label} specified")));
            }
            if !is_absolute_path(path) {
                return Err(TransportError::InvalidSettings(format!(
                    "The {label} must be an absolute path: {path}"
                )));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.timeout {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        }
    }

    pub fn connection_target(
        &self,
        decryptor: &dyn CredentialDecryptor,
    ) -> Result<ConnectionTarget> {
        let authentication = match (&self.key_file, &self.password) {
            (Some(path), _) => Authentication::PrivateKey {
                path: path.clone(),
                passphrase: decrypt_optional(decryptor, self.key_passphrase.as_deref())?,
            },
            (None, Some(password)) => Authentication::Password(decryptor.decrypt(password)?),
            (None, None) => Authentication::None,
        };

        Ok(ConnectionTarget {
            host: self.host.trim().to_string(),
            port: Some(self.port),
            username: self.user.clone().filter(|user| !user.is_empty()),
            authentication,
            verify_host_key: !self.disable_known_hosts,
        })
    }

    /// The command with the staging and local-user variables filled in.
    pub fn expanded_command(&self) -> String {
        substitute_variables(
            &self.command,
            &[
                (INPUT_FILE_VARIABLE, self.remote_input_file.as_str()),
                (OUTPUT_FILE_VARIABLE, self.remote_output_file.as_str()),
                (HOME_VARIABLE, local_home_dir().as_str()),
                (USER_VARIABLE, local_username().as_str()),
            ],
        )
    }
}

fn decrypt_optional(
    decryptor: &dyn CredentialDecryptor,
    value: Option<&str>,
) -> Result<Option<String>> {
    match value {
        Some(value) if !value.is_empty() => Ok(Some(decryptor.decrypt(value)?)),
        _ => Ok(None),
    }
}

/// Replaces each occurrence of a variable with its value in one left-to-right pass.
/// At every position the variables are tried in the given order, so a variable
/// that is a prefix of another must come after it.
pub fn substitute_variables(template: &str, variables: &[(&str, &str)]) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    'scan: while let Some(ch) = rest.chars().next() {
        if ch == '$' {
            for (name, value) in variables {
                if let Some(after) = rest.strip_prefix(*name) {
                    output.push_str(value);
                    rest = after;
                    continue 'scan;
                }
            }
        }
        output.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    output
}

pub fn is_absolute_path(path: &str) -> bool {
    if cfg!(windows) {
        WINDOWS_ABSOLUTE.is_match(path)
    } else {
        POSIX_ABSOLUTE.is_match(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RemoteExecSettings {
        RemoteExecSettings {
            host: "h".into(),
            user: Some("u".into()),
            command: "run $inFile $outFile".into(),
            remote_input_file: "/tmp/in.csv".into(),
            remote_output_file: "/tmp/out.csv".into(),
            ..RemoteExecSettings::default()
        }
    }

    #[test]
    fn expands_staging_variables() {
        assert_eq!(valid().expanded_command(), "run /tmp/in.csv /tmp/out.csv");
    }

    #[test]
    fn home_variable_wins_over_user_prefix() {
        let expanded = substitute_variables(
            "$USER_HOME/$USER",
            &[("$USER_HOME", "/home/alice"), ("$USER", "alice")],
        );
        assert_eq!(expanded, "/home/alice/alice");
    }

    #[test]
    fn unknown_dollar_sequences_are_kept() {
        let expanded = substitute_variables("echo $PATH $", &[("$USER", "alice")]);
        assert_eq!(expanded, "echo $PATH $");
    }

    #[test]
    fn validation_requires_fields() {
        assert!(valid().validate().is_ok());

        let mut settings = valid();
        settings.host = " ".into();
        assert!(matches!(settings.validate(), Err(TransportError::InvalidSettings(_))));

        let mut settings = valid();
        settings.command.clear();
        assert!(settings.validate().is_err());

        let mut settings = valid();
        settings.remote_output_file.clear();
        assert!(settings.validate().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn validation_requires_absolute_paths() {
        let mut settings = valid();
        settings.remote_input_file = "tmp/in.csv".into();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("absolute path"));
    }

    #[test]
    fn toml_round_trip_uses_persisted_keys() {
        let toml = r#"
            host = "h"
            port = 2222
            command = "run"
            remoteInputFile = "/a"
            remoteOutputFile = "/b"
            disableKnownHosts = true
        "#;
        let settings = RemoteExecSettings::from_toml_str(toml).unwrap();
        assert_eq!(settings.port, 2222);
        assert!(settings.disable_known_hosts);
        assert_eq!(settings.remote_input_file, "/a");
        assert_eq!(settings.timeout, 0);
        assert!(settings.to_toml_string().unwrap().contains("remoteOutputFile"));
    }

    #[test]
    fn connection_target_decrypts_secrets() {
        struct Reverse;
        impl CredentialDecryptor for Reverse {
            fn decrypt(&self, ciphertext: &str) -> Result<String> {
                Ok(ciphertext.chars().rev().collect())
            }
        }

        let mut settings = valid();
        settings.password = Some("terces".into());
        settings.disable_known_hosts = true;
        let target = settings.connection_target(&Reverse).unwrap();
        assert_eq!(target.authentication, Authentication::Password("secret".into()));
        assert!(!target.verify_host_key);
        assert_eq!(target.effective_port(), 22);
    }

    #[test]
    fn zero_timeout_means_none() {
        assert_eq!(valid().connect_timeout(), None);
        let mut settings = valid();
        settings.timeout = 5;
        assert_eq!(settings.connect_timeout(), Some(Duration::from_secs(5)));
    }
}
