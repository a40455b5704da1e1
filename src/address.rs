use std::fmt;

use once_cell::sync::Lazy;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;

use crate::{
    error::{Result, TransportError},
    target::{Authentication, ConnectionTarget},
};

pub const SCHEME: &str = "remote-file";

/// Path bytes escaped on display so the result parses back to the same path.
const PATH_ESCAPES: &AsciiSet = &CONTROLS.add(b' ').add(b'%').add(b';');

static TYPE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*);type=([dai])$").expect("valid type suffix pattern"));

/// A parsed `remote-file://[user[:password]@]host[:port]/path[;type=d]` address.
#[derive(Clone, PartialEq, Eq)]
pub struct ResourceAddress {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    /// Path with any `;type=` marker removed.
    pub path: String,
    pub directory_request: bool,
}

impl ResourceAddress {
    pub fn parse(address: &str) -> Result<ResourceAddress> {
        let invalid = |reason: &str| TransportError::InvalidAddress {
            address: redact(address),
            reason: reason.to_string(),
        };

        let rest = address
            .strip_prefix(SCHEME)
            .and_then(|rest| rest.strip_prefix("://"))
            .ok_or_else(|| invalid("expected scheme remote-file://"))?;

        let (authority, raw_path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, "/"),
        };

        let (userinfo, hostport) = match authority.rfind('@') {
            Some(index) => (Some(&authority[..index]), &authority[index + 1..]),
            None => (None, authority),
        };

        let (user, password) = match userinfo {
            Some(userinfo) => match userinfo.split_once(':') {
                Some((user, password)) => (Some(decode(user)), Some(decode(password))),
                None => (Some(decode(userinfo)), None),
            },
            None => (None, None),
        };

        let (host, port) = match hostport.strip_prefix('[') {
            Some(bracketed) => {
                let (host, after) = bracketed
                    .split_once(']')
                    .ok_or_else(|| invalid("unterminated IPv6 host"))?;
                (host, after.strip_prefix(':'))
            }
            None => match hostport.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (hostport, None),
            },
        };
        let port = match port {
            Some(port) => Some(port.parse::<u16>().map_err(|_| invalid("port is not a number"))?),
            None => None,
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        // the marker only counts unencoded, an escaped `;type=d` is part of the name
        let (path, directory_request) = match TYPE_SUFFIX.captures(raw_path) {
            Some(captures) => (decode(&captures[1]), &captures[2] == "d"),
            None => (decode(raw_path), false),
        };

        Ok(ResourceAddress {
            user: user.filter(|user| !user.is_empty()),
            password,
            host: host.to_string(),
            port,
            path,
            directory_request,
        })
    }

    /// Connection target for this address; credentials come from the userinfo if present.
    pub fn connection_target(&self) -> ConnectionTarget {
        ConnectionTarget {
            host: self.host.clone(),
            port: self.port,
            username: self.user.clone(),
            authentication: match &self.password {
                Some(password) => Authentication::Password(password.clone()),
                None => Authentication::None,
            },
            verify_host_key: true,
        }
    }
}

impl fmt::Debug for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceAddress")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("directory_request", &self.directory_request)
            .finish()
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}://")?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "{}", utf8_percent_encode(&self.path, PATH_ESCAPES))?;
        if self.directory_request {
            write!(f, ";type=d")?;
        }
        Ok(())
    }
}

fn decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

fn redact(address: &str) -> String {
    let Some(rest) = address.split_once("://").map(|(_, rest)| rest) else {
        return address.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => match rest[..at].split_once(':') {
            Some((user, _)) => address.replacen(&rest[..at], &format!("{user}:***"), 1),
            None => address.to_string(),
        },
        None => address.to_string(),
    }
}
