//! Line-detail pattern matching, split out from the transaction state
//! machine in `lib.rs`. Each `detect_*` function mirrors one sshd log line
//! shape and returns the fields it carries, or `None` when the detail does
//! not match that shape.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

pub struct InvalidUserProps {
    pub user: String,
    pub addr: String,
}

pub fn detect_invalid_user(detail: &str) -> Option<InvalidUserProps> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^Invalid user (\S+) from (\S+) port (\d+)").unwrap());
    let caps = re.captures(detail)?;
    Some(InvalidUserProps {
        user: caps[1].to_string(),
        addr: caps[2].to_string(),
    })
}

pub struct PasswordFailureProps {
    pub user: String,
    pub addr: String,
    pub port: String,
}

pub fn detect_passwordfailure(detail: &str) -> Option<PasswordFailureProps> {
    static RE: OnceLock<Regex> = OnceLock::new();
    static RE_INVALID: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^Failed password for (\S+) from (\S+) port (\S+)").unwrap());
    if let Some(caps) = re.captures(detail) {
        return Some(PasswordFailureProps {
            user: caps[1].to_string(),
            addr: caps[2].to_string(),
            port: caps[3].to_string(),
        });
    }
    let re_invalid = RE_INVALID.get_or_init(|| {
        Regex::new(r"^Failed password for invalid user (\S+) from (\S+) port (\S+)").unwrap()
    });
    re_invalid.captures(detail).map(|caps| PasswordFailureProps {
        user: caps[1].to_string(),
        addr: caps[2].to_string(),
        port: caps[3].to_string(),
    })
}

/// Free-form `key=value` pairs from a `pam_unix(sshd:auth): authentication
/// failure; ...` line. Shape varies (not every field is always present), so
/// unlike the other detectors this returns a loose map rather than a struct.
pub fn detect_authfailure(detail: &str) -> Option<HashMap<String, String>> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"authentication failure;\s+(.+)\s*$").unwrap());
    let caps = re.captures(detail)?;
    let mut props = HashMap::new();
    for pair in caps[1].split_whitespace() {
        if let Some((key, value)) = pair.split_once('=') {
            props.insert(key.to_string(), value.to_string());
        }
    }
    (!props.is_empty()).then_some(props)
}

pub struct AcceptedProps {
    pub auth: String,
    pub user: String,
    pub addr: String,
    pub port: String,
    pub key: Option<String>,
}

pub fn detect_accepted(detail: &str) -> Option<AcceptedProps> {
    static RE_PUBKEY: OnceLock<Regex> = OnceLock::new();
    static RE_PASSWORD: OnceLock<Regex> = OnceLock::new();

    let re_pubkey = RE_PUBKEY.get_or_init(|| {
        Regex::new(r"^Accepted publickey for (\S+) from (\S+) port (\S+) ssh2: RSA (\S+)").unwrap()
    });
    if let Some(caps) = re_pubkey.captures(detail) {
        return Some(AcceptedProps {
            auth: "rsa".to_string(),
            user: caps[1].to_string(),
            addr: caps[2].to_string(),
            port: caps[3].to_string(),
            key: Some(caps[4].to_string()),
        });
    }

    let re_password =
        RE_PASSWORD.get_or_init(|| Regex::new(r"^Accepted password for (\S+) from (\S+) port (\S+)").unwrap());
    re_password.captures(detail).map(|caps| AcceptedProps {
        auth: "password".to_string(),
        user: caps[1].to_string(),
        addr: caps[2].to_string(),
        port: caps[3].to_string(),
        key: None,
    })
}

pub fn detect_open(detail: &str) -> Option<()> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"^pam_unix\(sshd:session\): session opened for user (\S+) by (\S+)").unwrap());
    re.is_match(detail).then_some(())
}

pub fn detect_close(detail: &str) -> Option<()> {
    (detail.starts_with("Connection closed")
        || detail.starts_with("pam_unix(sshd:session): session closed"))
    .then_some(())
}
