//! Host identity verification.
//!
//! The policy is explicit configuration. The default,
//! [`HostKeyPolicy::TrustOnFirstUse`], accepts and records a host the first
//! time it is seen without asking anyone. That is the main security caveat
//! of this tool: the first connection to a host is not protected against
//! an active man-in-the-middle. Every newly trusted key is logged at warn
//! level with its fingerprint.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, KnownHostFileKind, Session as SshSession};

use super::{TransportError, DEFAULT_PORT};

/// How unknown and changed host keys are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Accept and record unknown hosts; reject changed keys.
    #[default]
    TrustOnFirstUse,
    /// Accept only hosts already present in the known hosts file.
    Strict,
    /// Skip verification entirely.
    AcceptAny,
}

impl HostKeyPolicy {
    /// Returns the configuration spelling of the policy.
    pub fn as_str(self) -> &'static str {
        match self {
            HostKeyPolicy::TrustOnFirstUse => "trust-on-first-use",
            HostKeyPolicy::Strict => "strict",
            HostKeyPolicy::AcceptAny => "accept-any",
        }
    }
}

impl fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trust-on-first-use" | "tofu" => Ok(HostKeyPolicy::TrustOnFirstUse),
            "strict" => Ok(HostKeyPolicy::Strict),
            "accept-any" => Ok(HostKeyPolicy::AcceptAny),
            other => Err(format!(
                "unknown host key policy {other:?} (expected trust-on-first-use, strict or accept-any)"
            )),
        }
    }
}

/// What to do with a presented host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Key matches a known entry, or checking is disabled.
    Accept,
    /// Unknown host under trust-on-first-use: accept and persist.
    Record,
    /// Key differs from the recorded one.
    Mismatch,
    /// Refuse the connection.
    Reject(String),
}

/// Maps a known-hosts lookup result through a policy.
pub fn decide(policy: HostKeyPolicy, check: CheckResult) -> Decision {
    match (policy, check) {
        (HostKeyPolicy::AcceptAny, _) => Decision::Accept,
        (_, CheckResult::Match) => Decision::Accept,
        (_, CheckResult::Mismatch) => Decision::Mismatch,
        (HostKeyPolicy::TrustOnFirstUse, CheckResult::NotFound) => Decision::Record,
        (HostKeyPolicy::Strict, CheckResult::NotFound) => {
            Decision::Reject("host is not in known hosts and policy is strict".to_string())
        }
        (_, CheckResult::Failure) => Decision::Reject("known hosts lookup failed".to_string()),
    }
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// The key was already known.
    Known,
    /// The key was trusted on first use and recorded.
    Learned,
    /// Verification is disabled.
    Unchecked,
}

/// Verifies host keys against an OpenSSH known hosts file.
#[derive(Debug, Clone)]
pub struct HostKeyVerifier {
    policy: HostKeyPolicy,
    known_hosts: PathBuf,
}

impl HostKeyVerifier {
    /// Creates a verifier backed by the given known hosts file.
    pub fn new(policy: HostKeyPolicy, known_hosts: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            known_hosts: known_hosts.into(),
        }
    }

    /// Returns the active policy.
    pub fn policy(&self) -> HostKeyPolicy {
        self.policy
    }

    /// Returns the known hosts file path.
    pub fn known_hosts_path(&self) -> &Path {
        &self.known_hosts
    }

    /// Checks the key presented during the handshake of `session`.
    pub fn verify(
        &self,
        session: &SshSession,
        host: &str,
        port: u16,
    ) -> Result<HostKeyStatus, TransportError> {
        let (key, key_type) = session.host_key().ok_or_else(|| TransportError::HostKeyRejected {
            host: host.to_string(),
            reason: "server presented no host key".to_string(),
        })?;
        let fingerprint = fingerprint(key);

        if self.policy == HostKeyPolicy::AcceptAny {
            tracing::warn!(
                host = %host,
                fingerprint = %fingerprint,
                "Host key verification disabled; accepting key"
            );
            return Ok(HostKeyStatus::Unchecked);
        }

        let mut known_hosts = session
            .known_hosts()
            .map_err(|e| TransportError::Handshake(format!("known hosts unavailable: {e}")))?;
        if self.known_hosts.exists() {
            known_hosts
                .read_file(&self.known_hosts, KnownHostFileKind::OpenSSH)
                .map_err(|e| TransportError::HostKeyRejected {
                    host: host.to_string(),
                    reason: format!("unreadable known hosts file: {e}"),
                })?;
        }

        match decide(self.policy, known_hosts.check_port(host, port, key)) {
            Decision::Accept => {
                tracing::debug!(host = %host, fingerprint = %fingerprint, "Host key matched");
                Ok(HostKeyStatus::Known)
            }
            Decision::Record => {
                tracing::warn!(
                    host = %host,
                    port = port,
                    fingerprint = %fingerprint,
                    "Trusting previously unseen host key on first use"
                );
                let entry = known_hosts_entry(host, port);
                known_hosts
                    .add(&entry, key, "added by pbshell", key_type.into())
                    .map_err(|e| TransportError::HostKeyRejected {
                        host: host.to_string(),
                        reason: format!("could not record key: {e}"),
                    })?;
                if let Some(parent) = self.known_hosts.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                known_hosts
                    .write_file(&self.known_hosts, KnownHostFileKind::OpenSSH)
                    .map_err(|e| TransportError::HostKeyRejected {
                        host: host.to_string(),
                        reason: format!("could not write known hosts file: {e}"),
                    })?;
                Ok(HostKeyStatus::Learned)
            }
            Decision::Mismatch => {
                tracing::error!(
                    host = %host,
                    port = port,
                    fingerprint = %fingerprint,
                    "HOST KEY MISMATCH; refusing connection"
                );
                Err(TransportError::HostKeyMismatch {
                    host: host.to_string(),
                    fingerprint,
                })
            }
            Decision::Reject(reason) => Err(TransportError::HostKeyRejected {
                host: host.to_string(),
                reason,
            }),
        }
    }
}

/// Known hosts spelling of a host: bare for port 22, `[host]:port` otherwise.
pub fn known_hosts_entry(host: &str, port: u16) -> String {
    if port == DEFAULT_PORT {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

/// OpenSSH-style `SHA256:<base64>` fingerprint of a raw host key.
pub fn fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest);
    format!("SHA256:{b64}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_tofu() {
        assert_eq!(HostKeyPolicy::default(), HostKeyPolicy::TrustOnFirstUse);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("strict".parse(), Ok(HostKeyPolicy::Strict));
        assert_eq!("TOFU".parse(), Ok(HostKeyPolicy::TrustOnFirstUse));
        assert_eq!("accept-any".parse(), Ok(HostKeyPolicy::AcceptAny));
        assert!("yolo".parse::<HostKeyPolicy>().is_err());
    }

    #[test]
    fn test_policy_display_roundtrips() {
        for policy in [
            HostKeyPolicy::TrustOnFirstUse,
            HostKeyPolicy::Strict,
            HostKeyPolicy::AcceptAny,
        ] {
            assert_eq!(policy.to_string().parse(), Ok(policy));
        }
    }

    #[test]
    fn test_tofu_decisions() {
        let p = HostKeyPolicy::TrustOnFirstUse;
        assert_eq!(decide(p, CheckResult::Match), Decision::Accept);
        assert_eq!(decide(p, CheckResult::NotFound), Decision::Record);
        assert_eq!(decide(p, CheckResult::Mismatch), Decision::Mismatch);
        assert!(matches!(decide(p, CheckResult::Failure), Decision::Reject(_)));
    }

    #[test]
    fn test_strict_decisions() {
        let p = HostKeyPolicy::Strict;
        assert_eq!(decide(p, CheckResult::Match), Decision::Accept);
        assert!(matches!(decide(p, CheckResult::NotFound), Decision::Reject(_)));
        assert_eq!(decide(p, CheckResult::Mismatch), Decision::Mismatch);
    }

    #[test]
    fn test_accept_any_ignores_mismatch() {
        let p = HostKeyPolicy::AcceptAny;
        assert_eq!(decide(p, CheckResult::Mismatch), Decision::Accept);
        assert_eq!(decide(p, CheckResult::NotFound), Decision::Accept);
    }

    #[test]
    fn test_known_hosts_entry() {
        assert_eq!(known_hosts_entry("db01", 22), "db01");
        assert_eq!(known_hosts_entry("db01", 2222), "[db01]:2222");
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"test key data");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        // 32-byte digest without padding is 43 base64 characters
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }
}
