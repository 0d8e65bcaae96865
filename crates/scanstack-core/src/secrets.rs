//! Secret/key manager.
//!
//! Each service that authenticates against the application gets one
//! credential per run. The first call to `get_or_create` for a service picks
//! the value (user-supplied, then the first non-placeholder value found in
//! existing artifacts, then a fresh UUID) and every later call returns the
//! same `Arc`, so every artifact written in a run carries the identical
//! instance.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::ServiceKind;

/// Credentials issued in one run, keyed by service.
pub type Credentials = BTreeMap<ServiceKind, Credential>;

/// Values that mean "no credential yet". Compared after trimming.
pub const PLACEHOLDERS: &[&str] = &[
    "",
    "GENERATE_ON_STARTUP",
    "CHANGE_ME",
    "changeme",
    "your-api-key-here",
    "your_api_key_here",
    "<api-key>",
];

pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim();
    PLACEHOLDERS.iter().any(|p| *p == value)
}

/// An opaque per-service secret shared by reference within one run.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Arc<str>);

impl Credential {
    fn new(value: &str) -> Self {
        Credential(Arc::from(value.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether both handles point at the same allocated secret.
    pub fn same_instance(&self, other: &Credential) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(***)")
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an existing credential value was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialSource {
    User,
    EnvFile,
    NativeConfig,
    Manifest,
    Generated,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CredentialSource::User => "config",
            CredentialSource::EnvFile => ".env",
            CredentialSource::NativeConfig => "native config",
            CredentialSource::Manifest => "manifest",
            CredentialSource::Generated => "generated",
        };
        f.write_str(s)
    }
}

/// A credential value read back out of an artifact on disk.
#[derive(Debug, Clone)]
pub struct ExistingValue {
    pub source: CredentialSource,
    pub value: String,
}

impl ExistingValue {
    pub fn new(source: CredentialSource, value: impl Into<String>) -> Self {
        Self {
            source,
            value: value.into(),
        }
    }
}

/// What the manager decided for one service.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialChoice {
    pub service: ServiceKind,
    pub source: CredentialSource,
}

#[derive(Debug, Default)]
pub struct SecretManager {
    issued: BTreeMap<ServiceKind, (Credential, CredentialSource)>,
    warnings: Vec<String>,
}

impl SecretManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the run's credential for `service`, choosing it on first call.
    ///
    /// `existing` is scanned in priority order; the first non-placeholder value
    /// wins and any other non-placeholder value that disagrees is reported.
    pub fn get_or_create(
        &mut self,
        service: ServiceKind,
        user_supplied: Option<&str>,
        existing: &[ExistingValue],
    ) -> Credential {
        if let Some((credential, _)) = self.issued.get(&service) {
            return credential.clone();
        }

        let (credential, source) = match self.pick(service, user_supplied, existing) {
            Some(found) => found,
            None => {
                info!(service = %service, "Generating new credential");
                (
                    Credential::new(&Uuid::new_v4().to_string()),
                    CredentialSource::Generated,
                )
            }
        };

        self.issued.insert(service, (credential.clone(), source));
        credential
    }

    /// Like `get_or_create`, but never generates: remote services own their
    /// key and a fresh one would not match it.
    pub fn reuse_only(
        &mut self,
        service: ServiceKind,
        user_supplied: Option<&str>,
        existing: &[ExistingValue],
    ) -> Option<Credential> {
        if let Some((credential, _)) = self.issued.get(&service) {
            return Some(credential.clone());
        }
        let (credential, source) = self.pick(service, user_supplied, existing)?;
        self.issued.insert(service, (credential.clone(), source));
        Some(credential)
    }

    fn pick(
        &mut self,
        service: ServiceKind,
        user_supplied: Option<&str>,
        existing: &[ExistingValue],
    ) -> Option<(Credential, CredentialSource)> {
        let mut candidates: Vec<ExistingValue> = user_supplied
            .map(|v| ExistingValue::new(CredentialSource::User, v))
            .into_iter()
            .collect();
        candidates.extend(existing.iter().cloned());

        let mut valid = candidates.iter().filter(|c| !is_placeholder(&c.value));
        let chosen = valid.next()?;
        for other in valid {
            if other.value.trim() != chosen.value.trim() {
                let msg = format!(
                    "{}: credential in {} differs from the one in {}; keeping the {} value",
                    service, other.source, chosen.source, chosen.source
                );
                warn!("{}", msg);
                self.warnings.push(msg);
            }
        }
        info!(service = %service, source = %chosen.source, "Reusing credential");
        Some((Credential::new(&chosen.value), chosen.source))
    }

    pub fn get(&self, service: ServiceKind) -> Option<&Credential> {
        self.issued.get(&service).map(|(c, _)| c)
    }

    /// Every credential issued so far.
    pub fn credentials(&self) -> Credentials {
        self.issued
            .iter()
            .map(|(service, (credential, _))| (*service, credential.clone()))
            .collect()
    }

    pub fn choices(&self) -> Vec<CredentialChoice> {
        self.issued
            .iter()
            .map(|(service, (_, source))| CredentialChoice {
                service: *service,
                source: *source,
            })
            .collect()
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_are_exact_matches() {
        assert!(is_placeholder(""));
        assert!(is_placeholder("  GENERATE_ON_STARTUP "));
        assert!(is_placeholder("<api-key>"));
        assert!(!is_placeholder("generate_on_startup"));
        assert!(!is_placeholder("CHANGE_ME_LATER"));
    }

    #[test]
    fn test_same_instance_within_run() {
        let mut secrets = SecretManager::new();
        let first = secrets.get_or_create(ServiceKind::TrunkRecorder, None, &[]);
        let second = secrets.get_or_create(
            ServiceKind::TrunkRecorder,
            None,
            &[ExistingValue::new(CredentialSource::EnvFile, "ignored-now")],
        );
        assert!(first.same_instance(&second));
        assert!(Uuid::parse_str(first.as_str()).is_ok());
    }

    #[test]
    fn test_existing_value_is_reused_over_placeholder() {
        let mut secrets = SecretManager::new();
        let cred = secrets.get_or_create(
            ServiceKind::RdioScanner,
            None,
            &[
                ExistingValue::new(CredentialSource::EnvFile, "GENERATE_ON_STARTUP"),
                ExistingValue::new(CredentialSource::NativeConfig, "kept-key"),
            ],
        );
        assert_eq!(cred.as_str(), "kept-key");
        assert_eq!(secrets.choices()[0].source, CredentialSource::NativeConfig);
    }

    #[test]
    fn test_user_value_wins_and_conflicts_are_reported() {
        let mut secrets = SecretManager::new();
        let cred = secrets.get_or_create(
            ServiceKind::Op25,
            Some("from-user"),
            &[ExistingValue::new(CredentialSource::EnvFile, "old-key")],
        );
        assert_eq!(cred.as_str(), "from-user");
        assert_eq!(secrets.take_warnings().len(), 1);
    }

    #[test]
    fn test_reuse_only_never_generates() {
        let mut secrets = SecretManager::new();
        assert!(secrets.reuse_only(ServiceKind::IcadTranscribe, None, &[]).is_none());
        assert!(secrets.get(ServiceKind::IcadTranscribe).is_none());
    }

    #[test]
    fn test_debug_does_not_leak() {
        let mut secrets = SecretManager::new();
        let cred = secrets.get_or_create(ServiceKind::Sdrtrunk, Some("s3cret"), &[]);
        assert!(!format!("{cred:?}").contains("s3cret"));
    }
}
