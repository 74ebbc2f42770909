mod challenge;
mod client;
mod crypto;
mod manager;
mod self_check;
mod status;
mod store;
mod transport;

pub use {
    challenge::{ChallengeHandler, ChallengeHandlerParams},
    client::{Challenge, Client, EabCredentials, Order},
    crypto::AccountKey,
    manager::{remaining_time, Manager},
    status::{CertificateStage, Stage, StageError, StageState, StatusModel},
    store::Certificate,
    transport::AcmeError,
};

use std::{collections::HashMap, path::PathBuf, str::FromStr};

/// Resolved locations of the certificate material on disk. Recomputed from
/// the settings at the start of every cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub trusted_authorities: PathBuf,
}

/// One domain the certificate must cover. The domain is kept in its
/// ACE (Punycode) form, which is also the form submitted to the CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSpec {
    pub ace_domain: String,
    /// Document root used by the files challenge handler.
    pub challenge_directory: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerType {
    Server,
    Files,
    Manual,
}

impl FromStr for HandlerType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(HandlerType::Server),
            "files" => Ok(HandlerType::Files),
            "manual" => Ok(HandlerType::Manual),
            other => Err(anyhow::anyhow!("invalid challenge handler type: {other}")),
        }
    }
}

/// Everything the lifecycle manager needs to know, resolved from the host
/// configuration. Paths are final here; empty-value defaults are applied
/// by the configuration layer.
#[derive(Debug, Clone)]
pub struct Settings {
    pub enabled: bool,
    pub account_key_path: PathBuf,
    pub certificate_directory: PathBuf,
    pub certificate_filename: String,
    pub certificate_key_filename: String,
    pub certificate_authority_filename: String,
    pub domains: Vec<DomainSpec>,
    pub handler_type: HandlerType,
    pub directory_endpoint: String,
    pub eab: Option<EabCredentials>,
}

impl Settings {
    pub fn certificate_paths(&self) -> CertificatePaths {
        CertificatePaths {
            cert: self.certificate_directory.join(&self.certificate_filename),
            key: self
                .certificate_directory
                .join(&self.certificate_key_filename),
            trusted_authorities: self
                .certificate_directory
                .join(&self.certificate_authority_filename),
        }
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.domains.iter().map(|d| d.ace_domain.clone()).collect()
    }

    pub fn challenge_params(&self) -> ChallengeHandlerParams {
        let domain_dirs: HashMap<String, PathBuf> = self
            .domains
            .iter()
            .map(|d| (d.ace_domain.clone(), d.challenge_directory.clone()))
            .collect();
        ChallengeHandlerParams {
            type_id: self.handler_type,
            domain_dirs,
        }
    }
}
