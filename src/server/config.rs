use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use envconfig::Envconfig;

use crate::acme::{DomainSpec, EabCredentials, HandlerType, Manager, Settings};

use super::implementation::Server;

/// Comma-separated `domain` or `domain=challenge_dir` entries.
#[derive(Debug, Default)]
pub struct DomainList(Vec<(String, String)>);

impl FromStr for DomainList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(DomainList(
            s.trim()
                .split(',')
                .map(|entry| entry.trim())
                .filter(|entry| !entry.is_empty())
                .map(|entry| match entry.split_once('=') {
                    Some((domain, dir)) => (domain.trim().to_string(), dir.trim().to_string()),
                    None => (entry.to_string(), String::new()),
                })
                .collect(),
        ))
    }
}

#[derive(Debug, Envconfig)]
pub struct Config {
    /// Address the control surface binds to
    #[envconfig(from = "BIND_ADDRESS", default = "127.0.0.1")]
    pub bind_address: String,
    /// Port used for the control surface
    #[envconfig(from = "HTTP_PORT", default = "9980")]
    pub http_port: u16,
    /// Master switch for the ACME client
    #[envconfig(from = "ACME_ENABLE_CLIENT", default = "false")]
    pub enable_client: bool,
    /// PEM account key; empty for a default under the app data directory
    #[envconfig(from = "ACME_ACCOUNT_KEY_PATH", default = "")]
    pub account_key_path: String,
    /// Directory holding the certificate files; empty for the app data
    /// directory
    #[envconfig(from = "ACME_CERTIFICATE_DIRECTORY", default = "")]
    pub certificate_directory: String,
    #[envconfig(from = "ACME_CERTIFICATE_FILENAME", default = "fullchain.pem")]
    pub certificate_filename: String,
    #[envconfig(from = "ACME_CERTIFICATE_KEY_FILENAME", default = "privkey.pem")]
    pub certificate_key_filename: String,
    #[envconfig(from = "ACME_CERTIFICATE_AUTHORITY_FILENAME", default = "authorities.pem")]
    pub certificate_authority_filename: String,
    /// Domains the certificate must cover, with optional per-domain
    /// challenge directories for the files handler
    #[envconfig(from = "ACME_CERTIFICATE_DOMAINS", default = "")]
    pub certificate_domains: DomainList,
    /// One of server, files, manual
    #[envconfig(from = "ACME_CHALLENGE_HANDLER_TYPE", default = "manual")]
    pub challenge_handler_type: String,
    #[envconfig(
        from = "ACME_DIRECTORY_ENDPOINT",
        default = "https://acme-v02.api.letsencrypt.org/directory"
    )]
    pub directory_endpoint: String,
    /// Optional External Account Binding credentials
    #[envconfig(from = "ACME_EAB_KID", default = "")]
    pub eab_kid: String,
    #[envconfig(from = "ACME_EAB_MAC", default = "")]
    pub eab_mac: String,
}

impl Default for Config {
    fn default() -> Self {
        let hashmap = std::collections::HashMap::new();
        Config::init_from_hashmap(&hashmap).unwrap()
    }
}

fn app_local_data() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("certport")
}

impl Config {
    pub fn settings(&self) -> Result<Settings> {
        let handler_type: HandlerType = self.challenge_handler_type.parse()?;

        let certificate_directory = if self.certificate_directory.is_empty() {
            app_local_data()
        } else {
            PathBuf::from(&self.certificate_directory)
        };
        let account_key_path = if self.account_key_path.is_empty() {
            app_local_data().join("acme_account_key.pem")
        } else {
            PathBuf::from(&self.account_key_path)
        };

        let mut domains = Vec::with_capacity(self.certificate_domains.0.len());
        for (domain, dir) in &self.certificate_domains.0 {
            let ace_domain = idna::domain_to_ascii(domain)
                .map_err(|errors| anyhow::anyhow!("invalid domain {domain}: {errors:?}"))?;
            let challenge_directory = if dir.is_empty() {
                PathBuf::from(".")
            } else {
                PathBuf::from(dir)
            };
            domains.push(DomainSpec {
                ace_domain,
                challenge_directory,
            });
        }

        let eab = if self.eab_kid.is_empty() || self.eab_mac.is_empty() {
            None
        } else {
            Some(EabCredentials {
                kid: self.eab_kid.clone(),
                hmac: self.eab_mac.clone(),
            })
        };

        Ok(Settings {
            enabled: self.enable_client,
            account_key_path,
            certificate_directory,
            certificate_filename: self.certificate_filename.clone(),
            certificate_key_filename: self.certificate_key_filename.clone(),
            certificate_authority_filename: self.certificate_authority_filename.clone(),
            domains,
            handler_type,
            directory_endpoint: self.directory_endpoint.clone(),
            eab,
        })
    }

    fn enabled_check(&self, settings: &Settings) -> Result<()> {
        if !settings.enabled {
            return Ok(());
        }
        if settings.domains.is_empty() {
            return Err(anyhow::anyhow!("missing ACME_CERTIFICATE_DOMAINS"));
        }
        if settings.directory_endpoint.is_empty() {
            return Err(anyhow::anyhow!("missing ACME_DIRECTORY_ENDPOINT"));
        }
        Ok(())
    }

    pub fn server(self) -> Result<Server> {
        let settings = self.settings()?;
        self.enabled_check(&settings)?;
        let address = IpAddr::from_str(&self.bind_address)?;
        let listen = SocketAddr::from((address, self.http_port));
        Ok(Server::new(listen, Manager::new(settings)))
    }
}
