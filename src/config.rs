// Copyright 2022 System Transparency Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Security policy and host configuration documents.
//!
//! Host config validation is two-phase: `validate_basic` runs right
//! after loading, the full `validate_network` pass runs lazily before
//! the network is brought up.

use anyhow::anyhow;
use serde::Deserialize;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::path::Path;
use std::str::FromStr;
use url::Url;

use crate::errors::{op, Error, Result, Scope};

pub const SECURITY_POLICY_PATH: &str = "/etc/stboot/security_policy.json";
pub const HOST_CONFIG_PATH: &str = "/etc/stboot/host_config.json";

pub const HOST_CONFIG_VERSION: u32 = 1;

/// URL template tokens substituted from the host config.
pub const ID_TOKEN: &str = "$ID";
pub const AUTH_TOKEN: &str = "$AUTH";

const TOKEN_MAX_LEN: usize = 64;

/// Marker for any constraint violation in the security policy.
#[derive(Debug, thiserror::Error)]
#[error("invalid security policy")]
pub struct ErrInvalidPolicy;

/// Where OS packages are acquired from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DeserializeFromStr, SerializeDisplay)]
pub enum FetchMethod {
    Local,
    Network,
}

impl FromStr for FetchMethod {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "network" => Ok(Self::Network),
            other => Err(anyhow!("unknown fetch method '{other}'")),
        }
    }
}

impl fmt::Display for FetchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// Security policy: how many signatures a package needs and where it
/// comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub signature_threshold: NonZeroU32,
    pub fetch_method: FetchMethod,
}

// The raw form tolerates out-of-range thresholds so that we can report
// them ourselves.  Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct RawPolicy {
    ospkg_signature_threshold: i64,
    ospkg_fetch_method: String,
}

fn invalid_policy(info: String) -> Error {
    Error::new()
        .scope(Scope::Opts)
        .op(op::VALIDATE)
        .info(info)
        .cause_other(ErrInvalidPolicy.into())
}

impl Policy {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let raw: RawPolicy = serde_json::from_slice(data)
            .map_err(|e| invalid_policy(format!("decoding security policy: {e}")))?;
        let signature_threshold = u32::try_from(raw.ospkg_signature_threshold)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| {
                invalid_policy(format!(
                    "signature threshold must be >= 1, got {}",
                    raw.ospkg_signature_threshold
                ))
            })?;
        let fetch_method = raw
            .ospkg_fetch_method
            .parse()
            .map_err(|e| invalid_policy(format!("{e}")))?;
        Ok(Self {
            signature_threshold,
            fetch_method,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| {
            Error::new()
                .scope(Scope::Opts)
                .op(op::PARSE)
                .info(format!("reading {}", path.display()))
                .cause_other(e.into())
        })?;
        Self::from_bytes(&data)
    }
}

/// Network configuration source for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DeserializeFromStr, SerializeDisplay)]
pub enum NetworkMode {
    Static,
    Dhcp,
}

impl FromStr for NetworkMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "static" => Ok(Self::Static),
            "dhcp" => Ok(Self::Dhcp),
            other => Err(anyhow!("unknown network mode '{other}'")),
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static => write!(f, "static"),
            Self::Dhcp => write!(f, "dhcp"),
        }
    }
}

/// Host identity and network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostConfig {
    pub version: u32,
    pub network_mode: NetworkMode,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Option<String>,
    #[serde(default)]
    pub provisioning_urls: Vec<String>,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub authentication: Option<String>,
}

fn invalid_config(info: String) -> Error {
    Error::new().scope(Scope::Opts).op(op::VALIDATE).info(info)
}

impl HostConfig {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| {
            Error::new()
                .scope(Scope::Opts)
                .op(op::PARSE)
                .info("decoding host config")
                .cause_other(e.into())
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| {
            Error::new()
                .scope(Scope::Opts)
                .op(op::PARSE)
                .info(format!("reading {}", path.display()))
                .cause_other(e.into())
        })?;
        Self::from_bytes(&data)
    }

    /// Constraints that must hold before anything else runs.
    pub fn validate_basic(&self) -> Result<()> {
        if self.version != HOST_CONFIG_VERSION {
            return Err(invalid_config(format!(
                "invalid version: {}, expected {}",
                self.version, HOST_CONFIG_VERSION
            )));
        }
        Ok(())
    }

    /// Full validation, run before network activation.  Reports the
    /// first failing constraint.
    pub fn validate_network(&self) -> Result<()> {
        self.validate_basic()?;

        if let Some(identity) = &self.identity {
            validate_token("identity", identity)?;
        }
        if let Some(authentication) = &self.authentication {
            validate_token("authentication", authentication)?;
        }

        if self.provisioning_urls.is_empty() {
            return Err(invalid_config("no provisioning URLs".into()));
        }
        for template in &self.provisioning_urls {
            let url = Url::parse(template)
                .map_err(|e| invalid_config(format!("invalid provisioning URL '{template}': {e}")))?;
            match url.scheme() {
                "http" | "https" => (),
                scheme => {
                    return Err(invalid_config(format!(
                        "provisioning URL '{template}' has unsupported scheme '{scheme}'"
                    )))
                }
            }
            if template.contains(ID_TOKEN) && !has_value(&self.identity) {
                return Err(invalid_config(format!(
                    "provisioning URL '{template}' uses {ID_TOKEN} but identity is empty"
                )));
            }
            if template.contains(AUTH_TOKEN) && !has_value(&self.authentication) {
                return Err(invalid_config(format!(
                    "provisioning URL '{template}' uses {AUTH_TOKEN} but authentication is empty"
                )));
            }
        }

        if self.network_mode == NetworkMode::Static {
            let host_ip = self
                .host_ip
                .as_deref()
                .ok_or_else(|| invalid_config("static mode requires host_ip".into()))?;
            parse_cidr(host_ip)
                .map_err(|e| invalid_config(format!("invalid host_ip '{host_ip}': {e}")))?;
            let gateway = self
                .gateway
                .as_deref()
                .ok_or_else(|| invalid_config("static mode requires gateway".into()))?;
            IpAddr::from_str(gateway)
                .map_err(|e| invalid_config(format!("invalid gateway '{gateway}': {e}")))?;
        }
        if let Some(dns) = self.dns.as_deref() {
            IpAddr::from_str(dns)
                .map_err(|e| invalid_config(format!("invalid dns '{dns}': {e}")))?;
        }
        Ok(())
    }
}

fn has_value(field: &Option<String>) -> bool {
    field.as_deref().map_or(false, |s| !s.is_empty())
}

fn validate_token(name: &str, value: &str) -> Result<()> {
    if value.len() > TOKEN_MAX_LEN {
        return Err(invalid_config(format!(
            "{name} exceeds {TOKEN_MAX_LEN} characters"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid_config(format!(
            "{name} contains characters outside [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

/// Check an `address/prefix` CIDR string.
fn parse_cidr(s: &str) -> anyhow::Result<()> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| anyhow!("missing prefix length"))?;
    let addr = IpAddr::from_str(addr)?;
    let prefix: u8 = prefix.parse()?;
    let max = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max {
        return Err(anyhow!("prefix length {prefix} out of range"));
    }
    Ok(())
}
