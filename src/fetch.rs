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

//! OS package acquisition: ordered network provisioning URLs or the
//! local data partition, selected by the security policy.

use anyhow::{bail, ensure, Context};
use reqwest::{blocking, StatusCode, Url};
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{HostConfig, AUTH_TOKEN, ID_TOKEN};
use crate::errors::{op, Error, Result, Scope};
use crate::ospkg::Descriptor;

/// Completion timeout for each per-URL fetch attempt.
const HTTP_COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on connection establishment including the TLS handshake.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DATA_PARTITION_MOUNT: &str = "/data";
pub const LOCAL_OSPKG_DIR: &str = "stboot/os_pkgs";
pub const LOCAL_BOOT_ORDER: &str = "stboot/boot_order";

/// A fetched descriptor/archive pair, not yet verified.
#[derive(Debug)]
pub struct PackageBundle {
    pub name: String,
    pub descriptor: Vec<u8>,
    pub archive: Vec<u8>,
}

pub trait PackageLocation: Display {
    /// Acquire a package, trying sources in order until one succeeds.
    fn fetch(&self) -> Result<PackageBundle>;
}

/// Substitute `$ID` and `$AUTH` literally; templates without tokens are
/// left unchanged.  A token written as `{$ID}` has its braces consumed
/// by the substitution.
pub fn substitute_url_template(
    template: &str,
    identity: &Option<String>,
    authentication: &Option<String>,
) -> String {
    let mut url = template.to_string();
    if let Some(identity) = identity {
        url = replace_token(&url, ID_TOKEN, identity);
    }
    if let Some(authentication) = authentication {
        url = replace_token(&url, AUTH_TOKEN, authentication);
    }
    url
}

fn replace_token(url: &str, token: &str, value: &str) -> String {
    // braced form first, so `{$ID}` does not leave `{dev42}` behind
    url.replace(&format!("{{{token}}}"), value)
        .replace(token, value)
}

// Remote package source: ordered provisioning URLs
pub struct NetworkLocation {
    urls: Vec<Url>,
}

impl NetworkLocation {
    pub fn new(config: &HostConfig) -> Result<Self> {
        let mut urls = Vec::new();
        for template in &config.provisioning_urls {
            let effective =
                substitute_url_template(template, &config.identity, &config.authentication);
            let url = Url::parse(&effective).map_err(|e| {
                Error::new()
                    .scope(Scope::Opts)
                    .op(op::VALIDATE)
                    .info(format!("provisioning URL '{effective}' after substitution: {e}"))
            })?;
            urls.push(url);
        }
        Ok(Self { urls })
    }

    fn attempt(&self, url: &Url) -> anyhow::Result<PackageBundle> {
        let client = new_http_client()?;
        let descriptor_url = derive_descriptor_url(url)?;
        let descriptor =
            http_get_body(&client, descriptor_url).context("fetching descriptor")?;
        let parsed = Descriptor::from_bytes(&descriptor)?;
        parsed.validate()?;

        // the provisioning URL names the archive itself; the descriptor
        // may redirect the archive fetch elsewhere
        let archive_url = if parsed.os_pkg_url.is_empty() {
            url.clone()
        } else {
            Url::parse(&parsed.os_pkg_url).context("parsing os_pkg_url")?
        };
        let archive =
            http_get_body(&client, archive_url).context("fetching package archive")?;

        Ok(PackageBundle {
            name: package_name(url),
            descriptor,
            archive,
        })
    }
}

impl Display for NetworkLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "fetching OS package from {} provisioning URLs", self.urls.len())
    }
}

impl PackageLocation for NetworkLocation {
    fn fetch(&self) -> Result<PackageBundle> {
        for url in &self.urls {
            match self.attempt(url) {
                Ok(bundle) => {
                    log::info!("fetched OS package '{}' from {url}", bundle.name);
                    return Ok(bundle);
                }
                // failed attempts stay at debug; only exhaustion is fatal
                Err(e) => log::debug!("fetching from {url} failed: {e:#}"),
            }
        }
        Err(Error::new()
            .scope(Scope::Network)
            .op(op::NO_RESPONSE)
            .info("no provisioning URL delivered an OS package"))
    }
}

// Local package source: data partition with a boot-order file
pub struct DataPartitionLocation {
    mount: PathBuf,
}

impl DataPartitionLocation {
    pub fn new(mount: &Path) -> Self {
        Self {
            mount: mount.to_path_buf(),
        }
    }
}

impl Display for DataPartitionLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "loading OS package from data partition at {}",
            self.mount.display()
        )
    }
}

impl PackageLocation for DataPartitionLocation {
    fn fetch(&self) -> Result<PackageBundle> {
        let order_path = self.mount.join(LOCAL_BOOT_ORDER);
        let order = fs::read_to_string(&order_path).map_err(|e| {
            Error::new()
                .scope(Scope::Host)
                .op(op::PARSE)
                .info(format!("reading {}", order_path.display()))
                .cause_other(e.into())
        })?;

        let dir = self.mount.join(LOCAL_OSPKG_DIR);
        for line in order.lines() {
            let entry = line.trim();
            if entry.is_empty() {
                continue;
            }
            let stem = entry
                .strip_suffix(".zip")
                .or_else(|| entry.strip_suffix(".json"))
                .unwrap_or(entry);
            let archive_path = dir.join(format!("{stem}.zip"));
            let descriptor_path = dir.join(format!("{stem}.json"));

            let archive = match fs::read(&archive_path) {
                Ok(data) => data,
                Err(e) => {
                    log::debug!("skipping boot order entry '{stem}': {e}");
                    continue;
                }
            };
            let descriptor = match fs::read(&descriptor_path) {
                Ok(data) => data,
                Err(e) => {
                    log::debug!("skipping boot order entry '{stem}': {e}");
                    continue;
                }
            };
            log::info!("loading OS package '{stem}' from data partition");
            return Ok(PackageBundle {
                name: stem.to_string(),
                descriptor,
                archive,
            });
        }
        Err(Error::new()
            .scope(Scope::Host)
            .op(op::VALIDATE)
            .info("no valid entries found"))
    }
}

/// Build the bounded HTTP client used for every fetch attempt.
pub fn new_http_client() -> anyhow::Result<blocking::Client> {
    blocking::ClientBuilder::new()
        .timeout(HTTP_COMPLETION_TIMEOUT)
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .build()
        .context("building HTTP client")
}

fn http_get_body(client: &blocking::Client, url: Url) -> anyhow::Result<Vec<u8>> {
    let resp = client
        .get(url.clone())
        .send()
        .with_context(|| format!("fetching '{url}'"))?;
    match resp.status() {
        StatusCode::OK => (),
        s => bail!("fetching '{url}' failed: {s}"),
    }
    let body = resp.bytes().context("reading response body")?;
    ensure!(!body.is_empty(), "zero length response from '{url}'");
    Ok(body.to_vec())
}

/// A provisioning URL names the package archive; its descriptor sits
/// next to it with `.json` in place of the `.zip` suffix.
fn derive_descriptor_url(archive_url: &Url) -> anyhow::Result<Url> {
    let path = archive_url.path();
    let Some(stem) = path.strip_suffix(".zip") else {
        bail!("cannot derive descriptor URL from '{archive_url}'");
    };
    let mut url = archive_url.clone();
    url.set_path(&format!("{stem}.json"));
    Ok(url)
}

fn package_name(archive_url: &Url) -> String {
    archive_url
        .path_segments()
        .and_then(|segments| segments.last())
        .map(|name| name.trim_end_matches(".zip"))
        .filter(|name| !name.is_empty())
        .unwrap_or("ospkg")
        .to_string()
}
