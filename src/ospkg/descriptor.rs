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

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use url::Url;

use crate::errors::{op, Error, Result, Scope};

pub const DESCRIPTOR_VERSION: u32 = 1;

/// OS package descriptor: metadata, detached signatures and the
/// certificates they pair with.  `certificates[i]` belongs to
/// `signatures[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub version: u32,
    /// Download location of the package archive; empty means none.
    #[serde(default)]
    pub os_pkg_url: String,
    /// Base64-encoded DER certificates.
    pub certificates: Vec<String>,
    /// Base64-encoded detached signatures.
    pub signatures: Vec<String>,
}

impl Descriptor {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| {
            Error::new()
                .scope(Scope::Ospkg)
                .op(op::PARSE)
                .info("decoding descriptor JSON")
                .cause_other(e.into())
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| {
            Error::new()
                .scope(Scope::Ospkg)
                .op(op::PARSE)
                .info(format!("reading {}", path.display()))
                .cause_other(e.into())
        })?;
        Self::from_bytes(&data)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            Error::new()
                .scope(Scope::Ospkg)
                .op(op::SERIALIZE)
                .info("encoding descriptor JSON")
                .cause_other(e.into())
        })
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |info: String| {
            Error::new().scope(Scope::Ospkg).op(op::VALIDATE).info(info)
        };

        if self.version != DESCRIPTOR_VERSION {
            return Err(invalid(format!(
                "invalid version: {}, expected {}",
                self.version, DESCRIPTOR_VERSION
            )));
        }
        if !self.os_pkg_url.is_empty() {
            let url = Url::parse(&self.os_pkg_url)
                .map_err(|e| invalid(format!("invalid os_pkg_url: {e}")))?;
            if url.scheme().is_empty() {
                return Err(invalid("os_pkg_url is missing a scheme".into()));
            }
        }
        if self.certificates.len() != self.signatures.len() {
            return Err(invalid(format!(
                "certificate/signature count mismatch: {} != {}",
                self.certificates.len(),
                self.signatures.len()
            )));
        }
        Ok(())
    }

    /// Decode the certificate fields to DER.
    pub fn certificates_der(&self) -> Result<Vec<Vec<u8>>> {
        decode_base64_fields(&self.certificates, "certificate")
    }

    /// Decode the signature fields to raw bytes.
    pub fn signatures_raw(&self) -> Result<Vec<Vec<u8>>> {
        decode_base64_fields(&self.signatures, "signature")
    }
}

fn decode_base64_fields(fields: &[String], what: &str) -> Result<Vec<Vec<u8>>> {
    fields
        .iter()
        .enumerate()
        .map(|(i, value)| {
            base64::decode(value).map_err(|e| {
                Error::new()
                    .scope(Scope::Ospkg)
                    .op(op::PARSE)
                    .info(format!("decoding {what} {i}"))
                    .cause_other(e.into())
            })
        })
        .collect()
}
