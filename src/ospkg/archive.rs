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

use cpio::{write_cpio, NewcBuilder, NewcReader};
use openssl::sha;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use crate::errors::{op, Error, Result, Scope};

pub const ENTRY_MANIFEST: &str = "manifest";
pub const ENTRY_KERNEL: &str = "kernel";
pub const ENTRY_INITRAMFS: &str = "initramfs";
pub const ENTRY_CMDLINE: &str = "cmdline";

const MANIFEST_VERSION: u32 = 1;
// S_IFREG | 0644, the only mode a canonical archive carries
const ENTRY_MODE: u32 = 0o100_644;

/// Names the payload entries in signing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    files: Vec<String>,
}

/// Deterministic OS package archive.
///
/// A cpio newc container holding a `manifest` plus the payload entries
/// it names.  Encoding is canonical (manifest first, then payload
/// entries in manifest order, fixed mode, no compression), so decoding
/// followed by encoding reproduces the input byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    members: BTreeMap<String, Vec<u8>>,
    order: Vec<String>,
}

impl Archive {
    /// Assemble a new archive from its payload parts.
    pub fn new(
        kernel: Vec<u8>,
        initramfs: Option<Vec<u8>>,
        cmdline: Option<Vec<u8>>,
    ) -> Result<Self> {
        let mut members = BTreeMap::new();
        let mut order = vec![ENTRY_KERNEL.to_string()];
        members.insert(ENTRY_KERNEL.to_string(), kernel);
        if let Some(initramfs) = initramfs {
            members.insert(ENTRY_INITRAMFS.to_string(), initramfs);
            order.push(ENTRY_INITRAMFS.to_string());
        }
        if let Some(cmdline) = cmdline {
            members.insert(ENTRY_CMDLINE.to_string(), cmdline);
            order.push(ENTRY_CMDLINE.to_string());
        }
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            files: order.clone(),
        };
        let manifest_bytes = serde_json::to_vec(&manifest).map_err(|e| {
            Error::new()
                .scope(Scope::Ospkg)
                .op(op::SERIALIZE)
                .info("encoding manifest")
                .cause_other(e.into())
        })?;
        members.insert(ENTRY_MANIFEST.to_string(), manifest_bytes);
        Ok(Self { members, order })
    }

    /// Decode an archive, checking canonical form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let parse_err = |info: &str, e: std::io::Error| {
            Error::new()
                .scope(Scope::Ospkg)
                .op(op::PARSE)
                .info(info.to_string())
                .cause_other(e.into())
        };
        let invalid = |info: String| {
            Error::new().scope(Scope::Ospkg).op(op::VALIDATE).info(info)
        };

        let mut members: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut source = Cursor::new(data);
        loop {
            let mut reader =
                NewcReader::new(source).map_err(|e| parse_err("reading archive entry", e))?;
            let entry = reader.entry();
            if entry.is_trailer() {
                break;
            }
            let name = entry.name().to_string();
            let mode = entry.mode();
            let mut buf = Vec::with_capacity(entry.file_size() as usize);
            reader
                .read_to_end(&mut buf)
                .map_err(|e| parse_err("reading archive entry contents", e))?;
            if mode & 0o170_000 == 0o100_000 {
                members.insert(name, buf);
            }
            source = reader
                .finish()
                .map_err(|e| parse_err("finishing archive entry", e))?;
        }

        let manifest_bytes = members
            .get(ENTRY_MANIFEST)
            .ok_or_else(|| invalid(format!("missing {ENTRY_MANIFEST} entry")))?;
        let manifest: Manifest = serde_json::from_slice(manifest_bytes).map_err(|e| {
            Error::new()
                .scope(Scope::Ospkg)
                .op(op::PARSE)
                .info("decoding manifest")
                .cause_other(e.into())
        })?;
        if manifest.version != MANIFEST_VERSION {
            return Err(invalid(format!(
                "invalid manifest version: {}, expected {}",
                manifest.version, MANIFEST_VERSION
            )));
        }
        for name in &manifest.files {
            match name.as_str() {
                ENTRY_KERNEL | ENTRY_INITRAMFS | ENTRY_CMDLINE => (),
                other => return Err(invalid(format!("unexpected manifest entry: {other}"))),
            }
            if !members.contains_key(name) {
                return Err(invalid(format!("manifest names missing entry: {name}")));
            }
        }
        for name in members.keys() {
            if name != ENTRY_MANIFEST && !manifest.files.contains(name) {
                return Err(invalid(format!("entry not named by manifest: {name}")));
            }
        }
        if !manifest.files.iter().any(|f| f == ENTRY_KERNEL) {
            return Err(invalid(format!("missing {ENTRY_KERNEL} entry")));
        }

        let archive = Self {
            members,
            order: manifest.files,
        };

        // canonical-form check: re-encoding must reproduce the input
        if archive.to_bytes()? != data {
            return Err(Error::new()
                .scope(Scope::Ospkg)
                .op(op::SERIALIZE)
                .info("archive is not in canonical form"));
        }
        Ok(archive)
    }

    /// Encode the archive in canonical form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut names = vec![ENTRY_MANIFEST];
        names.extend(self.order.iter().map(String::as_str));
        let entries = names.into_iter().filter_map(|name| {
            self.members
                .get(name)
                .map(|contents| (NewcBuilder::new(name).mode(ENTRY_MODE), Cursor::new(contents)))
        });
        write_cpio(entries, Vec::new()).map_err(|e| {
            Error::new()
                .scope(Scope::Ospkg)
                .op(op::SERIALIZE)
                .info("writing archive")
                .cause_other(e.into())
        })
    }

    /// Payload bytes in manifest order; this is what gets signed.
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for name in &self.order {
            if let Some(contents) = self.members.get(name) {
                payload.extend_from_slice(contents);
            }
        }
        payload
    }

    /// SHA-256 over the signed payload.
    pub fn digest(&self) -> [u8; 32] {
        sha::sha256(&self.signed_payload())
    }

    pub fn kernel(&self) -> &[u8] {
        // presence checked at construction and decode time
        self.members
            .get(ENTRY_KERNEL)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn initramfs(&self) -> Option<&[u8]> {
        self.members.get(ENTRY_INITRAMFS).map(Vec::as_slice)
    }

    pub fn cmdline(&self) -> Option<&[u8]> {
        self.members.get(ENTRY_CMDLINE).map(Vec::as_slice)
    }
}
