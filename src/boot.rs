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

//! The boot state machine.
//!
//! A linear pipeline with fail-stop semantics: configuration, network
//! (when the policy asks for it), time acquisition, fetch, signature
//! verification, kernel staging, handover.  Retries exist only inside
//! a state (URL list, interface list); any cross-state failure is
//! terminal.  An unverified kernel is never executed.

use std::fmt;
use std::path::PathBuf;

use crate::config::{FetchMethod, HostConfig, Policy, HOST_CONFIG_PATH, SECURITY_POLICY_PATH};
use crate::errors::Result;
use crate::fetch::{DataPartitionLocation, NetworkLocation, PackageBundle, PackageLocation};
use crate::ospkg::{Archive, Descriptor};
use crate::platform::{
    BootExecutor, DataPartition, MeasurementSink, NetworkSetup, Rebooter, SystemClock,
};
use crate::trust::{self, SIGNING_ROOT_PATH};

/// Time the boot medium was provisioned: 2022-06-15T00:00:00Z.  An RTC
/// reading earlier than this is known-bad and invalidates certificate
/// validity checks.
pub const INSTALLATION_TIMESTAMP: i64 = 1_655_251_200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Start,
    LoadingConfig,
    NetworkUp,
    Fetching,
    Verifying,
    Staging,
    HandingOff,
    Failed,
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootState::Start => "start",
            BootState::LoadingConfig => "loading-config",
            BootState::NetworkUp => "network-up",
            BootState::Fetching => "fetching",
            BootState::Verifying => "verifying",
            BootState::Staging => "staging",
            BootState::HandingOff => "handing-off",
            BootState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Locations of the configuration artifacts the controller ingests.
pub struct BootPaths {
    pub security_policy: PathBuf,
    pub host_config: PathBuf,
    pub signing_root: PathBuf,
}

impl Default for BootPaths {
    fn default() -> Self {
        Self {
            security_policy: SECURITY_POLICY_PATH.into(),
            host_config: HOST_CONFIG_PATH.into(),
            signing_root: SIGNING_ROOT_PATH.into(),
        }
    }
}

pub struct BootController<'a> {
    executor: &'a mut dyn BootExecutor,
    measurements: &'a mut dyn MeasurementSink,
    network: &'a mut dyn NetworkSetup,
    clock: &'a mut dyn SystemClock,
    rebooter: &'a mut dyn Rebooter,
    data_partition: &'a mut dyn DataPartition,
    paths: BootPaths,
    state: BootState,
}

impl<'a> BootController<'a> {
    pub fn new(
        executor: &'a mut dyn BootExecutor,
        measurements: &'a mut dyn MeasurementSink,
        network: &'a mut dyn NetworkSetup,
        clock: &'a mut dyn SystemClock,
        rebooter: &'a mut dyn Rebooter,
        data_partition: &'a mut dyn DataPartition,
        paths: BootPaths,
    ) -> Self {
        Self {
            executor,
            measurements,
            network,
            clock,
            rebooter,
            data_partition,
            paths,
            state: BootState::Start,
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    /// Run the boot pipeline to completion.  On success the process
    /// image has been replaced (or a corrective reboot was requested);
    /// on failure the machine-parseable error has been logged and the
    /// controller is parked in `Failed`.
    pub fn run(&mut self) -> Result<()> {
        match self.drive() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.transition(BootState::Failed);
                log::error!("{e}");
                // best-effort post-mortem trace; the error above is authoritative
                let _ = self
                    .measurements
                    .measure("boot failure", e.to_string().as_bytes());
                Err(e)
            }
        }
    }

    fn drive(&mut self) -> Result<()> {
        self.transition(BootState::LoadingConfig);
        let policy = Policy::from_file(&self.paths.security_policy)?;
        let host_config = HostConfig::from_file(&self.paths.host_config)?;
        host_config.validate_basic()?;
        log::info!(
            "security policy: {} signature(s) required, fetch method {}",
            policy.signature_threshold,
            policy.fetch_method
        );

        let bundle = match policy.fetch_method {
            FetchMethod::Network => {
                // full validation is deferred until the network is needed
                host_config.validate_network()?;
                self.transition(BootState::NetworkUp);
                self.network.bring_up(&host_config)?;
                if self.acquire_time()? {
                    // clock was corrected; reboot supersedes the pipeline
                    return Ok(());
                }
                self.transition(BootState::Fetching);
                let location = NetworkLocation::new(&host_config)?;
                log::info!("{location}");
                location.fetch()?
            }
            FetchMethod::Local => {
                self.transition(BootState::Fetching);
                let mount = self.data_partition.mount()?;
                let location = DataPartitionLocation::new(&mount);
                log::info!("{location}");
                location.fetch()?
            }
        };

        self.transition(BootState::Verifying);
        let archive = self.verify(&bundle, &policy)?;

        self.transition(BootState::Staging);
        self.executor
            .load(archive.kernel(), archive.initramfs(), archive.cmdline())?;
        self.measurements
            .measure(&format!("ospkg '{}'", bundle.name), &archive.digest())?;

        self.transition(BootState::HandingOff);
        self.executor.exec()
    }

    fn verify(&mut self, bundle: &PackageBundle, policy: &Policy) -> Result<Archive> {
        let descriptor = Descriptor::from_bytes(&bundle.descriptor)?;
        descriptor.validate()?;
        let archive = Archive::from_bytes(&bundle.archive)?;
        log::info!(
            "OS package '{}' digest sha256:{}",
            bundle.name,
            hex::encode(archive.digest())
        );

        let now = self.clock.now()?;
        let root = trust::load_signing_root(&self.paths.signing_root, now)?;
        let accepted = trust::verify_package(
            &archive,
            &descriptor,
            &root,
            policy.signature_threshold,
            now,
        )?;
        log::info!(
            "signature verification passed: {accepted} valid, {} required",
            policy.signature_threshold
        );
        Ok(archive)
    }

    /// Read the clock and repair a rolled-back RTC.  Returns true when
    /// a corrective reboot was requested; certificate validity checks
    /// are meaningless until the machine comes back with a sane clock.
    fn acquire_time(&mut self) -> Result<bool> {
        let now = self.clock.now()?;
        if now >= INSTALLATION_TIMESTAMP {
            return Ok(false);
        }
        log::warn!(
            "system clock {now} predates the installation timestamp {INSTALLATION_TIMESTAMP}; correcting and rebooting"
        );
        self.clock.set(INSTALLATION_TIMESTAMP)?;
        self.rebooter.reboot()?;
        Ok(true)
    }

    fn transition(&mut self, next: BootState) {
        log::debug!("boot state {} -> {next}", self.state);
        self.state = next;
    }
}
