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

//! Ports to the platform: kernel handover, measurement, network
//! bring-up, clock and reboot.  The boot controller only sees these
//! traits, so it runs unmodified against test stubs.

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::reboot::{reboot as nix_reboot, RebootMode};
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, clock_settime, ClockId};
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::{HostConfig, NetworkMode};
use crate::errors::{op, Error, Result, Scope};
use crate::fetch::DATA_PARTITION_MOUNT;

/// Per-interface DHCP bound; retries stay within ~30s overall.
const DHCP_TIMEOUT_SECS: u32 = 2;
const DHCP_TRIES: u32 = 3;
const DHCP_ROUNDS: usize = 5;

const DEFAULT_EVENT_LOG: &str = "/run/stboot/measurements.log";

// kexec_file_load(2) flag; not exported by libc
const KEXEC_FILE_NO_INITRAMFS: libc::c_ulong = 0x4;

/// Loads the verified kernel and jumps into it.
pub trait BootExecutor {
    fn load(
        &mut self,
        kernel: &[u8],
        initramfs: Option<&[u8]>,
        cmdline: Option<&[u8]>,
    ) -> Result<()>;

    /// Replace the running kernel.  Returns only on failure.
    fn exec(&mut self) -> Result<()>;
}

/// Sink for boot measurements (TPM event log or a stand-in).
pub trait MeasurementSink {
    fn measure(&mut self, description: &str, data: &[u8]) -> Result<()>;
}

pub trait NetworkSetup {
    fn bring_up(&mut self, config: &HostConfig) -> Result<()>;
}

pub trait SystemClock {
    /// Seconds since the epoch.
    fn now(&self) -> Result<i64>;
    fn set(&mut self, unix_secs: i64) -> Result<()>;
}

pub trait Rebooter {
    fn reboot(&mut self) -> Result<()>;
}

pub trait DataPartition {
    fn mount(&mut self) -> Result<PathBuf>;
}

fn host_err(op_name: &str, info: String) -> Error {
    Error::new().scope(Scope::Host).op(op_name).info(info)
}

// Production kernel handover via kexec_file_load(2)
#[derive(Default)]
pub struct KexecExecutor {
    // keep the memfds alive until exec
    staged: Option<(File, Option<File>)>,
}

impl KexecExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BootExecutor for KexecExecutor {
    fn load(
        &mut self,
        kernel: &[u8],
        initramfs: Option<&[u8]>,
        cmdline: Option<&[u8]>,
    ) -> Result<()> {
        let kernel_file = memfd_with("stboot-kernel", kernel)?;
        let initrd_file = initramfs
            .map(|data| memfd_with("stboot-initramfs", data))
            .transpose()?;

        let mut cmdline_buf = cmdline.unwrap_or_default().to_vec();
        cmdline_buf.push(0);

        let mut flags: libc::c_ulong = 0;
        let initrd_fd = match &initrd_file {
            Some(file) => libc::c_long::from(file.as_raw_fd()),
            None => {
                flags |= KEXEC_FILE_NO_INITRAMFS;
                -1
            }
        };
        let rc = unsafe {
            libc::syscall(
                libc::SYS_kexec_file_load,
                libc::c_long::from(kernel_file.as_raw_fd()),
                initrd_fd,
                cmdline_buf.len() as libc::c_ulong,
                cmdline_buf.as_ptr(),
                flags,
            )
        };
        if rc != 0 {
            return Err(host_err(op::NO_PERMISSION, "kexec_file_load".into())
                .cause_other(std::io::Error::last_os_error().into()));
        }
        self.staged = Some((kernel_file, initrd_file));
        Ok(())
    }

    fn exec(&mut self) -> Result<()> {
        if self.staged.is_none() {
            return Err(host_err(op::VALIDATE, "no kernel staged".into()));
        }
        nix::unistd::sync();
        match nix_reboot(RebootMode::RB_KEXEC) {
            Ok(never) => match never {},
            Err(e) => Err(host_err(op::NO_PERMISSION, "kexec reboot".into())
                .cause_other(e.into())),
        }
    }
}

fn memfd_with(name: &str, data: &[u8]) -> Result<File> {
    let cname = CString::new(name)
        .map_err(|e| host_err(op::VALIDATE, format!("memfd name: {e}")))?;
    let fd = memfd_create(&cname, MemFdCreateFlag::MFD_CLOEXEC)
        .map_err(|e| host_err(op::NO_PERMISSION, format!("memfd_create {name}")).cause_other(e.into()))?;
    let mut file = unsafe { File::from_raw_fd(fd) };
    file.write_all(data)
        .map_err(|e| host_err(op::SERIALIZE, format!("writing {name}")).cause_other(e.into()))?;
    Ok(file)
}

/// Append-only measurement log.  Stands in for the platform TPM sink;
/// event-log encoding happens outside the boot core.
pub struct FileEventLog {
    path: PathBuf,
}

impl FileEventLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl Default for FileEventLog {
    fn default() -> Self {
        Self::new(Path::new(DEFAULT_EVENT_LOG))
    }
}

impl MeasurementSink for FileEventLog {
    fn measure(&mut self, description: &str, data: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                host_err(op::NO_PERMISSION, format!("creating {}", parent.display()))
                    .cause_other(e.into())
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                host_err(op::NO_PERMISSION, format!("opening {}", self.path.display()))
                    .cause_other(e.into())
            })?;
        writeln!(
            file,
            "{description} sha256:{}",
            hex::encode(openssl::sha::sha256(data))
        )
        .map_err(|e| {
            host_err(op::SERIALIZE, "appending measurement".into()).cause_other(e.into())
        })
    }
}

// Interface bring-up via the userland tools available in the initramfs
#[derive(Default)]
pub struct CommandNetworkSetup;

impl NetworkSetup for CommandNetworkSetup {
    fn bring_up(&mut self, config: &HostConfig) -> Result<()> {
        match config.network_mode {
            NetworkMode::Static => bring_up_static(config),
            NetworkMode::Dhcp => bring_up_dhcp(),
        }?;
        if let Some(dns) = &config.dns {
            fs::write("/etc/resolv.conf", format!("nameserver {dns}\n")).map_err(|e| {
                Error::new()
                    .scope(Scope::Network)
                    .op(op::NO_PERMISSION)
                    .info("writing /etc/resolv.conf")
                    .cause_other(e.into())
            })?;
        }
        Ok(())
    }
}

fn net_err(info: String) -> Error {
    Error::new().scope(Scope::Network).op(op::NO_RESPONSE).info(info)
}

fn run_net_command(cmd: &mut Command) -> Result<()> {
    let status = cmd
        .status()
        .map_err(|e| net_err(format!("running {cmd:?}")).cause_other(e.into()))?;
    if !status.success() {
        return Err(net_err(format!("{cmd:?} failed with {status}")));
    }
    Ok(())
}

fn bring_up_static(config: &HostConfig) -> Result<()> {
    // validate_network guaranteed these are present and well-formed
    let host_ip = config.host_ip.as_deref().unwrap_or_default();
    let gateway = config.gateway.as_deref().unwrap_or_default();
    for interface in physical_interfaces()? {
        log::debug!("configuring {interface} with {host_ip}");
        let up = run_net_command(
            Command::new("ip").args(["link", "set", interface.as_str(), "up"]),
        )
        .and_then(|_| {
            run_net_command(
                Command::new("ip").args(["addr", "add", host_ip, "dev", interface.as_str()]),
            )
        })
        .and_then(|_| {
            run_net_command(Command::new("ip").args(["route", "add", "default", "via", gateway]))
        });
        match up {
            Ok(()) => {
                log::info!("network up on {interface} ({host_ip})");
                return Ok(());
            }
            Err(e) => log::debug!("static setup on {interface} failed: {e}"),
        }
    }
    Err(net_err("no interface accepted the static configuration".into()))
}

fn bring_up_dhcp() -> Result<()> {
    let interfaces = physical_interfaces()?;
    for round in 0..DHCP_ROUNDS {
        for interface in &interfaces {
            log::debug!("requesting DHCP lease on {interface} (round {round})");
            let lease = run_net_command(
                Command::new("udhcpc")
                    .arg("-i")
                    .arg(interface)
                    .arg("-t")
                    .arg(DHCP_TRIES.to_string())
                    .arg("-T")
                    .arg(DHCP_TIMEOUT_SECS.to_string())
                    .arg("-n")
                    .arg("-q"),
            );
            match lease {
                Ok(()) => {
                    log::info!("DHCP lease acquired on {interface}");
                    return Ok(());
                }
                Err(e) => log::debug!("DHCP on {interface} failed: {e}"),
            }
        }
    }
    Err(net_err("no interface acquired a DHCP lease".into()))
}

fn physical_interfaces() -> Result<Vec<String>> {
    let entries = fs::read_dir("/sys/class/net")
        .map_err(|e| net_err("listing /sys/class/net".into()).cause_other(e.into()))?;
    let mut interfaces = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name != "lo" {
            interfaces.push(name);
        }
    }
    interfaces.sort();
    if interfaces.is_empty() {
        return Err(net_err("no network interfaces found".into()));
    }
    Ok(interfaces)
}

pub struct RealClock;

impl SystemClock for RealClock {
    fn now(&self) -> Result<i64> {
        clock_gettime(ClockId::CLOCK_REALTIME)
            .map(|ts| ts.tv_sec())
            .map_err(|e| host_err(op::PARSE, "reading system clock".into()).cause_other(e.into()))
    }

    fn set(&mut self, unix_secs: i64) -> Result<()> {
        clock_settime(ClockId::CLOCK_REALTIME, TimeSpec::new(unix_secs, 0)).map_err(|e| {
            host_err(op::NO_PERMISSION, "setting system clock".into()).cause_other(e.into())
        })
    }
}

pub struct SystemRebooter;

impl Rebooter for SystemRebooter {
    fn reboot(&mut self) -> Result<()> {
        nix::unistd::sync();
        match nix_reboot(RebootMode::RB_AUTOBOOT) {
            Ok(never) => match never {},
            Err(e) => {
                Err(host_err(op::NO_PERMISSION, "reboot".into()).cause_other(e.into()))
            }
        }
    }
}

/// The data partition is mounted by the surrounding initramfs; this
/// port only hands out the fixed mount point.
pub struct FixedDataPartition;

impl DataPartition for FixedDataPartition {
    fn mount(&mut self) -> Result<PathBuf> {
        let path = Path::new(DATA_PARTITION_MOUNT);
        if !path.is_dir() {
            return Err(host_err(
                op::VALIDATE,
                format!("data partition not mounted at {DATA_PARTITION_MOUNT}"),
            ));
        }
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_log_appends_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log/measurements.log");
        let mut sink = FileEventLog::new(&path);
        sink.measure("ospkg 'test'", b"payload").unwrap();
        sink.measure("boot failure", b"detail").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("ospkg 'test' sha256:"));
        assert_eq!(
            lines[0],
            format!(
                "ospkg 'test' sha256:{}",
                hex::encode(openssl::sha::sha256(b"payload"))
            )
        );
    }

    #[test]
    fn unstaged_exec_is_rejected() {
        let mut executor = KexecExecutor::new();
        let err = executor.exec().unwrap_err();
        assert!(err.matches(Scope::Host, op::VALIDATE));
    }

    #[test]
    fn memfd_holds_contents() {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = memfd_with("stboot-test", b"kernel bytes").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"kernel bytes");
    }
}
