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

use log::LevelFilter;
use std::fs;

use libstboot::boot::{BootController, BootPaths};
use libstboot::platform::{
    CommandNetworkSetup, FileEventLog, FixedDataPartition, KexecExecutor, RealClock,
    SystemRebooter,
};
use libstboot::stlog::{self, Target};

const LOGLEVEL_PARAM: &str = "stboot.loglevel=";

fn main() {
    if let Err(e) = stlog::init() {
        eprintln!("stboot: {e}");
    }
    // as PID 1 stderr goes nowhere; use the kernel ring buffer
    if nix::unistd::getpid().as_raw() == 1 {
        if let Err(e) = stlog::set_output(Target::Kmsg) {
            log::warn!("falling back to stderr logging: {e}");
        }
    }
    stlog::set_level(loglevel_from_cmdline());

    let mut executor = KexecExecutor::new();
    let mut measurements = FileEventLog::default();
    let mut network = CommandNetworkSetup;
    let mut clock = RealClock;
    let mut rebooter = SystemRebooter;
    let mut data_partition = FixedDataPartition;

    let mut controller = BootController::new(
        &mut executor,
        &mut measurements,
        &mut network,
        &mut clock,
        &mut rebooter,
        &mut data_partition,
        BootPaths::default(),
    );

    match controller.run() {
        // the kernel was handed off or a corrective reboot is underway
        Ok(()) => (),
        // the error is already logged; an unverified kernel is never
        // executed, so there is nothing left to do but halt
        Err(_) => halt(),
    }
}

/// Log level from the kernel command line, default info.
fn loglevel_from_cmdline() -> LevelFilter {
    let Ok(cmdline) = fs::read_to_string("/proc/cmdline") else {
        return LevelFilter::Info;
    };
    for token in cmdline.split_whitespace() {
        if let Some(level) = token.strip_prefix(LOGLEVEL_PARAM) {
            return stlog::level_from_str(level);
        }
    }
    LevelFilter::Info
}

fn halt() -> ! {
    log::error!("boot halted");
    loop {
        nix::unistd::pause();
    }
}
