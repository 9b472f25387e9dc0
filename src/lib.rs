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

//! Core of the stboot measured/verified network bootloader: it locates
//! a signed OS package, verifies it against the pinned signing root,
//! and hands control to the verified kernel.

pub mod boot;
pub mod config;
pub mod errors;
pub mod fetch;
pub mod ospkg;
pub mod platform;
pub mod stlog;
pub mod trust;
