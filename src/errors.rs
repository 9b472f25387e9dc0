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

//! Structured error domain shared by all boot phases.
//!
//! Every phase reports failures as an [`Error`] carrying the subsystem
//! scope, the operation that failed, free-form detail, and an optional
//! wrapped cause.  The rendering is a single machine-parseable line per
//! error, followed by the cause chain.

use std::fmt;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// Subsystem that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    Host,
    Network,
    Opts,
    Ospkg,
    Stlog,
    Trust,
    #[default]
    Undefined,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::Host => "host",
            Scope::Network => "network",
            Scope::Opts => "opts",
            Scope::Ospkg => "ospkg",
            Scope::Stlog => "stlog",
            Scope::Trust => "trust",
            Scope::Undefined => "undefined",
        };
        f.write_str(name)
    }
}

/// Operation names shared across scopes.
pub mod op {
    pub const PARSE: &str = "Parse";
    pub const SERIALIZE: &str = "Serialize";
    pub const VALIDATE: &str = "Validate";
    pub const SIGN: &str = "Sign";
    pub const VERIFY: &str = "Verify";
    pub const INVALID_KEY: &str = "InvalidKey";
    pub const NO_RESPONSE: &str = "NoResponse";
    pub const NO_PERMISSION: &str = "NoPermission";
    pub const SIGN_ZERO_LENGTH: &str = "SignZeroLength";
    pub const HASH_ZERO_LENGTH: &str = "HashZeroLength";
    pub const VERIFICATION_FAILED: &str = "VerificationFailed";
}

/// Wrapped cause of an [`Error`].
#[derive(Debug, Clone)]
pub enum Cause {
    /// Another structured error; compared recursively.
    Chained(Box<Error>),
    /// An error from outside the domain; compared by reference.
    Other(Arc<anyhow::Error>),
}

/// Structured boot error.
///
/// Constructed with named setters; every field defaults to its zero
/// value, so `Error::new()` alone is the well-formed "unspecified"
/// error.  Setters may be called repeatedly; the last call wins.
#[derive(Debug, Clone, Default)]
pub struct Error {
    scope: Scope,
    op: String,
    info: String,
    cause: Option<Cause>,
}

impl Error {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn op(mut self, op: impl Into<String>) -> Self {
        self.op = op.into();
        self
    }

    pub fn info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    pub fn cause(mut self, cause: Error) -> Self {
        self.cause = Some(Cause::Chained(Box::new(cause)));
        self
    }

    pub fn cause_other(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(Cause::Other(Arc::new(cause)));
        self
    }

    /// Whether this error carries the given scope and operation.
    pub fn matches(&self, scope: Scope, op: &str) -> bool {
        self.scope == scope && self.op == op
    }

    pub fn info_str(&self) -> &str {
        &self.info
    }

    pub fn wrapped(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.scope)?;
        if !self.op.is_empty() {
            write!(f, ": {}", self.op)?;
        }
        if !self.info.is_empty() {
            write!(f, " - {}", self.info)?;
        }
        match &self.cause {
            Some(Cause::Chained(e)) => write!(f, "\n{e}"),
            Some(Cause::Other(e)) => write!(f, "\n{e}"),
            None => Ok(()),
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        if self.scope != other.scope || self.op != other.op || self.info != other.info {
            return false;
        }
        match (&self.cause, &other.cause) {
            (None, None) => true,
            (Some(Cause::Chained(a)), Some(Cause::Chained(b))) => a == b,
            (Some(Cause::Other(a)), Some(Cause::Other(b))) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Error {}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            Some(Cause::Chained(e)) => Some(e.as_ref()),
            Some(Cause::Other(e)) => {
                let inner: &(dyn std::error::Error + 'static) = e.as_ref().as_ref();
                Some(inner)
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn unspecified_error_renders() {
        assert_eq!(Error::new().to_string(), "undefined");
    }

    #[test]
    fn rendering_elides_empty_fields() {
        let e = Error::new().scope(Scope::Trust).op(op::VERIFY);
        assert_eq!(e.to_string(), "trust: Verify");

        let e = Error::new().scope(Scope::Host).info("mount failed");
        assert_eq!(e.to_string(), "host - mount failed");

        let e = Error::new()
            .scope(Scope::Ospkg)
            .op(op::VALIDATE)
            .info("invalid version: 2, expected 1");
        assert_eq!(e.to_string(), "ospkg: Validate - invalid version: 2, expected 1");
    }

    #[test]
    fn rendering_includes_cause_chain() {
        let inner = Error::new().scope(Scope::Network).op(op::NO_RESPONSE);
        let outer = Error::new()
            .scope(Scope::Host)
            .op(op::VALIDATE)
            .info("boot failed")
            .cause(inner);
        assert_eq!(
            outer.to_string(),
            "host: Validate - boot failed\nnetwork: NoResponse"
        );
    }

    #[test]
    fn last_setter_wins() {
        let e = Error::new()
            .scope(Scope::Host)
            .scope(Scope::Trust)
            .op(op::PARSE)
            .op(op::VERIFY);
        assert!(e.matches(Scope::Trust, op::VERIFY));
    }

    #[test]
    fn equality_is_structural_and_recursive() {
        let mk = || {
            Error::new()
                .scope(Scope::Trust)
                .op(op::VERIFICATION_FAILED)
                .info("2 of 3")
                .cause(Error::new().scope(Scope::Trust).op(op::INVALID_KEY))
        };
        let a = mk();
        let b = mk();
        let c = mk();

        // reflexive, symmetric, transitive
        assert_eq!(a, a);
        assert_eq!(a, b);
        assert_eq!(b, a);
        assert_eq!(b, c);
        assert_eq!(a, c);

        let different_cause = Error::new()
            .scope(Scope::Trust)
            .op(op::VERIFICATION_FAILED)
            .info("2 of 3")
            .cause(Error::new().scope(Scope::Trust).op(op::PARSE));
        assert_ne!(a, different_cause);
    }

    #[test]
    fn opaque_causes_compare_by_reference() {
        let shared = Arc::new(anyhow!("io failure"));
        let mut a = Error::new().scope(Scope::Host);
        a.cause = Some(Cause::Other(shared.clone()));
        let mut b = Error::new().scope(Scope::Host);
        b.cause = Some(Cause::Other(shared));
        assert_eq!(a, b);

        // equal messages, distinct values
        let c = Error::new().scope(Scope::Host).cause_other(anyhow!("io failure"));
        let d = Error::new().scope(Scope::Host).cause_other(anyhow!("io failure"));
        assert_ne!(c, d);
    }

    #[test]
    fn source_exposes_cause() {
        use std::error::Error as _;
        let e = Error::new()
            .scope(Scope::Ospkg)
            .cause(Error::new().scope(Scope::Trust));
        assert!(e.source().is_some());
        assert!(Error::new().source().is_none());
    }
}
