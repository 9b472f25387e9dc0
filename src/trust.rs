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

//! Signature engine: signature schemes, certificate validation and the
//! M-of-N package verification contract.

use openssl::asn1::Asn1Time;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::md::Md;
use openssl::pkey::{HasPrivate, HasPublic, Id, PKeyRef};
use openssl::pkey_ctx::PkeyCtx;
use openssl::rsa::Padding;
use openssl::sha;
use openssl::sign::{RsaPssSaltlen, Signer as OsslSigner, Verifier};
use openssl::x509::{X509, X509Ref};
use std::collections::HashSet;
use std::fs;
use std::num::NonZeroU32;
use std::path::Path;

use crate::errors::{op, Error, Result, Scope};
use crate::ospkg::{Archive, Descriptor};

/// Pinned trust root location.
pub const SIGNING_ROOT_PATH: &str = "/etc/ospkg_signing_root.pem";

const PEM_CERT_END: &[u8] = b"-----END CERTIFICATE-----";

fn trust_err(op_name: &str, info: String) -> Error {
    Error::new().scope(Scope::Trust).op(op_name).info(info)
}

fn ssl_err(op_name: &str, info: &str, e: ErrorStack) -> Error {
    trust_err(op_name, info.to_string()).cause_other(e.into())
}

/// Signature scheme, selected by public key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signer {
    /// RSA-PSS with SHA-256, salt length = digest length, MGF1/SHA-256.
    RsaPss,
    /// Ed25519 per RFC 8032, over the payload digest as message.
    Ed25519,
}

impl Signer {
    /// Select the scheme for a key.  Dispatch is total: key types
    /// without a scheme are an error, not a default.
    pub fn for_key<T: HasPublic>(key: &PKeyRef<T>) -> Result<Self> {
        match key.id() {
            Id::RSA => Ok(Self::RsaPss),
            Id::ED25519 => Ok(Self::Ed25519),
            other => Err(trust_err(
                op::INVALID_KEY,
                format!("unsupported key type {other:?}"),
            )),
        }
    }

    /// Sign `data`.  Both schemes sign the SHA-256 digest of `data`, so
    /// a signature made here verifies against that digest.
    pub fn sign<T: HasPrivate>(&self, key: &PKeyRef<T>, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(trust_err(op::HASH_ZERO_LENGTH, "no data to sign".into()));
        }
        match self {
            Self::RsaPss => {
                if key.id() != Id::RSA {
                    return Err(trust_err(
                        op::INVALID_KEY,
                        format!("RSA-PSS needs an RSA key, got {:?}", key.id()),
                    ));
                }
                let mut signer = OsslSigner::new(MessageDigest::sha256(), key)
                    .map_err(|e| ssl_err(op::SIGN, "creating RSA-PSS signer", e))?;
                signer
                    .set_rsa_padding(Padding::PKCS1_PSS)
                    .and_then(|_| signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH))
                    .and_then(|_| signer.set_rsa_mgf1_md(MessageDigest::sha256()))
                    .map_err(|e| ssl_err(op::SIGN, "configuring RSA-PSS signer", e))?;
                signer
                    .update(data)
                    .and_then(|_| signer.sign_to_vec())
                    .map_err(|e| ssl_err(op::SIGN, "RSA-PSS signing", e))
            }
            Self::Ed25519 => {
                if key.id() != Id::ED25519 {
                    return Err(trust_err(
                        op::INVALID_KEY,
                        format!("Ed25519 needs an Ed25519 key, got {:?}", key.id()),
                    ));
                }
                let digest = sha::sha256(data);
                let mut signer = OsslSigner::new_without_digest(key)
                    .map_err(|e| ssl_err(op::SIGN, "creating Ed25519 signer", e))?;
                signer
                    .sign_oneshot_to_vec(&digest)
                    .map_err(|e| ssl_err(op::SIGN, "Ed25519 signing", e))
            }
        }
    }

    /// Verify `signature` over a precomputed SHA-256 `hash`.
    pub fn verify<T: HasPublic>(
        &self,
        signature: &[u8],
        hash: &[u8],
        key: &PKeyRef<T>,
    ) -> Result<()> {
        if signature.is_empty() {
            return Err(trust_err(
                op::SIGN_ZERO_LENGTH,
                "zero length signature".into(),
            ));
        }
        if hash.is_empty() {
            return Err(trust_err(op::HASH_ZERO_LENGTH, "zero length hash".into()));
        }
        match self {
            Self::RsaPss => {
                if key.id() != Id::RSA {
                    return Err(trust_err(
                        op::INVALID_KEY,
                        format!("RSA-PSS needs an RSA key, got {:?}", key.id()),
                    ));
                }
                let mut ctx = PkeyCtx::new(key)
                    .map_err(|e| ssl_err(op::VERIFY, "creating verification context", e))?;
                ctx.verify_init()
                    .and_then(|_| ctx.set_rsa_padding(Padding::PKCS1_PSS))
                    .and_then(|_| ctx.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH))
                    .and_then(|_| ctx.set_rsa_mgf1_md(Md::sha256()))
                    .and_then(|_| ctx.set_signature_md(Md::sha256()))
                    .map_err(|e| ssl_err(op::VERIFY, "configuring verification context", e))?;
                match ctx.verify(hash, signature) {
                    Ok(true) => Ok(()),
                    Ok(false) | Err(_) => Err(trust_err(
                        op::VERIFICATION_FAILED,
                        "RSA-PSS signature does not verify".into(),
                    )),
                }
            }
            Self::Ed25519 => {
                if key.id() != Id::ED25519 {
                    return Err(trust_err(
                        op::INVALID_KEY,
                        format!("Ed25519 needs an Ed25519 key, got {:?}", key.id()),
                    ));
                }
                let mut verifier = Verifier::new_without_digest(key)
                    .map_err(|e| ssl_err(op::VERIFY, "creating Ed25519 verifier", e))?;
                match verifier.verify_oneshot(signature, hash) {
                    Ok(true) => Ok(()),
                    Ok(false) | Err(_) => Err(trust_err(
                        op::VERIFICATION_FAILED,
                        "Ed25519 signature does not verify".into(),
                    )),
                }
            }
        }
    }
}

/// Parse the first PEM certificate in `pem`, returning it together with
/// the bytes after it so multi-certificate files can be iterated.
pub fn load_cert_pem(pem: &[u8]) -> Result<(X509, &[u8])> {
    let end = pem
        .windows(PEM_CERT_END.len())
        .position(|w| w == PEM_CERT_END)
        .map(|pos| pos + PEM_CERT_END.len())
        .ok_or_else(|| trust_err(op::PARSE, "no certificate in PEM data".into()))?;
    let cert = X509::from_pem(&pem[..end])
        .map_err(|e| ssl_err(op::PARSE, "decoding PEM certificate", e))?;
    Ok((cert, &pem[end..]))
}

/// Check `now` against the certificate validity window.
pub fn validate_cert_times(cert: &X509Ref, now: i64) -> Result<()> {
    let now = Asn1Time::from_unix(now)
        .map_err(|e| ssl_err(op::VALIDATE, "encoding current time", e))?;
    if cert.not_before() > &now {
        return Err(trust_err(op::VALIDATE, "certificate not yet valid".into()));
    }
    if cert.not_after() < &now {
        return Err(trust_err(op::VALIDATE, "certificate expired".into()));
    }
    Ok(())
}

/// Load and time-validate the pinned signing root.
pub fn load_signing_root(path: &Path, now: i64) -> Result<X509> {
    let pem = fs::read(path).map_err(|e| {
        trust_err(op::PARSE, format!("reading {}", path.display())).cause_other(e.into())
    })?;
    let (root, _) = load_cert_pem(&pem)?;
    validate_cert_times(&root, now)
        .map_err(|e| trust_err(op::VALIDATE, "signing root".into()).cause(e))?;
    Ok(root)
}

/// Verify an OS package against its descriptor and the pinned root.
///
/// Each `(certificate[i], signature[i])` pair is checked independently:
/// certificate parse, chain to the root (signature plus temporal
/// validity), scheme dispatch by key type, then the signature over the
/// package digest.  Duplicate certificate subjects count at most once.
/// Returns the number of accepted pairs, or `Trust/VerificationFailed`
/// listing every failed pair in input order.
pub fn verify_package(
    archive: &Archive,
    descriptor: &Descriptor,
    root: &X509Ref,
    threshold: NonZeroU32,
    now: i64,
) -> Result<u32> {
    let hash = archive.digest();
    let certs = descriptor.certificates_der()?;
    let sigs = descriptor.signatures_raw()?;
    if certs.len() != sigs.len() {
        return Err(trust_err(
            op::VERIFY,
            "descriptor certificate/signature pairing broken".into(),
        ));
    }
    let root_key = root
        .public_key()
        .map_err(|e| ssl_err(op::PARSE, "extracting root public key", e))?;

    let mut accepted: HashSet<u32> = HashSet::new();
    let mut failures: Vec<String> = Vec::new();
    for (i, (der, sig)) in certs.iter().zip(&sigs).enumerate() {
        match verify_pair(der, sig, &hash, &root_key, now) {
            Ok(subject) => {
                if !accepted.insert(subject) {
                    failures.push(format!("pair {i}: duplicate certificate subject"));
                }
            }
            Err(e) => {
                log::debug!("signature pair {i} rejected: {e}");
                failures.push(format!("pair {i}: {e}"));
            }
        }
    }

    let count = accepted.len() as u32;
    if count < threshold.get() {
        return Err(trust_err(
            op::VERIFICATION_FAILED,
            format!(
                "{count} of {threshold} required signatures valid: {}",
                failures.join("; ")
            ),
        ));
    }
    Ok(count)
}

fn verify_pair(
    der: &[u8],
    sig: &[u8],
    hash: &[u8],
    root_key: &PKeyRef<openssl::pkey::Public>,
    now: i64,
) -> Result<u32> {
    let cert = X509::from_der(der)
        .map_err(|e| trust_err(op::PARSE, format!("certificate does not parse: {e}")))?;
    match cert.verify(root_key) {
        Ok(true) => (),
        Ok(false) => {
            return Err(trust_err(
                op::VALIDATE,
                "certificate not signed by the trust root".into(),
            ))
        }
        Err(e) => {
            return Err(trust_err(
                op::VALIDATE,
                format!("certificate chain verification: {e}"),
            ))
        }
    }
    validate_cert_times(&cert, now)?;
    let key = cert
        .public_key()
        .map_err(|e| trust_err(op::PARSE, format!("extracting public key: {e}")))?;
    let signer = Signer::for_key(&key)?;
    signer.verify(sig, hash, &key)?;
    Ok(cert.subject_name_hash())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use openssl::bn::BigNum;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::nid::Nid;
    use openssl::pkey::{PKey, Private, Public};
    use openssl::rsa::Rsa;
    use openssl::x509::X509NameBuilder;

    // fixed boot time inside every generated validity window
    pub(crate) const NOW: i64 = 1_700_000_000;
    pub(crate) const DAY: i64 = 86_400;

    pub(crate) fn rsa_key() -> PKey<Private> {
        PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
    }

    pub(crate) fn ed25519_key() -> PKey<Private> {
        PKey::generate_ed25519().unwrap()
    }

    pub(crate) fn ec_key() -> PKey<Private> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
    }

    pub(crate) fn public_half<T: HasPrivate>(key: &PKeyRef<T>) -> PKey<Public> {
        PKey::public_key_from_pem(&key.public_key_to_pem().unwrap()).unwrap()
    }

    pub(crate) fn make_cert(
        subject: &str,
        key: &PKey<Private>,
        issuer: Option<(&X509, &PKey<Private>)>,
        not_before: i64,
        not_after: i64,
    ) -> X509 {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, subject).unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_pubkey(key).unwrap();
        builder
            .set_not_before(&Asn1Time::from_unix(not_before).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::from_unix(not_after).unwrap())
            .unwrap();
        let signing_key = match issuer {
            Some((cert, signing_key)) => {
                builder.set_issuer_name(cert.subject_name()).unwrap();
                signing_key
            }
            None => {
                builder.set_issuer_name(&name).unwrap();
                key
            }
        };
        builder.sign(signing_key, MessageDigest::sha256()).unwrap();
        builder.build()
    }

    pub(crate) fn make_root(key: &PKey<Private>) -> X509 {
        make_cert("test root", key, None, NOW - 10 * DAY, NOW + 10 * DAY)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    struct Fixture {
        archive: Archive,
        descriptor: Descriptor,
        root: X509,
    }

    /// Archive plus descriptor with `n` Ed25519 signature/cert pairs
    /// chained to a fresh root.
    fn fixture(n: usize) -> Fixture {
        let root_key = rsa_key();
        let root = make_root(&root_key);
        let archive = Archive::new(
            b"kernel image".to_vec(),
            Some(b"initramfs image".to_vec()),
            None,
        )
        .unwrap();

        let mut certificates = Vec::new();
        let mut signatures = Vec::new();
        for i in 0..n {
            let key = ed25519_key();
            let cert = make_cert(
                &format!("signer {i}"),
                &key,
                Some((&root, &root_key)),
                NOW - DAY,
                NOW + DAY,
            );
            certificates.push(base64::encode(cert.to_der().unwrap()));
            let sig = Signer::Ed25519
                .sign(&key, &archive.signed_payload())
                .unwrap();
            signatures.push(base64::encode(sig));
        }
        let descriptor = Descriptor {
            version: 1,
            os_pkg_url: String::new(),
            certificates,
            signatures,
        };
        Fixture {
            archive,
            descriptor,
            root,
        }
    }

    fn threshold(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[test]
    fn rsa_pss_roundtrip_and_tampering() {
        let key = rsa_key();
        let public = public_half(&key);
        let data = b"signed payload bytes";
        let hash = sha::sha256(data);

        let sig = Signer::RsaPss.sign(&key, data).unwrap();
        Signer::RsaPss.verify(&sig, &hash, &public).unwrap();

        // flip one bit of the signature
        let mut bad_sig = sig.clone();
        bad_sig[0] ^= 0x01;
        let err = Signer::RsaPss.verify(&bad_sig, &hash, &public).unwrap_err();
        assert!(err.matches(Scope::Trust, op::VERIFICATION_FAILED));

        // flip one bit of the hash
        let mut bad_hash = hash;
        bad_hash[31] ^= 0x80;
        let err = Signer::RsaPss.verify(&sig, &bad_hash, &public).unwrap_err();
        assert!(err.matches(Scope::Trust, op::VERIFICATION_FAILED));

        // flip one bit of the data
        let mut bad_data = data.to_vec();
        bad_data[5] ^= 0x04;
        let err = Signer::RsaPss
            .verify(&sig, &sha::sha256(&bad_data), &public)
            .unwrap_err();
        assert!(err.matches(Scope::Trust, op::VERIFICATION_FAILED));
    }

    #[test]
    fn ed25519_roundtrip_and_tampering() {
        let key = ed25519_key();
        let public = public_half(&key);
        let data = b"signed payload bytes";
        let hash = sha::sha256(data);

        let sig = Signer::Ed25519.sign(&key, data).unwrap();
        Signer::Ed25519.verify(&sig, &hash, &public).unwrap();

        let mut bad_sig = sig.clone();
        bad_sig[10] ^= 0x20;
        let err = Signer::Ed25519.verify(&bad_sig, &hash, &public).unwrap_err();
        assert!(err.matches(Scope::Trust, op::VERIFICATION_FAILED));

        let mut bad_hash = hash;
        bad_hash[0] ^= 0x01;
        let err = Signer::Ed25519.verify(&sig, &bad_hash, &public).unwrap_err();
        assert!(err.matches(Scope::Trust, op::VERIFICATION_FAILED));
    }

    #[test]
    fn zero_length_inputs() {
        let key = ed25519_key();
        let hash = sha::sha256(b"x");
        let err = Signer::Ed25519.verify(&[], &hash, &key).unwrap_err();
        assert!(err.matches(Scope::Trust, op::SIGN_ZERO_LENGTH));
        let err = Signer::Ed25519.verify(b"sig", &[], &key).unwrap_err();
        assert!(err.matches(Scope::Trust, op::HASH_ZERO_LENGTH));
        let err = Signer::Ed25519.sign(&key, &[]).unwrap_err();
        assert!(err.matches(Scope::Trust, op::HASH_ZERO_LENGTH));
    }

    #[test]
    fn wrong_key_types_are_rejected() {
        let rsa = rsa_key();
        let ed = ed25519_key();
        let hash = sha::sha256(b"x");

        let err = Signer::RsaPss.verify(b"sig", &hash, &ed).unwrap_err();
        assert!(err.matches(Scope::Trust, op::INVALID_KEY));
        let err = Signer::Ed25519.verify(b"sig", &hash, &rsa).unwrap_err();
        assert!(err.matches(Scope::Trust, op::INVALID_KEY));
        let err = Signer::RsaPss.sign(&ed, b"data").unwrap_err();
        assert!(err.matches(Scope::Trust, op::INVALID_KEY));
    }

    #[test]
    fn scheme_dispatch_is_total() {
        assert_eq!(Signer::for_key(&rsa_key()).unwrap(), Signer::RsaPss);
        assert_eq!(Signer::for_key(&ed25519_key()).unwrap(), Signer::Ed25519);
        let err = Signer::for_key(&ec_key()).unwrap_err();
        assert!(err.matches(Scope::Trust, op::INVALID_KEY));
    }

    #[test]
    fn pem_loader_returns_trailing_bytes() {
        let key = rsa_key();
        let a = make_root(&key);
        let b = make_cert("second", &key, None, NOW - DAY, NOW + DAY);
        let mut pem = a.to_pem().unwrap();
        pem.extend_from_slice(&b.to_pem().unwrap());

        let (first, rest) = load_cert_pem(&pem).unwrap();
        assert_eq!(first.to_der().unwrap(), a.to_der().unwrap());
        let (second, rest) = load_cert_pem(rest).unwrap();
        assert_eq!(second.to_der().unwrap(), b.to_der().unwrap());
        assert!(load_cert_pem(rest).is_err());
    }

    #[test]
    fn cert_time_window_is_enforced() {
        let key = rsa_key();
        let cert = make_cert("t", &key, None, NOW - DAY, NOW + DAY);
        validate_cert_times(&cert, NOW).unwrap();

        let err = validate_cert_times(&cert, NOW - 2 * DAY).unwrap_err();
        assert!(err.info_str().contains("not yet valid"));
        let err = validate_cert_times(&cert, NOW + 2 * DAY).unwrap_err();
        assert!(err.info_str().contains("expired"));
    }

    #[test]
    fn package_verifies_with_threshold_met() {
        let f = fixture(3);
        let count =
            verify_package(&f.archive, &f.descriptor, &f.root, threshold(2), NOW).unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn truncated_signatures_fail_threshold_with_diagnosis() {
        let mut f = fixture(3);
        // truncate signatures 0 and 2 by one byte
        for i in [0usize, 2] {
            let mut sig = base64::decode(&f.descriptor.signatures[i]).unwrap();
            sig.pop();
            f.descriptor.signatures[i] = base64::encode(sig);
        }
        let err =
            verify_package(&f.archive, &f.descriptor, &f.root, threshold(2), NOW).unwrap_err();
        assert!(err.matches(Scope::Trust, op::VERIFICATION_FAILED));
        assert!(err.info_str().contains("pair 0"));
        assert!(err.info_str().contains("pair 2"));
        assert!(!err.info_str().contains("pair 1"));
    }

    #[test]
    fn invalid_pairs_do_not_block_success() {
        let mut f = fixture(3);
        f.descriptor.signatures[1] = base64::encode(b"garbage");
        let count =
            verify_package(&f.archive, &f.descriptor, &f.root, threshold(2), NOW).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn duplicate_subjects_count_once() {
        let mut f = fixture(1);
        let cert = f.descriptor.certificates[0].clone();
        let sig = f.descriptor.signatures[0].clone();
        f.descriptor.certificates.push(cert);
        f.descriptor.signatures.push(sig);

        let err =
            verify_package(&f.archive, &f.descriptor, &f.root, threshold(2), NOW).unwrap_err();
        assert!(err.matches(Scope::Trust, op::VERIFICATION_FAILED));
        assert!(err.info_str().contains("duplicate certificate subject"));
    }

    #[test]
    fn unchained_certificate_fails_its_pair() {
        let mut f = fixture(2);
        // replace pair 0 with a cert chained to some other root
        let other_root_key = rsa_key();
        let other_root = make_root(&other_root_key);
        let key = ed25519_key();
        let cert = make_cert(
            "outsider",
            &key,
            Some((&other_root, &other_root_key)),
            NOW - DAY,
            NOW + DAY,
        );
        f.descriptor.certificates[0] = base64::encode(cert.to_der().unwrap());
        f.descriptor.signatures[0] =
            base64::encode(Signer::Ed25519.sign(&key, &f.archive.signed_payload()).unwrap());

        let err =
            verify_package(&f.archive, &f.descriptor, &f.root, threshold(2), NOW).unwrap_err();
        assert!(err.info_str().contains("pair 0"));
        // the chained pair alone still verifies at threshold 1
        let count =
            verify_package(&f.archive, &f.descriptor, &f.root, threshold(1), NOW).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn expired_leaf_fails_its_pair() {
        let f = fixture(1);
        let err = verify_package(
            &f.archive,
            &f.descriptor,
            &f.root,
            threshold(1),
            NOW + 5 * DAY,
        )
        .unwrap_err();
        assert!(err.matches(Scope::Trust, op::VERIFICATION_FAILED));
        assert!(err.info_str().contains("expired"));
    }

    #[test]
    fn signing_root_is_loaded_and_time_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("root.pem");
        let key = rsa_key();
        let root = make_root(&key);
        std::fs::write(&path, root.to_pem().unwrap()).unwrap();

        load_signing_root(&path, NOW).unwrap();
        let err = load_signing_root(&path, NOW + 20 * DAY).unwrap_err();
        assert!(err.matches(Scope::Trust, op::VALIDATE));
        let err = load_signing_root(&dir.path().join("missing.pem"), NOW).unwrap_err();
        assert!(err.matches(Scope::Trust, op::PARSE));
    }
}
