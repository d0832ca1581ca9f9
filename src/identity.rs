// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Certificate identity: fingerprint, default name and trust-store nickname.
//!
//! Parsing is done in-process with `x509-parser`; no openssl binary involved.

use crate::error::{Error, Result};
use sha1::{Digest, Sha1};
use std::path::Path;
use x509_parser::prelude::*;

/// Tag that marks trust-store entries managed by vdcm.
pub const MARKER: &str = "VDCM";

/// Name used when the file name yields nothing usable.
pub const FALLBACK_NAME: &str = "local.dev";

const CERT_EXTENSIONS: &[&str] = &["pem", "crt", "cer"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateIdentity {
    /// Uppercase hex SHA-1 of the DER encoding, no separators.
    pub fingerprint: String,
    pub default_name: String,
    pub common_name: Option<String>,
}

impl CertificateIdentity {
    pub fn from_path(path: &Path) -> Result<Self> {
        let der = read_der(path)?;
        let (rest, cert) = X509Certificate::from_der(&der)
            .map_err(|e| Error::CertParse(format!("Invalid X.509: {}", e)))?;
        let encoded = &der[..der.len() - rest.len()];

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(String::from);

        Ok(Self {
            fingerprint: fingerprint_der(encoded),
            default_name: default_name_from(path),
            common_name,
        })
    }

    pub fn nickname(&self, name: &str) -> String {
        nickname_for(name)
    }
}

/// Fingerprint of the certificate stored at `path`. Only the certificate's
/// own encoding is hashed; bytes after it in the file are ignored.
pub fn fingerprint(path: &Path) -> Result<String> {
    let der = read_der(path)?;
    let (rest, _) = X509Certificate::from_der(&der)
        .map_err(|e| Error::CertParse(format!("Invalid X.509: {}", e)))?;
    Ok(fingerprint_der(&der[..der.len() - rest.len()]))
}

fn fingerprint_der(der: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(der))
}

/// Load the DER bytes of the first certificate in a PEM file, or the raw
/// bytes of a DER file.
fn read_der(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).map_err(|e| Error::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    if !looks_like_pem(&bytes) {
        return Ok(bytes);
    }

    let text = std::str::from_utf8(&bytes)
        .map_err(|_| Error::CertParse("PEM file is not valid UTF-8".into()))?;

    let blocks = ::pem::parse_many(text)
        .map_err(|e| Error::CertParse(format!("Failed to parse PEM: {}", e)))?;

    blocks
        .into_iter()
        .find(|block| block.tag() == "CERTIFICATE" || block.tag() == "X509 CERTIFICATE")
        .map(|block| block.into_contents())
        .ok_or_else(|| Error::CertParse("No CERTIFICATE block found".into()))
}

fn looks_like_pem(bytes: &[u8]) -> bool {
    bytes
        .windows(b"-----BEGIN".len())
        .any(|w| w == b"-----BEGIN")
}

/// File base name without a trailing `.pem`, `.crt` or `.cer` (any case).
pub fn default_name_from(path: &Path) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let stripped = match base.rsplit_once('.') {
        Some((stem, ext))
            if CERT_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known)) =>
        {
            stem.to_string()
        }
        _ => base,
    };

    if stripped.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        stripped
    }
}

pub fn nickname_for(name: &str) -> String {
    format!("{}:{}", MARKER, name)
}

/// True for a string shaped like a fingerprint (40 hex digits).
pub fn is_fingerprint(value: &str) -> bool {
    value.len() == 40 && value.chars().all(|c| c.is_ascii_hexdigit())
}
