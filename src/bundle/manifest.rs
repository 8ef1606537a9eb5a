// src/bundle/manifest.rs

//! Signed bundle manifest.
//!
//! The manifest is YAML metadata listing every artifact in a bundle with its
//! size and SHA-256, signed as a whole: the signed payload is the manifest
//! serialized with the `signature` field cleared, so the signature covers
//! everything else bit for bit.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Manifest wire format version this implementation produces and accepts.
pub const MANIFEST_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signing_public_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    pub artifacts: Vec<ManifestArtifact>,
}

/// A single file within the bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestArtifact {
    /// Relative slash path under the bundle's artifact prefix.
    pub path: String,
    pub kind: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
}

impl Manifest {
    /// The canonical signing payload: this manifest with `signature` cleared.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let mut clone = self.clone();
        clone.signature = String::new();
        Ok(serde_yaml::to_string(&clone)?.into_bytes())
    }
}

/// Infer an artifact kind from its file suffix.
pub fn infer_kind(path: &str) -> &'static str {
    let lower = path.to_lowercase();
    if lower.ends_with(".iso") {
        "iso"
    } else if lower.ends_with(".wim") {
        "wim"
    } else if lower.ends_with(".img") {
        "disk-image"
    } else if lower.ends_with(".qcow2") {
        "qcow2"
    } else if lower.ends_with(".vhd") || lower.ends_with(".vhdx") {
        "vhd"
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        "tar.gz"
    } else if lower.ends_with(".tar") {
        "tar"
    } else if lower.ends_with(".zip") {
        "zip"
    } else {
        "file"
    }
}
