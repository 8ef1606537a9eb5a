// src/bundle/mod.rs

//! Air-gap artifact bundles: signed tar+zstd archives.
//!
//! `build` walks an artifact directory, hashes every file streaming,
//! assembles and signs the manifest, and writes `manifest.yaml` plus the
//! payload files under `artifacts/` into a zstd-compressed tar. `import`
//! stages the archive into a temp directory, verifies the manifest signature
//! and every artifact's size and SHA-256 bit for bit, then registers each
//! artifact with the API and uploads the bytes to content-addressed storage.
//! Any verification failure fails the entire import; nothing is partially
//! ingested.

pub mod manifest;
pub mod signer;

pub use manifest::{infer_kind, Manifest, ManifestArtifact, MANIFEST_VERSION};
pub use signer::Signer;

use crate::error::{Error, Result};
use crate::storage;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};
use walkdir::WalkDir;

pub const MANIFEST_FILE_NAME: &str = "manifest.yaml";
pub const ARTIFACTS_PREFIX: &str = "artifacts";

/// Inputs for bundle creation.
pub struct BuildConfig {
    pub artifacts_dir: PathBuf,
    /// Optional newline-separated list of container image refs to mirror;
    /// blank lines and `#` comments are skipped.
    pub images_file: Option<PathBuf>,
    pub output: PathBuf,
}

/// Assemble a signed bundle from a directory of artifacts.
pub fn build(config: &BuildConfig, signer: &Signer) -> Result<Manifest> {
    let meta = std::fs::metadata(&config.artifacts_dir)
        .map_err(|e| Error::Validation(format!("artifacts dir: {e}")))?;
    if !meta.is_dir() {
        return Err(Error::Validation(format!(
            "artifacts dir {:?} is not a directory",
            config.artifacts_dir
        )));
    }

    let mut entries = collect_artifacts(&config.artifacts_dir)?;
    if entries.is_empty() {
        return Err(Error::Validation("no artifacts found to bundle".to_string()));
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let images = match &config.images_file {
        Some(path) => read_images_file(path)?,
        None => Vec::new(),
    };

    let mut manifest = Manifest {
        version: MANIFEST_VERSION.to_string(),
        created_at: chrono::SubsecRound::trunc_subsecs(chrono::Utc::now(), 0),
        signer: String::new(),
        signing_public_key: signer.public_key_base64(),
        signature: String::new(),
        images,
        artifacts: entries,
    };

    let payload = manifest.signing_bytes()?;
    manifest.signature = signer.sign(&payload)?;

    let manifest_bytes = serde_yaml::to_string(&manifest)?.into_bytes();
    write_bundle(&config.output, &manifest_bytes, &config.artifacts_dir, &manifest.artifacts)?;

    info!(
        output = %config.output.display(),
        artifacts = manifest.artifacts.len(),
        "wrote bundle"
    );
    Ok(manifest)
}

fn collect_artifacts(root: &Path) -> Result<Vec<ManifestArtifact>> {
    let mut artifacts = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Validation(format!("relative path for {:?}: {e}", entry.path())))?;
        let rel = slash_path(rel);

        let (size, sha256) = hash_file(entry.path())?;
        artifacts.push(ManifestArtifact {
            kind: infer_kind(&rel).to_string(),
            path: rel,
            size,
            sha256,
        });
    }
    Ok(artifacts)
}

fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Streaming SHA-256 and size of a file; never buffers the whole file.
fn hash_file(path: &Path) -> Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    let mut size: u64 = 0;
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size += n as u64;
    }
    Ok((size, format!("{:x}", hasher.finalize())))
}

fn read_images_file(path: &Path) -> Result<Vec<String>> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::Validation(format!("read images file: {e}")))?;
    Ok(data
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn write_bundle(
    output: &Path,
    manifest_bytes: &[u8],
    artifacts_dir: &Path,
    entries: &[ManifestArtifact],
) -> Result<()> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(output)?;
    let mut encoder = zstd::Encoder::new(file, 0)?;
    {
        let mut builder = tar::Builder::new(&mut encoder);

        let mut header = tar::Header::new_gnu();
        header.set_size(manifest_bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp() as u64);
        header.set_cksum();
        builder.append_data(&mut header, MANIFEST_FILE_NAME, manifest_bytes)?;

        for entry in entries {
            let full = artifacts_dir.join(&entry.path);
            let mut source = File::open(&full)?;
            builder.append_file(format!("{ARTIFACTS_PREFIX}/{}", entry.path), &mut source)?;
        }
        builder.finish()?;
    }
    encoder.finish()?.flush()?;
    Ok(())
}

/// Files extracted from a bundle, staged in a temporary directory that is
/// removed when this value drops.
pub struct StagedBundle {
    _dir: TempDir,
    files: HashMap<String, PathBuf>,
}

impl StagedBundle {
    /// Staged path for a manifest artifact entry, if present in the archive.
    pub fn artifact_path(&self, rel: &str) -> Option<&PathBuf> {
        self.files.get(&format!("{ARTIFACTS_PREFIX}/{rel}"))
    }
}

/// Extract a bundle and parse its manifest.
///
/// Rejects manifests with an unsupported version or a missing signature;
/// the signature itself is checked separately via [`Signer::verify`].
pub fn unpack(bundle_path: &Path) -> Result<(Manifest, StagedBundle)> {
    let file = File::open(bundle_path)?;
    let decoder = zstd::Decoder::new(file)?;
    let mut archive = tar::Archive::new(decoder);

    let staging = TempDir::with_prefix("foundry-bundle-")?;
    let mut manifest_bytes: Option<Vec<u8>> = None;
    let mut files = HashMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry.path()?.into_owned();
        let rel = sanitize_entry_path(&name)?;

        if rel == MANIFEST_FILE_NAME {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            manifest_bytes = Some(data);
            continue;
        }

        let target = staging.path().join(&rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
        files.insert(rel, target);
    }

    let manifest_bytes =
        manifest_bytes.ok_or_else(|| Error::Integrity("bundle missing manifest.yaml".to_string()))?;
    let manifest: Manifest = serde_yaml::from_slice(&manifest_bytes)?;

    if manifest.version != MANIFEST_VERSION {
        return Err(Error::Integrity(format!(
            "unsupported manifest version {:?}",
            manifest.version
        )));
    }
    if manifest.signature.is_empty() {
        return Err(Error::Integrity("manifest missing signature".to_string()));
    }

    Ok((manifest, StagedBundle { _dir: staging, files }))
}

/// Every extracted path must resolve under the staging root after cleaning.
fn sanitize_entry_path(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| {
                        Error::Integrity(format!("non-UTF-8 entry path {path:?}"))
                    })?
                    .to_string(),
            ),
            Component::CurDir => {}
            _ => {
                return Err(Error::Integrity(format!("invalid entry path {path:?}")));
            }
        }
    }
    if parts.is_empty() {
        return Err(Error::Integrity(format!("invalid entry path {path:?}")));
    }
    Ok(parts.join("/"))
}

/// Verify the manifest signature over its canonical payload.
pub fn verify_manifest(manifest: &Manifest, signer: &Signer) -> Result<()> {
    let payload = manifest.signing_bytes()?;
    signer
        .verify(&payload, &manifest.signature, &manifest.signing_public_key)
        .map_err(|e| match e {
            Error::Integrity(msg) => Error::Integrity(format!("verify manifest signature: {msg}")),
            other => other,
        })
}

/// Re-measure and re-hash one staged artifact against its manifest entry.
pub fn verify_artifact(staged: &Path, entry: &ManifestArtifact) -> Result<()> {
    let (size, sha256) = hash_file(staged)?;
    if size != entry.size {
        return Err(Error::Integrity(format!(
            "size mismatch for {}: expected {} got {}",
            entry.path, entry.size, size
        )));
    }
    if !sha256.eq_ignore_ascii_case(&entry.sha256) {
        return Err(Error::Integrity(format!("sha256 mismatch for {}", entry.path)));
    }
    Ok(())
}

/// Inputs for bundle import.
pub struct ImportConfig {
    pub bundle_path: PathBuf,
    /// Base URL of the provisioning API (e.g. `http://api.internal:8080`).
    pub api_base: String,
}

/// Import a bundle: verify everything, then register and upload each artifact.
pub async fn import(
    config: &ImportConfig,
    signer: &Signer,
    storage: &storage::Client,
) -> Result<Manifest> {
    let bundle_path = config.bundle_path.clone();
    let (manifest, staged) =
        tokio::task::spawn_blocking(move || unpack(&bundle_path))
            .await
            .map_err(|e| Error::Dependency(format!("unpack task failed: {e}")))??;

    verify_manifest(&manifest, signer)?;
    info!(created_at = %manifest.created_at, "verified manifest signature");

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| Error::Dependency(format!("failed to create HTTP client: {e}")))?;
    let api_base = config.api_base.trim_end_matches('/');

    for entry in &manifest.artifacts {
        let staged_path = staged
            .artifact_path(&entry.path)
            .ok_or_else(|| {
                Error::Integrity(format!("artifact {} missing from archive", entry.path))
            })?
            .clone();

        {
            let entry = entry.clone();
            let staged_path = staged_path.clone();
            tokio::task::spawn_blocking(move || verify_artifact(&staged_path, &entry))
                .await
                .map_err(|e| Error::Dependency(format!("verify task failed: {e}")))??;
        }

        let url = register_artifact(&http, api_base, entry).await?;
        let (bucket, key) = parse_s3_url(&url)?;

        let body = tokio::fs::read(&staged_path).await?;
        storage.put_object(&bucket, &key, body, &entry.sha256).await?;

        debug!(path = %entry.path, bytes = entry.size, bucket = %bucket, key = %key, "uploaded artifact");
    }

    Ok(manifest)
}

#[derive(Deserialize)]
struct RegisterResponse {
    #[serde(default)]
    artifact: Option<RegisteredArtifact>,
    #[serde(default)]
    s3: Option<RegisteredLocation>,
}

#[derive(Deserialize)]
struct RegisteredArtifact {
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
struct RegisteredLocation {
    #[serde(default)]
    bucket: String,
    #[serde(default)]
    key: String,
}

async fn register_artifact(
    http: &reqwest::Client,
    api_base: &str,
    entry: &ManifestArtifact,
) -> Result<String> {
    let body = serde_json::json!({
        "kind": entry.kind,
        "sha256": entry.sha256,
        "meta": {"path": entry.path, "size": entry.size},
        "mode": "register",
    });

    let response = http
        .post(format!("{api_base}/v1/artifacts"))
        .json(&body)
        .send()
        .await?;

    if response.status() != reqwest::StatusCode::CREATED {
        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        return Err(Error::Dependency(format!(
            "artifact register failed: HTTP {status}: {}",
            detail.trim()
        )));
    }

    let parsed: RegisterResponse = response.json().await?;
    if let Some(s3) = &parsed.s3 {
        if !s3.bucket.is_empty() && !s3.key.is_empty() {
            return Ok(format!("s3://{}/{}", s3.bucket, s3.key));
        }
    }
    match parsed.artifact {
        Some(artifact) if !artifact.url.is_empty() => Ok(artifact.url),
        _ => Err(Error::Dependency(
            "api response missing artifact url".to_string(),
        )),
    }
}

fn parse_s3_url(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| Error::Validation(format!("unsupported artifact url {url:?}")))?;
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(Error::Validation(format!("invalid s3 url {url:?}"))),
    }
}
