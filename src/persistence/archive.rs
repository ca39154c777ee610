//! Branch archive format.
//!
//! One archive file per branch at rest: a zip holding `manifest.json`
//! (branch metadata plus export timestamp and counts), `data.json` (the
//! per-edit records without content), and `blobs/<edit_id>.bin` with each
//! edit's stored bytes. Hard caps bound worst-case memory during export.

use std::io::{Cursor, Read, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::manifest::Branch;
use crate::store::StoredEdit;

/// On-disk extension for branch archives
pub const ARCHIVE_EXTENSION: &str = "vctrl";

/// Archive format version embedded in `manifest.json`
pub const ARCHIVE_FORMAT_VERSION: &str = "1.0";

/// Hard cap on a serialized archive
pub const MAX_ARCHIVE_BYTES: u64 = 100 * 1024 * 1024;

/// Hard cap on files inside an archive
pub const MAX_ARCHIVE_FILES: usize = 10_000;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Archive entry missing: {0}")]
    MissingEntry(String),
}

/// Metadata embedded in an archive's `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveManifest {
    pub format_version: String,
    pub note_id: Uuid,
    pub note_path: String,
    pub branch_name: String,
    /// When this archive was written
    pub exported_at: DateTime<Utc>,
    /// The note manifest's last-modified at export time; reconciliation
    /// compares this against the live manifest
    pub last_modified: DateTime<Utc>,
    pub edit_count: usize,
    pub total_bytes: u64,
    pub branch: Branch,
}

/// In-memory form of one branch archive.
#[derive(Debug, Clone)]
pub struct ArchiveBundle {
    pub manifest: ArchiveManifest,
    pub edits: Vec<StoredEdit>,
    pub blobs: Vec<(Uuid, Vec<u8>)>,
}

/// Serialize a bundle into archive bytes.
pub fn build_archive(bundle: &ArchiveBundle) -> Result<Vec<u8>, ArchiveError> {
    let file_count = bundle.blobs.len() + 2;
    if file_count > MAX_ARCHIVE_FILES {
        return Err(ArchiveError::CapacityExceeded(format!(
            "{} files exceeds the {} file limit",
            file_count, MAX_ARCHIVE_FILES,
        )));
    }

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file("manifest.json", options)?;
    zip.write_all(&serde_json::to_vec_pretty(&bundle.manifest)?)?;

    zip.start_file("data.json", options)?;
    zip.write_all(&serde_json::to_vec_pretty(&bundle.edits)?)?;

    for (edit_id, bytes) in &bundle.blobs {
        zip.start_file(format!("blobs/{}.bin", edit_id), options)?;
        zip.write_all(bytes)?;
    }

    let bytes = zip.finish()?.into_inner();
    if bytes.len() as u64 > MAX_ARCHIVE_BYTES {
        return Err(ArchiveError::CapacityExceeded(format!(
            "{} bytes exceeds the {} byte limit",
            bytes.len(),
            MAX_ARCHIVE_BYTES,
        )));
    }
    Ok(bytes)
}

/// Deserialize archive bytes back into a bundle.
pub fn parse_archive(bytes: &[u8]) -> Result<ArchiveBundle, ArchiveError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let manifest: ArchiveManifest = {
        let mut file = archive
            .by_name("manifest.json")
            .map_err(|_| ArchiveError::MissingEntry("manifest.json".into()))?;
        let mut raw = String::new();
        file.read_to_string(&mut raw)?;
        serde_json::from_str(&raw)?
    };

    let edits: Vec<StoredEdit> = {
        let mut file = archive
            .by_name("data.json")
            .map_err(|_| ArchiveError::MissingEntry("data.json".into()))?;
        let mut raw = String::new();
        file.read_to_string(&mut raw)?;
        serde_json::from_str(&raw)?
    };

    let blob_names: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with("blobs/") && name.ends_with(".bin"))
        .map(|name| name.to_string())
        .collect();

    let mut blobs = Vec::with_capacity(blob_names.len());
    for name in blob_names {
        let id_part = name
            .trim_start_matches("blobs/")
            .trim_end_matches(".bin");
        let edit_id: Uuid = id_part
            .parse()
            .map_err(|_| ArchiveError::MissingEntry(format!("unparseable blob name {}", name)))?;
        let mut file = archive.by_name(&name)?;
        let mut bytes = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut bytes)?;
        blobs.push((edit_id, bytes));
    }

    Ok(ArchiveBundle {
        manifest,
        edits,
        blobs,
    })
}

/// Archive filename: `<timestamp>_<discriminator>.vctrl`. The
/// discriminator keeps two exports within the same millisecond from
/// colliding.
pub fn archive_file_name(exported_at: DateTime<Utc>, discriminator: u32) -> String {
    format!(
        "{}_{:08x}.{}",
        exported_at.format("%Y%m%d%H%M%S%3f"),
        discriminator,
        ARCHIVE_EXTENSION,
    )
}
