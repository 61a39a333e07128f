//! Flat-extent VMDK descriptors and layer manifests for external
//! integrators.
//!
//! After a tip's fsmeta is built, the engine writes `merged.vmdk` next to it
//! describing the whole stack as flat extents, and `layers.manifest` with
//! one digest per line. Both files list entries top-down: the VMDK starts
//! with `fsmeta.erofs`, then layers newest-first — the reverse of OCI
//! manifest order.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use erofs_common::constants::{LAYERS_MANIFEST_NAME, MERGED_VMDK_NAME};

use crate::error::Result;
use crate::layer_order::LayerSequence;

const SECTOR_SIZE: u64 = 512;

/// One extent parsed out of a VMDK descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmdkLayer {
    /// Path as recorded in the descriptor.
    pub path: String,
    /// Extent size in 512-byte sectors.
    pub sectors: u64,
    /// Digest recovered from a `sha256-<hex>.erofs` file name, if any.
    pub digest: Option<String>,
}

fn sectors_of(path: &Path) -> Result<u64> {
    let len = std::fs::metadata(path)?.len();
    Ok(len.div_ceil(SECTOR_SIZE))
}

/// Writes `merged.vmdk` into `tip_dir`.
///
/// `layer_blobs` are the chain's blob paths in either direction; extents are
/// emitted with fsmeta first and layers newest-first. Blob paths inside the
/// tip directory are recorded relative, everything else absolute.
pub fn write_vmdk(tip_dir: &Path, fsmeta: &Path, layer_blobs: &LayerSequence) -> Result<PathBuf> {
    let descriptor = tip_dir.join(MERGED_VMDK_NAME);
    let mut out = std::fs::File::create(&descriptor)?;

    writeln!(out, "# Disk DescriptorFile")?;
    writeln!(out, "version=1")?;
    writeln!(out, "CID=fffffffe")?;
    writeln!(out, "parentCID=ffffffff")?;
    writeln!(out, "createType=\"monolithicFlat\"")?;
    writeln!(out)?;
    writeln!(out, "# Extent description")?;

    let mut write_extent = |path: &Path| -> Result<()> {
        let sectors = sectors_of(path)?;
        let shown = path
            .strip_prefix(tip_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf());
        writeln!(out, "RW {sectors} FLAT \"{}\" 0", shown.display())?;
        Ok(())
    };

    write_extent(fsmeta)?;
    for blob in layer_blobs.to_newest_first().ids() {
        write_extent(Path::new(blob))?;
    }

    out.sync_all()?;
    Ok(descriptor)
}

/// Writes `layers.manifest` into `tip_dir`: one digest per line,
/// newest-first. This is the authoritative record for checking VMDK layer
/// order.
pub fn write_layers_manifest(tip_dir: &Path, digests_newest_first: &[String]) -> Result<PathBuf> {
    let manifest = tip_dir.join(LAYERS_MANIFEST_NAME);
    let mut out = std::fs::File::create(&manifest)?;
    for digest in digests_newest_first {
        writeln!(out, "{digest}")?;
    }
    out.sync_all()?;
    Ok(manifest)
}

/// Parses the flat extents of a VMDK descriptor, in file order (fsmeta
/// first, then newest-first layers). Non-extent lines are skipped.
pub fn parse_vmdk(path: &Path) -> Result<Vec<VmdkLayer>> {
    let file = std::fs::File::open(path)?;
    let mut layers = Vec::new();

    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        if let Some(layer) = parse_extent_line(line.trim()) {
            layers.push(layer);
        }
    }
    Ok(layers)
}

// Extent lines look like: RW <sectors> FLAT "<path>" <offset>
fn parse_extent_line(line: &str) -> Option<VmdkLayer> {
    let rest = line.strip_prefix("RW ")?;
    let (sectors_str, rest) = rest.trim_start().split_once(char::is_whitespace)?;
    let sectors = sectors_str.parse().ok()?;
    let rest = rest.trim_start().strip_prefix("FLAT")?.trim_start();
    let rest = rest.strip_prefix('"')?;
    let (path, _) = rest.split_once('"')?;
    Some(VmdkLayer {
        path: path.to_string(),
        sectors,
        digest: digest_from_blob_path(path),
    })
}

/// Recovers `sha256:<hex>` from a `sha256-<hex>.erofs` file name, the
/// naming the blob resolver understands. fsmeta and canonically named blobs
/// yield `None`.
pub fn digest_from_blob_path(path: &str) -> Option<String> {
    let name = Path::new(path).file_name()?.to_str()?;
    let hex = name.strip_prefix("sha256-")?.strip_suffix(".erofs")?;
    if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(format!("sha256:{hex}"))
    } else {
        None
    }
}

/// Reverses a digest list, converting between VMDK order (newest layer
/// first) and OCI manifest order (base layer first).
pub fn reverse_digests(digests: &[String]) -> Vec<String> {
    digests.iter().rev().cloned().collect()
}

/// Reads a `layers.manifest`, returning digests newest-first. Blank and
/// malformed lines are skipped.
pub fn parse_layers_manifest(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)?;
    let mut digests = Vec::new();
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.starts_with("sha256:") {
            digests.push(line.to_string());
        }
    }
    Ok(digests)
}
