use anyhow::{anyhow, Context, Result};
use log::debug;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::Command;

use crate::constants::{EROFS_BLKSZBITS_OFFSET, EROFS_MAGIC, EROFS_SUPER_OFFSET};

/// Reads the superblock magic of `path` and fails unless it is a valid EROFS
/// image. Used to re-verify every artifact produced by an external
/// `mkfs.erofs` invocation before it is trusted.
pub fn verify_erofs_magic(path: &Path) -> Result<()> {
    let magic = read_le_u32(path, EROFS_SUPER_OFFSET)
        .with_context(|| format!("read superblock of {}", path.display()))?;
    if magic != EROFS_MAGIC {
        return Err(anyhow!(
            "{}: invalid EROFS magic {magic:#010x} (expected {EROFS_MAGIC:#010x})",
            path.display()
        ));
    }
    Ok(())
}

/// Reads the block size recorded in the EROFS superblock of `path`.
///
/// The superblock stores the size as a shift (`blkszbits`); a 4096-byte
/// image reports 12. The magic is checked first so a garbage file cannot
/// yield a plausible-looking size.
pub fn read_erofs_block_size(path: &Path) -> Result<u32> {
    verify_erofs_magic(path)?;
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(EROFS_SUPER_OFFSET + EROFS_BLKSZBITS_OFFSET))?;
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte)?;
    let bits = u32::from(byte[0]);
    if !(9..=16).contains(&bits) {
        return Err(anyhow!(
            "{}: implausible blkszbits {bits} in superblock",
            path.display()
        ));
    }
    Ok(1 << bits)
}

fn read_le_u32(path: &Path, offset: u64) -> Result<u32> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Truncates command output to `max_len` bytes for inclusion in error
/// messages, so verbose tool output cannot overwhelm the logs.
pub fn truncate_output(out: &[u8], max_len: usize) -> String {
    if out.len() <= max_len {
        return String::from_utf8_lossy(out).into_owned();
    }
    format!("{}... (truncated)", String::from_utf8_lossy(&out[..max_len]))
}

/// Returns true if an `mkfs.erofs` supporting tar conversion (`--tar`) is
/// available on this host. The result only reflects the binary's help
/// output; callers still re-verify every produced image.
pub fn mkfs_erofs_supports_tar() -> Result<bool> {
    let output = Command::new("mkfs.erofs")
        .arg("--help")
        .output()
        .context("failed to execute mkfs.erofs")?;
    // mkfs.erofs prints usage on stderr for both --help and bad flags.
    let text = [&output.stdout[..], &output.stderr[..]].concat();
    let supported = String::from_utf8_lossy(&text).contains("--tar");
    debug!("mkfs.erofs tar support: {supported}");
    Ok(supported)
}
