// Constants describing the on-disk EROFS format as consumed by the kernel
// driver and produced by mkfs.erofs.

/// Offset of the EROFS superblock from the start of the image.
pub const EROFS_SUPER_OFFSET: u64 = 1024;

/// EROFS superblock magic, little-endian at [`EROFS_SUPER_OFFSET`].
pub const EROFS_MAGIC: u32 = 0xE2E1_F5E0;

/// Offset of the `blkszbits` byte relative to the superblock start.
pub const EROFS_BLKSZBITS_OFFSET: u64 = 12;

/// Block size alignment for erofs images (512 bytes).
pub const EROFS_BLOCK_ALIGNMENT: u64 = 512;

/// Canonical file name of a committed layer blob inside a snapshot directory.
pub const LAYER_BLOB_NAME: &str = "layer.erofs";

/// File name of the multi-device descriptor inside a tip snapshot directory.
pub const FSMETA_NAME: &str = "fsmeta.erofs";

/// File name of the writable ext4 image inside an active snapshot directory.
pub const RWLAYER_IMAGE_NAME: &str = "rwlayer.img";

/// File name of the optional per-tip digest manifest (newest-first).
pub const LAYERS_MANIFEST_NAME: &str = "layers.manifest";

/// File name of the optional VMDK descriptor used by external integrators.
pub const MERGED_VMDK_NAME: &str = "merged.vmdk";

/// Label marking an active snapshot as the target of a tar-stream extraction.
pub const EXTRACT_SNAPSHOT_LABEL: &str = "containerd.io/snapshot/erofs.extract";
