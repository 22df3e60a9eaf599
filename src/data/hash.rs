use sha2::{Digest, Sha512};

/// Checksums are SHA-512 digests hex-encoded and truncated to 64 chars.
pub const CHECKSUM_LENGTH: usize = 64;

pub fn checksum(bytes: &[u8]) -> String {
    let digest = Sha512::digest(bytes);
    let mut encoded = hex::encode(digest);
    encoded.truncate(CHECKSUM_LENGTH);
    encoded
}

/// First two directory shards for a checksum-addressed path.
pub fn shard_pair(checksum: &str) -> (&str, &str) {
    (&checksum[0..2], &checksum[2..4])
}

/// Shards for a volume name: the volume directory tree is keyed by the
/// checksum of the name, not the name itself.
pub fn name_shard_pair(name: &str) -> (String, String) {
    let cs = checksum(name.as_bytes());
    (cs[0..2].to_string(), cs[2..4].to_string())
}
