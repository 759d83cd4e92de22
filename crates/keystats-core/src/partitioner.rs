//! Keystem to partition mapping.
//!
//! Producers must send every record for a keystem to the same partition, otherwise
//! two partition tasks could hydrate and flush the same aggregate independently.
//! The mapping is 32-bit FNV-1a of the keystem bytes modulo the partition count.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Partition owning `keystem` on a topic with `partitions` partitions.
///
/// Returns 0 when the topic has no partitions.
pub fn partition_for_keystem(keystem: &str, partitions: u32) -> i32 {
    if partitions == 0 {
        return 0;
    }
    (fnv1a_32(keystem.as_bytes()) % partitions) as i32
}
