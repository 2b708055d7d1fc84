//! CRC-32/IEEE-802.3 over frame header and payload.
//!
//! Parameters are fixed by the protocol: reflected polynomial
//! 0xEDB88320, initial value 0xFFFFFFFF, final xor 0xFFFFFFFF. The
//! `crc` crate's `CRC_32_ISO_HDLC` algorithm is exactly this CRC; both
//! peers must produce bit-identical trailers.

use crc::{CRC_32_ISO_HDLC, Crc};

/// The link CRC instance.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 of a contiguous byte slice.
#[must_use]
pub fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// CRC-32 over a sequence of slices, as if concatenated.
///
/// Used to checksum `header || payload` without assembling them first.
#[must_use]
pub fn checksum_parts(parts: &[&[u8]]) -> u32 {
    let mut digest = CRC32.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize()
}
