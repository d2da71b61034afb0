//! CRC-32 integrity code carried in the trailing `CRC:` field of every frame.
//!
//! The radio firmware computes the code MSB-first with polynomial 0x04C11DB7,
//! initial value 0xFFFFFFFF, no reflection and a final one's complement. That
//! is the catalogued CRC-32/BZIP2 algorithm, so we lean on the `crc` crate
//! rather than a bit loop.

use crc::{Crc, CRC_32_BZIP2};

const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_BZIP2);

/// Delimiter that separates the checked body from the hex checksum.
pub const CRC_DELIMITER: &str = ",CRC:";

/// Number of hex characters in the checksum field.
pub const CRC_HEX_LEN: usize = 8;

/// Compute the frame checksum over `data`.
pub fn compute(data: &[u8]) -> u32 {
    FRAME_CRC.checksum(data)
}

/// Render a checksum the way it appears on the wire (8 uppercase hex digits).
pub fn to_hex(crc: u32) -> String {
    format!("{:08X}", crc)
}

/// Split a line into `(body, crc_field)` at the last checksum delimiter.
pub fn split(line: &str) -> Option<(&str, &str)> {
    let pos = line.rfind(CRC_DELIMITER)?;
    Some((&line[..pos], &line[pos + CRC_DELIMITER.len()..]))
}

/// Verify a line that carries a trailing `,CRC:<hex8>` field.
///
/// Only the first 8 characters after the delimiter are compared, and the
/// comparison is case-sensitive against uppercase hex. A missing delimiter or a
/// short checksum fails closed.
pub fn verify(line: &str) -> bool {
    let Some((body, received)) = split(line) else {
        return false;
    };
    let Some(received) = received.get(..CRC_HEX_LEN) else {
        return false;
    };
    to_hex(compute(body.as_bytes())) == received
}
