//! CRC32 matching the server's file checksum convention.
//!
//! PX4's FTP checksum runs the IEEE polynomial with a zero initial register
//! and no final inversion. Seeding `crc32fast` with `!0` starts the register
//! at zero, and complementing the output undoes its final inversion, so both
//! helpers reproduce the server's value.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Checksum of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(u32::MAX);
    hasher.update(data);
    !hasher.finalize()
}

/// Checksum of an entire file, read in chunks.
pub fn file_crc32(path: impl AsRef<Path>) -> io::Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new_with_initial(u32::MAX);
    let mut buffer = [0u8; 16 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(!hasher.finalize())
}
