// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File-metadata probe (spec §4.1, component C1).
//!
//! Classifies a file as a portable-executable image by content sniff, not
//! by extension — the same contract `tugger-windows-codesign`'s
//! `is_file_signable` follows for the same reason: extensions lie, and a
//! `.dll.deploy`-renamed-to-`.dll` file is exactly the case this crate
//! needs to get right.

use std::path::Path;

const DOS_MAGIC: [u8; 2] = [0x4d, 0x5a]; // "MZ"
const PE_SIGNATURE_OFFSET_POINTER: usize = 0x3c;
const PE_MAGIC: [u8; 4] = *b"PE\0\0";

/// Whether `path` is a portable-executable image, determined by reading
/// its leading bytes rather than trusting its extension.
///
/// Files that cannot be opened or read are treated as not-PE; this is
/// non-fatal per spec §4.1.
pub fn is_portable_executable(path: impl AsRef<Path>) -> bool {
    match std::fs::read(path.as_ref()) {
        Ok(data) => is_portable_executable_bytes(&data),
        Err(_) => false,
    }
}

/// Same classification as [is_portable_executable] but operating on an
/// in-memory buffer, for callers that already hold the bytes (e.g. after
/// extracting a container member).
pub fn is_portable_executable_bytes(data: &[u8]) -> bool {
    if data.len() < PE_SIGNATURE_OFFSET_POINTER + 4 {
        return false;
    }

    if data[0..2] != DOS_MAGIC {
        return false;
    }

    let pe_offset = u32::from_le_bytes([
        data[PE_SIGNATURE_OFFSET_POINTER],
        data[PE_SIGNATURE_OFFSET_POINTER + 1],
        data[PE_SIGNATURE_OFFSET_POINTER + 2],
        data[PE_SIGNATURE_OFFSET_POINTER + 3],
    ]) as usize;

    match data.get(pe_offset..pe_offset + 4) {
        Some(sig) => sig == PE_MAGIC,
        None => false,
    }
}
