// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Canonical handling of NAA device identifiers.
//!
//! Arrays, hypervisor hosts and the catalog all report the SCSI identity of
//! a LUN, but they disagree on casing and prefixes. Everything in this crate
//! and its consumers compares identifiers only after passing them through
//! [`normalize_naa`], which yields `naa.<lowercase hex>`.
//!
//! One array family reports the designator with the SCSI "NAA type" nibble
//! still attached, producing a 33-digit value starting with `3` (for example
//! `3624a9370...`). That leading `3` is not part of the identifier the host
//! uses for the device and must be dropped, otherwise device lookups on the
//! host silently miss.

use crate::error::{Result, StorageError};

/// OUI-derived prefix of Pure Storage FlashArray NAA identifiers.
pub const PURE_NAA_PREFIX: &str = "624a9370";

/// OUI-derived prefix of NetApp ONTAP NAA identifiers.
pub const NETAPP_NAA_PREFIX: &str = "600a0980";

const NAA_SCHEME: &str = "naa.";

/// Length in hex digits of an NAA registered-extended (type 6) identifier.
const NAA6_DIGITS: usize = 32;
/// Length in hex digits of an NAA registered (type 5) identifier.
const NAA5_DIGITS: usize = 16;

/// Converts any vendor- or host-reported form of an NAA identifier into the
/// canonical `naa.<lowercase hex>` form.
pub fn normalize_naa(raw: &str) -> Result<String> {
    let lowered = raw.trim().to_ascii_lowercase();
    let digits = lowered.strip_prefix(NAA_SCHEME).unwrap_or(&lowered);

    let digits = match digits.strip_prefix('3') {
        Some(rest) if digits.len() == NAA6_DIGITS + 1 => rest,
        _ => digits,
    };

    if digits.is_empty() {
        return Err(StorageError::InvalidNaa {
            naa: raw.to_string(),
            reason: "empty identifier",
        });
    }
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StorageError::InvalidNaa {
            naa: raw.to_string(),
            reason: "non-hex characters",
        });
    }
    if digits.len() != NAA6_DIGITS && digits.len() != NAA5_DIGITS {
        return Err(StorageError::InvalidNaa {
            naa: raw.to_string(),
            reason: "unexpected identifier length",
        });
    }

    Ok(format!("{NAA_SCHEME}{digits}"))
}

/// Builds the canonical NAA for a volume from its vendor prefix and serial.
pub fn build_naa(prefix: &str, serial: &str) -> Result<String> {
    normalize_naa(&format!("{}{}", prefix, serial.trim()))
}

/// Extracts the vendor serial from an NAA identifier, checking that it
/// carries the expected vendor prefix.
pub fn extract_serial(naa: &str, prefix: &str) -> Result<String> {
    let canonical = normalize_naa(naa)?;
    let digits = &canonical[NAA_SCHEME.len()..];
    let prefix = prefix.to_ascii_lowercase();
    match digits.strip_prefix(prefix.as_str()) {
        Some(serial) if !serial.is_empty() => Ok(serial.to_string()),
        _ => Err(StorageError::InvalidNaa {
            naa: naa.to_string(),
            reason: "vendor prefix mismatch",
        }),
    }
}

/// Compares two identifiers after normalization. Unparseable inputs never
/// match.
pub fn naa_eq(a: &str, b: &str) -> bool {
    match (normalize_naa(a), normalize_naa(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
