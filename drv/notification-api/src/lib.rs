// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API crate for the Notification Service (spec.md §3.1, §4.2, §6.1).

#![no_std]

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use partition_abi::Uuid;
use status_err::StatusCode;
use unwrap_lite::UnwrapLite;

/// Status codes returned in the low byte of `Resp.Arg6` (spec.md §6.4).
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, StatusCode)]
#[repr(i8)]
pub enum NotificationStatus {
    Success = 0,
    NotSupported = -1,
    InvalidParameter = -2,
    NoMem = -3,
}

/// Message ids, packed into `Req.Arg5 & 0x03` (spec.md §4.2, §6.1).
///
/// Only two bits are ever inspected, so `Add`/`Remove` and the two
/// memory-mapping opcodes collapse onto the same four values; all four are
/// modeled here for completeness, but `MemAssign`/`MemUnassign` (whose
/// id would require a wider field) can never actually arrive through the
/// 2-bit encoding and exist only so match arms stay exhaustive and
/// self-documenting.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum NotificationOpcode {
    Add = 0,
    Remove = 1,
    Register = 2,
    Unregister = 3,
}

impl NotificationOpcode {
    pub fn from_arg5(arg5: u64) -> Self {
        // Masked to 2 bits by construction, so `from_u8` cannot fail.
        Self::from_u8((arg5 & 0x03) as u8).unwrap_lite()
    }
}

/// Maximum number of `(cookie, id)` entries in a single REGISTER/UNREGISTER
/// batch (spec.md §4.2 validation order, step 1).
pub const MAX_BATCH: u8 = 7;

/// Number of mapping slots per service entry, and the width of the global
/// bitmask (spec.md §3.1).
pub const MAX_MAPPINGS: usize = 64;

/// Number of service entries the registry can hold (spec.md §3.1).
pub const MAX_SERVICES: usize = 16;

/// A single `(cookie, id)` pairing as it travels packed into a 64-bit word
/// (spec.md §3.1 "Mapping packed wire form").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PackedMapping {
    pub per_vcpu: bool,
    pub id: u16,
    pub cookie: u32,
}

/// Error produced when an id does not fit the 9-bit field, or otherwise
/// falls outside the `0..64` range this service actually allocates.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutOfRange;

impl PackedMapping {
    /// Decodes one packed mapping word: bit 0 = per_vcpu, bits 23..31 = id
    /// (9 bits), bits 32..63 = cookie (spec.md §3.1).
    ///
    /// The 9-bit id field can represent values up to 511; ids beyond 63 are
    /// out of band for this registry's 64-bit bitmask and are rejected here
    /// rather than silently truncated.
    pub fn decode(word: u64) -> Result<Self, OutOfRange> {
        let per_vcpu = (word & 1) != 0;
        let id = ((word >> 23) & 0x1FF) as u16;
        let cookie = (word >> 32) as u32;
        if id as usize >= MAX_MAPPINGS {
            return Err(OutOfRange);
        }
        Ok(PackedMapping {
            per_vcpu,
            id,
            cookie,
        })
    }

    pub fn encode(self) -> u64 {
        let mut word = 0u64;
        if self.per_vcpu {
            word |= 1;
        }
        word |= (self.id as u64 & 0x1FF) << 23;
        word |= (self.cookie as u64) << 32;
        word
    }
}

/// Delayed-SRI notification flag used by the TEST_NOTIFICATION bridge
/// (spec.md §4.5).
pub const DELAYED_SRI_FLAG: u32 = 1 << 1;

/// Response direction bit, OR'd into `Resp.Arg5` (spec.md §4.1, §6.1).
pub const RESPONSE_DIRECTION_BIT: u64 = 1 << 8;

/// Extracts a target service UUID from a request's `Arg3`/`Arg4` halves
/// exactly as spec.md §4.2 describes.
pub fn extract_uuid(arg3_hi: u64, arg4_lo: u64) -> Uuid {
    Uuid::from_hi_lo(arg3_hi, arg4_lo)
}
