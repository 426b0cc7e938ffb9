// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire ABI shared between the Service Dispatcher and both services.
//!
//! This mirrors the kernel/application `abi` split in the teacher: this
//! crate holds only the types that cross the partition-messaging boundary,
//! never the transport itself (the transport is an external collaborator,
//! see `spec.md` §1).

#![no_std]

use serde::{Deserialize, Serialize};
use unwrap_lite::UnwrapLite;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of register-sized argument slots in a direct request/response.
pub const ARG_COUNT: usize = 14;

/// A direct request or response record, as delivered by the Transport
/// Adapter (component A). Only the fields the in-scope services interpret
/// are named; everything else travels as opaque `Arg` words.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct DirectMessage {
    pub source_id: u16,
    pub destination_id: u16,
    pub arg: [u64; ARG_COUNT],
}

impl DirectMessage {
    pub const fn new(source_id: u16, destination_id: u16) -> Self {
        Self {
            source_id,
            destination_id,
            arg: [0; ARG_COUNT],
        }
    }

    /// A caller's partition id is monitor-owned iff its upper byte is
    /// nonzero (§4.3.2).
    pub fn source_is_monitor_owned(&self) -> bool {
        (self.source_id & 0xFF00) != 0
    }
}

/// A 16-byte service or test identifier, compared byte-for-byte (§4.2
/// "UUID extraction").
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct Uuid(pub [u8; 16]);

impl Uuid {
    /// Extracts a UUID from a request's hi/lo register pair exactly as
    /// §4.2 specifies: bytes hi[7..0] then lo[7..0], most-significant byte
    /// first.
    pub fn from_hi_lo(hi: u64, lo: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&hi.to_be_bytes());
        bytes[8..16].copy_from_slice(&lo.to_be_bytes());
        Uuid(bytes)
    }

    pub fn to_hi_lo(self) -> (u64, u64) {
        let hi = u64::from_be_bytes(self.0[0..8].try_into().unwrap_lite());
        let lo = u64::from_be_bytes(self.0[8..16].try_into().unwrap_lite());
        (hi, lo)
    }

    const fn from_hi_lo_const(hi: u64, lo: u64) -> Uuid {
        let hi = hi.to_be_bytes();
        let lo = lo.to_be_bytes();
        let mut bytes = [0u8; 16];
        let mut i = 0;
        while i < 8 {
            bytes[i] = hi[i];
            bytes[8 + i] = lo[i];
            i += 1;
        }
        Uuid(bytes)
    }
}

/// Notification Service receiver UUID fixed constants used on the test path
/// (§6.3).
pub mod test_uuids {
    use super::Uuid;

    pub const BATTERY: Uuid =
        Uuid::from_hi_lo_const(0xBA7A_FF2E_B1EA_C765, 0xB710_B3A3_59F6_4054);
    pub const THERMAL: Uuid =
        Uuid::from_hi_lo_const(0xBA7A_FF2E_B1EA_C765, 0xB610_B3A3_59F6_4054);
}

/// The three service UUIDs the Service Dispatcher (§4.1) demultiplexes on.
/// Platform-fixed; the actual 16 bytes are supplied by the firmware build
/// that wires this partition to its FF-A partition id (left as a build-time
/// constant rather than hard-coded here, since the spec only requires
/// byte-identity comparison against whatever value the platform assigns).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ServiceUuids {
    pub notification: Uuid,
    pub tpm: Uuid,
    pub test: Uuid,
}

/// Serializable form of a [`DirectMessage`], used only by test harnesses
/// that want to snapshot request/response traffic; the real transport is
/// out of scope (§1).
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct DirectMessageWire {
    pub source_id: u16,
    pub destination_id: u16,
    pub arg: [u64; ARG_COUNT],
}

impl From<DirectMessage> for DirectMessageWire {
    fn from(m: DirectMessage) -> Self {
        DirectMessageWire {
            source_id: m.source_id,
            destination_id: m.destination_id,
            arg: m.arg,
        }
    }
}
