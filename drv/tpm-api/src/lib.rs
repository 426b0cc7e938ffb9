// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire encoding and register layout for the TPM 2.0 Service (spec.md §3.2,
//! §4.3, §6.2, §6.4).

#![no_std]

use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use status_err::StatusCode;

/// Number of TPM localities this service multiplexes (spec.md §3.2).
pub const NUM_LOCALITIES: u8 = 5;

/// Status codes returned in `Resp.Arg0` (spec.md §6.4).
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, StatusCode)]
#[repr(i32)]
pub enum TpmStatus {
    SuccessOk = 0,
    SuccessOkResultsReturned = 1,
    ErrorNofunc = -1,
    ErrorNotsup = -2,
    ErrorInvarg = -3,
    ErrorNomem = -4,
    ErrorDenied = -5,
}

impl TpmStatus {
    pub fn is_success(self) -> bool {
        matches!(self, TpmStatus::SuccessOk | TpmStatus::SuccessOkResultsReturned)
    }
}

/// Top-level TPM service opcodes, carried in `Req.Arg0` (spec.md §4.3).
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u64)]
pub enum TpmOpcode {
    GetInterfaceVersion = 0,
    GetFeatureInfo = 1,
    Start = 2,
    RegisterForNotification = 3,
    UnregisterFromNotification = 4,
    FinishNotified = 5,
    ManageLocality = 6,
}

impl TpmOpcode {
    pub fn from_arg0(arg0: u64) -> Option<Self> {
        Self::from_u64(arg0)
    }
}

/// START function qualifier, carried in `Req.Arg1` (spec.md §4.3.1).
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u64)]
pub enum StartQualifier {
    Command = 0,
    Locality = 1,
}

impl StartQualifier {
    pub fn from_arg1(arg1: u64) -> Option<Self> {
        Self::from_u64(arg1)
    }
}

/// MANAGE_LOCALITY operation, carried in `Req.Arg1` (spec.md §4.3.2).
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u64)]
pub enum ManageLocalityOp {
    Open = 0,
    Close = 1,
}

impl ManageLocalityOp {
    pub fn from_arg1(arg1: u64) -> Option<Self> {
        Self::from_u64(arg1)
    }
}

/// The single test-service opcode (spec.md §4.5).
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u64)]
pub enum TestOpcode {
    TestNotification = 0,
}

impl TestOpcode {
    pub fn from_arg0(arg0: u64) -> Option<Self> {
        Self::from_u64(arg0)
    }
}

/// Result of the TEST_NOTIFICATION bridge, carried in `Resp.Arg0` (spec.md
/// §4.5).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum TestStatus {
    Success = 0,
    InvalidParameter = 1,
}

bitflags! {
    /// `LocalityControl` register, +0x08 (spec.md §6.2).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct LocalityControl: u32 {
        const REQUEST_ACCESS = 1 << 0;
        const RELINQUISH     = 1 << 1;
    }

    /// `LocalityStatus` register, +0x0C (spec.md §6.2).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct LocalityStatus: u32 {
        const GRANTED = 1 << 1;
    }

    /// `LocalityState` register, +0x00. Only `GRANTED`-adjacent bits matter
    /// to the state machine; the rest are modeled because the original
    /// keeps them in the same register and callers may read it back
    /// (original naming: `PTP_CRB_LOCALITY_STATE_*`).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct LocalityState: u32 {
        const TPM_ESTABLISHED    = 1 << 0;
        const LOCALITY_ASSIGNED  = 1 << 1;
        const ACTIVE_LOCALITY_0  = 1 << 2;
        const ACTIVE_LOCALITY_1  = 1 << 3;
        const ACTIVE_LOCALITY_2  = 1 << 4;
        const ACTIVE_LOCALITY_3  = 1 << 5;
        const ACTIVE_LOCALITY_4  = 1 << 6;
        const TPM_REG_VALID_STATUS = 1 << 7;
    }

    /// `CrbControlRequest` register, +0x40 (spec.md §6.2).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct CrbControlRequest: u32 {
        const COMMAND_READY = 1 << 0;
        const GO_IDLE        = 1 << 1;
    }

    /// `CrbControlStatus` register, +0x44 (spec.md §6.2).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct CrbControlStatus: u32 {
        const TPM_IDLE = 1 << 0;
    }

    /// `CrbControlStart` register, +0x4C (spec.md §6.2).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct CrbControlStart: u32 {
        const START = 1 << 0;
    }
}

impl LocalityState {
    /// The `ACTIVE_LOCALITY_n` flag for a given locality index (0..4).
    pub fn active_locality_bit(locality: u8) -> LocalityState {
        match locality {
            0 => LocalityState::ACTIVE_LOCALITY_0,
            1 => LocalityState::ACTIVE_LOCALITY_1,
            2 => LocalityState::ACTIVE_LOCALITY_2,
            3 => LocalityState::ACTIVE_LOCALITY_3,
            4 => LocalityState::ACTIVE_LOCALITY_4,
            _ => LocalityState::empty(),
        }
    }
}

/// Byte offsets within one 0x1000-byte locality register block (spec.md
/// §6.2). Offsets past `CrbControlStart` follow the PC-Client PTP register
/// map; the spec only fixes the ones it names explicitly.
pub mod offset {
    pub const LOCALITY_STATE: usize = 0x00;
    pub const LOCALITY_CONTROL: usize = 0x08;
    pub const LOCALITY_STATUS: usize = 0x0C;
    pub const INTERFACE_ID: usize = 0x30;
    pub const CRB_CONTROL_REQUEST: usize = 0x40;
    pub const CRB_CONTROL_STATUS: usize = 0x44;
    pub const CRB_CONTROL_CANCEL: usize = 0x48;
    pub const CRB_CONTROL_START: usize = 0x4C;
    pub const CRB_CONTROL_COMMAND_SIZE: usize = 0x50;
    pub const CRB_CONTROL_COMMAND_ADDRESS_LOW: usize = 0x54;
    pub const CRB_CONTROL_COMMAND_ADDRESS_HIGH: usize = 0x58;
    pub const CRB_CONTROL_RESPONSE_SIZE: usize = 0x5C;
    pub const CRB_CONTROL_RESPONSE_ADDRESS: usize = 0x60;
    pub const CRB_DATA_BUFFER: usize = 0x80;
}

/// Stride between successive locality register blocks (spec.md §4.4).
pub const LOCALITY_REGION_SIZE: usize = 0x1000;

/// Size in bytes of the inline data buffer each virtual CRB exposes at
/// [`offset::CRB_DATA_BUFFER`].
pub const CRB_DATA_BUFFER_LEN: usize = LOCALITY_REGION_SIZE - offset::CRB_DATA_BUFFER;

/// Mask isolating the interface-type nibble of `InterfaceId` (spec.md
/// §4.4): `1` means CRB is the active interface.
pub const INTERFACE_TYPE_MASK: u32 = 0xF;
pub const INTERFACE_TYPE_CRB: u32 = 1;

/// Mask isolating the idle-bypass capability bit of `InterfaceId` (spec.md
/// §4.4).
pub const IDLE_BYPASS_MASK: u32 = 0x200;

/// Default value written into a freshly-initialized virtual CRB's
/// `InterfaceId` register: interface type CRB (bits 3:0 = 1), interface
/// version 1 (bits 7:4), locality and CRB capability bits set (spec.md
/// §6.2 "0x4011-class value"; exact non-type-mask bit assignment is this
/// crate's choice, see DESIGN.md).
pub const INTERFACE_ID_DEFAULT: u32 = 0x0000_4011;
