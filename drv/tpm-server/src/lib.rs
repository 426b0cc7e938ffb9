// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The TPM 2.0 Service (spec.md §3.2, §4.3): per-locality virtual CRB
//! state, the CRB state machine, and TPM opcode dispatch.

#![cfg_attr(not(test), no_std)]

use drv_tpm_api::{
    offset, CrbControlRequest, CrbControlStart, CrbControlStatus, LocalityControl, LocalityState,
    LocalityStatus, ManageLocalityOp, StartQualifier, TpmOpcode, TpmStatus, CRB_DATA_BUFFER_LEN,
    INTERFACE_ID_DEFAULT, NUM_LOCALITIES,
};
use drv_tpm_backend::{TpmBackend, TpmBus};
use partition_abi::DirectMessage;
use ringbuf::*;
use sp_runtime::Delay;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    Start {
        locality: u8,
        status: i32,
    },
    ManageLocality {
        locality: u8,
        status: i32,
    },
    Denied,
    None,
}

ringbuf!(Trace, 32, Trace::None);

/// Legacy TPM 1.2 response tag; a CRB/FFA-over-FIFO command that returns
/// this tag is rejected rather than forwarded (spec.md §4.3.5).
const TPM_ST_RSP_COMMAND: u16 = 0x00C4;

/// `CurrentState` (spec.md §3.2): IDLE → READY → COMPLETE → IDLE.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CurrentState {
    Idle,
    Ready,
    Complete,
}

/// Placeholder command/response address value written into a cleaned
/// virtual CRB (spec.md §3.2 invariant: "always point at the inline
/// buffer"); the virtual CRB is never really addressed over a bus, so this
/// is a sentinel rather than a real pointer.
const INLINE_BUFFER_ADDRESS: u64 = offset::CRB_DATA_BUFFER as u64;

/// The emulated per-locality register file (spec.md §3.2, §6.2).
#[derive(Clone)]
pub struct VirtualCrb {
    pub locality_state: LocalityState,
    pub locality_control: LocalityControl,
    pub locality_status: LocalityStatus,
    pub interface_id: u32,
    pub control_request: CrbControlRequest,
    pub control_status: CrbControlStatus,
    pub control_cancel: u32,
    pub control_start: CrbControlStart,
    pub command_size: u32,
    pub command_address: u64,
    pub response_size: u32,
    pub response_address: u64,
    pub data_buffer: [u8; CRB_DATA_BUFFER_LEN],
}

impl VirtualCrb {
    fn init(_locality: u8) -> Self {
        VirtualCrb {
            locality_state: LocalityState::TPM_ESTABLISHED,
            locality_control: LocalityControl::empty(),
            locality_status: LocalityStatus::empty(),
            interface_id: INTERFACE_ID_DEFAULT,
            control_request: CrbControlRequest::empty(),
            control_status: CrbControlStatus::TPM_IDLE,
            control_cancel: 0,
            control_start: CrbControlStart::empty(),
            command_size: CRB_DATA_BUFFER_LEN as u32,
            command_address: INLINE_BUFFER_ADDRESS,
            response_size: CRB_DATA_BUFFER_LEN as u32,
            response_address: INLINE_BUFFER_ADDRESS,
            data_buffer: [0; CRB_DATA_BUFFER_LEN],
        }
    }

    /// Rewrites the register file into the canonical "clean" layout after
    /// a START call (spec.md §4.3.1, §8 invariant 7).
    fn clean(&mut self, locality: u8, current_state: CurrentState) {
        self.locality_state = LocalityState::TPM_ESTABLISHED
            | LocalityState::active_locality_bit(locality)
            | LocalityState::TPM_REG_VALID_STATUS
            | LocalityState::LOCALITY_ASSIGNED;
        self.locality_control = LocalityControl::empty();
        self.locality_status |= LocalityStatus::GRANTED;
        self.interface_id = INTERFACE_ID_DEFAULT;
        self.control_request = CrbControlRequest::empty();
        self.control_cancel = 0;
        self.control_start = CrbControlStart::empty();
        self.control_status = if current_state == CurrentState::Idle {
            CrbControlStatus::TPM_IDLE
        } else {
            CrbControlStatus::empty()
        };
        self.command_size = CRB_DATA_BUFFER_LEN as u32;
        self.command_address = INLINE_BUFFER_ADDRESS;
        self.response_size = CRB_DATA_BUFFER_LEN as u32;
        self.response_address = INLINE_BUFFER_ADDRESS;
    }
}

fn arg0_of(status: TpmStatus) -> u64 {
    (u32::from(status) as i32) as i64 as u64
}

/// Owns all per-locality virtual CRB state and the process-wide
/// `CurrentState`/`ActiveLocality` (spec.md §3.2).
pub struct TpmService<B> {
    backend: TpmBackend<B>,
    crbs: [VirtualCrb; NUM_LOCALITIES as usize],
    locality_open: [bool; NUM_LOCALITIES as usize],
    current_state: CurrentState,
    active_locality: Option<u8>,
}

impl<B: TpmBus> TpmService<B> {
    pub fn new(backend: TpmBackend<B>) -> Self {
        TpmService {
            backend,
            crbs: core::array::from_fn(|i| VirtualCrb::init(i as u8)),
            locality_open: [false; NUM_LOCALITIES as usize],
            current_state: CurrentState::Idle,
            active_locality: None,
        }
    }

    pub fn current_state(&self) -> CurrentState {
        self.current_state
    }

    pub fn active_locality(&self) -> Option<u8> {
        self.active_locality
    }

    pub fn crb(&self, locality: u8) -> &VirtualCrb {
        &self.crbs[locality as usize]
    }

    pub fn crb_mut(&mut self, locality: u8) -> &mut VirtualCrb {
        &mut self.crbs[locality as usize]
    }

    /// Exercises the `MANAGE_LOCALITY` open/close gate directly; a full
    /// deployment only reaches this through [`Self::handle`], but tests and
    /// partition bring-up code may want to seed a locality open before any
    /// START call arrives.
    pub fn set_locality_open(&mut self, locality: u8, open: bool) {
        self.locality_open[locality as usize] = open;
    }

    pub fn locality_open(&self, locality: u8) -> bool {
        self.locality_open[locality as usize]
    }

    /// Dispatches one TPM-service request (spec.md §4.3).
    pub fn handle(&mut self, req: &DirectMessage, delay: &mut impl Delay) -> DirectMessage {
        let mut resp = DirectMessage::new(req.destination_id, req.source_id);
        match TpmOpcode::from_arg0(req.arg[0]) {
            Some(TpmOpcode::GetInterfaceVersion) => self.get_interface_version(&mut resp),
            Some(TpmOpcode::GetFeatureInfo) => self.get_feature_info(&mut resp),
            Some(TpmOpcode::Start) => self.start(req, &mut resp, delay),
            Some(TpmOpcode::RegisterForNotification)
            | Some(TpmOpcode::UnregisterFromNotification)
            | Some(TpmOpcode::FinishNotified) => {
                resp.arg[0] = arg0_of(TpmStatus::ErrorNotsup);
            }
            Some(TpmOpcode::ManageLocality) => self.manage_locality(req, &mut resp),
            None => {
                resp.arg[0] = arg0_of(TpmStatus::ErrorNofunc);
            }
        }
        resp
    }

    fn get_interface_version(&mut self, resp: &mut DirectMessage) {
        resp.arg[0] = arg0_of(TpmStatus::SuccessOkResultsReturned);
        resp.arg[1] = (1u64 << 16) | 0u64;
    }

    fn get_feature_info(&mut self, resp: &mut DirectMessage) {
        resp.arg[0] = arg0_of(TpmStatus::ErrorNotsup);
    }

    fn start(&mut self, req: &DirectMessage, resp: &mut DirectMessage, delay: &mut impl Delay) {
        let locality = req.arg[2] as u8;
        if locality >= NUM_LOCALITIES {
            resp.arg[0] = arg0_of(TpmStatus::ErrorInvarg);
            return;
        }

        let status = if !self.locality_open[locality as usize] {
            ringbuf_entry!(Trace::Denied);
            TpmStatus::ErrorDenied
        } else {
            match StartQualifier::from_arg1(req.arg[1]) {
                Some(StartQualifier::Command) => {
                    if self.active_locality != Some(locality) {
                        TpmStatus::ErrorInvarg
                    } else {
                        self.run_crb_state_machine(locality, delay)
                    }
                }
                Some(StartQualifier::Locality) => self.locality_transition(locality, delay),
                None => TpmStatus::ErrorInvarg,
            }
        };

        self.clean();
        ringbuf_entry!(Trace::Start {
            locality,
            status: status as i32
        });
        resp.arg[0] = arg0_of(status);
    }

    fn manage_locality(&mut self, req: &DirectMessage, resp: &mut DirectMessage) {
        let status = if req.source_id & 0xFF00 == 0 {
            TpmStatus::ErrorDenied
        } else {
            let locality = req.arg[2] as u8;
            if locality >= NUM_LOCALITIES {
                TpmStatus::ErrorInvarg
            } else {
                match ManageLocalityOp::from_arg1(req.arg[1]) {
                    Some(ManageLocalityOp::Open) => {
                        self.locality_open[locality as usize] = true;
                        TpmStatus::SuccessOk
                    }
                    Some(ManageLocalityOp::Close) => {
                        self.locality_open[locality as usize] = false;
                        TpmStatus::SuccessOk
                    }
                    None => TpmStatus::ErrorInvarg,
                }
            }
        };
        ringbuf_entry!(Trace::ManageLocality {
            locality: req.arg[2] as u8,
            status: status as i32
        });
        resp.arg[0] = arg0_of(status);
    }

    fn clean(&mut self) {
        let Some(active) = self.active_locality else {
            return;
        };
        let current_state = self.current_state;
        self.crbs[active as usize].clean(active, current_state);
    }

    /// CRB state machine (spec.md §4.3.3).
    fn run_crb_state_machine(&mut self, active: u8, delay: &mut impl Delay) -> TpmStatus {
        let crb_request = self.crbs[active as usize].control_request;
        let crb_start = self.crbs[active as usize].control_start;

        match self.current_state {
            CurrentState::Idle => {
                if crb_request.contains(CrbControlRequest::COMMAND_READY) {
                    match self.backend.cmd_ready(active, delay) {
                        Ok(()) => {
                            self.current_state = CurrentState::Ready;
                            TpmStatus::SuccessOk
                        }
                        Err(_) => TpmStatus::ErrorDenied,
                    }
                } else {
                    TpmStatus::ErrorDenied
                }
            }
            CurrentState::Ready => {
                if crb_request.contains(CrbControlRequest::GO_IDLE) {
                    match self.backend.go_idle(active, delay) {
                        Ok(()) => {
                            self.current_state = CurrentState::Idle;
                            TpmStatus::SuccessOk
                        }
                        Err(_) => TpmStatus::ErrorDenied,
                    }
                } else if crb_request.contains(CrbControlRequest::COMMAND_READY) {
                    match self.backend.cmd_ready(active, delay) {
                        Ok(()) => TpmStatus::SuccessOk,
                        Err(_) => TpmStatus::ErrorDenied,
                    }
                } else if crb_start.contains(CrbControlStart::START) {
                    match self.execute_command(active, delay) {
                        Ok(()) => {
                            self.current_state = CurrentState::Complete;
                            TpmStatus::SuccessOk
                        }
                        Err(status) => status,
                    }
                } else {
                    TpmStatus::ErrorDenied
                }
            }
            CurrentState::Complete => {
                let idle_bypass = self.backend.is_idle_bypass_supported();
                if crb_request.contains(CrbControlRequest::GO_IDLE) {
                    match self.backend.go_idle(active, delay) {
                        Ok(()) => {
                            self.current_state = CurrentState::Idle;
                            self.crbs[active as usize].data_buffer = [0; CRB_DATA_BUFFER_LEN];
                            TpmStatus::SuccessOk
                        }
                        Err(_) => TpmStatus::ErrorDenied,
                    }
                } else if crb_request.contains(CrbControlRequest::COMMAND_READY) && idle_bypass {
                    match self.backend.cmd_ready(active, delay) {
                        Ok(()) => {
                            self.current_state = CurrentState::Ready;
                            self.crbs[active as usize].data_buffer = [0; CRB_DATA_BUFFER_LEN];
                            TpmStatus::SuccessOk
                        }
                        Err(_) => TpmStatus::ErrorDenied,
                    }
                } else if crb_start.contains(CrbControlStart::START) && idle_bypass {
                    match self.execute_command(active, delay) {
                        Ok(()) => TpmStatus::SuccessOk,
                        Err(status) => status,
                    }
                } else {
                    TpmStatus::ErrorDenied
                }
            }
        }
    }

    /// Locality transition (spec.md §4.3.4).
    fn locality_transition(&mut self, locality: u8, delay: &mut impl Delay) -> TpmStatus {
        let control = self.crbs[locality as usize].locality_control;
        if control.contains(LocalityControl::RELINQUISH) {
            if self.active_locality != Some(locality) {
                return TpmStatus::ErrorDenied;
            }
            match self.backend.locality_relinquish(locality, delay) {
                Ok(()) => {
                    self.active_locality = None;
                    self.crbs[locality as usize] = VirtualCrb::init(locality);
                    TpmStatus::SuccessOk
                }
                Err(_) => TpmStatus::ErrorDenied,
            }
        } else if control.contains(LocalityControl::REQUEST_ACCESS) {
            if !(self.active_locality.is_none() || self.active_locality == Some(locality)) {
                return TpmStatus::ErrorDenied;
            }
            match self.backend.locality_request(locality, delay) {
                Ok(()) => {
                    self.active_locality = Some(locality);
                    self.crbs[locality as usize] = VirtualCrb::init(locality);
                    TpmStatus::SuccessOk
                }
                Err(_) => TpmStatus::ErrorDenied,
            }
        } else {
            TpmStatus::ErrorDenied
        }
    }

    /// Backend Start (spec.md §4.3.5).
    fn execute_command(&mut self, locality: u8, delay: &mut impl Delay) -> Result<(), TpmStatus> {
        let command_len = (self.crbs[locality as usize].command_size as usize).min(CRB_DATA_BUFFER_LEN);
        let response_cap = self.crbs[locality as usize].response_size as usize;

        let mut command = [0u8; CRB_DATA_BUFFER_LEN];
        command[..command_len].copy_from_slice(&self.crbs[locality as usize].data_buffer[..command_len]);

        self.backend
            .copy_command_data(locality, &command[..command_len], delay)
            .map_err(|_| TpmStatus::ErrorDenied)?;
        self.backend
            .start_command(locality, delay)
            .map_err(|_| TpmStatus::ErrorDenied)?;

        let mut header = [0u8; 10];
        self.backend
            .copy_response_data(locality, 0, &mut header, delay)
            .map_err(|_| TpmStatus::ErrorDenied)?;

        let tag = u16::from_be_bytes([header[0], header[1]]);
        if tag == TPM_ST_RSP_COMMAND {
            return Err(TpmStatus::ErrorNotsup);
        }
        let response_total_len =
            u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        if response_total_len > response_cap || response_total_len > CRB_DATA_BUFFER_LEN {
            return Err(TpmStatus::ErrorNomem);
        }

        let mut response = [0u8; CRB_DATA_BUFFER_LEN];
        response[..10].copy_from_slice(&header);
        if response_total_len > 10 {
            self.backend
                .copy_response_data(locality, 10, &mut response[10..response_total_len], delay)
                .map_err(|_| TpmStatus::ErrorDenied)?;
        }

        self.crbs[locality as usize].data_buffer[..response_total_len]
            .copy_from_slice(&response[..response_total_len]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_tpm_backend::BackendConfig;
    use std::collections::BTreeMap;

    struct NoDelay;
    impl Delay for NoDelay {
        fn delay_us(&mut self, _micros: u32) {}
    }

    struct FakeTpmBus {
        regs: BTreeMap<(u8, usize), u32>,
    }

    impl FakeTpmBus {
        fn new() -> Self {
            let mut regs = BTreeMap::new();
            regs.insert((0, offset::INTERFACE_ID), drv_tpm_api::INTERFACE_TYPE_CRB);
            FakeTpmBus { regs }
        }
    }

    impl TpmBus for FakeTpmBus {
        fn read32(&mut self, locality: u8, offset: usize) -> u32 {
            *self.regs.get(&(locality, offset)).unwrap_or(&0)
        }

        fn write32(&mut self, locality: u8, offset: usize, value: u32) {
            if offset == self::offset::CRB_CONTROL_REQUEST {
                self.regs.insert((locality, offset), 0);
                if value & CrbControlRequest::GO_IDLE.bits() != 0 {
                    self.regs.insert(
                        (locality, self::offset::CRB_CONTROL_STATUS),
                        CrbControlStatus::TPM_IDLE.bits(),
                    );
                } else if value & CrbControlRequest::COMMAND_READY.bits() != 0 {
                    self.regs
                        .insert((locality, self::offset::CRB_CONTROL_STATUS), 0);
                }
            } else if offset == self::offset::CRB_CONTROL_START {
                self.regs.insert((locality, offset), 0);
            } else if offset == self::offset::LOCALITY_CONTROL {
                self.regs.insert((locality, offset), 0);
                if value & LocalityControl::REQUEST_ACCESS.bits() != 0 {
                    self.regs.insert(
                        (locality, self::offset::LOCALITY_STATUS),
                        LocalityStatus::GRANTED.bits(),
                    );
                } else if value & LocalityControl::RELINQUISH.bits() != 0 {
                    self.regs
                        .insert((locality, self::offset::LOCALITY_STATUS), 0);
                }
            } else {
                self.regs.insert((locality, offset), value);
            }
        }

        fn read8(&mut self, locality: u8, offset: usize) -> u8 {
            self.read32(locality, offset) as u8
        }

        fn write8(&mut self, locality: u8, offset: usize, value: u8) {
            self.write32(locality, offset, value as u32)
        }
    }

    fn service() -> TpmService<FakeTpmBus> {
        let backend = TpmBackend::new(FakeTpmBus::new(), BackendConfig::default());
        TpmService::new(backend)
    }

    fn req(opcode: u64, arg1: u64, arg2: u64, source_id: u16) -> DirectMessage {
        let mut m = DirectMessage::new(source_id, 0);
        m.arg[0] = opcode;
        m.arg[1] = arg1;
        m.arg[2] = arg2;
        m
    }

    #[test]
    fn s5_version_query() {
        let mut svc = service();
        let mut delay = NoDelay;
        let resp = svc.handle(&req(TpmOpcode::GetInterfaceVersion as u64, 0, 0, 0), &mut delay);
        assert_eq!(resp.arg[0], arg0_of(TpmStatus::SuccessOkResultsReturned));
        assert_eq!(resp.arg[1], 0x0001_0000);
    }

    #[test]
    fn s7_denied_when_locality_closed() {
        let mut svc = service();
        let mut delay = NoDelay;
        let resp = svc.handle(
            &req(TpmOpcode::Start as u64, StartQualifier::Locality as u64, 0, 0),
            &mut delay,
        );
        assert_eq!(resp.arg[0], arg0_of(TpmStatus::ErrorDenied));
    }

    #[test]
    fn s6_locality_lifecycle() {
        let mut svc = service();
        let mut delay = NoDelay;
        svc.set_locality_open(0, true);

        // Locality transition: REQUEST_ACCESS.
        svc.crb_mut(0).locality_control = LocalityControl::REQUEST_ACCESS;
        let resp = svc.handle(
            &req(TpmOpcode::Start as u64, StartQualifier::Locality as u64, 0, 0),
            &mut delay,
        );
        assert_eq!(resp.arg[0], arg0_of(TpmStatus::SuccessOk));
        assert_eq!(svc.active_locality(), Some(0));

        // COMMAND_READY transition IDLE -> READY.
        svc.crb_mut(0).control_request = CrbControlRequest::COMMAND_READY;
        let resp = svc.handle(
            &req(TpmOpcode::Start as u64, StartQualifier::Command as u64, 0, 0),
            &mut delay,
        );
        assert_eq!(resp.arg[0], arg0_of(TpmStatus::SuccessOk));
        assert_eq!(svc.current_state(), CurrentState::Ready);

        // A minimal TPM2 response header the fake bus will hand back
        // unmodified: tag != TPM_ST_RSP_COMMAND, responseSize = 10.
        let mut header = [0u8; 10];
        header[0..2].copy_from_slice(&0x8001u16.to_be_bytes());
        header[2..6].copy_from_slice(&10u32.to_be_bytes());
        svc.crb_mut(0).data_buffer[..10].copy_from_slice(&header);
        svc.crb_mut(0).command_size = 10;

        svc.crb_mut(0).control_start = CrbControlStart::START;
        let resp = svc.handle(
            &req(TpmOpcode::Start as u64, StartQualifier::Command as u64, 0, 0),
            &mut delay,
        );
        assert_eq!(resp.arg[0], arg0_of(TpmStatus::SuccessOk));
        assert_eq!(svc.current_state(), CurrentState::Complete);
        assert_eq!(&svc.crb(0).data_buffer[..10], &header[..]);
    }

    #[test]
    fn execute_command_response_longer_than_header_is_read_in_order() {
        let mut svc = service();
        let mut delay = NoDelay;
        svc.set_locality_open(0, true);

        svc.crb_mut(0).locality_control = LocalityControl::REQUEST_ACCESS;
        svc.handle(
            &req(TpmOpcode::Start as u64, StartQualifier::Locality as u64, 0, 0),
            &mut delay,
        );

        svc.crb_mut(0).control_request = CrbControlRequest::COMMAND_READY;
        svc.handle(
            &req(TpmOpcode::Start as u64, StartQualifier::Command as u64, 0, 0),
            &mut delay,
        );

        // A 16-byte response: a 10-byte header plus 6 bytes of payload that
        // must come back unscrambled, not as a second copy of the header.
        let mut response = [0u8; 16];
        response[0..2].copy_from_slice(&0x8001u16.to_be_bytes());
        response[2..6].copy_from_slice(&16u32.to_be_bytes());
        response[10..16].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        svc.crb_mut(0).data_buffer[..16].copy_from_slice(&response);
        svc.crb_mut(0).command_size = 16;

        svc.crb_mut(0).control_start = CrbControlStart::START;
        let resp = svc.handle(
            &req(TpmOpcode::Start as u64, StartQualifier::Command as u64, 0, 0),
            &mut delay,
        );
        assert_eq!(resp.arg[0], arg0_of(TpmStatus::SuccessOk));
        assert_eq!(&svc.crb(0).data_buffer[..16], &response[..]);
    }

    #[test]
    fn manage_locality_requires_monitor_owned_source() {
        let mut svc = service();
        let resp = svc.handle(
            &req(TpmOpcode::ManageLocality as u64, ManageLocalityOp::Open as u64, 0, 0x0010),
            &mut NoDelay,
        );
        assert_eq!(resp.arg[0], arg0_of(TpmStatus::ErrorDenied));
        assert!(!svc.locality_open(0));

        let resp = svc.handle(
            &req(TpmOpcode::ManageLocality as u64, ManageLocalityOp::Open as u64, 0, 0x0200),
            &mut NoDelay,
        );
        assert_eq!(resp.arg[0], arg0_of(TpmStatus::SuccessOk));
        assert!(svc.locality_open(0));
    }

    #[test]
    fn invariant_7_start_leaves_canonical_registers() {
        let mut svc = service();
        svc.set_locality_open(0, true);
        svc.crb_mut(0).locality_control = LocalityControl::REQUEST_ACCESS;
        svc.handle(
            &req(TpmOpcode::Start as u64, StartQualifier::Locality as u64, 0, 0),
            &mut NoDelay,
        );
        let crb = svc.crb(0);
        assert_eq!(crb.control_start, CrbControlStart::empty());
        assert_eq!(crb.control_request, CrbControlRequest::empty());
        assert_eq!(crb.command_address, INLINE_BUFFER_ADDRESS);
        assert_eq!(crb.response_address, INLINE_BUFFER_ADDRESS);
    }

    #[test]
    fn unknown_opcode_is_nofunc() {
        let mut svc = service();
        let resp = svc.handle(&req(99, 0, 0, 0), &mut NoDelay);
        assert_eq!(resp.arg[0], arg0_of(TpmStatus::ErrorNofunc));
    }
}
