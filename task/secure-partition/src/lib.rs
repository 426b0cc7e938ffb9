// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Service Dispatcher (spec.md §4.1) and the TEST_NOTIFICATION bridge
//! (spec.md §4.5).
//!
//! This crate owns both in-scope services for the lifetime of the
//! partition (spec.md §5, §9) and demultiplexes each incoming direct
//! request by target-service UUID. The transport that actually delivers
//! requests and carries responses back to a caller is an external
//! collaborator (spec.md §1) and is modeled here only as the
//! [`PartitionTransport`] trait, the same way `drv-tpm-backend::TpmBus`
//! and `drv-notification-server::NotificationTransport` stop at a trait
//! boundary rather than a concrete board implementation.

#![cfg_attr(not(test), no_std)]

use counters::Count;
use drv_notification_api::{
    extract_uuid, NotificationOpcode, NotificationStatus, PackedMapping, DELAYED_SRI_FLAG,
    MAX_BATCH, RESPONSE_DIRECTION_BIT,
};
use drv_notification_server::{
    NotificationService, NotificationTransport, RegisterEntry, UnregisterEntry,
};
use drv_tpm_api::{TestOpcode, TestStatus, TpmStatus};
use drv_tpm_backend::{TpmBackend, TpmBus};
use drv_tpm_server::TpmService;
use partition_abi::{DirectMessage, ServiceUuids, Uuid};
use ringbuf::*;
use sp_runtime::Delay;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    Dispatch(Uuid),
    UnknownService(Uuid),
    TestNotification { cookie: u32, status: TestStatus },
    None,
}

ringbuf!(Trace, 32, Trace::None);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Count)]
enum Event {
    Notification,
    Tpm,
    Test,
    UnknownService,
}

counters::counters!(Event);

/// External collaborator: delivers the next direct-request record along
/// with the target-service UUID it was addressed to, and carries the
/// matching response back to the caller (spec.md §1, out of scope).
pub trait PartitionTransport {
    fn receive(&mut self) -> (Uuid, DirectMessage);
    fn reply(&mut self, resp: DirectMessage);
}

/// `(u32::from(status) as i32) as i64 as u64`, sign-extending a 32-bit
/// status code into a 64-bit argument slot (spec.md §6.4), reused here for
/// the dispatcher's own unknown-service fallback.
fn tpm_arg0(status: TpmStatus) -> u64 {
    (u32::from(status) as i32) as i64 as u64
}

/// Owns the Notification Service and TPM Service registries for the
/// partition's lifetime and demultiplexes requests between them (spec.md
/// §4.1).
pub struct Dispatcher<B> {
    uuids: ServiceUuids,
    notification: NotificationService,
    tpm: TpmService<B>,
}

impl<B: TpmBus> Dispatcher<B> {
    pub fn new(uuids: ServiceUuids, backend: TpmBackend<B>) -> Self {
        Dispatcher {
            uuids,
            notification: NotificationService::new(),
            tpm: TpmService::new(backend),
        }
    }

    pub fn notification(&self) -> &NotificationService {
        &self.notification
    }

    pub fn tpm(&self) -> &TpmService<B> {
        &self.tpm
    }

    /// Demultiplexes one request by target-service UUID (spec.md §4.1).
    ///
    /// `service_uuid` travels alongside the 14-register [`DirectMessage`]
    /// body rather than inside it, since the body has no field reserved
    /// for it.
    pub fn handle(
        &mut self,
        service_uuid: Uuid,
        req: &DirectMessage,
        transport: &mut impl NotificationTransport,
        delay: &mut impl Delay,
    ) -> DirectMessage {
        ringbuf_entry!(Trace::Dispatch(service_uuid));

        if service_uuid == self.uuids.notification {
            count!(Event::Notification);
            self.handle_notification(req, transport)
        } else if service_uuid == self.uuids.tpm {
            count!(Event::Tpm);
            self.tpm.handle(req, delay)
        } else if service_uuid == self.uuids.test {
            count!(Event::Test);
            self.handle_test(req, transport)
        } else {
            count!(Event::UnknownService);
            ringbuf_entry!(Trace::UnknownService(service_uuid));
            let mut resp = DirectMessage::new(req.destination_id, req.source_id);
            resp.arg[0] = tpm_arg0(TpmStatus::ErrorNofunc);
            resp
        }
    }

    /// Notification Service path (spec.md §4.1, §4.2): `Arg1..Arg5` are
    /// copied verbatim, `Arg5`'s response-direction bit is set, and the
    /// status lands in the low byte of `Arg6`.
    fn handle_notification(
        &mut self,
        req: &DirectMessage,
        transport: &mut impl NotificationTransport,
    ) -> DirectMessage {
        let mut resp = DirectMessage::new(req.destination_id, req.source_id);
        resp.arg[1] = req.arg[1];
        resp.arg[2] = req.arg[2];
        resp.arg[3] = req.arg[3];
        resp.arg[4] = req.arg[4];
        resp.arg[5] = req.arg[5] | RESPONSE_DIRECTION_BIT;

        let status = match NotificationOpcode::from_arg5(req.arg[5]) {
            NotificationOpcode::Register => self.do_register(req),
            NotificationOpcode::Unregister => self.do_unregister(req),
            NotificationOpcode::Add | NotificationOpcode::Remove => {
                NotificationStatus::NotSupported
            }
        };
        resp.arg[6] = u8::from(status) as u64;
        resp
    }

    fn do_register(&mut self, req: &DirectMessage) -> NotificationStatus {
        let count = req.arg[6];
        if count == 0 || count > MAX_BATCH as u64 {
            return NotificationStatus::InvalidParameter;
        }
        let uuid = extract_uuid(req.arg[3], req.arg[4]);
        let mut entries = [RegisterEntry {
            cookie: 0,
            id: 0,
            per_vcpu: false,
        }; MAX_BATCH as usize];
        for (i, slot) in entries.iter_mut().enumerate().take(count as usize) {
            match PackedMapping::decode(req.arg[7 + i]) {
                Ok(mapping) => *slot = mapping.into(),
                Err(_) => return NotificationStatus::InvalidParameter,
            }
        }
        self.notification
            .register(uuid, &entries[..count as usize], req.source_id)
    }

    fn do_unregister(&mut self, req: &DirectMessage) -> NotificationStatus {
        let count = req.arg[6];
        if count == 0 || count > MAX_BATCH as u64 {
            return NotificationStatus::InvalidParameter;
        }
        let uuid = extract_uuid(req.arg[3], req.arg[4]);
        let mut entries = [UnregisterEntry { cookie: 0, id: 0 }; MAX_BATCH as usize];
        for (i, slot) in entries.iter_mut().enumerate().take(count as usize) {
            match PackedMapping::decode(req.arg[7 + i]) {
                Ok(mapping) => {
                    *slot = UnregisterEntry {
                        cookie: mapping.cookie,
                        id: mapping.id,
                    }
                }
                Err(_) => return NotificationStatus::InvalidParameter,
            }
        }
        self.notification
            .unregister(uuid, &entries[..count as usize], req.source_id)
    }

    /// Test/Notification bridge (spec.md §4.5): the single
    /// `TEST_NOTIFICATION` opcode, taking `(uuid_hi, uuid_lo, cookie)` in
    /// `Arg1..Arg3`, raises the matching mapping with the delayed-SRI flag
    /// and reports success/failure in `Resp.Arg0`.
    fn handle_test(
        &mut self,
        req: &DirectMessage,
        transport: &mut impl NotificationTransport,
    ) -> DirectMessage {
        let mut resp = DirectMessage::new(req.destination_id, req.source_id);
        let cookie = req.arg[3] as u32;
        let status = match TestOpcode::from_arg0(req.arg[0]) {
            Some(TestOpcode::TestNotification) => {
                let uuid = extract_uuid(req.arg[1], req.arg[2]);
                match self
                    .notification
                    .raise(transport, uuid, cookie, DELAYED_SRI_FLAG)
                {
                    NotificationStatus::Success => TestStatus::Success,
                    _ => TestStatus::InvalidParameter,
                }
            }
            None => TestStatus::InvalidParameter,
        };
        ringbuf_entry!(Trace::TestNotification { cookie, status });
        resp.arg[0] = status as u64;
        resp
    }
}

/// Runs the dispatcher for the partition's lifetime (spec.md §5, §9):
/// pulls one request at a time from `transport`, dispatches it, and
/// replies. Never returns, matching the teacher's task main loops.
pub fn run<B: TpmBus>(
    dispatcher: &mut Dispatcher<B>,
    transport: &mut (impl PartitionTransport + NotificationTransport),
    delay: &mut impl Delay,
) -> ! {
    loop {
        let (uuid, req) = transport.receive();
        sp_runtime::sys_log!("secure-partition: dispatch {:?}", uuid);
        let resp = dispatcher.handle(uuid, &req, transport, delay);
        transport.reply(resp);
    }
}
