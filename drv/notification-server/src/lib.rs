// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Notification Service (spec.md §3.1, §4.2).
//!
//! Owns the `{service -> mappings}` registry and the global bitmask;
//! validates and applies REGISTER/UNREGISTER transactions; exposes the
//! internal `raise` API used by the TPM service's test bridge and, in a
//! full deployment, by any other in-partition caller that needs to signal a
//! mapped event.

#![cfg_attr(not(test), no_std)]

use counters::{count, Count};
use drv_notification_api::{
    NotificationStatus, PackedMapping, MAX_BATCH, MAX_MAPPINGS, MAX_SERVICES,
};
use partition_abi::Uuid;
use ringbuf::*;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    Register { uuid: Uuid, count: u8 },
    RegisterRejected(NotificationStatus),
    Unregister { uuid: Uuid, count: u8 },
    UnregisterRejected(NotificationStatus),
    Raise { uuid: Uuid, cookie: u32, id: u16 },
    RaiseNotFound,
    None,
}

ringbuf!(Trace, 64, Trace::None);

/// Per-call-kind tallies, independent of the ring buffer's rolling window
/// (spec.md §5 ambient stack).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Count)]
enum Event {
    Register,
    Unregister,
    Raise,
}

counters::counters!(Event);

/// A `(cookie, id)` request entry, decoded from a packed wire mapping
/// (spec.md §4.2).
#[derive(Copy, Clone, Debug)]
pub struct RegisterEntry {
    pub cookie: u32,
    pub id: u16,
    pub per_vcpu: bool,
}

impl From<PackedMapping> for RegisterEntry {
    fn from(m: PackedMapping) -> Self {
        RegisterEntry {
            cookie: m.cookie,
            id: m.id,
            per_vcpu: m.per_vcpu,
        }
    }
}

/// An unregister request entry: the cookie to remove and the id the caller
/// believes is stored there (spec.md §4.2 validation order, UNREGISTER step
/// 3 checks this matches).
#[derive(Copy, Clone, Debug)]
pub struct UnregisterEntry {
    pub cookie: u32,
    pub id: u16,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct Mapping {
    in_use: bool,
    cookie: u32,
    id: u16,
    per_vcpu: bool,
    source_partition_id: u16,
}

#[derive(Clone)]
struct ServiceEntry {
    uuid: Uuid,
    in_use: bool,
    mappings: [Mapping; MAX_MAPPINGS],
}

impl ServiceEntry {
    const fn empty() -> Self {
        ServiceEntry {
            uuid: Uuid([0; 16]),
            in_use: false,
            mappings: [Mapping {
                in_use: false,
                cookie: 0,
                id: 0,
                per_vcpu: false,
                source_partition_id: 0,
            }; MAX_MAPPINGS],
        }
    }

    fn find_cookie(&self, cookie: u32) -> Option<usize> {
        self.mappings
            .iter()
            .position(|m| m.in_use && m.cookie == cookie)
    }

    fn free_slot(&self) -> Option<usize> {
        self.mappings.iter().position(|m| !m.in_use)
    }
}

/// External collaborator: the notification-delivery primitive (spec.md §1,
/// out of scope). Raises the given bitmask on `destination`, optionally
/// with the per-vCPU flag folded into `flag`.
pub trait NotificationTransport {
    fn notification_set(&mut self, destination: u16, flag: u32, bitmask: u64) -> bool;
}

/// Owns the registry described in spec.md §3.1: up to [`MAX_SERVICES`]
/// service entries, each with up to [`MAX_MAPPINGS`] mappings, plus the
/// 64-bit [`GlobalBitmask`](spec.md §3.1) tracking which ids are allocated.
pub struct NotificationService {
    bitmask: u64,
    services: [ServiceEntry; MAX_SERVICES],
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationService {
    pub const fn new() -> Self {
        NotificationService {
            bitmask: 0,
            services: [const { ServiceEntry::empty() }; MAX_SERVICES],
        }
    }

    /// Current value of the global bitmask, exposed for testing invariant 2
    /// (spec.md §8).
    pub fn global_bitmask(&self) -> u64 {
        self.bitmask
    }

    fn find_service(&self, uuid: Uuid) -> Option<usize> {
        self.services
            .iter()
            .position(|s| s.in_use && s.uuid == uuid)
    }

    fn find_or_alloc_service(&self, uuid: Uuid) -> Result<usize, NotificationStatus> {
        if let Some(i) = self.find_service(uuid) {
            return Ok(i);
        }
        self.services
            .iter()
            .position(|s| !s.in_use)
            .ok_or(NotificationStatus::NoMem)
    }

    /// REGISTER: adds `entries.len()` `(cookie, id)` mappings to the service
    /// named by `uuid`, owned by `source_partition_id` (spec.md §4.2).
    ///
    /// All-or-nothing: on any validation failure the registry is left
    /// byte-identical to its pre-call state (spec.md §8 invariant 4).
    pub fn register(
        &mut self,
        uuid: Uuid,
        entries: &[RegisterEntry],
        source_partition_id: u16,
    ) -> NotificationStatus {
        count!(Event::Register);
        if entries.is_empty() || entries.len() > MAX_BATCH as usize {
            ringbuf_entry!(Trace::RegisterRejected(NotificationStatus::InvalidParameter));
            return NotificationStatus::InvalidParameter;
        }

        let service_idx = match self.find_or_alloc_service(uuid) {
            Ok(i) => i,
            Err(e) => {
                ringbuf_entry!(Trace::RegisterRejected(e));
                return e;
            }
        };

        // Work on copies; nothing is committed until every entry validates
        // (spec.md "Atomicity").
        let mut service = self.services[service_idx].clone();
        let mut bitmask = self.bitmask;

        for entry in entries {
            if (entry.id as usize) >= MAX_MAPPINGS {
                ringbuf_entry!(Trace::RegisterRejected(NotificationStatus::InvalidParameter));
                return NotificationStatus::InvalidParameter;
            }
            if service.find_cookie(entry.cookie).is_some() {
                ringbuf_entry!(Trace::RegisterRejected(NotificationStatus::InvalidParameter));
                return NotificationStatus::InvalidParameter;
            }
            if bitmask & (1 << entry.id) != 0 {
                ringbuf_entry!(Trace::RegisterRejected(NotificationStatus::InvalidParameter));
                return NotificationStatus::InvalidParameter;
            }
            let Some(slot) = service.free_slot() else {
                ringbuf_entry!(Trace::RegisterRejected(NotificationStatus::NoMem));
                return NotificationStatus::NoMem;
            };
            service.mappings[slot] = Mapping {
                in_use: true,
                cookie: entry.cookie,
                id: entry.id,
                per_vcpu: entry.per_vcpu,
                source_partition_id,
            };
            bitmask |= 1 << entry.id;
        }

        service.uuid = uuid;
        service.in_use = true;
        self.services[service_idx] = service;
        self.bitmask = bitmask;
        ringbuf_entry!(Trace::Register {
            uuid,
            count: entries.len() as u8
        });
        NotificationStatus::Success
    }

    /// UNREGISTER: removes `entries.len()` mappings from the service named
    /// by `uuid`; only the registrar (matching `source_partition_id`) may
    /// remove a mapping (spec.md §4.2).
    pub fn unregister(
        &mut self,
        uuid: Uuid,
        entries: &[UnregisterEntry],
        source_partition_id: u16,
    ) -> NotificationStatus {
        count!(Event::Unregister);
        if entries.is_empty() || entries.len() > MAX_BATCH as usize {
            ringbuf_entry!(Trace::UnregisterRejected(NotificationStatus::InvalidParameter));
            return NotificationStatus::InvalidParameter;
        }

        let Some(service_idx) = self.find_service(uuid) else {
            ringbuf_entry!(Trace::UnregisterRejected(NotificationStatus::InvalidParameter));
            return NotificationStatus::InvalidParameter;
        };

        let mut service = self.services[service_idx].clone();
        let mut bitmask = self.bitmask;

        for entry in entries {
            let Some(slot) = service.find_cookie(entry.cookie) else {
                ringbuf_entry!(Trace::UnregisterRejected(NotificationStatus::InvalidParameter));
                return NotificationStatus::InvalidParameter;
            };
            let mapping = service.mappings[slot];
            if mapping.id != entry.id {
                ringbuf_entry!(Trace::UnregisterRejected(NotificationStatus::InvalidParameter));
                return NotificationStatus::InvalidParameter;
            }
            if mapping.source_partition_id != source_partition_id {
                ringbuf_entry!(Trace::UnregisterRejected(NotificationStatus::InvalidParameter));
                return NotificationStatus::InvalidParameter;
            }
            bitmask &= !(1u64 << mapping.id);
            service.mappings[slot] = Mapping::default();
        }

        self.services[service_idx] = service;
        self.bitmask = bitmask;
        ringbuf_entry!(Trace::Unregister {
            uuid,
            count: entries.len() as u8
        });
        NotificationStatus::Success
    }

    /// `raise(service_uuid, cookie, flag)` (spec.md §4.2 "Raise API").
    pub fn raise(
        &self,
        transport: &mut impl NotificationTransport,
        uuid: Uuid,
        cookie: u32,
        flag: u32,
    ) -> NotificationStatus {
        count!(Event::Raise);
        let Some(service_idx) = self.find_service(uuid) else {
            ringbuf_entry!(Trace::RaiseNotFound);
            return NotificationStatus::InvalidParameter;
        };
        let service = &self.services[service_idx];
        let Some(slot) = service.find_cookie(cookie) else {
            ringbuf_entry!(Trace::RaiseNotFound);
            return NotificationStatus::InvalidParameter;
        };
        let mapping = service.mappings[slot];
        let bitmask = 1u64 << mapping.id;
        let flag = if mapping.per_vcpu { flag | PER_VCPU_FLAG } else { flag };

        ringbuf_entry!(Trace::Raise {
            uuid,
            cookie,
            id: mapping.id
        });

        if transport.notification_set(mapping.source_partition_id, flag, bitmask) {
            NotificationStatus::Success
        } else {
            NotificationStatus::InvalidParameter
        }
    }
}

/// Bit set in the delivery `flag` word when a mapping was registered
/// per-vCPU (spec.md §3.1 Mapping).
const PER_VCPU_FLAG: u32 = 1 << 0;

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTransport {
        calls: std::vec::Vec<(u16, u32, u64)>,
        fail: bool,
    }

    impl FakeTransport {
        fn new() -> Self {
            FakeTransport {
                calls: std::vec::Vec::new(),
                fail: false,
            }
        }
    }

    impl NotificationTransport for FakeTransport {
        fn notification_set(&mut self, destination: u16, flag: u32, bitmask: u64) -> bool {
            self.calls.push((destination, flag, bitmask));
            !self.fail
        }
    }

    const U_BATT: Uuid = Uuid([0xAA; 16]);

    #[test]
    fn s1_register_two_raise_one() {
        let mut svc = NotificationService::new();
        let status = svc.register(
            U_BATT,
            &[
                RegisterEntry {
                    cookie: 0,
                    id: 0,
                    per_vcpu: false,
                },
                RegisterEntry {
                    cookie: 1,
                    id: 1,
                    per_vcpu: false,
                },
            ],
            0x1234,
        );
        assert_eq!(status, NotificationStatus::Success);
        assert_eq!(svc.global_bitmask(), 0b11);

        let mut transport = FakeTransport::new();
        let status = svc.raise(&mut transport, U_BATT, 1, DELAYED_SRI);
        assert_eq!(status, NotificationStatus::Success);
        assert_eq!(transport.calls, std::vec![(0x1234, DELAYED_SRI, 2)]);
    }

    const DELAYED_SRI: u32 = 1 << 1;

    #[test]
    fn s2_duplicate_cookie_rejected() {
        let mut svc = NotificationService::new();
        svc.register(
            U_BATT,
            &[
                RegisterEntry {
                    cookie: 0,
                    id: 0,
                    per_vcpu: false,
                },
                RegisterEntry {
                    cookie: 1,
                    id: 1,
                    per_vcpu: false,
                },
            ],
            1,
        );

        let status = svc.register(
            U_BATT,
            &[RegisterEntry {
                cookie: 1,
                id: 9,
                per_vcpu: false,
            }],
            1,
        );
        assert_eq!(status, NotificationStatus::InvalidParameter);
        assert_eq!(svc.global_bitmask(), 0b11);
    }

    #[test]
    fn s3_duplicate_id_rejected() {
        let mut svc = NotificationService::new();
        svc.register(
            U_BATT,
            &[
                RegisterEntry {
                    cookie: 0,
                    id: 0,
                    per_vcpu: false,
                },
                RegisterEntry {
                    cookie: 1,
                    id: 1,
                    per_vcpu: false,
                },
            ],
            1,
        );

        let status = svc.register(
            U_BATT,
            &[RegisterEntry {
                cookie: 99,
                id: 0,
                per_vcpu: false,
            }],
            1,
        );
        assert_eq!(status, NotificationStatus::InvalidParameter);
        assert_eq!(svc.global_bitmask(), 0b11);
    }

    #[test]
    fn s4_out_of_range_batch_size() {
        let mut svc = NotificationService::new();
        assert_eq!(
            svc.register(U_BATT, &[], 1),
            NotificationStatus::InvalidParameter
        );

        let too_many: std::vec::Vec<RegisterEntry> = (0..8)
            .map(|i| RegisterEntry {
                cookie: i,
                id: i as u16,
                per_vcpu: false,
            })
            .collect();
        assert_eq!(
            svc.register(U_BATT, &too_many, 1),
            NotificationStatus::InvalidParameter
        );
        assert_eq!(svc.global_bitmask(), 0);
    }

    #[test]
    fn unregister_requires_matching_registrar() {
        let mut svc = NotificationService::new();
        svc.register(
            U_BATT,
            &[RegisterEntry {
                cookie: 5,
                id: 3,
                per_vcpu: false,
            }],
            0x1111,
        );

        // Wrong source partition: rejected, no state change.
        let status = svc.unregister(U_BATT, &[UnregisterEntry { cookie: 5, id: 3 }], 0x2222);
        assert_eq!(status, NotificationStatus::InvalidParameter);
        assert_eq!(svc.global_bitmask(), 1 << 3);

        // Mismatched id at that cookie: rejected.
        let status = svc.unregister(U_BATT, &[UnregisterEntry { cookie: 5, id: 4 }], 0x1111);
        assert_eq!(status, NotificationStatus::InvalidParameter);

        // Correct registrar and id: succeeds and clears the bit.
        let status = svc.unregister(U_BATT, &[UnregisterEntry { cookie: 5, id: 3 }], 0x1111);
        assert_eq!(status, NotificationStatus::Success);
        assert_eq!(svc.global_bitmask(), 0);
    }

    #[test]
    fn raise_unknown_uuid_or_cookie_is_invalid_parameter() {
        let svc = NotificationService::new();
        let mut transport = FakeTransport::new();
        assert_eq!(
            svc.raise(&mut transport, U_BATT, 0, DELAYED_SRI),
            NotificationStatus::InvalidParameter
        );
        assert!(transport.calls.is_empty());
    }
}
