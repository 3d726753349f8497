// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end scenarios over an in-memory host.

use super::*;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use v4v_core::protocol::WireAddress;
use v4v_core::protocol::WireRingId;
use v4v_core::PORT_ANY;
use v4v_ring::GuestFrame;
use v4v_ring::HeapFrames;
use v4v_ring::MapFault;
use v4v_ring::MappedPage;
use v4v_ring::RingConsumer;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Flat guest memory shared by every domain in a test.
struct VecMemory(Mutex<Vec<u8>>);

impl VecMemory {
    fn new(size: usize) -> Self {
        Self(Mutex::new(vec![0; size]))
    }

    fn fill(&self, gva: u64, data: &[u8]) {
        let mut mem = self.0.lock();
        mem[gva as usize..gva as usize + data.len()].copy_from_slice(data);
    }
}

impl GuestMemory for VecMemory {
    fn read_at(&self, gva: u64, data: &mut [u8]) -> Result<(), AccessError> {
        let mem = self.0.lock();
        let start = gva as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= mem.len())
            .ok_or(AccessError::OutOfRange(gva, data.len() as u64))?;
        data.copy_from_slice(&mem[start..end]);
        Ok(())
    }

    fn write_at(&self, gva: u64, data: &[u8]) -> Result<(), AccessError> {
        let mut mem = self.0.lock();
        let start = gva as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= mem.len())
            .ok_or(AccessError::OutOfRange(gva, data.len() as u64))?;
        mem[start..end].copy_from_slice(data);
        Ok(())
    }
}

struct CountedFrame {
    inner: Box<dyn GuestFrame>,
    pins: Arc<AtomicUsize>,
}

impl GuestFrame for CountedFrame {
    fn map(&self) -> Result<MappedPage, MapFault> {
        self.inner.map()
    }
}

impl Drop for CountedFrame {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::Relaxed);
    }
}

/// In-memory frame pool and event-channel fabric, with pin counting and
/// signal recording.
#[derive(Default)]
struct TestHost {
    frames: HeapFrames,
    pins: Arc<AtomicUsize>,
    signals: Mutex<Vec<DomainId>>,
    next_port: AtomicU32,
}

impl FramePool for TestHost {
    fn pin_writable(
        &self,
        owner: DomainId,
        pfn: u64,
    ) -> Result<Box<dyn GuestFrame>, v4v_ring::PinError> {
        let inner = self.frames.pin_writable(owner, pfn)?;
        self.pins.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(CountedFrame {
            inner,
            pins: self.pins.clone(),
        }))
    }
}

impl Notifier for TestHost {
    fn allocate_port(&self, _domain: DomainId) -> Result<EvtchnPort, PortError> {
        Ok(EvtchnPort(0x80 + self.next_port.fetch_add(1, Ordering::Relaxed)))
    }

    fn free_port(&self, _domain: DomainId, _port: EvtchnPort) {}

    fn signal(&self, domain: DomainId, _port: EvtchnPort) {
        self.signals.lock().push(domain);
    }
}

const SCRATCH_GVA: u64 = 0xf0000;
const IOV_GVA: u64 = 0xf8000;
const ADDR_GVA: u64 = 0xfc000;
const RULE_GVA: u64 = 0xe0000;
const QUERY_GVA: u64 = 0xd0000;
const INFO_GVA: u64 = 0xc0000;

struct TestEnv {
    v4v: V4v,
    host: Arc<TestHost>,
    mem: VecMemory,
}

impl TestEnv {
    fn new(domains: &[u16]) -> Self {
        let host = Arc::new(TestHost::default());
        let v4v = V4v::new(host.clone(), host.clone());
        for &domain in domains {
            v4v.domain_init(DomainId(domain)).unwrap();
        }
        Self {
            v4v,
            host,
            mem: VecMemory::new(0x10_0000),
        }
    }

    /// Registers a ring and returns the guest's consumer over its frames.
    /// `tag` keys the guest addresses and frame numbers used.
    fn register(
        &self,
        domain: u16,
        port: u32,
        partner: DomainId,
        len: u32,
        npage: u64,
        tag: u64,
    ) -> Result<RingConsumer, V4vError> {
        let ring_gva = 0x10000 * (tag + 1);
        let pfns_gva = ring_gva + 0x8000;
        let base_pfn = 1000 * (tag + 1);

        let desc = RingDescriptor {
            magic: RING_MAGIC,
            len,
            rx_ptr: 0,
            tx_ptr: 0,
            pad: 0,
            id: WireRingId {
                port,
                domain,
                partner: partner.0,
            },
            reserved: [0; 8],
        };
        self.mem.fill(ring_gva, desc.as_bytes());
        // In a real guest the descriptor page and the registered mapping
        // alias the same memory; mirror the bytes into frame 0 by hand.
        let page = self.host.frames.page(base_pfn);
        for (i, b) in desc.as_bytes().iter().enumerate() {
            page.page()[i].store(*b, Ordering::Relaxed);
        }
        for i in 0..npage {
            self.mem
                .fill(pfns_gva + i * 8, &(base_pfn + i).to_ne_bytes());
        }

        self.v4v
            .register_ring(DomainId(domain), &self.mem, ring_gva, pfns_gva, npage as u32)?;
        Ok(RingConsumer::new(
            (0..npage).map(|i| self.host.frames.page(base_pfn + i)).collect(),
        )
        .unwrap())
    }

    fn unregister(&self, domain: u16, tag: u64) -> Result<(), V4vError> {
        let ring_gva = 0x10000 * (tag + 1);
        self.v4v
            .unregister_ring(DomainId(domain), &self.mem, ring_gva)
    }

    fn send(
        &self,
        from: (u16, u32),
        to: (u16, u32),
        payload: &[u8],
        message_type: u32,
    ) -> Result<u32, V4vError> {
        self.mem.fill(SCRATCH_GVA, payload);
        let iov = Iov {
            base: SCRATCH_GVA,
            len: payload.len() as u32,
            reserved: 0,
        };
        self.mem.fill(IOV_GVA, iov.as_bytes());
        let addr = SendAddr {
            src: WireAddress {
                port: from.1,
                domain: from.0,
                pad: 0,
            },
            dst: WireAddress {
                port: to.1,
                domain: to.0,
                pad: 0,
            },
        };
        self.mem.fill(ADDR_GVA, addr.as_bytes());
        self.v4v
            .sendv(DomainId(from.0), &self.mem, ADDR_GVA, IOV_GVA, 1, message_type)
    }

    fn add_rule(&self, accept: bool, src: (u16, u32), dst: (u16, u32), position: u32) {
        let rule = TablesRule {
            src: WireAddress {
                port: src.1,
                domain: src.0,
                pad: 0,
            },
            dst: WireAddress {
                port: dst.1,
                domain: dst.0,
                pad: 0,
            },
            accept: accept.into(),
        };
        self.mem.fill(RULE_GVA, rule.as_bytes());
        self.v4v.tables_add(&self.mem, RULE_GVA, position).unwrap();
    }

    /// Issues a one-entry bulk ring-state query from `caller` and returns
    /// the flags and max message size written back.
    fn query(&self, caller: u16, dst: (u16, u32), space_required: u32) -> (RingDataFlags, u32) {
        let header = RingDataHeader {
            magic: RING_DATA_MAGIC,
            nent: 1,
            pad: 0,
        };
        self.mem.fill(QUERY_GVA, header.as_bytes());
        let ent = RingDataEnt {
            ring: WireAddress {
                port: dst.1,
                domain: dst.0,
                pad: 0,
            },
            flags: RingDataFlags::new(),
            pad: 0,
            space_required,
            max_message_size: 0,
        };
        let ent_gva = QUERY_GVA + size_of::<RingDataHeader>() as u64;
        self.mem.fill(ent_gva, ent.as_bytes());

        self.v4v
            .notify(DomainId(caller), &self.mem, Some(QUERY_GVA))
            .unwrap();

        let mut raw = [0u8; size_of::<RingDataEnt>()];
        self.mem.read_at(ent_gva, &mut raw).unwrap();
        let ent = RingDataEnt::read_from_bytes(&raw).unwrap();
        (ent.flags, ent.max_message_size)
    }

    fn take_signals(&self) -> Vec<DomainId> {
        std::mem::take(&mut self.host.signals.lock())
    }
}

#[test]
fn basic_send() {
    let env = TestEnv::new(&[2, 3]);
    let consumer = env
        .register(2, 100, DomainId::ANY, 256, 1, 0)
        .unwrap();

    let sent = env.send((3, 0), (2, 100), &[0xaa, 0xbb, 0xcc], 0x1111).unwrap();
    assert_eq!(sent, 3);
    assert_eq!(env.take_signals(), [DomainId(2)]);

    let msg = consumer.try_recv().unwrap();
    assert_eq!(
        msg.source,
        Address {
            domain: DomainId(3),
            port: 0
        }
    );
    assert_eq!(msg.message_type, 0x1111);
    assert_eq!(msg.data, [0xaa, 0xbb, 0xcc]);
    assert_eq!(consumer.tx_ptr(), 32);
    assert_eq!(consumer.rx_ptr(), 32);

    // The next send observes the drained ring and resets both pointers.
    env.send((3, 0), (2, 100), &[0xdd], 0).unwrap();
    assert_eq!(consumer.rx_ptr(), 0);
    assert_eq!(consumer.tx_ptr(), 32);
    assert_eq!(consumer.try_recv().unwrap().data, [0xdd]);
}

#[test]
fn full_ring_blocks_until_consumed() {
    let env = TestEnv::new(&[2, 3]);
    let consumer = env.register(2, 100, DomainId::ANY, 128, 1, 0).unwrap();

    for i in 0..3u8 {
        env.send((3, 0), (2, 100), &[i; 12], 0).unwrap();
    }
    assert_eq!(
        env.send((3, 0), (2, 100), &[3; 12], 0),
        Err(V4vError::WouldBlock)
    );
    env.take_signals();

    // Nothing has been consumed, so notify wakes nobody.
    env.v4v.notify(DomainId(2), &env.mem, None).unwrap();
    assert_eq!(env.take_signals(), []);

    // Consuming the first message frees the blocked sender's slot.
    consumer.try_recv().unwrap();
    env.v4v.notify(DomainId(2), &env.mem, None).unwrap();
    assert_eq!(env.take_signals(), [DomainId(3)]);

    // The retried send wraps the producer pointer.
    env.send((3, 0), (2, 100), &[3; 12], 0).unwrap();
    let data: Vec<_> = consumer.drain().into_iter().map(|m| m.data).collect();
    assert_eq!(data, [vec![1; 12], vec![2; 12], vec![3; 12]]);
}

#[test]
fn pending_entry_is_single_and_upgraded() {
    let env = TestEnv::new(&[2, 3]);
    let consumer = env.register(2, 100, DomainId::ANY, 128, 1, 0).unwrap();

    for i in 0..3u8 {
        env.send((3, 0), (2, 100), &[i; 12], 0).unwrap();
    }
    // Two blocked sends from the same source leave one pending entry.
    assert_eq!(env.send((3, 0), (2, 100), &[9; 12], 0), Err(V4vError::WouldBlock));
    assert_eq!(env.send((3, 0), (2, 100), &[9; 24], 0), Err(V4vError::WouldBlock));
    env.take_signals();

    consumer.drain();
    env.v4v.notify(DomainId(2), &env.mem, None).unwrap();
    assert_eq!(env.take_signals(), [DomainId(3)]);

    // The entry is gone; another notify wakes nobody.
    env.v4v.notify(DomainId(2), &env.mem, None).unwrap();
    assert_eq!(env.take_signals(), []);
}

#[test]
fn rules_filter_sends_first_match_wins() {
    let env = TestEnv::new(&[3, 4]);
    let _consumer = env.register(4, 200, DomainId::ANY, 256, 1, 0).unwrap();

    env.add_rule(false, (DomainId::ANY.0, PORT_ANY), (4, 200), 1);
    assert_eq!(env.send((3, 0), (4, 200), &[1], 0), Err(V4vError::Refused));

    // An accept inserted at position 1 matches first.
    env.add_rule(true, (3, PORT_ANY), (4, 200), 1);
    env.send((3, 0), (4, 200), &[1], 0).unwrap();

    // Other sources still hit the reject.
    env.v4v.domain_init(DomainId(5)).unwrap();
    assert_eq!(env.send((5, 0), (4, 200), &[1], 0), Err(V4vError::Refused));
}

#[test]
fn rule_check_is_pure_across_list_operations() {
    let env = TestEnv::new(&[3, 4]);
    let _consumer = env.register(4, 200, DomainId::ANY, 256, 1, 0).unwrap();
    env.add_rule(false, (DomainId::ANY.0, PORT_ANY), (4, 200), 1);

    assert_eq!(env.send((3, 0), (4, 200), &[1], 0), Err(V4vError::Refused));

    let header = TablesListHeader {
        magic: TABLES_LIST_MAGIC,
        start_rule: 0,
        nb_rules: 8,
    };
    env.mem.fill(RULE_GVA, header.as_bytes());
    env.v4v.tables_list(&env.mem, RULE_GVA).unwrap();
    let mut raw = [0u8; size_of::<TablesListHeader>()];
    env.mem.read_at(RULE_GVA, &mut raw).unwrap();
    assert_eq!(TablesListHeader::read_from_bytes(&raw).unwrap().nb_rules, 1);

    assert_eq!(env.send((3, 0), (4, 200), &[1], 0), Err(V4vError::Refused));
}

#[test]
fn explicit_partner_restricts_senders() {
    let env = TestEnv::new(&[2, 3, 5]);
    let _consumer = env.register(2, 100, DomainId(3), 256, 1, 0).unwrap();

    env.send((3, 0), (2, 100), &[1], 0).unwrap();
    assert_eq!(env.send((5, 0), (2, 100), &[1], 0), Err(V4vError::Refused));
}

#[test]
fn bulk_query_reports_and_queues() {
    let env = TestEnv::new(&[2, 3]);
    let consumer = env.register(2, 100, DomainId::ANY, 128, 1, 0).unwrap();

    // Empty ring, satisfiable request.
    let (flags, max) = env.query(3, (2, 100), 50);
    assert!(flags.exists() && flags.sufficient() && flags.empty());
    assert!(!flags.pending());
    assert_eq!(max, 96);

    // Unsatisfiable request queues a pending entry.
    let (flags, _) = env.query(3, (2, 100), 200);
    assert!(flags.exists() && flags.pending());
    assert!(!flags.sufficient());

    // A later satisfiable query cancels it again.
    let (flags, _) = env.query(3, (2, 100), 96);
    assert!(flags.sufficient());
    env.take_signals();
    env.v4v.notify(DomainId(2), &env.mem, None).unwrap();
    assert_eq!(env.take_signals(), []);

    // An unregistered address reports nothing.
    let (flags, max) = env.query(3, (2, 999), 1);
    assert_eq!(u16::from(flags), 0);
    assert_eq!(max, 0);

    // Partially drained rings are not empty.
    env.send((3, 0), (2, 100), &[1; 12], 0).unwrap();
    let (flags, _) = env.query(3, (2, 100), 8);
    assert!(flags.exists() && flags.sufficient() && !flags.empty());
    drop(consumer);
}

#[test]
fn bulk_query_rejects_bad_magic() {
    let env = TestEnv::new(&[2]);
    let header = RingDataHeader {
        magic: 0x1234,
        nent: 0,
        pad: 0,
    };
    env.mem.fill(QUERY_GVA, header.as_bytes());
    assert_eq!(
        env.v4v.notify(DomainId(2), &env.mem, Some(QUERY_GVA)),
        Err(V4vError::InvalidArgument)
    );
}

#[test]
fn teardown_releases_everything() {
    let env = TestEnv::new(&[2, 3]);
    let consumer = env.register(2, 100, DomainId::ANY, 128, 1, 0).unwrap();

    for i in 0..3u8 {
        env.send((3, 0), (2, 100), &[i; 12], 0).unwrap();
    }
    assert_eq!(env.send((3, 0), (2, 100), &[9; 12], 0), Err(V4vError::WouldBlock));
    assert_eq!(env.host.pins.load(Ordering::Relaxed), 1);

    env.v4v.domain_destroy(DomainId(2));
    assert_eq!(env.host.pins.load(Ordering::Relaxed), 0);
    assert_eq!(env.send((3, 0), (2, 100), &[1], 0), Err(V4vError::Refused));
    assert_eq!(
        env.v4v.notify(DomainId(2), &env.mem, None),
        Err(V4vError::NoDevice)
    );

    // Destroying a domain with no state is a no-op.
    env.v4v.domain_destroy(DomainId(2));
    drop(consumer);
}

#[test]
fn register_unregister_leaves_no_residue() {
    let env = TestEnv::new(&[2, 3]);
    for _ in 0..5 {
        env.register(2, 100, DomainId::ANY, 256, 1, 0).unwrap();
        env.unregister(2, 0).unwrap();
    }
    assert_eq!(env.unregister(2, 0), Err(V4vError::NotFound));
    assert_eq!(env.host.pins.load(Ordering::Relaxed), 0);
    assert_eq!(env.send((3, 0), (2, 100), &[1], 0), Err(V4vError::Refused));
}

#[test]
fn duplicate_registration_rejected() {
    let env = TestEnv::new(&[2]);
    env.register(2, 100, DomainId::ANY, 256, 1, 0).unwrap();
    assert_eq!(
        env.register(2, 100, DomainId::ANY, 256, 1, 1).err(),
        Some(V4vError::AlreadyExists)
    );
    // The duplicate's pins were rolled back.
    assert_eq!(env.host.pins.load(Ordering::Relaxed), 1);
}

#[test]
fn registration_validates_descriptor() {
    let env = TestEnv::new(&[2]);
    // Too small.
    assert_eq!(
        env.register(2, 100, DomainId::ANY, 32, 1, 0).err(),
        Some(V4vError::InvalidArgument)
    );
    // Not slot-aligned.
    assert_eq!(
        env.register(2, 100, DomainId::ANY, 200, 1, 1).err(),
        Some(V4vError::InvalidArgument)
    );
    // Too few backing pages.
    assert_eq!(
        env.register(2, 100, DomainId::ANY, 8192, 1, 2).err(),
        Some(V4vError::InvalidArgument)
    );
    // Unaligned descriptor handle.
    assert_eq!(
        env.v4v
            .register_ring(DomainId(2), &env.mem, 0x10008, 0x18000, 1),
        Err(V4vError::InvalidArgument)
    );
}

#[test]
fn callers_without_state_are_rejected() {
    let env = TestEnv::new(&[2]);
    let _consumer = env.register(2, 100, DomainId::ANY, 256, 1, 0).unwrap();

    assert_eq!(
        env.send((9, 0), (2, 100), &[1], 0),
        Err(V4vError::InvalidArgument)
    );
    assert_eq!(
        env.v4v.notify(DomainId(9), &env.mem, None),
        Err(V4vError::NoDevice)
    );
    assert_eq!(
        env.v4v.domain_init(DomainId(2)).unwrap_err().to_string(),
        "domain already has v4v state"
    );
}

#[test]
fn oversized_scatter_total_rejected() {
    let env = TestEnv::new(&[2, 3]);
    let _consumer = env.register(2, 100, DomainId::ANY, 256, 1, 0).unwrap();

    // Two iovs whose lengths sum past 2 GiB.
    let iovs = [
        Iov {
            base: 0,
            len: 0x7000_0000,
            reserved: 0,
        },
        Iov {
            base: 0,
            len: 0x7000_0000,
            reserved: 0,
        },
    ];
    let mut raw = Vec::new();
    for iov in &iovs {
        raw.extend_from_slice(iov.as_bytes());
    }
    env.mem.fill(IOV_GVA, &raw);
    let addr = SendAddr {
        src: WireAddress {
            port: 0,
            domain: 3,
            pad: 0,
        },
        dst: WireAddress {
            port: 100,
            domain: 2,
            pad: 0,
        },
    };
    env.mem.fill(ADDR_GVA, addr.as_bytes());
    assert_eq!(
        env.v4v.sendv(DomainId(3), &env.mem, ADDR_GVA, IOV_GVA, 2, 0),
        Err(V4vError::MessageTooLarge)
    );
}

#[test]
fn info_reports_magics_and_port() {
    let env = TestEnv::new(&[2]);
    env.v4v.info(DomainId(2), &env.mem, INFO_GVA).unwrap();

    let mut raw = [0u8; size_of::<InfoBlock>()];
    env.mem.read_at(INFO_GVA, &mut raw).unwrap();
    let info = InfoBlock::read_from_bytes(&raw).unwrap();
    assert_eq!(info.ring_magic, RING_MAGIC);
    assert_eq!(info.data_magic, RING_DATA_MAGIC);
    assert_eq!(info.evtchn, 0x80);
}
