//! End-to-end tunnel lifecycle tests
//!
//! Drives the dispatcher and maintenance with mock collaborators and
//! simulates the remote hop side of the build protocol with the real
//! record crypto.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;

use garliccraft_core::{
    I2npMessage, I2npMessageType, RouterHash, RouterInfo, TunnelId, TunnelSettings, TunnelState,
};
use garliccraft_crypto::{
    open_record, record_layer_transform, seal_reply, unwrap_from_router, EncryptionKeypair,
    REPLY_SEAL_OVERHEAD,
};
use garliccraft_tunnel::{
    seconds_since_epoch, BuildRequestRecord, InboundTunnel, I2npHandler, LocalDestination, NetDb,
    OutboundTunnel, ProfileEvents, RouterContext, TransitHandler, Transport, TunnelBase,
    TunnelConfig, Tunnels, TUNNEL_CREATION_TIMEOUT,
};

const LOCAL_HASH: RouterHash = [0xEE; 32];

// ==================== mock collaborators ====================

#[derive(Default)]
struct MockTransport {
    sent: Mutex<Vec<(RouterHash, I2npMessage)>>,
    online: AtomicBool,
}

impl Transport for MockTransport {
    fn send_message(&self, to: &RouterHash, mut msg: I2npMessage) {
        msg.disarm();
        self.sent.lock().unwrap().push((*to, msg));
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }
}

impl MockTransport {
    fn take_sent(&self) -> Vec<(RouterHash, I2npMessage)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

#[derive(Default)]
struct MockNetDb {
    routers: Mutex<Vec<RouterInfo>>,
}

impl NetDb for MockNetDb {
    fn random_router(
        &self,
        exclude: &RouterHash,
        _reachable: bool,
        _high_bandwidth: bool,
    ) -> Option<RouterInfo> {
        self.routers
            .lock()
            .unwrap()
            .iter()
            .find(|r| &r.hash != exclude)
            .cloned()
    }
}

#[derive(Default)]
struct MockProfiles {
    build_responses: Mutex<Vec<(RouterHash, u8)>>,
    non_replied: Mutex<Vec<RouterHash>>,
}

impl ProfileEvents for MockProfiles {
    fn tunnel_build_response(&self, hash: &RouterHash, ret_code: u8) {
        self.build_responses.lock().unwrap().push((*hash, ret_code));
    }

    fn tunnel_non_replied(&self, hash: &RouterHash) {
        self.non_replied.lock().unwrap().push(*hash);
    }
}

#[derive(Default)]
struct MockDestination {
    lease_set_updated: AtomicBool,
    garlic_keys: Mutex<Vec<([u8; 32], u64)>>,
}

impl LocalDestination for MockDestination {
    fn set_lease_set_updated(&self, updated: bool) {
        self.lease_set_updated.store(updated, Ordering::Relaxed);
    }

    fn submit_garlic_key(&self, key: [u8; 32], tag: u64) {
        self.garlic_keys.lock().unwrap().push((key, tag));
    }
}

#[derive(Default)]
struct MockI2np {
    received: Mutex<Vec<I2npMessage>>,
}

impl I2npHandler for MockI2np {
    fn handle_message(&self, msg: I2npMessage) {
        self.received.lock().unwrap().push(msg);
    }
}

#[derive(Default)]
struct MockTransit {
    builds: Mutex<Vec<I2npMessage>>,
}

impl TransitHandler for MockTransit {
    fn post_transit_build(&self, msg: I2npMessage) {
        self.builds.lock().unwrap().push(msg);
    }
}

struct TestEnv {
    ctx: Arc<RouterContext>,
    transport: Arc<MockTransport>,
    netdb: Arc<MockNetDb>,
    profiles: Arc<MockProfiles>,
    destination: Arc<MockDestination>,
    i2np: Arc<MockI2np>,
    transit: Arc<MockTransit>,
}

fn make_env() -> TestEnv {
    let transport = Arc::new(MockTransport::default());
    let netdb = Arc::new(MockNetDb::default());
    let profiles = Arc::new(MockProfiles::default());
    let destination = Arc::new(MockDestination::default());
    let i2np = Arc::new(MockI2np::default());
    let transit = Arc::new(MockTransit::default());
    let ctx = Arc::new(RouterContext {
        local_hash: LOCAL_HASH,
        transport: transport.clone(),
        netdb: netdb.clone(),
        profiles: profiles.clone(),
        local_destination: destination.clone(),
        i2np: i2np.clone(),
        transit: transit.clone(),
    });
    TestEnv {
        ctx,
        transport,
        netdb,
        profiles,
        destination,
        i2np,
        transit,
    }
}

// ==================== hop-side simulation ====================

struct Hop {
    keys: EncryptionKeypair,
    info: RouterInfo,
}

fn make_hops(hashes: &[u8]) -> Vec<Hop> {
    hashes
        .iter()
        .map(|&b| {
            let keys = EncryptionKeypair::generate();
            let info = RouterInfo::new([b; 32], keys.public_key_bytes());
            Hop { keys, info }
        })
        .collect()
}

fn peers(hops: &[Hop]) -> Vec<RouterInfo> {
    hops.iter().map(|h| h.info.clone()).collect()
}

/// Process one transit hop of a build message: open the hop's own record,
/// write its reply, and apply its layer transform to every other slot.
/// Returns the decoded request.
fn simulate_hop(
    keys: &EncryptionKeypair,
    records: &mut [u8],
    record_size: usize,
    num: usize,
    ret_code: u8,
) -> (usize, BuildRequestRecord) {
    let secret = keys.secret_key_bytes();
    let mut own = None;
    for slot in 0..num {
        let bytes = &records[slot * record_size..(slot + 1) * record_size];
        if let Ok(plaintext) = open_record(&secret, slot as u8, bytes) {
            own = Some((slot, BuildRequestRecord::decode(&plaintext).unwrap()));
            break;
        }
    }
    let (slot, request) = own.expect("hop should find its own record");

    let mut reply_plain = vec![0u8; record_size - REPLY_SEAL_OVERHEAD];
    reply_plain[0] = ret_code;
    let sealed = seal_reply(&request.reply_key, slot as u8, &reply_plain).unwrap();
    records[slot * record_size..(slot + 1) * record_size].copy_from_slice(&sealed);

    for other in 0..num {
        if other != slot {
            record_layer_transform(
                &request.reply_key,
                other as u8,
                &mut records[other * record_size..(other + 1) * record_size],
            );
        }
    }
    (slot, request)
}

/// Run a build payload through the whole hop chain, returning the reply
/// payload and the decoded per-hop requests.
fn simulate_chain(
    hops: &[Hop],
    payload: &[u8],
    record_size: usize,
    ret_codes: &[u8],
) -> (Vec<u8>, Vec<(usize, BuildRequestRecord)>) {
    let mut payload = payload.to_vec();
    let num = payload[0] as usize;
    let records = &mut payload[1..];
    let mut requests = Vec::new();
    for (hop, &ret) in hops.iter().zip(ret_codes) {
        requests.push(simulate_hop(&hop.keys, records, record_size, num, ret));
    }
    (payload, requests)
}

// ==================== seed scenarios ====================

/// Happy-path outbound build, 3 hops, short records.
#[test]
fn test_outbound_build_three_hops_established() {
    let env = make_env();
    let tunnels = Tunnels::new(env.ctx.clone(), TunnelSettings::default());
    let hops = make_hops(&[0xA1, 0xB2, 0xC3]);

    let config =
        TunnelConfig::outbound(peers(&hops), [0xBB; 32], 999, true, &mut OsRng).unwrap();
    let record_size = config.record_size();
    let tunnel = OutboundTunnel::new(config, env.ctx.clone());

    tunnels.add_pending_outbound_tunnel(0xDEADBEEF, tunnel.clone());
    tunnel.build(0xDEADBEEF, None);

    // the request went directly to the first hop
    let sent = env.transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, hops[0].info.hash);
    assert_eq!(sent[0].1.type_id, I2npMessageType::ShortTunnelBuild);

    // the reply gateway differs from the last hop, so a garlic reply key
    // was registered with the router
    assert_eq!(env.destination.garlic_keys.lock().unwrap().len(), 1);

    let payload = &sent[0].1.payload;
    assert_eq!(payload[0] as usize, 4);

    let (reply, requests) = simulate_chain(&hops, payload, record_size, &[0, 0, 0]);

    // slots form a permutation; chain links point at the next peer
    let mut slots: Vec<usize> = requests.iter().map(|(s, _)| *s).collect();
    slots.sort_unstable();
    slots.dedup();
    assert_eq!(slots.len(), 3);
    assert!(slots.iter().all(|&s| s < 4));
    assert_eq!(requests[0].1.next_ident, hops[1].info.hash);
    assert_eq!(requests[1].1.next_ident, hops[2].info.hash);
    assert_eq!(requests[0].1.next_tunnel_id, requests[1].1.receive_tunnel_id);
    // only the last hop carries the caller's reply message id
    assert_eq!(requests[2].1.reply_msg_id, 0xDEADBEEF);
    assert_ne!(requests[0].1.reply_msg_id, 0xDEADBEEF);
    // the last hop forwards the reply to our inbound gateway
    assert_eq!(requests[2].1.next_ident, [0xBB; 32]);
    assert_eq!(requests[2].1.next_tunnel_id, 999);

    let reply_msg = I2npMessage::new(I2npMessageType::ShortTunnelBuildReply, 0xDEADBEEF, reply);
    tunnels.process_messages(vec![reply_msg]);

    assert_eq!(tunnel.core().state(), TunnelState::Established);
    assert_eq!(tunnels.count_outbound_tunnels(), 1);
    assert!(std::sync::Arc::ptr_eq(
        &tunnels.get_next_outbound_tunnel().unwrap(),
        &tunnel
    ));

    // every hop got a zero return code credited
    let responses = env.profiles.build_responses.lock().unwrap();
    assert_eq!(responses.len(), 3);
    for (hop, (hash, code)) in hops.iter().zip(responses.iter()) {
        assert_eq!(*hash, hop.info.hash);
        assert_eq!(*code, 0);
    }

    // hops are stored endpoint first
    let inverted = tunnel.core().inverted_peers();
    assert_eq!(inverted.len(), 3);
    assert_eq!(inverted[0].hash, hops[2].info.hash);
    let mut reversed = tunnel.core().peers();
    reversed.reverse();
    assert_eq!(
        inverted.iter().map(|p| p.hash).collect::<Vec<_>>(),
        reversed.iter().map(|p| p.hash).collect::<Vec<_>>()
    );
}

/// One declined hop keeps the tunnel out of the outbound list.
#[test]
fn test_declined_build_fails() {
    let env = make_env();
    let tunnels = Tunnels::new(env.ctx.clone(), TunnelSettings::default());
    let hops = make_hops(&[0xA1, 0xB2, 0xC3]);

    let config =
        TunnelConfig::outbound(peers(&hops), [0xBB; 32], 999, true, &mut OsRng).unwrap();
    let record_size = config.record_size();
    let tunnel = OutboundTunnel::new(config, env.ctx.clone());

    tunnels.add_pending_outbound_tunnel(0xDEADBEEF, tunnel.clone());
    tunnel.build(0xDEADBEEF, None);
    let sent = env.transport.take_sent();

    // the last hop declines with code 30
    let (reply, _) = simulate_chain(&hops, &sent[0].1.payload, record_size, &[0, 0, 30]);
    let reply_msg = I2npMessage::new(I2npMessageType::ShortTunnelBuildReply, 0xDEADBEEF, reply);
    tunnels.process_messages(vec![reply_msg]);

    assert_eq!(tunnel.core().state(), TunnelState::BuildFailed);
    assert_eq!(tunnels.count_outbound_tunnels(), 0);

    // the decline was still credited to every hop
    let responses = env.profiles.build_responses.lock().unwrap();
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[2], (hops[2].info.hash, 30));
    drop(responses);

    // the pending sweep counts the failure exactly once
    tunnels.manage_tunnels(seconds_since_epoch());
    assert_eq!(tunnels.total_failed_tunnel_creations(), 1);
    assert_eq!(tunnels.total_successive_tunnel_creations(), 0);
}

/// A pending tunnel older than the creation timeout is swept, with one
/// non-replied event per hop.
#[test]
fn test_pending_timeout_sweep() {
    let env = make_env();
    let tunnels = Tunnels::new(env.ctx.clone(), TunnelSettings::default());
    let hops = make_hops(&[0xA1, 0xB2]);

    let config = TunnelConfig::inbound(peers(&hops), LOCAL_HASH, true, &mut OsRng).unwrap();
    let tunnel = InboundTunnel::new(config, env.ctx.clone(), Arc::new(Default::default()));
    tunnels.add_pending_inbound_tunnel(0x5050, tunnel.clone());
    tunnel.build(0x5050, None);

    let ts = seconds_since_epoch() + TUNNEL_CREATION_TIMEOUT + 1;
    tunnels.manage_tunnels(ts);

    assert!(tunnels.get_pending_inbound_tunnel(0x5050).is_none());
    assert_eq!(tunnels.total_failed_tunnel_creations(), 1);

    let non_replied = env.profiles.non_replied.lock().unwrap();
    assert_eq!(non_replied.len(), 2);
    assert!(non_replied.contains(&hops[0].info.hash));
    assert!(non_replied.contains(&hops[1].info.hash));
}

// counting mock for the dispatch batching scenario
struct CountingTunnel {
    id: TunnelId,
    handled: AtomicU64,
    flushes: AtomicU64,
}

impl CountingTunnel {
    fn new(id: TunnelId) -> Arc<Self> {
        Arc::new(Self {
            id,
            handled: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        })
    }
}

impl TunnelBase for CountingTunnel {
    fn tunnel_id(&self) -> TunnelId {
        self.id
    }

    fn handle_tunnel_data_msg(self: Arc<Self>, _msg: I2npMessage) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    fn send_tunnel_data_msg(self: Arc<Self>, _msg: I2npMessage) {}

    fn flush_tunnel_data_msgs(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Consecutive messages for one tunnel cost a single registry lookup; the
/// batch flushes once on tunnel change and once at the end.
#[test]
fn test_dispatch_batching() {
    let env = make_env();
    let tunnels = Tunnels::new(env.ctx.clone(), TunnelSettings::default());
    let x = CountingTunnel::new(0x1111);
    let y = CountingTunnel::new(0x2222);
    assert!(tunnels.add_tunnel(x.clone()));
    assert!(tunnels.add_tunnel(y.clone()));

    let mut msgs = Vec::new();
    for id in [0x1111u32, 0x2222] {
        for _ in 0..50 {
            let mut payload = vec![0u8; 8];
            payload[..4].copy_from_slice(&id.to_be_bytes());
            msgs.push(I2npMessage::new(I2npMessageType::TunnelData, 0, payload));
        }
    }

    let lookups_before = tunnels.stats().registry_lookups();
    let processed = tunnels.process_messages(msgs);

    assert_eq!(processed, 100);
    assert_eq!(tunnels.stats().registry_lookups() - lookups_before, 2);
    assert_eq!(x.handled.load(Ordering::Relaxed), 50);
    assert_eq!(y.handled.load(Ordering::Relaxed), 50);
    assert_eq!(x.flushes.load(Ordering::Relaxed), 1);
    assert_eq!(y.flushes.load(Ordering::Relaxed), 1);
}

/// With no tunnels at all, maintenance creates the zero-hop pair and the
/// exploratory pool from the configured values.
#[test]
fn test_zero_hops_fallback_and_exploratory_pool() {
    let env = make_env();
    let mut settings = TunnelSettings::default();
    settings.exploratory.inbound_length = 3;
    settings.exploratory.outbound_length = 1;
    settings.exploratory.inbound_quantity = 4;
    settings.exploratory.outbound_quantity = 5;
    let tunnels = Tunnels::new(env.ctx.clone(), settings);

    tunnels.manage_tunnels(seconds_since_epoch());

    assert_eq!(tunnels.count_inbound_tunnels(), 1);
    assert_eq!(tunnels.count_outbound_tunnels(), 1);

    let inbound = tunnels.get_next_inbound_tunnel().unwrap();
    assert!(inbound.is_zero_hops());
    assert!(inbound.is_established());
    // the zero-hop inbound is dispatchable by id
    assert!(tunnels.get_tunnel(inbound.core().tunnel_id()).is_some());

    let outbound = tunnels.get_next_outbound_tunnel().unwrap();
    assert!(outbound.is_zero_hops());
    assert!(outbound.is_established());

    let pool = tunnels.exploratory_pool().expect("exploratory pool");
    assert_eq!(pool.num_inbound_hops(), 3);
    assert_eq!(pool.num_outbound_hops(), 1);
    assert_eq!(pool.inbound_quantity(), 4);
    assert_eq!(pool.outbound_quantity(), 5);

    // a second sweep does not duplicate the fallbacks
    tunnels.manage_tunnels(seconds_since_epoch());
    assert_eq!(tunnels.count_inbound_tunnels(), 1);
}

/// A pool-less inbound tunnel triggers a symmetric outbound build with
/// the hops reversed.
#[test]
fn test_symmetric_auto_outbound() {
    let env = make_env();
    let tunnels = Tunnels::new(env.ctx.clone(), TunnelSettings::default());
    let hops = make_hops(&[0xA1, 0xB2]);

    let config = TunnelConfig::inbound(peers(&hops), LOCAL_HASH, true, &mut OsRng).unwrap();
    let record_size = config.record_size();
    let tunnel = InboundTunnel::new(config, env.ctx.clone(), Arc::new(Default::default()));
    tunnels.add_pending_inbound_tunnel(0x5151, tunnel.clone());
    tunnel.build(0x5151, None);

    let sent = env.transport.take_sent();
    assert_eq!(sent.len(), 1);
    // inbound build goes directly to the gateway hop
    assert_eq!(sent[0].0, hops[0].info.hash);

    let (reply, _) = simulate_chain(&hops, &sent[0].1.payload, record_size, &[0, 0]);
    // the reply for an inbound tunnel arrives at its endpoint: us
    let reply_msg = I2npMessage::new(I2npMessageType::ShortTunnelBuild, 0x5151, reply);
    tunnels.process_messages(vec![reply_msg]);

    assert!(tunnel.is_established());
    assert_eq!(tunnels.count_inbound_tunnels(), 1);
    assert!(tunnels.get_tunnel(tunnel.core().tunnel_id()).is_some());

    // the symmetric outbound build left for the reversed first hop
    let sent = env.transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, hops[1].info.hash);
    assert_eq!(sent[0].1.type_id, I2npMessageType::ShortTunnelBuild);
}

// ==================== further flows ====================

/// Five hops need the eight-record variant; fake slots fill the rest.
#[test]
fn test_five_hop_build_uses_eight_records() {
    let env = make_env();
    let tunnels = Tunnels::new(env.ctx.clone(), TunnelSettings::default());
    let hops = make_hops(&[1, 2, 3, 4, 5]);

    let config =
        TunnelConfig::outbound(peers(&hops), [0xBB; 32], 1, true, &mut OsRng).unwrap();
    let record_size = config.record_size();
    let tunnel = OutboundTunnel::new(config, env.ctx.clone());
    tunnels.add_pending_outbound_tunnel(0x4242, tunnel.clone());
    tunnel.build(0x4242, None);

    let sent = env.transport.take_sent();
    let payload = &sent[0].1.payload;
    assert_eq!(payload[0], 8);
    assert_eq!(payload.len(), 1 + 8 * record_size);

    let (reply, requests) = simulate_chain(&hops, payload, record_size, &[0; 5]);
    let slots: std::collections::HashSet<usize> =
        requests.iter().map(|(s, _)| *s).collect();
    assert_eq!(slots.len(), 5);

    let reply_msg = I2npMessage::new(I2npMessageType::ShortTunnelBuildReply, 0x4242, reply);
    tunnels.process_messages(vec![reply_msg]);
    assert!(tunnel.is_established());
    assert_eq!(tunnel.core().num_hops(), 5);
}

/// Legacy variable builds use the large record size end to end.
#[test]
fn test_legacy_variable_build() {
    let env = make_env();
    let tunnels = Tunnels::new(env.ctx.clone(), TunnelSettings::default());
    let hops = make_hops(&[7, 8]);

    let config =
        TunnelConfig::outbound(peers(&hops), [0xBB; 32], 1, false, &mut OsRng).unwrap();
    let record_size = config.record_size();
    let tunnel = OutboundTunnel::new(config, env.ctx.clone());
    tunnels.add_pending_outbound_tunnel(0x6161, tunnel.clone());
    tunnel.build(0x6161, None);

    let sent = env.transport.take_sent();
    assert_eq!(sent[0].1.type_id, I2npMessageType::VariableTunnelBuild);
    // no garlic key registration for legacy builds
    assert!(env.destination.garlic_keys.lock().unwrap().is_empty());

    let (reply, _) = simulate_chain(&hops, &sent[0].1.payload, record_size, &[0, 0]);
    let reply_msg =
        I2npMessage::new(I2npMessageType::VariableTunnelBuildReply, 0x6161, reply);
    tunnels.process_messages(vec![reply_msg]);
    assert!(tunnel.is_established());
}

/// A build sent through an outbound tunnel whose endpoint is not the
/// first hop gets wrapped for the first hop's router.
#[test]
fn test_build_via_outbound_tunnel_wraps_for_first_hop() {
    let env = make_env();
    let tunnels = Tunnels::new(env.ctx.clone(), TunnelSettings::default());
    let via = tunnels.create_zero_hops_outbound_tunnel(None);
    let hops = make_hops(&[0xA1, 0xB2]);

    let config = TunnelConfig::inbound(peers(&hops), LOCAL_HASH, true, &mut OsRng).unwrap();
    let record_size = config.record_size();
    let tunnel = InboundTunnel::new(config, env.ctx.clone(), Arc::new(Default::default()));
    tunnels.add_pending_inbound_tunnel(0x7171, tunnel.clone());
    tunnel.build(0x7171, Some(&via));

    let sent = env.transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, hops[0].info.hash);
    assert_eq!(sent[0].1.type_id, I2npMessageType::Garlic);

    // the first hop unwraps the envelope and finds the build request
    let unwrapped = unwrap_from_router(
        &hops[0].keys.secret_key_bytes(),
        &sent[0].1.payload,
    )
    .unwrap();
    let inner = I2npMessage::from_bytes(&unwrapped).unwrap();
    assert_eq!(inner.type_id, I2npMessageType::ShortTunnelBuild);

    let (reply, _) = simulate_chain(&hops, &inner.payload, record_size, &[0, 0]);
    let reply_msg = I2npMessage::new(I2npMessageType::ShortTunnelBuild, 0x7171, reply);
    tunnels.process_messages(vec![reply_msg]);
    assert!(tunnel.is_established());
}

/// Build messages that match no pending tunnel belong to the transit
/// subsystem; legacy build types are dropped with a warning.
#[test]
fn test_unmatched_build_goes_to_transit() {
    let env = make_env();
    let tunnels = Tunnels::new(env.ctx.clone(), TunnelSettings::default());

    let msgs = vec![
        I2npMessage::new(I2npMessageType::ShortTunnelBuild, 0x9999, vec![4u8; 64]),
        I2npMessage::new(I2npMessageType::TunnelBuild, 0x9999, vec![0u8; 64]),
        I2npMessage::new(I2npMessageType::TunnelBuildReply, 0x9999, vec![0u8; 64]),
    ];
    tunnels.process_messages(msgs);

    assert_eq!(env.transit.builds.lock().unwrap().len(), 1);
}

/// A gateway message whose inner length overruns the envelope is dropped.
#[test]
fn test_oversized_gateway_length_dropped() {
    let env = make_env();
    let tunnels = Tunnels::new(env.ctx.clone(), TunnelSettings::default());
    let inbound = tunnels.create_zero_hops_inbound_tunnel(None);

    let mut payload = Vec::new();
    payload.extend_from_slice(&inbound.core().tunnel_id().to_be_bytes());
    payload.extend_from_slice(&1000u16.to_be_bytes());
    payload.extend_from_slice(&[0u8; 16]);
    let msg = I2npMessage::new(I2npMessageType::TunnelGateway, 1, payload);
    tunnels.process_messages(vec![msg]);

    assert!(env.i2np.received.lock().unwrap().is_empty());
}

/// A well-formed gateway message reaches the local handler through the
/// zero-hop inbound tunnel.
#[test]
fn test_gateway_message_delivered_to_zero_hop_inbound() {
    let env = make_env();
    let tunnels = Tunnels::new(env.ctx.clone(), TunnelSettings::default());
    let inbound = tunnels.create_zero_hops_inbound_tunnel(None);

    let inner = I2npMessage::new(I2npMessageType::Garlic, 0x77, vec![1, 2, 3]);
    let gw = garliccraft_core::create_tunnel_gateway_msg(inbound.core().tunnel_id(), &inner);
    tunnels.process_messages(vec![gw]);

    let received = env.i2np.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].msg_id, 0x77);
    assert_eq!(received[0].payload, vec![1, 2, 3]);
    assert!(received[0].from.is_some());
}

/// A dropped build request marks its pending tunnel failed through the
/// drop hook.
#[test]
fn test_dropped_build_request_marks_failed() {
    struct DroppingTransport;
    impl Transport for DroppingTransport {
        fn send_message(&self, _to: &RouterHash, msg: I2npMessage) {
            drop(msg);
        }
        fn is_online(&self) -> bool {
            false
        }
    }

    let env = make_env();
    let ctx = Arc::new(RouterContext {
        local_hash: LOCAL_HASH,
        transport: Arc::new(DroppingTransport),
        netdb: env.netdb.clone(),
        profiles: env.profiles.clone(),
        local_destination: env.destination.clone(),
        i2np: env.i2np.clone(),
        transit: env.transit.clone(),
    });
    let tunnels = Tunnels::new(ctx.clone(), TunnelSettings::default());
    let hops = make_hops(&[0xA1]);

    let config = TunnelConfig::inbound(peers(&hops), LOCAL_HASH, true, &mut OsRng).unwrap();
    let tunnel = InboundTunnel::new(config, ctx, Arc::new(Default::default()));
    tunnels.add_pending_inbound_tunnel(0x8181, tunnel.clone());
    tunnel.build(0x8181, None);

    assert_eq!(tunnel.core().state(), TunnelState::BuildFailed);

    // the sweep then clears it and counts the failure
    tunnels.manage_tunnels(seconds_since_epoch());
    assert!(tunnels.get_pending_inbound_tunnel(0x8181).is_none());
    assert_eq!(tunnels.total_failed_tunnel_creations(), 1);
}

/// An established pending entry resolves to a success on the next sweep.
#[test]
fn test_established_pending_counts_success() {
    let env = make_env();
    let tunnels = Tunnels::new(env.ctx.clone(), TunnelSettings::default());
    let hops = make_hops(&[0xA1, 0xB2]);

    let config =
        TunnelConfig::outbound(peers(&hops), [0xBB; 32], 1, true, &mut OsRng).unwrap();
    let record_size = config.record_size();
    let tunnel = OutboundTunnel::new(config, env.ctx.clone());
    tunnels.add_pending_outbound_tunnel(0x9292, tunnel.clone());
    tunnel.build(0x9292, None);

    let sent = env.transport.take_sent();
    let (reply, _) = simulate_chain(&hops, &sent[0].1.payload, record_size, &[0, 0]);
    tunnels.process_messages(vec![I2npMessage::new(
        I2npMessageType::ShortTunnelBuildReply,
        0x9292,
        reply,
    )]);
    assert!(tunnel.is_established());

    tunnels.manage_tunnels(seconds_since_epoch());
    assert_eq!(tunnels.total_successive_tunnel_creations(), 1);
    assert_eq!(tunnels.total_failed_tunnel_creations(), 0);
    assert!(tunnels.tunnel_creation_success_rate() > 0.1);
}

/// The worker can be started and stopped cleanly.
#[tokio::test]
async fn test_worker_start_stop() {
    let env = make_env();
    let tunnels = Tunnels::new(env.ctx.clone(), TunnelSettings::default());
    tunnels.start();
    tunnels.post_tunnel_data(I2npMessage::new(
        I2npMessageType::ShortTunnelBuild,
        1,
        vec![4u8; 64],
    ));
    tunnels.stop().await;
}
