//! Shared mock collaborators for unit tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use garliccraft_core::{I2npMessage, RouterHash, RouterInfo};

use crate::traits::{
    I2npHandler, LocalDestination, NetDb, ProfileEvents, RouterContext, TransitHandler, Transport,
};

pub(crate) const LOCAL_HASH: RouterHash = [0xEE; 32];

#[derive(Default)]
pub(crate) struct MockTransport {
    pub sent: Mutex<Vec<(RouterHash, I2npMessage)>>,
    pub online: AtomicBool,
}

impl Transport for MockTransport {
    fn send_message(&self, to: &RouterHash, mut msg: I2npMessage) {
        // accepted by a live connection
        msg.disarm();
        self.sent.lock().unwrap().push((*to, msg));
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub(crate) struct MockNetDb {
    pub routers: Mutex<Vec<RouterInfo>>,
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
pub(crate) struct MockProfiles {
    pub build_responses: Mutex<Vec<(RouterHash, u8)>>,
    pub non_replied: Mutex<Vec<RouterHash>>,
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
pub(crate) struct MockDestination {
    pub lease_set_updated: AtomicBool,
    pub garlic_keys: Mutex<Vec<([u8; 32], u64)>>,
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
pub(crate) struct MockI2np {
    pub received: Mutex<Vec<I2npMessage>>,
}

impl I2npHandler for MockI2np {
    fn handle_message(&self, msg: I2npMessage) {
        self.received.lock().unwrap().push(msg);
    }
}

#[derive(Default)]
pub(crate) struct MockTransit {
    pub builds: Mutex<Vec<I2npMessage>>,
}

impl TransitHandler for MockTransit {
    fn post_transit_build(&self, msg: I2npMessage) {
        self.builds.lock().unwrap().push(msg);
    }
}

pub(crate) struct TestEnv {
    pub ctx: Arc<RouterContext>,
    pub transport: Arc<MockTransport>,
    pub netdb: Arc<MockNetDb>,
    pub profiles: Arc<MockProfiles>,
    pub destination: Arc<MockDestination>,
    pub i2np: Arc<MockI2np>,
    pub transit: Arc<MockTransit>,
}

pub(crate) fn make_env() -> TestEnv {
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

pub(crate) fn make_context() -> Arc<RouterContext> {
    make_env().ctx
}
