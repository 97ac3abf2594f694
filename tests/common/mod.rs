//! Mock southbound shared by the end-to-end tests.
//!
//! Interfaces (`/if/<name>`), the addresses they derive
//! (`/if/<name>/addr/<ip>`), routes (`/route/<name>`, depending on their
//! outgoing interface) and bridge domains (`/bd/<name>`, depending on every
//! member interface) are kept in one in-memory table. Every attempted
//! operation is logged, so tests can assert the order the scheduler called
//! the descriptors in.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use kvsched::{
    Dependency, DescriptorCapabilities, DescriptorError, DescriptorResult, KeyValuePair, KvScheduler,
    KvWithMetadata, MemMetadataMap, Metadata, MetadataMap, Scheduler, SchedulerConfig, TypedAdapter,
    TypedDescriptor, ValueOrigin, ValueRef, value,
};
use parking_lot::Mutex;

pub const IF_PREFIX: &str = "/if/";
pub const ROUTE_PREFIX: &str = "/route/";
pub const BD_PREFIX: &str = "/bd/";

// ============================================================================
// Values
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    pub name: String,
    pub mtu: u32,
    pub addrs: Vec<String>,
}

/// Assigned by the mock SB on create.
#[derive(Debug, Clone, PartialEq)]
pub struct IfMeta {
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfAddr {
    pub iface: String,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub dst: String,
    pub iface: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeDomain {
    pub ifaces: Vec<String>,
}

pub fn iface(name: &str, mtu: u32, addrs: &[&str]) -> ValueRef {
    value(Interface {
        name: name.to_string(),
        mtu,
        addrs: addrs.iter().map(|a| a.to_string()).collect(),
    })
}

pub fn route(dst: &str, iface: &str) -> ValueRef {
    value(Route { dst: dst.to_string(), iface: iface.to_string() })
}

pub fn bridge_domain(ifaces: &[&str]) -> ValueRef {
    value(BridgeDomain { ifaces: ifaces.iter().map(|i| i.to_string()).collect() })
}

pub fn if_key(name: &str) -> String {
    format!("{IF_PREFIX}{name}")
}

pub fn addr_key(iface: &str, addr: &str) -> String {
    format!("{IF_PREFIX}{iface}/addr/{addr}")
}

pub fn route_key(name: &str) -> String {
    format!("{ROUTE_PREFIX}{name}")
}

pub fn bd_key(name: &str) -> String {
    format!("{BD_PREFIX}{name}")
}

// ============================================================================
// Southbound
// ============================================================================

struct Injected {
    remaining: u32,
    retriable: bool,
}

#[derive(Default)]
struct SbState {
    values: BTreeMap<String, (ValueRef, Option<Metadata>)>,
    ops: Vec<String>,
    failures: HashMap<String, Injected>,
    next_index: u32,
}

impl SbState {
    /// Log the attempt; consumes one injected failure for `key` if any.
    fn attempt(&mut self, op: &str, key: &str) -> DescriptorResult<()> {
        if let Some(injected) = self.failures.get_mut(key) {
            if injected.remaining > 0 {
                injected.remaining -= 1;
                self.ops.push(format!("{op} {key} FAILED"));
                return Err(if injected.retriable {
                    DescriptorError::failed(format!("injected {op} failure"))
                } else {
                    DescriptorError::Unsupported { descriptor: "mock".to_string(), operation: "injected" }
                });
            }
        }
        self.ops.push(format!("{op} {key}"));
        Ok(())
    }
}

/// The "external system" the scheduler reconciles.
#[derive(Default)]
pub struct MockSb {
    state: Mutex<SbState>,
}

impl MockSb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` operations on `key`.
    pub fn fail_next(&self, key: &str, times: u32, retriable: bool) {
        self.state.lock().failures.insert(key.to_string(), Injected { remaining: times, retriable });
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().ops.clone()
    }

    pub fn take_ops(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().ops)
    }

    pub fn get(&self, key: &str) -> Option<ValueRef> {
        self.state.lock().values.get(key).map(|(v, _)| v.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().values.keys().cloned().collect()
    }

    /// A change made behind the scheduler's back.
    pub fn put_external(&self, key: &str, value: ValueRef) {
        self.state.lock().values.insert(key.to_string(), (value, None));
    }

    pub fn remove_external(&self, key: &str) {
        self.state.lock().values.remove(key);
    }

    fn dump<T: 'static>(&self, accept: impl Fn(&str) -> bool) -> Vec<KvWithMetadata> {
        self.state
            .lock()
            .values
            .iter()
            .filter(|(k, (v, _))| accept(k) && v.downcast_ref::<T>().is_some())
            .map(|(k, (v, m))| KvWithMetadata {
                key: k.clone(),
                value: Some(v.clone()),
                metadata: m.clone(),
                origin: ValueOrigin::Unknown,
            })
            .collect()
    }
}

// ============================================================================
// Descriptors
// ============================================================================

pub struct InterfaceDescriptor {
    pub sb: Arc<MockSb>,
}

fn is_interface_key(key: &str) -> bool {
    key.starts_with(IF_PREFIX) && !key.contains("/addr/")
}

impl TypedDescriptor for InterfaceDescriptor {
    type Value = Interface;
    type Metadata = IfMeta;

    fn name(&self) -> &str {
        "interface"
    }

    fn key_selector(&self, key: &str) -> bool {
        is_interface_key(key)
    }

    fn capabilities(&self) -> DescriptorCapabilities {
        DescriptorCapabilities { supports_update: true, supports_retrieve: true, with_metadata: true }
    }

    fn key_label(&self, key: &str) -> String {
        key.trim_start_matches(IF_PREFIX).to_string()
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        Some(IF_PREFIX)
    }

    fn validate(&self, _key: &str, value: &Interface) -> DescriptorResult<()> {
        if value.mtu == 0 {
            return Err(DescriptorError::invalid("mtu must be positive", &["mtu"]));
        }
        Ok(())
    }

    fn create(&self, key: &str, value: &Interface) -> DescriptorResult<Option<IfMeta>> {
        let mut sb = self.sb.state.lock();
        sb.attempt("create", key)?;
        sb.next_index += 1;
        let meta = IfMeta { index: sb.next_index };
        sb.values.insert(key.to_string(), (kvsched::value(value.clone()), Some(Arc::new(meta.clone()) as Metadata)));
        Ok(Some(meta))
    }

    fn delete(&self, key: &str, _value: &Interface, _metadata: Option<&IfMeta>) -> DescriptorResult<()> {
        let mut sb = self.sb.state.lock();
        sb.attempt("delete", key)?;
        sb.values.remove(key);
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        _old: &Interface,
        new: &Interface,
        old_metadata: Option<&IfMeta>,
    ) -> DescriptorResult<Option<IfMeta>> {
        let mut sb = self.sb.state.lock();
        sb.attempt("update", key)?;
        let meta = old_metadata.cloned();
        let stored = meta.clone().map(|m| Arc::new(m) as Metadata);
        sb.values.insert(key.to_string(), (kvsched::value(new.clone()), stored));
        Ok(meta)
    }

    fn retrieve(&self, _correlate: &[KvWithMetadata]) -> DescriptorResult<Vec<KvWithMetadata>> {
        Ok(self.sb.dump::<Interface>(is_interface_key))
    }

    fn derived_values(&self, key: &str, value: &Interface) -> Vec<KeyValuePair> {
        let name = key.trim_start_matches(IF_PREFIX);
        value
            .addrs
            .iter()
            .map(|addr| {
                KeyValuePair::new(
                    addr_key(name, addr),
                    kvsched::value(IfAddr { iface: name.to_string(), addr: addr.clone() }),
                )
            })
            .collect()
    }

    fn metadata_map_factory(&self) -> Arc<dyn MetadataMap> {
        Arc::new(MemMetadataMap::new("interface").with_index("index", |meta| {
            meta.downcast_ref::<IfMeta>().map(|m| vec![m.index.to_string()]).unwrap_or_default()
        }))
    }
}

/// Addresses are derived from interfaces; they are never retrieved on their
/// own.
pub struct AddrDescriptor {
    pub sb: Arc<MockSb>,
}

impl TypedDescriptor for AddrDescriptor {
    type Value = IfAddr;
    type Metadata = ();

    fn name(&self) -> &str {
        "if-addr"
    }

    fn key_selector(&self, key: &str) -> bool {
        key.starts_with(IF_PREFIX) && key.contains("/addr/")
    }

    fn create(&self, key: &str, value: &IfAddr) -> DescriptorResult<Option<()>> {
        let mut sb = self.sb.state.lock();
        sb.attempt("create", key)?;
        sb.values.insert(key.to_string(), (kvsched::value(value.clone()), None));
        Ok(None)
    }

    fn delete(&self, key: &str, _value: &IfAddr, _metadata: Option<&()>) -> DescriptorResult<()> {
        let mut sb = self.sb.state.lock();
        sb.attempt("delete", key)?;
        sb.values.remove(key);
        Ok(())
    }
}

/// Routes cannot be updated in place: every change is a re-create.
pub struct RouteDescriptor {
    pub sb: Arc<MockSb>,
}

impl TypedDescriptor for RouteDescriptor {
    type Value = Route;
    type Metadata = ();

    fn name(&self) -> &str {
        "route"
    }

    fn key_selector(&self, key: &str) -> bool {
        key.starts_with(ROUTE_PREFIX)
    }

    fn capabilities(&self) -> DescriptorCapabilities {
        DescriptorCapabilities { supports_update: false, supports_retrieve: true, with_metadata: false }
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        Some(ROUTE_PREFIX)
    }

    fn create(&self, key: &str, value: &Route) -> DescriptorResult<Option<()>> {
        let mut sb = self.sb.state.lock();
        sb.attempt("create", key)?;
        sb.values.insert(key.to_string(), (kvsched::value(value.clone()), None));
        Ok(None)
    }

    fn delete(&self, key: &str, _value: &Route, _metadata: Option<&()>) -> DescriptorResult<()> {
        let mut sb = self.sb.state.lock();
        sb.attempt("delete", key)?;
        sb.values.remove(key);
        Ok(())
    }

    fn retrieve(&self, _correlate: &[KvWithMetadata]) -> DescriptorResult<Vec<KvWithMetadata>> {
        Ok(self.sb.dump::<Route>(|k| k.starts_with(ROUTE_PREFIX)))
    }

    fn dependencies(&self, _key: &str, value: &Route) -> Vec<Dependency> {
        vec![Dependency::on_key("interface", if_key(&value.iface))]
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        vec!["interface".to_string()]
    }
}

/// Keys sort before the interfaces they depend on.
pub struct BridgeDomainDescriptor {
    pub sb: Arc<MockSb>,
}

impl TypedDescriptor for BridgeDomainDescriptor {
    type Value = BridgeDomain;
    type Metadata = ();

    fn name(&self) -> &str {
        "bridge-domain"
    }

    fn key_selector(&self, key: &str) -> bool {
        key.starts_with(BD_PREFIX)
    }

    fn create(&self, key: &str, value: &BridgeDomain) -> DescriptorResult<Option<()>> {
        let mut sb = self.sb.state.lock();
        sb.attempt("create", key)?;
        sb.values.insert(key.to_string(), (kvsched::value(value.clone()), None));
        Ok(None)
    }

    fn delete(&self, key: &str, _value: &BridgeDomain, _metadata: Option<&()>) -> DescriptorResult<()> {
        let mut sb = self.sb.state.lock();
        sb.attempt("delete", key)?;
        sb.values.remove(key);
        Ok(())
    }

    fn dependencies(&self, _key: &str, value: &BridgeDomain) -> Vec<Dependency> {
        value
            .ifaces
            .iter()
            .map(|name| Dependency::on_key(format!("member-{name}"), if_key(name)))
            .collect()
    }
}

// ============================================================================
// Setup
// ============================================================================

pub fn quiet_config() -> SchedulerConfig {
    SchedulerConfig { print_txn_summary: false, ..SchedulerConfig::default() }
}

/// Scheduler with the four mock descriptors registered.
pub fn setup_with(config: SchedulerConfig) -> (Scheduler, Arc<MockSb>) {
    let sb = MockSb::new();
    let scheduler = Scheduler::new(config);
    scheduler
        .register_descriptor(TypedAdapter::into_arc(InterfaceDescriptor { sb: sb.clone() }))
        .unwrap();
    scheduler
        .register_descriptor(TypedAdapter::into_arc(AddrDescriptor { sb: sb.clone() }))
        .unwrap();
    scheduler
        .register_descriptor(TypedAdapter::into_arc(RouteDescriptor { sb: sb.clone() }))
        .unwrap();
    scheduler
        .register_descriptor(TypedAdapter::into_arc(BridgeDomainDescriptor { sb: sb.clone() }))
        .unwrap();
    (scheduler, sb)
}

pub fn setup() -> (Scheduler, Arc<MockSb>) {
    setup_with(quiet_config())
}

/// Poll `cond` every few milliseconds until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
