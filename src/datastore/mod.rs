//! The live routing datastore: single source of truth for the data plane.
//!
//! Reconcilers and the metrics poller are the only mutators. Request-path
//! code reads atomically swapped snapshots and never blocks on control-plane
//! events; subscribers receive change events from a dispatcher task fed by a
//! buffered channel, so mutators never block on subscribers either.

pub mod metrics;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::HeaderMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::crd::{
    Destination, Engine, ModelRouteSpec, ModelServerSpec, StringMatch, validate_model_route,
    validate_model_server,
};
use crate::errors::GatewayError;

/* ============================= KEYS ============================= */

/// Entities are addressed by `namespace/name` identifiers everywhere;
/// no object pointers cross component boundaries.
pub type Key = String;

pub fn object_key(namespace: &str, name: &str) -> Key {
    format!("{namespace}/{name}")
}

fn key_namespace(key: &str) -> &str {
    key.split_once('/').map(|(ns, _)| ns).unwrap_or_default()
}

/* ============================= EVENTS ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    ModelRoute,
    ModelServer,
    Pod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: ObjectKind,
    pub action: EventAction,
    pub key: Key,
}

pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/* ============================= POD INFO ============================= */

/// Rolling metrics snapshot for one backend replica.
///
/// Histogram-derived values (`time_to_first_token`, `time_per_output_token`)
/// are delta-averages between consecutive scrapes; the raw sums and counts
/// of the previous scrape are retained for the next delta.
#[derive(Debug, Clone, Default)]
pub struct PodMetricsSnapshot {
    pub gpu_cache_usage: f64,
    pub waiting_requests: u64,
    pub running_requests: u64,
    /// Seconds, delta-averaged.
    pub time_to_first_token: f64,
    /// Seconds, delta-averaged.
    pub time_per_output_token: f64,

    pub ttft_sum: f64,
    pub ttft_count: u64,
    pub tpot_sum: f64,
    pub tpot_count: u64,
}

/// One ready backend replica.
///
/// Immutable except for the metrics snapshot, which the poller refreshes in
/// place. Ownership links to ModelServers live in the datastore indexes,
/// not here.
#[derive(Debug)]
pub struct PodInfo {
    pub key: Key,
    pub namespace: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub metrics_port: u16,
    pub engine: Engine,
    pub labels: BTreeMap<String, String>,
    /// Models the replica reports as loaded.
    pub models: Vec<String>,
    pub metrics: RwLock<PodMetricsSnapshot>,
}

impl PodInfo {
    pub fn metrics_snapshot(&self) -> PodMetricsSnapshot {
        self.metrics.read().clone()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn metrics_url(&self) -> String {
        format!("http://{}:{}/metrics", self.ip, self.metrics_port)
    }
}

/// What the Pod reconciler knows about a ready pod; the datastore resolves
/// engine and ports from the owning ModelServer.
#[derive(Debug, Clone)]
pub struct PodSeed {
    pub namespace: String,
    pub name: String,
    pub ip: String,
    pub labels: BTreeMap<String, String>,
    pub models: Vec<String>,
}

/* ============================= COMPILED ROUTES ============================= */

#[derive(Debug)]
pub enum CompiledStringMatch {
    Exact(String),
    Prefix(String),
    Regex(regex::Regex),
}

impl CompiledStringMatch {
    fn compile(m: &StringMatch) -> Result<Self, GatewayError> {
        if let Some(v) = &m.exact {
            Ok(CompiledStringMatch::Exact(v.clone()))
        } else if let Some(v) = &m.prefix {
            Ok(CompiledStringMatch::Prefix(v.clone()))
        } else if let Some(v) = &m.regex {
            let anchored = format!("^(?:{v})$");
            let re = regex::Regex::new(&anchored)
                .map_err(|e| GatewayError::Config(format!("invalid regex {v:?}: {e}")))?;
            Ok(CompiledStringMatch::Regex(re))
        } else {
            Err(GatewayError::Config("empty string match".into()))
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            CompiledStringMatch::Exact(v) => value == v,
            CompiledStringMatch::Prefix(v) => value.starts_with(v.as_str()),
            CompiledStringMatch::Regex(re) => re.is_match(value),
        }
    }
}

#[derive(Debug)]
pub struct CompiledMatch {
    /// Header names lowercased at compile time.
    pub headers: Vec<(String, CompiledStringMatch)>,
    pub uri: Option<CompiledStringMatch>,
}

impl CompiledMatch {
    fn matches(&self, headers: &HeaderMap, uri: &str) -> bool {
        for (name, matcher) in &self.headers {
            let value = headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if !matcher.matches(value) {
                return false;
            }
        }
        match &self.uri {
            Some(matcher) => matcher.matches(uri),
            None => true,
        }
    }
}

#[derive(Debug)]
pub struct CompiledRule {
    pub matches: Vec<CompiledMatch>,
    pub destinations: Vec<Destination>,
}

/// A ModelRoute with its matchers compiled once at apply time, so the hot
/// path never parses a regex.
#[derive(Debug)]
pub struct RouteState {
    pub key: Key,
    pub spec: ModelRouteSpec,
    pub rules: Vec<CompiledRule>,
}

impl RouteState {
    fn compile(key: Key, spec: ModelRouteSpec) -> Result<Self, GatewayError> {
        let mut rules = Vec::with_capacity(spec.rules.len());
        for rule in &spec.rules {
            let mut compiled_matches = Vec::new();
            for m in rule.matches.iter().flatten() {
                let headers = m
                    .headers
                    .iter()
                    .flatten()
                    .map(|h| {
                        CompiledStringMatch::compile(&h.value)
                            .map(|c| (h.name.to_ascii_lowercase(), c))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let uri = m.uri.as_ref().map(CompiledStringMatch::compile).transpose()?;
                compiled_matches.push(CompiledMatch { headers, uri });
            }
            rules.push(CompiledRule {
                matches: compiled_matches,
                destinations: rule.destinations.clone(),
            });
        }
        Ok(Self { key, spec, rules })
    }
}

#[derive(Debug)]
pub struct ServerState {
    pub key: Key,
    pub spec: ModelServerSpec,
}

/// Prefill and decode pods of one PD group value.
#[derive(Debug, Clone, Default)]
pub struct PdGroupPods {
    pub prefill: Vec<Arc<PodInfo>>,
    pub decode: Vec<Arc<PodInfo>>,
}

/* ============================= DATASTORE ============================= */

type Snapshot<T> = ArcSwap<HashMap<Key, T>>;

pub struct Datastore {
    routes: Snapshot<Arc<RouteState>>,
    servers: Snapshot<Arc<ServerState>>,
    pods: Snapshot<Arc<PodInfo>>,

    // Derived indexes, rebuilt after every mutation and swapped atomically.
    model_to_route: ArcSwap<HashMap<String, Key>>,
    lora_to_route: ArcSwap<HashMap<String, Key>>,
    server_to_pods: ArcSwap<HashMap<Key, Vec<Key>>>,
    pod_to_servers: ArcSwap<HashMap<Key, Vec<Key>>>,
    pd_groups: ArcSwap<HashMap<Key, HashMap<String, PdGroupPods>>>,

    route_lock: Mutex<()>,
    server_lock: Mutex<()>,
    pod_lock: Mutex<()>,
    index_lock: Mutex<()>,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    callbacks: RwLock<Vec<(ObjectKind, Callback)>>,

    http: reqwest::Client,
}

impl Default for Datastore {
    fn default() -> Self {
        Self::new()
    }
}

impl Datastore {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            routes: ArcSwap::from_pointee(HashMap::new()),
            servers: ArcSwap::from_pointee(HashMap::new()),
            pods: ArcSwap::from_pointee(HashMap::new()),
            model_to_route: ArcSwap::from_pointee(HashMap::new()),
            lora_to_route: ArcSwap::from_pointee(HashMap::new()),
            server_to_pods: ArcSwap::from_pointee(HashMap::new()),
            pod_to_servers: ArcSwap::from_pointee(HashMap::new()),
            pd_groups: ArcSwap::from_pointee(HashMap::new()),
            route_lock: Mutex::new(()),
            server_lock: Mutex::new(()),
            pod_lock: Mutex::new(()),
            index_lock: Mutex::new(()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            callbacks: RwLock::new(Vec::new()),
            http: reqwest::Client::new(),
        }
    }

    /* ------------------------- subscriptions ------------------------- */

    /// Subscribe to change events of one object kind. Callbacks run on the
    /// dispatcher task, never on the mutator's thread.
    pub fn register_callback(&self, kind: ObjectKind, callback: Callback) {
        self.callbacks.write().push((kind, callback));
    }

    /// Drain the event channel and invoke matching callbacks. Spawned once
    /// at startup; returns when the datastore is dropped.
    pub async fn run_dispatcher(self: Arc<Self>) {
        let mut rx = match self.events_rx.lock().take() {
            Some(rx) => rx,
            None => {
                warn!("datastore_dispatcher_already_running");
                return;
            }
        };
        while let Some(event) = rx.recv().await {
            let callbacks = self.callbacks.read().clone();
            for (kind, callback) in &callbacks {
                if *kind == event.kind {
                    callback(&event);
                }
            }
        }
    }

    fn emit(&self, kind: ObjectKind, action: EventAction, key: &str) {
        let _ = self.events_tx.send(Event {
            kind,
            action,
            key: key.to_string(),
        });
    }

    /* ------------------------- route mutators ------------------------- */

    pub fn add_or_update_model_route(
        &self,
        namespace: &str,
        name: &str,
        spec: ModelRouteSpec,
    ) -> Result<(), GatewayError> {
        validate_model_route(&spec)?;
        let key = object_key(namespace, name);
        let state = Arc::new(RouteState::compile(key.clone(), spec)?);

        let action = {
            let _g = self.route_lock.lock();
            let mut map = HashMap::clone(&self.routes.load());
            let action = if map.insert(key.clone(), state).is_some() {
                EventAction::Update
            } else {
                EventAction::Add
            };
            self.routes.store(Arc::new(map));
            action
        };

        self.rebuild_indexes();
        self.emit(ObjectKind::ModelRoute, action, &key);
        info!(route = %key, "model_route_applied");
        Ok(())
    }

    pub fn delete_model_route(&self, key: &str) {
        let removed = {
            let _g = self.route_lock.lock();
            let mut map = HashMap::clone(&self.routes.load());
            let removed = map.remove(key).is_some();
            self.routes.store(Arc::new(map));
            removed
        };
        if removed {
            self.rebuild_indexes();
            self.emit(ObjectKind::ModelRoute, EventAction::Delete, key);
            info!(route = %key, "model_route_deleted");
        }
    }

    /* ------------------------- server mutators ------------------------- */

    pub fn add_or_update_model_server(
        &self,
        namespace: &str,
        name: &str,
        spec: ModelServerSpec,
    ) -> Result<(), GatewayError> {
        validate_model_server(&spec)?;
        let key = object_key(namespace, name);
        let state = Arc::new(ServerState {
            key: key.clone(),
            spec,
        });

        let action = {
            let _g = self.server_lock.lock();
            let mut map = HashMap::clone(&self.servers.load());
            let action = if map.insert(key.clone(), state).is_some() {
                EventAction::Update
            } else {
                EventAction::Add
            };
            self.servers.store(Arc::new(map));
            action
        };

        // A new server may retroactively claim existing pods, so pods whose
        // engine/port were resolved from owning servers are re-derived.
        self.refresh_pod_resolution();
        self.rebuild_indexes();
        self.emit(ObjectKind::ModelServer, action, &key);
        info!(server = %key, "model_server_applied");
        Ok(())
    }

    pub fn delete_model_server(&self, key: &str) {
        let removed = {
            let _g = self.server_lock.lock();
            let mut map = HashMap::clone(&self.servers.load());
            let removed = map.remove(key).is_some();
            self.servers.store(Arc::new(map));
            removed
        };
        if removed {
            self.refresh_pod_resolution();
            self.rebuild_indexes();
            self.emit(ObjectKind::ModelServer, EventAction::Delete, key);
            info!(server = %key, "model_server_deleted");
        }
    }

    /* ------------------------- pod mutators ------------------------- */

    pub fn add_or_update_pod(&self, seed: PodSeed) {
        let key = object_key(&seed.namespace, &seed.name);
        let pod = Arc::new(self.resolve_pod(&key, &seed, None));

        let action = {
            let _g = self.pod_lock.lock();
            let mut map = HashMap::clone(&self.pods.load());
            let previous = map.insert(key.clone(), pod);
            if let Some(prev) = &previous {
                // Keep the rolling metrics across control-plane updates.
                let snapshot = prev.metrics_snapshot();
                *map[&key].metrics.write() = snapshot;
            }
            self.pods.store(Arc::new(map));
            if previous.is_some() {
                EventAction::Update
            } else {
                EventAction::Add
            }
        };

        self.rebuild_indexes();
        self.emit(ObjectKind::Pod, action, &key);
        info!(pod = %key, "pod_applied");
    }

    pub fn delete_pod(&self, key: &str) {
        let removed = {
            let _g = self.pod_lock.lock();
            let mut map = HashMap::clone(&self.pods.load());
            let removed = map.remove(key).is_some();
            self.pods.store(Arc::new(map));
            removed
        };
        if removed {
            self.rebuild_indexes();
            self.emit(ObjectKind::Pod, EventAction::Delete, key);
            info!(pod = %key, "pod_removed");
        }
    }

    /// Engine and ports come from the owning ModelServer; when several
    /// servers claim the pod, the lowest key wins for scrape settings.
    fn resolve_pod(&self, key: &str, seed: &PodSeed, keep: Option<PodMetricsSnapshot>) -> PodInfo {
        let servers = self.servers.load();
        let mut owners: Vec<&Arc<ServerState>> = servers
            .values()
            .filter(|s| {
                key_namespace(&s.key) == seed.namespace
                    && selector_matches(&s.spec.selector, &seed.labels)
            })
            .collect();
        owners.sort_by(|a, b| a.key.cmp(&b.key));

        let (engine, port, metrics_port) = match owners.first() {
            Some(s) => (s.spec.engine, s.spec.port, s.spec.metrics_port()),
            None => (Engine::default(), 8000, 8000),
        };

        PodInfo {
            key: key.to_string(),
            namespace: seed.namespace.clone(),
            name: seed.name.clone(),
            ip: seed.ip.clone(),
            port,
            metrics_port,
            engine,
            labels: seed.labels.clone(),
            models: seed.models.clone(),
            metrics: RwLock::new(keep.unwrap_or_default()),
        }
    }

    /// Re-derive engine/port resolution for every pod after server changes.
    fn refresh_pod_resolution(&self) {
        let _g = self.pod_lock.lock();
        let current = self.pods.load();
        let mut map = HashMap::with_capacity(current.len());
        for (key, pod) in current.iter() {
            let seed = PodSeed {
                namespace: pod.namespace.clone(),
                name: pod.name.clone(),
                ip: pod.ip.clone(),
                labels: pod.labels.clone(),
                models: pod.models.clone(),
            };
            let resolved = self.resolve_pod(key, &seed, Some(pod.metrics_snapshot()));
            map.insert(key.clone(), Arc::new(resolved));
        }
        self.pods.store(Arc::new(map));
    }

    /* ------------------------- derived indexes ------------------------- */

    fn rebuild_indexes(&self) {
        let _g = self.index_lock.lock();
        let routes = self.routes.load_full();
        let servers = self.servers.load_full();
        let pods = self.pods.load_full();

        let mut model_to_route: HashMap<String, Key> = HashMap::new();
        let mut lora_to_route: HashMap<String, Key> = HashMap::new();
        let mut route_keys: Vec<&Key> = routes.keys().collect();
        route_keys.sort();
        for key in route_keys {
            let route = &routes[key];
            if let Some(existing) = model_to_route.get(&route.spec.model_name) {
                warn!(
                    model = %route.spec.model_name,
                    kept = %existing,
                    ignored = %key,
                    "duplicate_model_route"
                );
            } else {
                model_to_route.insert(route.spec.model_name.clone(), key.clone());
                for lora in route.spec.lora_adapters.iter().flatten() {
                    lora_to_route.entry(lora.clone()).or_insert_with(|| key.clone());
                }
            }
        }

        let mut server_to_pods: HashMap<Key, Vec<Key>> = HashMap::new();
        let mut pod_to_servers: HashMap<Key, Vec<Key>> = HashMap::new();
        let mut pd_groups: HashMap<Key, HashMap<String, PdGroupPods>> = HashMap::new();

        for server in servers.values() {
            let server_ns = key_namespace(&server.key);
            let mut members: Vec<Key> = pods
                .values()
                .filter(|p| {
                    p.namespace == server_ns && selector_matches(&server.spec.selector, &p.labels)
                })
                .map(|p| p.key.clone())
                .collect();
            members.sort();

            for pod_key in &members {
                pod_to_servers
                    .entry(pod_key.clone())
                    .or_default()
                    .push(server.key.clone());
            }

            if let Some(pd) = &server.spec.pd_group {
                let groups = pd_groups.entry(server.key.clone()).or_default();
                for pod_key in &members {
                    let pod = &pods[pod_key];
                    let Some(group_value) = pod.labels.get(&pd.key) else {
                        continue;
                    };
                    let entry = groups.entry(group_value.clone()).or_default();
                    if selector_matches(&pd.prefill_selector, &pod.labels) {
                        entry.prefill.push(pod.clone());
                    }
                    if selector_matches(&pd.decode_selector, &pod.labels) {
                        entry.decode.push(pod.clone());
                    }
                }
                for group in groups.values_mut() {
                    group.prefill.sort_by(|a, b| a.key.cmp(&b.key));
                    group.decode.sort_by(|a, b| a.key.cmp(&b.key));
                }
            }

            server_to_pods.insert(server.key.clone(), members);
        }
        for servers in pod_to_servers.values_mut() {
            servers.sort();
        }

        self.model_to_route.store(Arc::new(model_to_route));
        self.lora_to_route.store(Arc::new(lora_to_route));
        self.server_to_pods.store(Arc::new(server_to_pods));
        self.pod_to_servers.store(Arc::new(pod_to_servers));
        self.pd_groups.store(Arc::new(pd_groups));
    }

    /* ------------------------- readers ------------------------- */

    pub fn get_model_route(&self, key: &str) -> Option<Arc<RouteState>> {
        self.routes.load().get(key).cloned()
    }

    pub fn get_model_server(&self, key: &str) -> Option<Arc<ServerState>> {
        self.servers.load().get(key).cloned()
    }

    pub fn get_pod(&self, key: &str) -> Option<Arc<PodInfo>> {
        self.pods.load().get(key).cloned()
    }

    pub fn list_pods(&self) -> Vec<Arc<PodInfo>> {
        let mut pods: Vec<_> = self.pods.load().values().cloned().collect();
        pods.sort_by(|a, b| a.key.cmp(&b.key));
        pods
    }

    /// Model names (including LoRA adapters) the gateway currently serves.
    pub fn list_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .model_to_route
            .load()
            .keys()
            .chain(self.lora_to_route.load().keys())
            .cloned()
            .collect();
        models.sort();
        models.dedup();
        models
    }

    /// Healthy pods of one ModelServer, as a fresh slice.
    pub fn pods_by_model_server(&self, server_key: &str) -> Vec<Arc<PodInfo>> {
        let index = self.server_to_pods.load();
        let pods = self.pods.load();
        index
            .get(server_key)
            .map(|keys| keys.iter().filter_map(|k| pods.get(k).cloned()).collect())
            .unwrap_or_default()
    }

    /// Servers that currently own a pod.
    pub fn servers_by_pod(&self, pod_key: &str) -> Vec<Key> {
        self.pod_to_servers
            .load()
            .get(pod_key)
            .cloned()
            .unwrap_or_default()
    }

    /// PD partition of one server: `group value -> (prefill, decode)` pods.
    pub fn pd_pods_by_group(&self, server_key: &str) -> HashMap<String, PdGroupPods> {
        self.pd_groups
            .load()
            .get(server_key)
            .cloned()
            .unwrap_or_default()
    }

    /* ------------------------- route matching ------------------------- */

    /// Resolve the requested model to a ModelServer.
    ///
    /// Rules are evaluated in declared order, first match wins; within the
    /// matched rule one destination is picked by weighted random choice
    /// (every destination weighs 1 when no weights are specified).
    pub fn match_model_server(
        &self,
        model: &str,
        headers: &HeaderMap,
        uri: &str,
    ) -> Result<(Key, bool), GatewayError> {
        let (route_key, is_lora) = match self.model_to_route.load().get(model) {
            Some(key) => (key.clone(), false),
            None => match self.lora_to_route.load().get(model) {
                Some(key) => (key.clone(), true),
                None => return Err(GatewayError::Route(model.to_string())),
            },
        };

        let routes = self.routes.load();
        let route = routes
            .get(&route_key)
            .ok_or_else(|| GatewayError::Route(model.to_string()))?;

        let rule = route
            .rules
            .iter()
            .find(|rule| rule.matches.is_empty() || rule.matches.iter().any(|m| m.matches(headers, uri)))
            .ok_or_else(|| {
                GatewayError::Route(format!("{model}: no rule matches the request"))
            })?;

        let destination = pick_weighted(&rule.destinations)
            .ok_or_else(|| GatewayError::Route(format!("{model}: rule has no destination")))?;

        let server_key = object_key(key_namespace(&route.key), &destination.model_server);
        if !self.servers.load().contains_key(&server_key) {
            return Err(GatewayError::Route(format!(
                "{model}: destination {server_key} does not exist"
            )));
        }
        Ok((server_key, is_lora))
    }
}

/* ============================= HELPERS ============================= */

pub fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    !selector.is_empty()
        && selector
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|lv| lv == v))
}

fn pick_weighted(destinations: &[Destination]) -> Option<&Destination> {
    if destinations.is_empty() {
        return None;
    }
    let total: u64 = destinations
        .iter()
        .map(|d| u64::from(d.weight.unwrap_or(1)))
        .sum();
    let mut roll = rand::rng().random_range(0..total);
    for dest in destinations {
        let weight = u64::from(dest.weight.unwrap_or(1));
        if roll < weight {
            return Some(dest);
        }
        roll -= weight;
    }
    destinations.last()
}

/* ============================= TESTS ============================= */
