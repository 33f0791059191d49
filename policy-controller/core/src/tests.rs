use crate::{
    reconcile::{CREATE_ACL_FAILED, UPDATE_ACL_FAILED},
    *,
};
use maplit::{btreemap, btreeset};
use netpol_controller_queue::{worker, QueueMetrics, RateLimit, WorkQueue};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Call {
    CreatePortGroup(String),
    CreateAddressSet(String),
    CreateIngressAcl(String, String, String, Vec<PortSpec>),
    CreateEgressAcl(String, String, String, Vec<PortSpec>),
    DeleteAcl(String, Direction),
    DeleteAddressSet(String),
    DeletePortGroup(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Backend {
    port_groups: BTreeSet<String>,
    address_sets: BTreeSet<String>,
    acls: BTreeMap<(String, &'static str), (String, String, Vec<PortSpec>)>,
}

/// An idempotent in-memory backend that records every call.
#[derive(Clone, Default)]
struct FakeSdn(Arc<Mutex<SdnState>>);

#[derive(Default)]
struct SdnState {
    calls: Vec<Call>,
    backend: Backend,
    fail: Option<&'static str>,
}

#[derive(Clone, Default)]
struct FakeStore {
    policies: Arc<Mutex<HashMap<PolicyId, Arc<Policy>>>>,
    broken: bool,
}

#[derive(Clone, Default)]
struct FakeEvents(Arc<Mutex<Vec<(PolicyId, String, String)>>>);

type TestReconciler = Reconciler<FakeStore, FakeSdn, FakeEvents>;

// === impl FakeSdn ===

impl FakeSdn {
    fn fail_on(&self, op: &'static str) {
        self.0.lock().fail = Some(op);
    }

    fn heal(&self) {
        self.0.lock().fail = None;
    }

    fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.0.lock().calls)
    }

    fn backend(&self) -> Backend {
        self.0.lock().backend.clone()
    }

    fn call(&self, op: &'static str, call: Call, apply: impl FnOnce(&mut Backend)) -> Result<()> {
        let mut state = self.0.lock();
        state.calls.push(call);
        if state.fail == Some(op) {
            anyhow::bail!("{op} failed");
        }
        apply(&mut state.backend);
        Ok(())
    }
}

#[async_trait::async_trait]
impl SdnClient for FakeSdn {
    async fn create_port_group(&self, name: &str) -> Result<()> {
        self.call(
            "create_port_group",
            Call::CreatePortGroup(name.to_string()),
            |b| {
                b.port_groups.insert(name.to_string());
            },
        )
    }

    async fn create_address_set(&self, name: &str) -> Result<()> {
        self.call(
            "create_address_set",
            Call::CreateAddressSet(name.to_string()),
            |b| {
                b.address_sets.insert(name.to_string());
            },
        )
    }

    async fn create_ingress_acl(
        &self,
        pg: &str,
        allow: &str,
        except: &str,
        ports: &[PortSpec],
    ) -> Result<()> {
        self.call(
            "create_ingress_acl",
            Call::CreateIngressAcl(pg.into(), allow.into(), except.into(), ports.to_vec()),
            |b| {
                b.acls.insert(
                    (pg.to_string(), "ingress"),
                    (allow.into(), except.into(), ports.to_vec()),
                );
            },
        )
    }

    async fn create_egress_acl(
        &self,
        pg: &str,
        allow: &str,
        except: &str,
        ports: &[PortSpec],
    ) -> Result<()> {
        self.call(
            "create_egress_acl",
            Call::CreateEgressAcl(pg.into(), allow.into(), except.into(), ports.to_vec()),
            |b| {
                b.acls.insert(
                    (pg.to_string(), "egress"),
                    (allow.into(), except.into(), ports.to_vec()),
                );
            },
        )
    }

    async fn delete_acl(&self, pg: &str, direction: Direction) -> Result<()> {
        self.call(
            "delete_acl",
            Call::DeleteAcl(pg.to_string(), direction),
            |b| {
                b.acls.remove(&(pg.to_string(), direction.as_str()));
            },
        )
    }

    async fn delete_address_set(&self, name: &str) -> Result<()> {
        self.call(
            "delete_address_set",
            Call::DeleteAddressSet(name.to_string()),
            |b| {
                b.address_sets.remove(name);
            },
        )
    }

    async fn delete_port_group(&self, name: &str) -> Result<()> {
        self.call(
            "delete_port_group",
            Call::DeletePortGroup(name.to_string()),
            |b| {
                b.port_groups.remove(name);
                b.acls.retain(|(pg, _), _| pg != name);
            },
        )
    }
}

// === impl FakeStore ===

impl FakeStore {
    fn insert(&self, policy: Policy) {
        self.policies
            .lock()
            .insert(policy.id.clone(), Arc::new(policy));
    }

    fn remove(&self, id: &PolicyId) {
        self.policies.lock().remove(id);
    }
}

impl PolicyStore for FakeStore {
    fn get_policy(&self, id: &PolicyId) -> Result<Option<Arc<Policy>>> {
        if self.broken {
            anyhow::bail!("cache unavailable");
        }
        Ok(self.policies.lock().get(id).cloned())
    }
}

// === impl FakeEvents ===

impl FakeEvents {
    fn take(&self) -> Vec<(PolicyId, String, String)> {
        std::mem::take(&mut *self.0.lock())
    }
}

#[async_trait::async_trait]
impl EventRecorder for FakeEvents {
    async fn warn(&self, policy: &Policy, reason: &str, note: String) {
        self.0
            .lock()
            .push((policy.id.clone(), reason.to_string(), note));
    }
}

// === helpers ===

fn mk_reconciler() -> (TestReconciler, FakeStore, FakeSdn, FakeEvents) {
    let store = FakeStore::default();
    let sdn = FakeSdn::default();
    let events = FakeEvents::default();
    let reconciler = Reconciler::new(
        store.clone(),
        sdn.clone(),
        events.clone(),
        ReconcileMetrics::default(),
    );
    (reconciler, store, sdn, events)
}

fn mk_policy(name: &str, ingress: Vec<Rule>, egress: Vec<Rule>) -> Policy {
    Policy {
        id: PolicyId::new("default", name),
        uid: Some(format!("uid-{name}")),
        ingress,
        egress,
    }
}

fn mk_rule(ports: Vec<PortSpec>) -> Rule {
    Rule {
        ports,
        peers: vec![Peer::IpBlock(NetworkMatch {
            net: "10.0.0.0/8".parse().unwrap(),
            except: vec!["10.1.0.0/16".parse().unwrap()],
        })],
    }
}

fn pg(name: &str) -> Call {
    Call::CreatePortGroup(name.to_string())
}

fn set(name: &str) -> Call {
    Call::CreateAddressSet(name.to_string())
}

fn web_allow() -> Policy {
    mk_policy("web-allow", vec![mk_rule(vec![PortSpec::tcp(80)])], vec![])
}

// === tests ===

#[tokio::test]
async fn ingress_only_policy() {
    let (reconciler, store, sdn, events) = mk_reconciler();
    let policy = web_allow();
    store.insert(policy.clone());

    reconciler
        .reconcile(&Task::add(policy.id.clone()))
        .await
        .expect("reconcile must succeed");

    assert_eq!(
        sdn.take_calls(),
        vec![
            pg("web-allow.default"),
            set("web-allow.default.ingress.allow"),
            set("web-allow.default.ingress.except"),
            Call::CreateIngressAcl(
                "web-allow.default".to_string(),
                "web-allow.default.ingress.allow".to_string(),
                "web-allow.default.ingress.except".to_string(),
                vec![PortSpec::tcp(80)],
            ),
        ]
    );
    assert_eq!(events.take(), vec![]);
}

#[tokio::test]
async fn policy_without_rules_only_creates_port_group() {
    let (reconciler, store, sdn, _) = mk_reconciler();
    let policy = mk_policy("deny-all", vec![], vec![]);
    store.insert(policy.clone());

    reconciler
        .reconcile(&Task::add(policy.id.clone()))
        .await
        .expect("reconcile must succeed");

    assert_eq!(sdn.take_calls(), vec![pg("deny-all.default")]);
}

#[tokio::test]
async fn creates_ingress_before_egress_with_aggregated_ports() {
    let (reconciler, store, sdn, _) = mk_reconciler();
    let policy = mk_policy(
        "api",
        vec![
            mk_rule(vec![PortSpec::tcp(80), PortSpec::udp(53)]),
            mk_rule(vec![PortSpec::tcp(80)]),
        ],
        vec![mk_rule(vec![]), mk_rule(vec![PortSpec::tcp(5432)])],
    );
    store.insert(policy.clone());

    reconciler
        .reconcile(&Task::add(policy.id.clone()))
        .await
        .expect("reconcile must succeed");

    assert_eq!(
        sdn.take_calls(),
        vec![
            pg("api.default"),
            set("api.default.ingress.allow"),
            set("api.default.ingress.except"),
            Call::CreateIngressAcl(
                "api.default".to_string(),
                "api.default.ingress.allow".to_string(),
                "api.default.ingress.except".to_string(),
                // Duplicates are passed through in rule order.
                vec![PortSpec::tcp(80), PortSpec::udp(53), PortSpec::tcp(80)],
            ),
            set("api.default.egress.allow"),
            set("api.default.egress.except"),
            Call::CreateEgressAcl(
                "api.default".to_string(),
                "api.default.egress.allow".to_string(),
                "api.default.egress.except".to_string(),
                vec![PortSpec::tcp(5432)],
            ),
        ]
    );
}

#[tokio::test]
async fn repeated_adds_are_idempotent() {
    let (reconciler, store, sdn, _) = mk_reconciler();
    let policy = mk_policy(
        "api",
        vec![mk_rule(vec![PortSpec::tcp(80)])],
        vec![mk_rule(vec![PortSpec::udp(53)])],
    );
    store.insert(policy.clone());
    let task = Task::add(policy.id.clone());

    reconciler.reconcile(&task).await.expect("first pass");
    let first_calls = sdn.take_calls();
    let first_state = sdn.backend();

    reconciler.reconcile(&task).await.expect("second pass");
    assert_eq!(sdn.take_calls(), first_calls);
    assert_eq!(sdn.backend(), first_state);
    assert_eq!(
        first_state.address_sets,
        btreeset! {
            "api.default.egress.allow".to_string(),
            "api.default.egress.except".to_string(),
            "api.default.ingress.allow".to_string(),
            "api.default.ingress.except".to_string(),
        }
    );
}

#[tokio::test]
async fn ingress_acl_failure_stops_the_pass() {
    let (reconciler, store, sdn, events) = mk_reconciler();
    let policy = mk_policy(
        "api",
        vec![mk_rule(vec![PortSpec::tcp(80)])],
        vec![mk_rule(vec![PortSpec::udp(53)])],
    );
    store.insert(policy.clone());
    sdn.fail_on("create_ingress_acl");

    let error = reconciler
        .reconcile(&Task::add(policy.id.clone()))
        .await
        .expect_err("reconcile must fail");
    assert!(
        format!("{error:#}").contains("creating ingress ACL for port group api.default"),
        "{error:#}"
    );

    let calls = sdn.take_calls();
    assert_eq!(calls.len(), 4);
    assert!(matches!(calls.last(), Some(Call::CreateIngressAcl(..))));
    assert!(!calls
        .iter()
        .any(|c| matches!(c, Call::CreateEgressAcl(..)) || *c == set("api.default.egress.allow")));

    let recorded = events.take();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].0, policy.id);
    assert_eq!(recorded[0].1, CREATE_ACL_FAILED);
    assert!(recorded[0].2.contains("create_ingress_acl failed"));

    // The retried pass starts over from the port group.
    sdn.heal();
    reconciler
        .reconcile(&Task::add(policy.id.clone()))
        .await
        .expect("retry must succeed");
    let calls = sdn.take_calls();
    assert_eq!(calls.len(), 7);
    assert_eq!(calls[0], pg("api.default"));
    assert_eq!(events.take(), vec![]);
}

#[tokio::test]
async fn missing_policies_are_already_converged() {
    let (reconciler, _, sdn, events) = mk_reconciler();
    let id = PolicyId::new("default", "gone");
    for task in [Task::add(id.clone()), Task::update(id.clone())] {
        reconciler
            .reconcile(&task)
            .await
            .expect("reconcile must succeed");
    }
    assert_eq!(sdn.take_calls(), vec![]);
    assert_eq!(events.take(), vec![]);
}

#[tokio::test]
async fn cache_failures_are_retried() {
    let store = FakeStore {
        broken: true,
        ..Default::default()
    };
    let sdn = FakeSdn::default();
    let events = FakeEvents::default();
    let reconciler = Reconciler::new(
        store,
        sdn.clone(),
        events.clone(),
        ReconcileMetrics::default(),
    );

    reconciler
        .reconcile(&Task::add(PolicyId::new("default", "api")))
        .await
        .expect_err("reconcile must fail");
    assert_eq!(sdn.take_calls(), vec![]);
    assert_eq!(events.take(), vec![]);
}

#[tokio::test]
async fn update_removes_directions_without_rules() {
    let (reconciler, store, sdn, _) = mk_reconciler();
    let policy = mk_policy(
        "api",
        vec![mk_rule(vec![PortSpec::tcp(80)])],
        vec![mk_rule(vec![PortSpec::udp(53)])],
    );
    store.insert(policy.clone());
    reconciler
        .reconcile(&Task::add(policy.id.clone()))
        .await
        .expect("add must succeed");
    sdn.take_calls();

    store.insert(mk_policy(
        "api",
        vec![mk_rule(vec![PortSpec::tcp(8080)])],
        vec![],
    ));
    reconciler
        .reconcile(&Task::update(policy.id.clone()))
        .await
        .expect("update must succeed");

    assert_eq!(
        sdn.take_calls(),
        vec![
            pg("api.default"),
            set("api.default.ingress.allow"),
            set("api.default.ingress.except"),
            Call::CreateIngressAcl(
                "api.default".to_string(),
                "api.default.ingress.allow".to_string(),
                "api.default.ingress.except".to_string(),
                vec![PortSpec::tcp(8080)],
            ),
            Call::DeleteAcl("api.default".to_string(), Direction::Egress),
            Call::DeleteAddressSet("api.default.egress.except".to_string()),
            Call::DeleteAddressSet("api.default.egress.allow".to_string()),
        ]
    );
    assert_eq!(
        sdn.backend(),
        Backend {
            port_groups: btreeset! { "api.default".to_string() },
            address_sets: btreeset! {
                "api.default.ingress.allow".to_string(),
                "api.default.ingress.except".to_string(),
            },
            acls: btreemap! {
                ("api.default".to_string(), "ingress") => (
                    "api.default.ingress.allow".to_string(),
                    "api.default.ingress.except".to_string(),
                    vec![PortSpec::tcp(8080)],
                ),
            },
        }
    );
}

#[tokio::test]
async fn failed_updates_record_an_event() {
    let (reconciler, store, sdn, events) = mk_reconciler();
    let policy = web_allow();
    store.insert(policy.clone());
    sdn.fail_on("create_address_set");

    reconciler
        .reconcile(&Task::update(policy.id.clone()))
        .await
        .expect_err("update must fail");

    let recorded = events.take();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].1, UPDATE_ACL_FAILED);
}

#[tokio::test]
async fn delete_tears_down_in_reverse_order() {
    let (reconciler, store, sdn, events) = mk_reconciler();
    let policy = mk_policy(
        "api",
        vec![mk_rule(vec![PortSpec::tcp(80)])],
        vec![mk_rule(vec![PortSpec::udp(53)])],
    );
    store.insert(policy.clone());
    reconciler
        .reconcile(&Task::add(policy.id.clone()))
        .await
        .expect("add must succeed");
    sdn.take_calls();

    store.remove(&policy.id);
    reconciler
        .reconcile(&Task::delete(policy.id.clone()))
        .await
        .expect("delete must succeed");

    assert_eq!(
        sdn.take_calls(),
        vec![
            Call::DeleteAcl("api.default".to_string(), Direction::Egress),
            Call::DeleteAddressSet("api.default.egress.except".to_string()),
            Call::DeleteAddressSet("api.default.egress.allow".to_string()),
            Call::DeleteAcl("api.default".to_string(), Direction::Ingress),
            Call::DeleteAddressSet("api.default.ingress.except".to_string()),
            Call::DeleteAddressSet("api.default.ingress.allow".to_string()),
            Call::DeletePortGroup("api.default".to_string()),
        ]
    );
    assert_eq!(sdn.backend(), Backend::default());

    // Deleting again is harmless.
    reconciler
        .reconcile(&Task::delete(policy.id.clone()))
        .await
        .expect("delete must succeed");
    assert_eq!(sdn.backend(), Backend::default());
    assert_eq!(events.take(), vec![]);
}

#[tokio::test]
async fn delete_of_a_recreated_policy_converges() {
    let (reconciler, store, sdn, _) = mk_reconciler();
    let policy = web_allow();
    store.insert(policy.clone());

    reconciler
        .reconcile(&Task::delete(policy.id.clone()))
        .await
        .expect("delete must succeed");

    let calls = sdn.take_calls();
    assert_eq!(calls[0], pg("web-allow.default"));
    assert!(!calls.contains(&Call::DeletePortGroup("web-allow.default".to_string())));
    assert!(sdn
        .backend()
        .port_groups
        .contains("web-allow.default"));
}

#[tokio::test(start_paused = true)]
async fn worker_requeues_failed_reconciles() {
    let (reconciler, store, sdn, events) = mk_reconciler();
    let reconciler = Arc::new(reconciler);
    let queue = WorkQueue::new(
        RateLimit {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1),
            qps: 0.0,
            burst: 0,
        },
        QueueMetrics::default(),
    );

    let policy = web_allow();
    store.insert(policy.clone());
    sdn.fail_on("create_ingress_acl");

    let task = Task::add(policy.id.clone());
    queue.add(task.clone());
    assert!(worker::process_next(&queue, &*reconciler).await);
    assert_eq!(queue.num_requeues(&task), 1);
    assert_eq!(events.take().len(), 1);

    sdn.heal();
    assert!(worker::process_next(&queue, &*reconciler).await);
    assert_eq!(queue.num_requeues(&task), 0);
    assert!(queue.is_empty());
    assert_eq!(events.take(), vec![]);
    assert!(sdn.backend().acls.contains_key(&(
        "web-allow.default".to_string(),
        "ingress"
    )));
}
