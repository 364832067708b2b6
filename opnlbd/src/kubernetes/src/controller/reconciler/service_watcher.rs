use std::{
    collections::HashMap,
    net::IpAddr,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Node, Service, ServiceStatus,
};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::{
    api::{ListParams, PostParams},
    runtime::{
        controller::{Action, Config as ControllerConfig},
        events::{Event as PublishedEvent, EventType},
        finalizer::{finalizer, Event},
        reflector::ObjectRef,
        watcher::Config,
        Controller,
    },
    Api, Client, ResourceExt,
};

use opnlbd_opnsense::client::OpnsenseApi;
use opnlbd_vip::allocator::VipAllocator;

use crate::{
    context::{error_policy, ContextWith, Ctx, State},
    controller::desired_state::{compute_desired_state, to_nat_rules},
    controller::error::Error,
    util::{get_namespace, get_namespaced_name},
};

pub const SERVICE_FINALIZER: &str = "opnsense.org/opnsense-lb";
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

const INTERNAL_IP_TYPE: &str = "InternalIP";

/// Shared state for the Service reconciler: the appliance driver, the VIP
/// allocator and the identifiers scoping our remote footprint. The
/// allocator is only consulted from the single reconcile worker; the mutex
/// is held across synchronous sections only.
pub struct LbContext {
    pub opnsense: Arc<dyn OpnsenseApi>,
    pub allocator: Mutex<VipAllocator>,
    pub load_balancer_class: String,
    pub managed_by: String,
}

impl LbContext {
    pub fn new(
        opnsense: Arc<dyn OpnsenseApi>,
        allocator: VipAllocator,
        load_balancer_class: &str,
        managed_by: &str,
    ) -> LbContext {
        LbContext {
            opnsense,
            allocator: Mutex::new(allocator),
            load_balancer_class: load_balancer_class.to_string(),
            managed_by: managed_by.to_string(),
        }
    }
}

#[tracing::instrument(skip_all)]
pub async fn reconciler(
    svc: Arc<Service>,
    ctx: Arc<ContextWith<Arc<LbContext>>>,
) -> Result<Action, Error> {
    ctx.metrics().reconciliation(svc.as_ref());

    let ns = get_namespace::<Service>(&svc).map_err(Error::KubeLibrary)?;
    let services = Api::<Service>::namespaced(ctx.client().clone(), &ns);
    let key = get_namespaced_name(svc.as_ref());

    if !is_managed(&svc, &ctx.component.load_balancer_class) && !has_finalizer(&svc) {
        // Never ours: no finalizer, no tagged rules, nothing to do. Objects
        // that were ours and stopped matching keep the finalizer and are
        // cleaned up below.
        tracing::debug!(key, "Service does not match the LoadBalancer class");
        return Ok(Action::await_change());
    }

    let start = tokio::time::Instant::now();
    let result = finalizer(&services, SERVICE_FINALIZER, svc, |event| async {
        match event {
            Event::Apply(svc) => reconcile(&services, &svc, ctx.clone()).await,
            Event::Cleanup(svc) => cleanup(&svc, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)));
    ctx.metrics().observe_reconcile_duration(start.elapsed());
    result
}

#[tracing::instrument(skip_all)]
async fn reconcile(
    api: &Api<Service>,
    svc: &Service,
    ctx: Arc<ContextWith<Arc<LbContext>>>,
) -> Result<Action, Error> {
    let ns = get_namespace::<Service>(svc).map_err(Error::KubeLibrary)?;
    let key = get_namespaced_name(svc);
    let lb = ctx.component.clone();

    tracing::info!(name = svc.name_any(), namespace = ns, "Reconcile Service");

    if !is_managed(svc, &lb.load_balancer_class) {
        // The platform blocks class changes on live objects, but an object
        // discovered mismatched while carrying our finalizer still needs
        // its appliance rules scrubbed.
        cleanup_key(&lb, &key).await;
        return Ok(Action::await_change());
    }

    let vip = match allocate_vip(&lb, svc, &key)? {
        Some(vip) => vip,
        None => {
            publish_event(
                &ctx,
                svc,
                EventType::Warning,
                "NoVIP",
                format!("no VIP available for {}", key),
            )
            .await;
            clear_status(api, &svc.name_any()).await;
            // No requeue storm on pool exhaustion. The next event for this
            // key retries; pool free-ups re-trigger via endpoint and node
            // churn.
            return Ok(Action::await_change());
        }
    };

    let endpoint_slices = Api::<EndpointSlice>::namespaced(ctx.client().clone(), &ns)
        .list(&ListParams::default().labels(&format!("{}={}", SERVICE_NAME_LABEL, svc.name_any())))
        .await
        .map_err(Error::Kube)?
        .items;

    let node_ips = node_internal_ips(ctx.client()).await;

    let state = compute_desired_state(vip, svc, &endpoint_slices, node_ips.as_ref(), 0);

    if let Err(e) = lb.opnsense.ensure_vip(state.vip).await {
        publish_event(
            &ctx,
            svc,
            EventType::Warning,
            "EnsureVIPFailed",
            format!("OPNsense EnsureVIP: {}", e),
        )
        .await;
        clear_status(api, &svc.name_any()).await;
        return Err(Error::Opnsense(e));
    }

    let desired = to_nat_rules(&state, &lb.managed_by, &key);
    if let Err(e) = lb.opnsense.apply_nat_rules(&desired, &lb.managed_by, &key).await {
        publish_event(
            &ctx,
            svc,
            EventType::Warning,
            "ApplyNATRulesFailed",
            format!("OPNsense ApplyNATRules: {}", e),
        )
        .await;
        clear_status(api, &svc.name_any()).await;
        return Err(Error::Opnsense(e));
    }

    if let Err(e) = patch_status(api, &svc.name_any(), Some(vip)).await {
        publish_event(
            &ctx,
            svc,
            EventType::Warning,
            "StatusPatchFailed",
            format!("patch Service status: {}", e),
        )
        .await;
        return Err(e);
    }

    publish_event(
        &ctx,
        svc,
        EventType::Normal,
        "Synced",
        format!("assigned VIP {} and synced NAT rules to OPNsense", state.vip),
    )
    .await;
    tracing::info!(key, vip = vip.to_string(), "Synced NAT and status for Service");

    // Periodic resync heals out-of-band appliance edits.
    Ok(Action::requeue(Duration::from_secs(ctx.interval())))
}

#[tracing::instrument(skip_all)]
async fn cleanup(
    svc: &Service,
    ctx: Arc<ContextWith<Arc<LbContext>>>,
) -> Result<Action, Error> {
    let key = get_namespaced_name(svc);
    tracing::info!(key, "Cleanup Service");
    cleanup_key(&ctx.component, &key).await;
    Ok(Action::await_change())
}

/// Reverses the externally visible side effects for a key: drop every rule
/// tagged for it, remove the VIP alias when this key owns one, release the
/// allocator binding. Errors are logged but never returned so that
/// finalizer removal can proceed; tagged orphans stay reclaimable.
pub async fn cleanup_key(lb: &Arc<LbContext>, key: &str) {
    if let Err(e) = lb.opnsense.apply_nat_rules(&[], &lb.managed_by, key).await {
        tracing::error!(error = %e, key, "Cleanup ApplyNATRules failed");
    }
    // Empty in single-VIP mode: the shared alias is externally managed and
    // must survive cleanup.
    let vip = lb.allocator.lock().ok().and_then(|a| a.get(key));
    if let Some(vip) = vip {
        if let Err(e) = lb.opnsense.remove_vip(vip).await {
            tracing::error!(error = %e, key, vip = vip.to_string(), "Cleanup RemoveVIP failed");
        }
    }
    if let Ok(mut allocator) = lb.allocator.lock() {
        allocator.release(key);
    }
}

/// Binds a VIP for the key, re-adopting the address already published in
/// the Service status when possible so that a restarted controller does not
/// shuffle pool assignments.
pub fn allocate_vip(
    lb: &Arc<LbContext>,
    svc: &Service,
    key: &str,
) -> Result<Option<IpAddr>, Error> {
    let mut allocator = lb.allocator.lock().map_err(|_| Error::FailedToGetLock)?;
    if let Some(published) = published_vip(svc) {
        allocator.claim(key, published);
    }
    Ok(allocator.allocate(key))
}

pub fn is_managed(svc: &Service, load_balancer_class: &str) -> bool {
    let spec = match svc.spec.as_ref() {
        Some(spec) => spec,
        None => return false,
    };
    if spec.type_.as_deref() != Some("LoadBalancer") {
        return false;
    }
    spec.load_balancer_class.as_deref() == Some(load_balancer_class)
}

fn has_finalizer(svc: &Service) -> bool {
    svc.finalizers().iter().any(|f| f == SERVICE_FINALIZER)
}

fn published_vip(svc: &Service) -> Option<IpAddr> {
    svc.status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|ingress| ingress.ip.as_ref())
        .and_then(|ip| IpAddr::from_str(ip).ok())
}

fn set_lb_ingress(svc: &Service, vip: Option<IpAddr>) -> Service {
    let ingress: Vec<LoadBalancerIngress> = match vip {
        Some(vip) => vec![LoadBalancerIngress {
            ip: Some(vip.to_string()),
            ..Default::default()
        }],
        None => Vec::new(),
    };
    let mut new_svc = svc.clone();
    match new_svc.status.as_mut() {
        Some(status) => {
            status.load_balancer = Some(LoadBalancerStatus {
                ingress: Some(ingress),
            });
        }
        None => {
            new_svc.status = Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(ingress),
                }),
                ..Default::default()
            });
        }
    }
    new_svc
}

/// Read-modify-write on the status subresource.
async fn patch_status(api: &Api<Service>, name: &str, vip: Option<IpAddr>) -> Result<(), Error> {
    let latest = api.get(name).await.map_err(Error::Kube)?;
    let updated = set_lb_ingress(&latest, vip);
    api.replace_status(
        name,
        &PostParams::default(),
        serde_json::to_vec(&updated).map_err(Error::Serialization)?,
    )
    .await
    .map_err(Error::Kube)?;
    Ok(())
}

async fn clear_status(api: &Api<Service>, name: &str) {
    if let Err(e) = patch_status(api, name, None).await {
        tracing::warn!(error = %e, name, "failed to clear Service status");
    }
}

async fn node_internal_ips(client: &Client) -> Option<HashMap<String, String>> {
    let nodes = Api::<Node>::all(client.clone());
    let list = match nodes.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list Nodes");
            return None;
        }
    };
    let mut map = HashMap::new();
    for node in list.items.iter() {
        let addr = node
            .status
            .as_ref()
            .and_then(|status| status.addresses.as_ref())
            .and_then(|addrs| addrs.iter().find(|a| a.type_ == INTERNAL_IP_TYPE))
            .map(|a| a.address.clone());
        if let Some(addr) = addr {
            map.insert(node.name_any(), addr);
        }
    }
    Some(map)
}

async fn publish_event(
    ctx: &Arc<ContextWith<Arc<LbContext>>>,
    svc: &Service,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let recorder = {
        let mut diagnostics = ctx.diagnostics().write().await;
        diagnostics.last_event = chrono::Utc::now();
        diagnostics.recorder(ctx.client().clone(), svc)
    };
    let result = recorder
        .publish(PublishedEvent {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        })
        .await;
    if let Err(e) = result {
        tracing::warn!(error = %e, reason, "failed to publish event");
    }
}

pub async fn run(state: State, interval: u64, lb: Arc<LbContext>, client: Client) {
    let services = Api::<Service>::all(client.clone());
    let endpoint_slices = Api::<EndpointSlice>::all(client.clone());
    let nodes = Api::<Node>::all(client.clone());

    tracing::info!("Start Service watcher");

    let controller = Controller::new(services, Config::default().any_semantic());
    let store = controller.store();
    let class = lb.load_balancer_class.clone();

    controller
        .watches(
            endpoint_slices,
            Config::default().any_semantic(),
            // EndpointSlices share their Service's name through the
            // well-known label.
            |eps| {
                let ns = eps.namespace().unwrap_or_default();
                eps.labels()
                    .get(SERVICE_NAME_LABEL)
                    .map(|name| ObjectRef::<Service>::new(name).within(&ns))
            },
        )
        .watches(
            nodes,
            Config::default().any_semantic(),
            // Node IP changes can shift backend addresses for every
            // matched Service.
            move |_node: Node| {
                store
                    .state()
                    .into_iter()
                    .filter(|svc| is_managed(svc, &class))
                    .map(|svc| ObjectRef::from_obj(svc.as_ref()))
                    .collect::<Vec<ObjectRef<Service>>>()
            },
        )
        // One key at a time: the appliance is a shared single writer.
        .with_config(ControllerConfig::default().concurrency(1))
        .shutdown_on_signal()
        .run(
            reconciler,
            error_policy::<Service, Error, ContextWith<Arc<LbContext>>>,
            state.to_context_with(client, interval, lb),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
