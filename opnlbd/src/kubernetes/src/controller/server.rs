use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;

use actix_web::{
    get, middleware,
    web::Data,
    App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, Config as KubeConfig,
};
use prometheus::{Encoder, TextEncoder};

use opnlbd_opnsense::client::{OpnsenseClient, OpnsenseConfig, DEFAULT_INTERFACE};
use opnlbd_trace::init::{prepare_tracing, TraceConfig};
use opnlbd_vip::allocator::VipAllocator;
use opnlbd_vip::error::Error as VipError;

use crate::config::{Config, DEFAULT_DEV_VIP, MANAGED_BY};
use crate::context::State;
use crate::controller::error::Error;
use crate::controller::leader::LeaderElector;
use crate::controller::reconciler::service_watcher::{self, LbContext};

const DEFAULT_REQUEUE_INTERVAL: u64 = 30 * 60;

pub fn start(config: Config, trace: TraceConfig) {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(run(config, trace));
}

#[tracing::instrument(skip_all)]
async fn run(config: Config, trace_config: TraceConfig) {
    prepare_tracing(trace_config).await;

    let state = State::new(MANAGED_BY);

    let client = kube_client(config.kubeconfig.as_deref()).await;

    let (api_key, api_secret) = load_credentials(&client, &config)
        .await
        .expect("Failed to load OPNsense credentials");

    let opnsense = OpnsenseClient::new(OpnsenseConfig {
        base_url: config.opnsense_url.clone(),
        api_key,
        api_secret,
        interface: DEFAULT_INTERFACE.to_string(),
        managed_by: MANAGED_BY.to_string(),
    })
    .expect("Failed to build OPNsense client");

    let allocator = build_allocator(&config).expect("Failed to build VIP allocator");

    let lb = Arc::new(LbContext::new(
        Arc::new(opnsense),
        allocator,
        &config.load_balancer_class,
        MANAGED_BY,
    ));

    // Every replica serves diagnostics; only the leader reconciles.
    let server_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_state.clone()))
            .service(index)
            .service(health)
            .service(ready)
            .service(metrics_)
            .wrap(
                middleware::Logger::default()
                    .exclude("/healthz")
                    .exclude("/readyz"),
            )
    })
    .bind("0.0.0.0:8080")
    .unwrap()
    .shutdown_timeout(5);

    let identity = std::env::var("HOSTNAME").unwrap_or_else(|_| MANAGED_BY.to_string());
    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        &config.lease_name,
        &config.lease_namespace,
        &identity,
    ));

    let watcher_state = state.clone();
    tokio::spawn(async move {
        let mut guard = elector.clone().acquire().await;
        tokio::select! {
            _ = service_watcher::run(watcher_state, DEFAULT_REQUEUE_INTERVAL, lb, client) => {
                // Signal-driven shutdown: hand the lease to a peer.
                elector.release().await;
            }
            _ = guard.lost() => {
                tracing::error!("Leadership lost, exiting");
                std::process::exit(1);
            }
        }
    });

    server.run().await.unwrap()
}

async fn kube_client(kubeconfig: Option<&str>) -> Client {
    match kubeconfig {
        Some(path) if !path.is_empty() => {
            let kubeconfig = Kubeconfig::read_from(path).expect("Failed to read kubeconfig");
            let config =
                KubeConfig::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .expect("Failed to load kubeconfig");
            Client::try_from(config).expect("Failed to create kube client")
        }
        _ => Client::try_default()
            .await
            .expect("Failed to create kube client"),
    }
}

/// Appliance credentials come from the environment, overridden by the
/// configured Secret when present (`apiKey`/`apiSecret`, falling back to
/// `key`/`secret` data keys).
async fn load_credentials(client: &Client, config: &Config) -> Result<(String, String), Error> {
    let mut api_key = config.opnsense_api_key.clone();
    let mut api_secret = config.opnsense_api_secret.clone();

    if let Some(name) = &config.opnsense_secret_name {
        let secrets = Api::<Secret>::namespaced(client.clone(), &config.opnsense_secret_namespace);
        let secret = secrets.get(name).await.map_err(Error::Kube)?;
        let data = secret.data.unwrap_or_default();
        let field = |key: &str| {
            data.get(key)
                .map(|v| String::from_utf8_lossy(&v.0).to_string())
                .filter(|s| !s.is_empty())
        };
        if let Some(key) = field("apiKey") {
            api_key = key;
        }
        if let Some(secret) = field("apiSecret") {
            api_secret = secret;
        }
        if api_key.is_empty() {
            api_key = field("key").unwrap_or_default();
            api_secret = field("secret").unwrap_or_default();
        }
    }

    Ok((api_key, api_secret))
}

fn build_allocator(config: &Config) -> Result<VipAllocator, VipError> {
    if let Some(vip) = &config.single_vip {
        let addr = IpAddr::from_str(vip).map_err(|_| VipError::InvalidAddress(vip.clone()))?;
        return Ok(VipAllocator::single(addr));
    }
    if !config.vip_pool.is_empty() {
        let mut addrs = Vec::with_capacity(config.vip_pool.len());
        for vip in config.vip_pool.iter() {
            addrs.push(IpAddr::from_str(vip).map_err(|_| VipError::InvalidAddress(vip.clone()))?);
        }
        return VipAllocator::pool(addrs);
    }
    eprintln!(
        "opnsense-lb-controller: neither VIP nor VIP_POOL set; using default {} (dev only). Set VIP or VIP_POOL in production.",
        DEFAULT_DEV_VIP
    );
    Ok(VipAllocator::single(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))))
}

#[get("/healthz")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
async fn ready(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("ready")
}

#[get("/metrics")]
async fn metrics_(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&metrics, &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}
