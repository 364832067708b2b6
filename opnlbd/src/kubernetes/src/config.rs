use std::env;

pub const DEFAULT_LOAD_BALANCER_CLASS: &str = "opnsense.org/opnsense-lb";
pub const DEFAULT_SECRET_NAMESPACE: &str = "default";
pub const DEFAULT_LEASE_NAMESPACE: &str = "default";
pub const DEFAULT_LEASE_NAME: &str = "opnsense-lb-controller";
pub const MANAGED_BY: &str = "opnsense-lb-controller";

/// Default for local development only; production sets VIP or VIP_POOL.
pub const DEFAULT_DEV_VIP: &str = "192.0.2.1";

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub load_balancer_class: String,
    pub opnsense_url: String,
    pub opnsense_api_key: String,
    pub opnsense_api_secret: String,
    pub opnsense_secret_name: Option<String>,
    pub opnsense_secret_namespace: String,
    // Single-VIP mode when set; otherwise the pool is used.
    pub single_vip: Option<String>,
    pub vip_pool: Vec<String>,
    pub lease_namespace: String,
    pub lease_name: String,
    // From the CLI; empty selects in-cluster credentials.
    pub kubeconfig: Option<String>,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            load_balancer_class: get_env("LOAD_BALANCER_CLASS", DEFAULT_LOAD_BALANCER_CLASS),
            opnsense_url: env::var("OPNSENSE_URL").unwrap_or_default(),
            opnsense_api_key: env::var("OPNSENSE_API_KEY").unwrap_or_default(),
            opnsense_api_secret: env::var("OPNSENSE_API_SECRET").unwrap_or_default(),
            opnsense_secret_name: env::var("OPNSENSE_SECRET_NAME").ok().filter(|s| !s.is_empty()),
            opnsense_secret_namespace: get_env("OPNSENSE_SECRET_NAMESPACE", DEFAULT_SECRET_NAMESPACE),
            single_vip: env::var("VIP").ok().filter(|s| !s.is_empty()),
            vip_pool: parse_pool(&env::var("VIP_POOL").unwrap_or_default()),
            lease_namespace: get_env("LEASE_NAMESPACE", DEFAULT_LEASE_NAMESPACE),
            lease_name: get_env("LEASE_NAME", DEFAULT_LEASE_NAME),
            kubeconfig: None,
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn parse_pool(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
