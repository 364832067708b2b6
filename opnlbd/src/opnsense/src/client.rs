use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use super::error::Error;

pub const DEFAULT_INTERFACE: &str = "wan";

const SEARCH_NAT_RULE_PATH: &str = "/api/firewall/d_nat/search_rule";
const ADD_NAT_RULE_PATH: &str = "/api/firewall/d_nat/add_rule";
const DEL_NAT_RULE_PATH: &str = "/api/firewall/d_nat/del_rule";
const SAVEPOINT_PATH: &str = "/api/firewall/filter_base/savepoint";
const APPLY_PATH: &str = "/api/firewall/filter_base/apply";
const SEARCH_VIP_PATH: &str = "/api/interfaces/vip_settings/search_item";
const ADD_VIP_PATH: &str = "/api/interfaces/vip_settings/add_item";
const DEL_VIP_PATH: &str = "/api/interfaces/vip_settings/del_item";
const RECONFIGURE_VIP_PATH: &str = "/api/interfaces/vip_settings/reconfigure";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One desired DNAT rule (external port to one backend target).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    pub external_port: i32,
    pub protocol: String,
    pub target_ip: String,
    pub target_port: i32,
    pub description: String,
}

/// A DNAT rule as listed from the appliance. Only the identity fields are
/// parsed; ownership is carried in the description tag.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RemoteNatRule {
    pub uuid: String,
    #[serde(default)]
    pub description: String,
}

/// Capability set the reconciler depends on for NAT and VIP management.
#[async_trait]
pub trait OpnsenseApi: Send + Sync {
    async fn list_nat_rules(&self) -> Result<Vec<RemoteNatRule>, Error>;

    /// Converges the appliance rule set for (managed_by, service_key) to
    /// `desired`. Rules tagged for other services are never touched.
    async fn apply_nat_rules(
        &self,
        desired: &[NatRule],
        managed_by: &str,
        service_key: &str,
    ) -> Result<(), Error>;

    async fn ensure_vip(&self, vip: IpAddr) -> Result<(), Error>;

    async fn remove_vip(&self, vip: IpAddr) -> Result<(), Error>;
}

/// The description prefix identifying rules owned by (managed_by, key).
/// The trailing space keeps `ns/svc` from matching rules of `ns/svc2`.
pub fn rule_scope(managed_by: &str, service_key: &str) -> String {
    format!("{} {} ", managed_by, service_key)
}

#[derive(Debug, Clone)]
pub struct OpnsenseConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub interface: String,
    pub managed_by: String,
}

/// HTTP driver for the OPNsense API. Firewall edits are staged on the
/// appliance and only become active after the savepoint/apply commit, so
/// every mutating call ends with one.
#[derive(Debug)]
pub struct OpnsenseClient {
    http: reqwest::Client,
    config: OpnsenseConfig,
}

#[derive(Debug, Deserialize)]
struct NatRuleRows {
    #[serde(default)]
    rows: Vec<RemoteNatRule>,
}

#[derive(Debug, Deserialize)]
struct VipRows {
    #[serde(default)]
    rows: Vec<VipRow>,
}

#[derive(Debug, Deserialize)]
struct VipRow {
    uuid: String,
    #[serde(default)]
    subnet: String,
}

#[derive(Debug, Deserialize)]
struct Savepoint {
    #[serde(default)]
    revision: String,
}

impl OpnsenseClient {
    pub fn new(config: OpnsenseConfig) -> Result<OpnsenseClient, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(OpnsenseClient { http, config })
    }

    async fn search<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let resp = self
            .http
            .get(format!("{}{}", self.config.base_url, path))
            .query(&[("current", "1"), ("rowCount", "10000")])
            .basic_auth(&self.config.api_key, Some(&self.config.api_secret))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| Error::Decode {
            path: path.to_string(),
            source: e,
        })
    }

    async fn post(&self, path: &str, body: Option<serde_json::Value>) -> Result<String, Error> {
        let mut req = self
            .http
            .post(format!("{}{}", self.config.base_url, path))
            .basic_auth(&self.config.api_key, Some(&self.config.api_secret));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(resp.text().await?)
    }

    async fn commit(&self) -> Result<(), Error> {
        let body = self.post(SAVEPOINT_PATH, None).await?;
        let savepoint: Savepoint = serde_json::from_str(&body).map_err(|e| Error::Decode {
            path: SAVEPOINT_PATH.to_string(),
            source: e,
        })?;
        tracing::debug!(revision = savepoint.revision, "Commit firewall changes");
        self.post(APPLY_PATH, None).await?;
        Ok(())
    }

    async fn find_vip(&self, vip: IpAddr) -> Result<Option<String>, Error> {
        let subnet = format!("{}/32", vip);
        let rows: VipRows = self.search(SEARCH_VIP_PATH).await?;
        Ok(rows
            .rows
            .into_iter()
            .find(|r| r.subnet == subnet)
            .map(|r| r.uuid))
    }
}

#[async_trait]
impl OpnsenseApi for OpnsenseClient {
    async fn list_nat_rules(&self) -> Result<Vec<RemoteNatRule>, Error> {
        let rows: NatRuleRows = self.search(SEARCH_NAT_RULE_PATH).await?;
        Ok(rows.rows)
    }

    async fn apply_nat_rules(
        &self,
        desired: &[NatRule],
        managed_by: &str,
        service_key: &str,
    ) -> Result<(), Error> {
        let existing = self.list_nat_rules().await?;
        let scope = rule_scope(managed_by, service_key);

        // Delete before create so that rules from a previous desired state
        // cannot outlive the apply.
        let mut mutated = false;
        for rule in existing.iter().filter(|r| r.description.starts_with(&scope)) {
            self.post(&format!("{}/{}", DEL_NAT_RULE_PATH, rule.uuid), None)
                .await?;
            mutated = true;
        }
        for rule in desired.iter() {
            let body = json!({
                "rule": {
                    "description": rule.description,
                    "protocol": rule.protocol.to_uppercase(),
                    "destination": format!("0.0.0.0/{}", rule.external_port),
                    "target": format!("{}:{}", rule.target_ip, rule.target_port),
                }
            });
            self.post(ADD_NAT_RULE_PATH, Some(body)).await?;
            mutated = true;
        }

        if mutated {
            self.commit().await?;
        }
        Ok(())
    }

    async fn ensure_vip(&self, vip: IpAddr) -> Result<(), Error> {
        if self.find_vip(vip).await?.is_some() {
            return Ok(());
        }
        let body = json!({
            "vip": {
                "mode": "ipalias",
                "interface": self.config.interface,
                "subnet": format!("{}/32", vip),
                "description": format!("{} {}", self.config.managed_by, vip),
            }
        });
        self.post(ADD_VIP_PATH, Some(body)).await?;
        self.post(RECONFIGURE_VIP_PATH, None).await?;
        Ok(())
    }

    async fn remove_vip(&self, vip: IpAddr) -> Result<(), Error> {
        let uuid = match self.find_vip(vip).await? {
            Some(uuid) => uuid,
            None => return Ok(()),
        };
        self.post(&format!("{}/{}", DEL_VIP_PATH, uuid), None)
            .await?;
        self.post(RECONFIGURE_VIP_PATH, None).await?;
        Ok(())
    }
}
