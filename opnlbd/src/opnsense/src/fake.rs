use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::client::{rule_scope, NatRule, OpnsenseApi, RemoteNatRule};
use super::error::Error;

/// In-memory stand-in for the appliance. Records VIPs and NAT rules so
/// integration tests can assert controller behavior, and can be told to
/// fail the next operations to exercise the transient-error paths.
#[derive(Debug, Default)]
pub struct FakeOpnsense {
    inner: Mutex<Inner>,
    fail_apply: AtomicBool,
    fail_ensure_vip: AtomicBool,
    fail_remove_vip: AtomicBool,
}

#[derive(Debug, Default)]
struct Inner {
    vips: HashSet<IpAddr>,
    rules: Vec<FakeRule>,
    uuid: u64,
}

#[derive(Debug, Clone)]
struct FakeRule {
    uuid: String,
    rule: NatRule,
    service_key: String,
}

impl FakeOpnsense {
    pub fn new() -> FakeOpnsense {
        FakeOpnsense::default()
    }

    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    pub fn fail_ensure_vip(&self, fail: bool) {
        self.fail_ensure_vip.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remove_vip(&self, fail: bool) {
        self.fail_remove_vip.store(fail, Ordering::SeqCst);
    }

    pub fn vips(&self) -> Vec<IpAddr> {
        self.inner.lock().unwrap().vips.iter().copied().collect()
    }

    pub fn rules_for(&self, service_key: &str) -> Vec<NatRule> {
        self.inner
            .lock()
            .unwrap()
            .rules
            .iter()
            .filter(|r| r.service_key == service_key)
            .map(|r| r.rule.clone())
            .collect()
    }

    fn injected(&self, flag: &AtomicBool, path: &str) -> Result<(), Error> {
        if flag.load(Ordering::SeqCst) {
            return Err(Error::Status {
                path: path.to_string(),
                status: 500,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OpnsenseApi for FakeOpnsense {
    async fn list_nat_rules(&self) -> Result<Vec<RemoteNatRule>, Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .rules
            .iter()
            .map(|r| RemoteNatRule {
                uuid: r.uuid.clone(),
                description: r.rule.description.clone(),
            })
            .collect())
    }

    async fn apply_nat_rules(
        &self,
        desired: &[NatRule],
        managed_by: &str,
        service_key: &str,
    ) -> Result<(), Error> {
        self.injected(&self.fail_apply, "/api/firewall/d_nat/add_rule")?;

        let scope = rule_scope(managed_by, service_key);
        let mut inner = self.inner.lock().unwrap();
        inner
            .rules
            .retain(|r| !r.rule.description.starts_with(&scope));
        for rule in desired.iter() {
            inner.uuid += 1;
            let uuid = format!("fake-uuid-{}", inner.uuid);
            inner.rules.push(FakeRule {
                uuid,
                rule: rule.clone(),
                service_key: service_key.to_string(),
            });
        }
        Ok(())
    }

    async fn ensure_vip(&self, vip: IpAddr) -> Result<(), Error> {
        self.injected(&self.fail_ensure_vip, "/api/interfaces/vip_settings/add_item")?;
        self.inner.lock().unwrap().vips.insert(vip);
        Ok(())
    }

    async fn remove_vip(&self, vip: IpAddr) -> Result<(), Error> {
        self.injected(&self.fail_remove_vip, "/api/interfaces/vip_settings/del_item")?;
        self.inner.lock().unwrap().vips.remove(&vip);
        Ok(())
    }
}
