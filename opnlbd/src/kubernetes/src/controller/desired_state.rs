use std::collections::HashMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;

use opnlbd_opnsense::client::NatRule;

/// Desired NAT state for one Service: the VIP and one rule per declared port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    pub vip: IpAddr,
    pub rules: Vec<DesiredRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRule {
    pub external_port: i32,
    pub protocol: String,
    pub backends: Vec<Backend>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub ip: String,
    pub port: i32,
}

/// Projects the desired NAT state from the Service and its EndpointSlices.
/// Pure and deterministic: port order follows the Service spec, backend
/// order follows the slices, so remote diffs are stable across reconciles.
///
/// When an endpoint carries a node name and `node_ips` is provided, traffic
/// is forwarded to the node advertising the NodePort; otherwise the raw
/// endpoint address is used. Backend port is the port's nodePort, or
/// `node_port_override` when nonzero.
pub fn compute_desired_state(
    vip: IpAddr,
    svc: &Service,
    endpoint_slices: &[EndpointSlice],
    node_ips: Option<&HashMap<String, String>>,
    node_port_override: i32,
) -> DesiredState {
    let backend_ips = collect_backend_ips(endpoint_slices, node_ips);

    let mut rules = Vec::new();
    if let Some(ports) = svc.spec.as_ref().and_then(|spec| spec.ports.as_ref()) {
        for port in ports.iter() {
            let target_port = if node_port_override != 0 {
                node_port_override
            } else {
                port.node_port.unwrap_or(0)
            };
            rules.push(DesiredRule {
                external_port: port.port,
                protocol: port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                backends: backend_ips
                    .iter()
                    .map(|ip| Backend {
                        ip: ip.clone(),
                        port: target_port,
                    })
                    .collect(),
            });
        }
    }

    DesiredState { vip, rules }
}

fn collect_backend_ips(
    endpoint_slices: &[EndpointSlice],
    node_ips: Option<&HashMap<String, String>>,
) -> Vec<String> {
    let mut ips = Vec::new();
    for eps in endpoint_slices.iter() {
        for ep in eps.endpoints.iter() {
            // The Endpoints view of the platform only exposes ready addresses.
            if ep.conditions.as_ref().and_then(|c| c.ready) == Some(false) {
                continue;
            }
            let addr = match ep.addresses.first() {
                Some(addr) => addr,
                None => continue,
            };
            let ip = match (ep.node_name.as_ref(), node_ips) {
                (Some(node), Some(map)) => map.get(node).cloned().unwrap_or_default(),
                _ => addr.clone(),
            };
            if ip.is_empty() {
                continue;
            }
            ips.push(ip);
        }
    }
    ips
}

/// Flattens the desired state to one appliance rule per (port, backend),
/// tagging each with the ownership description.
pub fn to_nat_rules(state: &DesiredState, managed_by: &str, service_key: &str) -> Vec<NatRule> {
    let mut out = Vec::new();
    for rule in state.rules.iter() {
        for backend in rule.backends.iter() {
            out.push(NatRule {
                external_port: rule.external_port,
                protocol: rule.protocol.clone(),
                target_ip: backend.ip.clone(),
                target_port: backend.port,
                description: format!("{} {} {}", managed_by, service_key, state.vip),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;

    use crate::fixture::reconciler::{
        test_eps, test_eps_without_nodes, test_node_ips, test_svc, test_svc_with_ports,
    };

    use super::*;

    fn vip() -> IpAddr {
        IpAddr::from_str("192.0.2.1").unwrap()
    }

    #[test]
    fn projection_is_pure() {
        let svc = test_svc();
        let slices = vec![test_eps()];
        let nodes = test_node_ips();
        let first = compute_desired_state(vip(), &svc, &slices, Some(&nodes), 0);
        let second = compute_desired_state(vip(), &svc, &slices, Some(&nodes), 0);
        assert_eq!(first, second);
    }

    #[test]
    fn resolves_backends_through_node_internal_ips() {
        let svc = test_svc();
        let slices = vec![test_eps()];
        let nodes = test_node_ips();
        let state = compute_desired_state(vip(), &svc, &slices, Some(&nodes), 0);

        assert_eq!(state.vip, vip());
        assert_eq!(state.rules.len(), 1);
        let rule = &state.rules[0];
        assert_eq!(rule.external_port, 80);
        assert_eq!(rule.protocol, "TCP");
        assert_eq!(
            rule.backends,
            vec![Backend {
                ip: "192.0.2.10".to_string(),
                port: 30080,
            }]
        );
    }

    #[test]
    fn uses_raw_address_without_resolver() {
        let svc = test_svc();
        let slices = vec![test_eps()];
        let state = compute_desired_state(vip(), &svc, &slices, None, 0);
        assert_eq!(state.rules[0].backends[0].ip, "10.0.0.1");
    }

    #[test]
    fn uses_raw_address_when_endpoint_has_no_node() {
        let svc = test_svc();
        let slices = vec![test_eps_without_nodes()];
        let nodes = test_node_ips();
        let state = compute_desired_state(vip(), &svc, &slices, Some(&nodes), 0);
        assert_eq!(state.rules[0].backends[0].ip, "10.0.0.1");
    }

    #[test]
    fn drops_backend_when_node_is_unresolvable() {
        let svc = test_svc();
        let slices = vec![test_eps()];
        let nodes = HashMap::new();
        let state = compute_desired_state(vip(), &svc, &slices, Some(&nodes), 0);
        assert!(state.rules[0].backends.is_empty());
    }

    #[test]
    fn drops_not_ready_endpoints() {
        let svc = test_svc();
        let mut eps = test_eps();
        for ep in eps.endpoints.iter_mut() {
            if let Some(conditions) = ep.conditions.as_mut() {
                conditions.ready = Some(false);
            }
        }
        let nodes = test_node_ips();
        let state = compute_desired_state(vip(), &svc, &[eps], Some(&nodes), 0);
        assert!(state.rules[0].backends.is_empty());
    }

    #[test]
    fn empty_endpoints_yield_rules_without_backends() {
        let svc = test_svc();
        let state = compute_desired_state(vip(), &svc, &[], None, 0);
        assert_eq!(state.rules.len(), 1);
        assert!(state.rules[0].backends.is_empty());
        assert!(to_nat_rules(&state, "m", "default/test-svc").is_empty());
    }

    #[test]
    fn preserves_port_order() {
        let svc = test_svc_with_ports(&[(80, 30080, "TCP"), (443, 30444, "TCP"), (53, 30053, "UDP")]);
        let state = compute_desired_state(vip(), &svc, &[], None, 0);
        let ports: Vec<i32> = state.rules.iter().map(|r| r.external_port).collect();
        assert_eq!(ports, vec![80, 443, 53]);
        assert_eq!(state.rules[2].protocol, "UDP");
    }

    #[rstest(over, expected, case(0, 30080), case(8080, 8080))]
    fn node_port_override(over: i32, expected: i32) {
        let svc = test_svc();
        let slices = vec![test_eps()];
        let nodes = test_node_ips();
        let state = compute_desired_state(vip(), &svc, &slices, Some(&nodes), over);
        assert_eq!(state.rules[0].backends[0].port, expected);
    }

    #[test]
    fn fan_out_is_ports_times_backends() {
        let svc = test_svc_with_ports(&[(80, 30080, "TCP"), (443, 30444, "TCP")]);
        let mut eps = test_eps_without_nodes();
        let mut second = eps.endpoints[0].clone();
        second.addresses = vec!["10.0.0.2".to_string()];
        eps.endpoints.push(second);
        let state = compute_desired_state(vip(), &svc, &[eps], None, 0);

        let rules = to_nat_rules(&state, "opnsense-lb-controller", "default/test-svc");
        assert_eq!(rules.len(), 4);
        for rule in rules.iter() {
            assert!(rule
                .description
                .starts_with("opnsense-lb-controller default/test-svc 192.0.2.1"));
        }
    }
}
