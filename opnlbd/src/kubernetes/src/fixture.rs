pub mod reconciler {
    use std::collections::{BTreeMap, HashMap};
    use std::net::IpAddr;
    use std::str::FromStr;
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
    use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointSlice};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use kube::core::ObjectMeta;

    use opnlbd_opnsense::fake::FakeOpnsense;
    use opnlbd_vip::allocator::VipAllocator;

    use crate::config::{DEFAULT_LOAD_BALANCER_CLASS, MANAGED_BY};
    use crate::controller::reconciler::service_watcher::{LbContext, SERVICE_FINALIZER, SERVICE_NAME_LABEL};

    pub fn test_svc() -> Service {
        test_svc_with_ports(&[(80, 30080, "TCP")])
    }

    pub fn test_svc_with_ports(ports: &[(i32, i32, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("test-svc".to_string()),
                namespace: Some("default".to_string()),
                finalizers: Some(vec![SERVICE_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                load_balancer_class: Some(DEFAULT_LOAD_BALANCER_CLASS.to_string()),
                ports: Some(
                    ports
                        .iter()
                        .map(|(port, node_port, protocol)| ServicePort {
                            port: *port,
                            node_port: Some(*node_port),
                            protocol: Some(protocol.to_string()),
                            target_port: Some(IntOrString::Int(8080)),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }

    pub fn test_svc_with_type(type_: &str) -> Service {
        let mut svc = test_svc();
        if let Some(spec) = svc.spec.as_mut() {
            spec.type_ = Some(type_.to_string());
        }
        svc
    }

    pub fn test_svc_with_class(class: Option<&str>) -> Service {
        let mut svc = test_svc();
        if let Some(spec) = svc.spec.as_mut() {
            spec.load_balancer_class = class.map(|c| c.to_string());
        }
        svc
    }

    pub fn test_eps() -> EndpointSlice {
        EndpointSlice {
            address_type: "IPv4".to_string(),
            endpoints: vec![Endpoint {
                addresses: vec!["10.0.0.1".to_string()],
                conditions: Some(EndpointConditions {
                    ready: Some(true),
                    serving: Some(true),
                    terminating: Some(false),
                }),
                node_name: Some("n1".to_string()),
                ..Default::default()
            }],
            metadata: ObjectMeta {
                name: Some("test-svc-eps".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(BTreeMap::from([(
                    SERVICE_NAME_LABEL.to_string(),
                    "test-svc".to_string(),
                )])),
                ..Default::default()
            },
            ports: None,
        }
    }

    pub fn test_eps_without_nodes() -> EndpointSlice {
        let mut eps = test_eps();
        for ep in eps.endpoints.iter_mut() {
            ep.node_name = None;
        }
        eps
    }

    pub fn test_node_ips() -> HashMap<String, String> {
        HashMap::from([("n1".to_string(), "192.0.2.10".to_string())])
    }

    pub fn test_vip_pool() -> VipAllocator {
        VipAllocator::pool(vec![
            IpAddr::from_str("192.0.2.1").unwrap(),
            IpAddr::from_str("192.0.2.2").unwrap(),
        ])
        .unwrap()
    }

    pub fn test_lb_context(allocator: VipAllocator) -> (Arc<LbContext>, Arc<FakeOpnsense>) {
        let fake = Arc::new(FakeOpnsense::new());
        let lb = Arc::new(LbContext::new(
            fake.clone(),
            allocator,
            DEFAULT_LOAD_BALANCER_CLASS,
            MANAGED_BY,
        ));
        (lb, fake)
    }
}
