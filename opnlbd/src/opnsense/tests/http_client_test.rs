//! Contract tests for the OPNsense HTTP driver against a mock server.

use std::net::IpAddr;
use std::str::FromStr;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use opnlbd_opnsense::client::{NatRule, OpnsenseApi, OpnsenseClient, OpnsenseConfig};
use opnlbd_opnsense::error::Error;

fn test_client(server: &MockServer) -> OpnsenseClient {
    OpnsenseClient::new(OpnsenseConfig {
        base_url: server.uri(),
        api_key: "key".to_string(),
        api_secret: "secret".to_string(),
        interface: "wan".to_string(),
        managed_by: "opnsense-lb-controller".to_string(),
    })
    .expect("client")
}

fn test_rule(description: &str) -> NatRule {
    NatRule {
        external_port: 80,
        protocol: "TCP".to_string(),
        target_ip: "10.0.0.1".to_string(),
        target_port: 30080,
        description: description.to_string(),
    }
}

async fn mount_commit(server: &MockServer, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/api/firewall/filter_base/savepoint"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"revision": "123"})))
        .expect(expected)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/firewall/filter_base/apply"))
        .respond_with(ResponseTemplate::new(200))
        .expect(expected)
        .mount(server)
        .await;
}

#[tokio::test]
async fn list_nat_rules_parses_rows() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/firewall/d_nat/search_rule"))
        .and(query_param("current", "1"))
        .and(query_param("rowCount", "10000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [
                {"uuid": "a1", "description": "opnsense-lb-controller ns/svc 192.0.2.1"},
                {"uuid": "b2", "description": "other"},
                {"uuid": "c3"},
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let rules = test_client(&server).list_nat_rules().await.expect("list");
    assert_eq!(rules.len(), 3);
    assert_eq!(rules[0].uuid, "a1");
    assert_eq!(rules[0].description, "opnsense-lb-controller ns/svc 192.0.2.1");
    assert_eq!(rules[2].description, "");
}

#[tokio::test]
async fn apply_creates_rules_and_commits() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/firewall/d_nat/search_rule"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": []})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/firewall/d_nat/add_rule"))
        .and(body_partial_json(json!({
            "rule": {
                "protocol": "TCP",
                "destination": "0.0.0.0/80",
                "target": "10.0.0.1:30080",
            }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    mount_commit(&server, 1).await;

    let desired = vec![test_rule("opnsense-lb-controller ns/svc 192.0.2.1")];
    test_client(&server)
        .apply_nat_rules(&desired, "opnsense-lb-controller", "ns/svc")
        .await
        .expect("apply");
}

#[tokio::test]
async fn apply_uppercases_protocol() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/firewall/d_nat/search_rule"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": []})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/firewall/d_nat/add_rule"))
        .and(body_partial_json(json!({"rule": {"protocol": "UDP"}})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    mount_commit(&server, 1).await;

    let mut rule = test_rule("opnsense-lb-controller ns/svc 192.0.2.1");
    rule.protocol = "udp".to_string();
    test_client(&server)
        .apply_nat_rules(&[rule], "opnsense-lb-controller", "ns/svc")
        .await
        .expect("apply");
}

#[tokio::test]
async fn apply_only_deletes_rules_of_the_given_service() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/firewall/d_nat/search_rule"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [
                {"uuid": "u1", "description": "opnsense-lb-controller ns/svc1 192.0.2.1"},
                {"uuid": "u2", "description": "opnsense-lb-controller ns/svc2 192.0.2.2"},
                {"uuid": "u3", "description": "user-entered rule"},
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/firewall/d_nat/del_rule/u1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/firewall/d_nat/del_rule/u2"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/firewall/d_nat/del_rule/u3"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/firewall/d_nat/add_rule"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    mount_commit(&server, 1).await;

    let desired = vec![test_rule("opnsense-lb-controller ns/svc1 192.0.2.1")];
    test_client(&server)
        .apply_nat_rules(&desired, "opnsense-lb-controller", "ns/svc1")
        .await
        .expect("apply");
}

#[tokio::test]
async fn apply_does_not_confuse_keys_sharing_a_prefix() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/firewall/d_nat/search_rule"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [
                {"uuid": "u1", "description": "opnsense-lb-controller ns/svc 192.0.2.1"},
                {"uuid": "u2", "description": "opnsense-lb-controller ns/svc2 192.0.2.2"},
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/firewall/d_nat/del_rule/u1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/firewall/d_nat/del_rule/u2"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    mount_commit(&server, 1).await;

    test_client(&server)
        .apply_nat_rules(&[], "opnsense-lb-controller", "ns/svc")
        .await
        .expect("apply");
}

#[tokio::test]
async fn apply_without_mutation_skips_commit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/firewall/d_nat/search_rule"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": []})))
        .expect(1)
        .mount(&server)
        .await;
    mount_commit(&server, 0).await;

    test_client(&server)
        .apply_nat_rules(&[], "opnsense-lb-controller", "ns/svc")
        .await
        .expect("apply");
}

#[tokio::test]
async fn apply_fails_on_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/firewall/d_nat/search_rule"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": []})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/firewall/d_nat/add_rule"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let desired = vec![test_rule("opnsense-lb-controller ns/svc 192.0.2.1")];
    let err = test_client(&server)
        .apply_nat_rules(&desired, "opnsense-lb-controller", "ns/svc")
        .await
        .expect_err("should fail");
    assert!(matches!(err, Error::Status { status: 500, .. }));
}

#[tokio::test]
async fn list_fails_on_malformed_json() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/firewall/d_nat/search_rule"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = test_client(&server)
        .list_nat_rules()
        .await
        .expect_err("should fail");
    assert!(matches!(err, Error::Decode { .. }));
}

#[tokio::test]
async fn ensure_vip_is_a_noop_when_present() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/interfaces/vip_settings/search_item"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [
                {"uuid": "v1", "subnet": "192.0.2.1/32", "interface": "wan", "mode": "ipalias"},
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/interfaces/vip_settings/add_item"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/interfaces/vip_settings/reconfigure"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    test_client(&server)
        .ensure_vip(IpAddr::from_str("192.0.2.1").unwrap())
        .await
        .expect("ensure");
}

#[tokio::test]
async fn ensure_vip_adds_alias_and_reconfigures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/interfaces/vip_settings/search_item"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": []})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/interfaces/vip_settings/add_item"))
        .and(body_partial_json(json!({
            "vip": {
                "mode": "ipalias",
                "interface": "wan",
                "subnet": "192.0.2.1/32",
            }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/interfaces/vip_settings/reconfigure"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    test_client(&server)
        .ensure_vip(IpAddr::from_str("192.0.2.1").unwrap())
        .await
        .expect("ensure");
}

#[tokio::test]
async fn remove_vip_deletes_by_uuid() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/interfaces/vip_settings/search_item"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [
                {"uuid": "v1", "subnet": "192.0.2.1/32", "interface": "wan", "mode": "ipalias"},
                {"uuid": "v2", "subnet": "192.0.2.2/32", "interface": "wan", "mode": "ipalias"},
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/interfaces/vip_settings/del_item/v1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/interfaces/vip_settings/reconfigure"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    test_client(&server)
        .remove_vip(IpAddr::from_str("192.0.2.1").unwrap())
        .await
        .expect("remove");
}

#[tokio::test]
async fn remove_vip_is_a_noop_when_absent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/interfaces/vip_settings/search_item"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": []})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/interfaces/vip_settings/reconfigure"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    test_client(&server)
        .remove_vip(IpAddr::from_str("192.0.2.1").unwrap())
        .await
        .expect("remove");
}
