//! E2E tests for .well-known endpoints (WebFinger, NodeInfo, host-meta)

mod common;

use common::TestServer;
use serde_json::Value;

fn authority(server: &TestServer) -> &str {
    server.addr.trim_start_matches("http://")
}

#[tokio::test]
async fn test_webfinger_acct_resource() {
    let server = TestServer::new().await;
    let resource = format!("acct:me@{}", authority(&server));

    let response = server
        .client
        .get(server.url("/.well-known/webfinger"))
        .query(&[("resource", resource.as_str())])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "application/jrd+json");

    let json: Value = response.json().await.unwrap();
    assert_eq!(json["subject"], resource);

    let links = json["links"].as_array().unwrap();
    let self_link = links.iter().find(|link| link["rel"] == "self").unwrap();
    assert_eq!(self_link["type"], "application/activity+json");
    assert_eq!(self_link["href"], server.actor_uri());

    let profile = links
        .iter()
        .find(|link| link["rel"] == "http://webfinger.net/rel/profile-page")
        .unwrap();
    assert_eq!(profile["href"], server.url("/"));
}

#[tokio::test]
async fn test_webfinger_actor_uri_resource() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger"))
        .query(&[("resource", server.actor_uri())])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["subject"], format!("acct:me@{}", authority(&server)));
}

#[tokio::test]
async fn test_webfinger_unknown_account() {
    let server = TestServer::new().await;

    for resource in [
        format!("acct:someone-else@{}", authority(&server)),
        "acct:me@elsewhere.example".to_string(),
    ] {
        let response = server
            .client
            .get(server.url("/.well-known/webfinger"))
            .query(&[("resource", resource.as_str())])
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 404, "{} should not resolve", resource);
    }
}

#[tokio::test]
async fn test_nodeinfo_discovery() {
    let server = TestServer::new().await;

    let json: Value = server
        .client
        .get(server.url("/.well-known/nodeinfo"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(json["links"][0]["href"], server.url("/nodeinfo/2.0"));

    let nodeinfo: Value = server
        .client
        .get(server.url("/nodeinfo/2.0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(nodeinfo["software"]["name"], "solofed");
    assert_eq!(nodeinfo["protocols"][0], "activitypub");
    assert_eq!(nodeinfo["usage"]["users"]["total"], 1);
}

#[tokio::test]
async fn test_host_meta_endpoint() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/host-meta"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains(&format!(
        "{}/.well-known/webfinger?resource={{uri}}",
        server.addr
    )));
}
