//! Integration tests for configuration checking and engine lifecycle.

use std::time::Duration;

use proxy_core::cli::{check, CheckError};
use proxy_core::config::ConfigSource;
use proxy_core::engine::{Engine, EngineBuilder, EngineError};
use proxy_core::{ConfigParser, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;

#[tokio::test]
async fn empty_config_passes() {
    let (_dir, path) = common::write_config("config.json", "{}");
    check(&ConfigSource::file(path), &EngineBuilder).await.unwrap();
}

#[tokio::test]
async fn client_layout_passes() {
    let port = common::free_port();
    let config = format!(
        r#"{{
            "log": {{ "level": "warning" }},
            "dns": {{
                "servers": [
                    {{ "type": "https", "tag": "dns-remote", "server": "8.8.8.8", "detour": "proxy" }},
                    {{ "type": "local", "tag": "dns-local" }}
                ],
                "rules": [ {{ "domain_suffix": ["lan"], "server": "dns-local" }} ],
                "final": "dns-remote"
            }},
            "inbounds": [
                {{ "type": "mixed", "tag": "mixed-in", "listen": "127.0.0.1", "listen_port": {port} }}
            ],
            "outbounds": [
                {{ "type": "socks", "tag": "proxy", "server": "127.0.0.1", "server_port": 1080 }},
                {{ "type": "direct", "tag": "direct" }},
                {{ "type": "block", "tag": "block" }}
            ],
            "route": {{
                "rules": [
                    {{ "protocol": "dns", "action": "hijack-dns" }},
                    {{ "ip_cidr": ["10.0.0.0/8", "192.168.0.0/16"], "outbound": "direct" }},
                    {{ "inbound": "mixed-in", "port_range": "6000:7000", "outbound": "block" }}
                ],
                "final": "proxy",
                "default_domain_resolver": "dns-local"
            }}
        }}"#
    );
    let (_dir, path) = common::write_config("config.json", &config);
    check(&ConfigSource::file(path), &EngineBuilder).await.unwrap();

    // Closed on success, so the port is free again.
    std::net::TcpListener::bind(("127.0.0.1", port)).expect("listener must be released");
}

#[tokio::test]
async fn undefined_route_outbound_is_reported() {
    let (_dir, path) = common::write_config(
        "config.json",
        r#"{
            "outbounds": [ { "type": "direct", "tag": "direct" } ],
            "route": { "rules": [ { "domain": "example.com", "outbound": "proxy-hk" } ] }
        }"#,
    );
    let err = check(&ConfigSource::file(path), &EngineBuilder).await.unwrap_err();
    assert!(matches!(err, CheckError::Engine(EngineError::RouteRule { index: 0, .. })));
    assert!(err.to_string().contains("proxy-hk"));
}

#[tokio::test]
async fn failed_inbound_releases_earlier_listeners() {
    let port = common::free_port();
    let config = format!(
        r#"{{
            "inbounds": [
                {{ "type": "mixed", "tag": "first", "listen": "127.0.0.1", "listen_port": {port} }},
                {{ "type": "mixed", "tag": "second", "listen": "127.0.0.1", "listen_port": {port} }}
            ]
        }}"#
    );
    let (_dir, path) = common::write_config("config.json", &config);
    let err = check(&ConfigSource::file(path), &EngineBuilder).await.unwrap_err();

    assert!(matches!(err, CheckError::Engine(EngineError::Inbound { index: 1, .. })));
    assert!(err.to_string().starts_with("initialize inbound[1]: listen tcp"));
    std::net::TcpListener::bind(("127.0.0.1", port)).expect("first listener must be released");
}

#[tokio::test]
async fn malformed_config_is_a_config_error() {
    let (_dir, path) = common::write_config("config.json", r#"{ "inbounds": [ "#);
    let err = check(&ConfigSource::file(path), &EngineBuilder).await.unwrap_err();
    assert!(matches!(err, CheckError::Config(_)));
}

#[tokio::test]
async fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = ConfigSource::file(dir.path().join("absent.json"));
    let err = check(&source, &EngineBuilder).await.unwrap_err();
    assert!(matches!(err, CheckError::Config(_)));
}

#[tokio::test]
async fn repeated_checks_give_same_outcome() {
    let (_dir, path) = common::write_config(
        "config.toml",
        r#"
            [[outbounds]]
            type = "vmess"
            tag = "proxy"
            server = "10.0.0.1"
            server_port = 443
            uuid = "not-a-uuid"
        "#,
    );
    let source = ConfigSource::file(path);
    let first = check(&source, &EngineBuilder).await.unwrap_err().to_string();
    let second = check(&source, &EngineBuilder).await.unwrap_err().to_string();
    assert_eq!(first, second);
    assert!(first.starts_with("initialize outbound[0]: invalid uuid"));
}

#[tokio::test]
async fn directory_entries_merge_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("00-outbounds.json"),
        r#"{ "outbounds": [ { "type": "direct", "tag": "direct" } ] }"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("10-route.json"),
        r#"{ "outbounds": [ { "type": "block", "tag": "block" } ], "route": { "final": "block" } }"#,
    )
    .unwrap();

    let source = ConfigSource::new(Vec::new(), vec![dir.path().to_path_buf()]);
    let options = source.parse(None).unwrap();
    assert_eq!(options.outbounds.len(), 2);
    check(&source, &EngineBuilder).await.unwrap();
}

#[tokio::test]
async fn direct_inbound_relays_to_backend() {
    let backend = common::start_echo_backend().await;
    let config = format!(
        r#"{{
            "inbounds": [
                {{
                    "type": "direct",
                    "tag": "forward",
                    "listen": "127.0.0.1",
                    "listen_port": 0,
                    "override_address": "{}",
                    "override_port": {}
                }}
            ],
            "outbounds": [ {{ "type": "direct", "tag": "direct" }} ]
        }}"#,
        backend.ip(),
        backend.port()
    );
    let (_dir, path) = common::write_config("config.json", &config);
    let options = ConfigSource::file(path).parse(None).unwrap();

    let ctx = Context::new();
    let mut engine = Engine::new(ctx.clone(), options).await.unwrap();
    let (tag, addr) = engine.inbound_addrs()[0].clone();
    assert_eq!(tag, "forward");

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");
    drop(client);

    engine.close().await;
    ctx.cancel();
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn blocked_route_closes_connection() {
    let backend = common::start_echo_backend().await;
    let config = format!(
        r#"{{
            "inbounds": [
                {{
                    "type": "direct",
                    "tag": "forward",
                    "listen": "127.0.0.1",
                    "override_address": "{}",
                    "override_port": {}
                }}
            ],
            "outbounds": [
                {{ "type": "direct", "tag": "direct" }},
                {{ "type": "block", "tag": "block" }}
            ],
            "route": {{ "rules": [ {{ "ip_cidr": "127.0.0.0/8", "action": "reject" }} ] }}
        }}"#,
        backend.ip(),
        backend.port()
    );
    let (_dir, path) = common::write_config("config.json", &config);
    let options = ConfigSource::file(path).parse(None).unwrap();

    let mut engine = Engine::new(Context::new(), options).await.unwrap();
    let (_, addr) = engine.inbound_addrs()[0].clone();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let _ = client.write_all(b"ping").await;
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
        .await
        .unwrap();
    assert!(read.map(|n| n == 0).unwrap_or(true));

    engine.close().await;
}
