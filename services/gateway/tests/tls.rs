
use harness::{
    read_exact_timeout, stomp_connect, tls_client_connect, GatewayHandle, GatewayOptions,
    TcpEchoBackend, TestCert, TlsBackend,
};
use protogate_gateway::{tls, TlsMode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn terminate_mode_detects_protocol_inside_tls() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let cert = TestCert::generate("gateway.test");

    let mut config = GatewayHandle::config();
    config.tls = TlsMode::terminate(tls::server_config(cert.certs(), cert.key()).unwrap());
    let gateway = GatewayHandle::spawn_with(config, GatewayOptions::default())
        .await
        .unwrap();
    gateway.add_service("broker0", vec![backend.uri("stomp")], &[]);

    let mut client = tls_client_connect(gateway.listen_addr, "gateway.test", &cert.cert_der)
        .await
        .unwrap();
    let frame = stomp_connect("broker0");
    client.write_all(&frame).await.unwrap();
    client.flush().await.unwrap();

    assert_eq!(read_exact_timeout(&mut client, frame.len()).await.unwrap(), frame);
    // The backend sees plaintext.
    assert_eq!(backend.received(), frame);
    assert_eq!(gateway.stat(|s| &s.tls_terminated), 1);
}

#[tokio::test]
async fn terminate_mode_still_accepts_cleartext() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let cert = TestCert::generate("gateway.test");

    let mut config = GatewayHandle::config();
    config.tls = TlsMode::terminate(tls::server_config(cert.certs(), cert.key()).unwrap());
    let gateway = GatewayHandle::spawn_with(config, GatewayOptions::default())
        .await
        .unwrap();
    gateway.add_service("broker0", vec![backend.uri("stomp")], &[]);

    let mut client = gateway.connect().await;
    let frame = stomp_connect("broker0");
    client.write_all(&frame).await.unwrap();
    assert_eq!(read_exact_timeout(&mut client, frame.len()).await.unwrap(), frame);
    assert_eq!(gateway.stat(|s| &s.tls_terminated), 0);
}

#[tokio::test]
async fn passthrough_routes_on_sni() {
    let backend = TlsBackend::spawn("secure.example.test", "from-backend").await.unwrap();
    let gateway = GatewayHandle::spawn().await.unwrap();
    gateway.add_service(
        "secure",
        vec![format!("tls://{}", backend.addr)],
        &["secure.example.test"],
    );

    let mut client = tls_client_connect(
        gateway.listen_addr,
        "secure.example.test",
        &backend.cert.cert_der,
    )
    .await
    .unwrap();
    client.write_all(b"hello").await.unwrap();
    client.flush().await.unwrap();

    let mut buf = vec![0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"from-backend");
    assert_eq!(backend.connection_count(), 1);
    assert_eq!(gateway.stat(|s| &s.tls_terminated), 0);
}
