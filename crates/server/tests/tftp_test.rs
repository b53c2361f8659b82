//! TFTP service against a real UDP client

use axum::{body::Body, http::StatusCode, Router};
use chrono::{Duration, Utc};
use metalboot_common::{
    HwAddr, Image, ImageKind, InstallState, Installation, NewImage, NewInstallation, NewSystem,
};
use metalboot_metal::Drivers;
use metalboot_server::tftp::packet::{ErrorCode, Packet, Request};
use metalboot_server::{create_router, AppState, Config, MemoryStore, Store, TftpServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tower::ServiceExt; // for `oneshot`
use uuid::Uuid;

struct Harness {
    server: SocketAddr,
    client: UdpSocket,
    store: Arc<MemoryStore>,
    app: Router,
    _images: tempfile::TempDir,
}

async fn start() -> Harness {
    let images = tempfile::tempdir().unwrap();
    let config = Config::for_images(images.path());
    let store = Arc::new(MemoryStore::new());
    let drivers = Drivers::new(&config.metal());

    let state = AppState::new(config, store.clone() as Arc<dyn Store>, drivers);
    let tftp = TftpServer::bind("127.0.0.1:0", state.boot.clone()).await.unwrap();
    let server = tftp.local_addr().unwrap();
    tokio::spawn(tftp.run());

    Harness {
        server,
        client: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        store,
        app: create_router(state),
        _images: images,
    }
}

/// Register web01 on `aa:bb:cc:dd:ee:01` with a queued fedora installation
async fn seed_web01(store: &MemoryStore) -> (Image, Installation) {
    let mac: HwAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
    let system = store
        .register_system(NewSystem {
            name: Some("web01".to_string()),
            hw_addrs: vec![mac],
            ..Default::default()
        })
        .await
        .unwrap();
    let image = store
        .create_image(NewImage {
            name: "fedora".to_string(),
            kind: ImageKind::Iso,
            iso_sha256: None,
            liveimg_sha256: None,
        })
        .await
        .unwrap();
    let install = store
        .create_installation(NewInstallation {
            uuid: Uuid::new_v4(),
            system_id: system.id,
            image_id: image.id,
            valid_until: Utc::now() + Duration::hours(1),
            snippet_text: String::new(),
            kickstart_override: String::new(),
            comment: String::new(),
        })
        .await
        .unwrap();
    (image, install)
}

async fn http_get(app: &Router, uri: &str) -> Vec<u8> {
    let request = axum::http::Request::builder()
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

fn request(filename: &str, options: &[(&str, &str)]) -> Request {
    Request {
        filename: filename.to_string(),
        mode: "octet".to_string(),
        options: options
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

async fn recv(client: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = vec![0u8; 70000];
    let (len, from) = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        client.recv_from(&mut buf),
    )
    .await
    .expect("no reply from server")
    .unwrap();
    (Packet::parse(&buf[..len]).unwrap(), from)
}

/// Read a whole file, acknowledging every block
async fn download(h: &Harness, filename: &str) -> Result<Vec<u8>, (ErrorCode, String)> {
    h.client
        .send_to(&Packet::Read(request(filename, &[])).encode(), h.server)
        .await
        .unwrap();

    let mut contents = Vec::new();
    loop {
        match recv(&h.client).await {
            (Packet::Data { block, data }, from) => {
                assert_ne!(from, h.server, "transfers use their own port");
                h.client.send_to(&Packet::Ack(block).encode(), from).await.unwrap();
                let done = data.len() < 512;
                contents.extend_from_slice(&data);
                if done {
                    return Ok(contents);
                }
            }
            (Packet::Error { code, message }, _) => return Err((code, message)),
            (other, _) => panic!("unexpected packet {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_grub_bootstrap_over_tftp() {
    let h = start().await;

    let script = download(&h, "grub.cfg").await.unwrap();
    let script = String::from_utf8(script).unwrap();
    assert!(script.contains("configfile /boot/${grub_platform}/${net_default_mac}/grub.cfg"));
}

#[tokio::test]
async fn test_machine_script_over_tftp() {
    let h = start().await;
    let (image, install) = seed_web01(&h.store).await;

    // grub asks with the optional boot/ prefix
    let script = download(&h, "/boot/efi/aa-bb-cc-dd-ee-01/grub.cfg").await.unwrap();
    let script = String::from_utf8(script).unwrap();
    assert!(script.contains(&format!("ImageID={}", image.id)));
    assert!(script.contains("linuxefi /boot/efi/aa-bb-cc-dd-ee-01/images/pxeboot/vmlinuz"));

    let state = h
        .store
        .find_installation_by_uuid(install.uuid, InstallState::Finished, Utc::now())
        .await
        .unwrap()
        .unwrap()
        .state;
    assert_eq!(state, InstallState::Booting);
}

#[tokio::test]
async fn test_option_negotiation() {
    let h = start().await;
    h.client
        .send_to(
            &Packet::Read(request("grub.cfg", &[("blksize", "1024"), ("tsize", "0")])).encode(),
            h.server,
        )
        .await
        .unwrap();

    let (packet, from) = recv(&h.client).await;
    let options = match packet {
        Packet::OptionAck(options) => options,
        other => panic!("expected OACK, got {:?}", other),
    };
    assert_eq!(options[0], ("blksize".to_string(), "1024".to_string()));
    let size: usize = options[1].1.parse().unwrap();

    h.client.send_to(&Packet::Ack(0).encode(), from).await.unwrap();
    let (packet, from) = recv(&h.client).await;
    match packet {
        Packet::Data { block, data } => {
            assert_eq!(block, 1);
            assert_eq!(data.len(), size);
        }
        other => panic!("expected data, got {:?}", other),
    }
    h.client.send_to(&Packet::Ack(1).encode(), from).await.unwrap();
}

#[tokio::test]
async fn test_missing_file_over_tftp() {
    let h = start().await;

    let (code, _) = download(&h, "efi/aa-bb-cc-dd-ee-02/shimx64.efi").await.unwrap_err();
    assert_eq!(code, ErrorCode::FileNotFound);

    let (code, _) = download(&h, "boot/../../etc/passwd").await.unwrap_err();
    assert_eq!(code, ErrorCode::FileNotFound);
}

#[tokio::test]
async fn test_write_is_refused() {
    let h = start().await;
    h.client
        .send_to(&Packet::Write(request("grub.cfg", &[])).encode(), h.server)
        .await
        .unwrap();

    let (packet, from) = recv(&h.client).await;
    assert_eq!(from, h.server);
    assert_eq!(
        packet,
        Packet::Error {
            code: ErrorCode::AccessViolation,
            message: "writing not supported".to_string()
        }
    );
}

#[tokio::test]
async fn test_tftp_and_http_serve_identical_scripts() {
    let h = start().await;
    let (_, install) = seed_web01(&h.store).await;

    let over_tftp = download(&h, "efi/aa-bb-cc-dd-ee-01/grub.cfg").await.unwrap();
    let over_http = http_get(&h.app, "/boot/efi/aa-bb-cc-dd-ee-01/grub.cfg").await;
    assert_eq!(over_tftp, over_http);
    assert!(String::from_utf8_lossy(&over_http).contains(&install.uuid.to_string()));

    let state = h
        .store
        .find_installation_by_uuid(install.uuid, InstallState::Finished, Utc::now())
        .await
        .unwrap()
        .unwrap()
        .state;
    assert_eq!(state, InstallState::Booting);

    // same again once the installation sits in Booting
    let over_tftp = download(&h, "boot/efi/aa-bb-cc-dd-ee-01/grub.cfg").await.unwrap();
    assert_eq!(over_tftp, over_http);

    // and for the bootstrap script
    let over_tftp = download(&h, "grub.cfg").await.unwrap();
    let over_http = http_get(&h.app, "/boot/grub.cfg").await;
    assert_eq!(over_tftp, over_http);
}
