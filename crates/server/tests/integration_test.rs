//! Integration tests for the boot and admin HTTP surface

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use metalboot_common::{
    Appliance, ApplianceKind, HwAddr, Image, ImageKind, InstallState, Installation, NewAppliance,
    NewImage, NewInstallation, NewSystem, Result, System,
};
use metalboot_metal::{Drivers, EnlistResult, Metal, SystemAppliance};
use metalboot_server::{
    create_router, AppState, Config, MemoryStore, PowerQueue, Store, SyslogServer,
};
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tower::ServiceExt; // for `oneshot`
use uuid::Uuid;

const MAC: &str = "aa:bb:cc:dd:ee:01";
const MAC_DASHED: &str = "aa-bb-cc-dd-ee-01";

/// Power driver that records what it was asked to do
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(&'static str, String)>>,
    machines: Mutex<Vec<EnlistResult>>,
}

impl Recorder {
    fn record(&self, action: &'static str, target: &SystemAppliance) {
        let uid = target.system.uid.clone().unwrap_or_default();
        self.calls.lock().unwrap().push((action, uid));
    }

    fn calls(&self) -> Vec<(&'static str, String)> {
        self.calls.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<(&'static str, String)> {
        for _ in 0..100 {
            let calls = self.calls();
            if calls.len() >= count {
                return calls;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("expected {} power actions, got {:?}", count, self.calls());
    }
}

#[async_trait]
impl Metal for Recorder {
    async fn enlist(&self, _: &Appliance, pattern: &Regex) -> Result<Vec<EnlistResult>> {
        Ok(self
            .machines
            .lock()
            .unwrap()
            .iter()
            .filter(|m| pattern.is_match(&m.uid))
            .cloned()
            .collect())
    }

    async fn boot_network(&self, target: &SystemAppliance) -> Result<()> {
        self.record("network", target);
        Ok(())
    }

    async fn boot_local(&self, target: &SystemAppliance) -> Result<()> {
        self.record("local", target);
        Ok(())
    }

    fn controls_power(&self) -> bool {
        true
    }
}

struct TestApp {
    app: Router,
    store: Arc<MemoryStore>,
    power: PowerQueue,
    recorder: Arc<Recorder>,
    images: tempfile::TempDir,
    discovery_image: Image,
}

/// Helper to create a test app with a discovery system already seeded
async fn create_test_app() -> TestApp {
    let images = tempfile::tempdir().unwrap();
    let mut config = Config::for_images(images.path());
    config.power_delay = std::time::Duration::ZERO;

    let store = Arc::new(MemoryStore::new());
    let recorder = Arc::new(Recorder::default());
    let drivers =
        Drivers::new(&config.metal()).with_driver(ApplianceKind::Libvirt, recorder.clone());

    let discovery = seed_system(&store, "discovery", &[HwAddr::null()], None).await;
    let discovery_image = seed_image(&store, "discovery").await;
    seed_installation(&store, &discovery, &discovery_image, Duration::days(365), "").await;

    let state = AppState::new(config, store.clone() as Arc<dyn Store>, drivers);
    let power = state.power.clone();

    TestApp {
        app: create_router(state),
        store,
        power,
        recorder,
        images,
        discovery_image,
    }
}

fn mac(s: &str) -> HwAddr {
    s.parse().unwrap()
}

async fn seed_system(
    store: &MemoryStore,
    name: &str,
    addrs: &[HwAddr],
    appliance_id: Option<i64>,
) -> System {
    store
        .register_system(NewSystem {
            name: Some(name.to_string()),
            hw_addrs: addrs.to_vec(),
            uid: appliance_id.map(|_| format!("uid-{}", name)),
            appliance_id,
            ..Default::default()
        })
        .await
        .unwrap()
}

async fn seed_image(store: &MemoryStore, name: &str) -> Image {
    store
        .create_image(NewImage {
            name: name.to_string(),
            kind: ImageKind::Iso,
            iso_sha256: None,
            liveimg_sha256: Some("f00d".to_string()),
        })
        .await
        .unwrap()
}

async fn seed_installation(
    store: &MemoryStore,
    system: &System,
    image: &Image,
    valid_for: Duration,
    kickstart_override: &str,
) -> Installation {
    store
        .create_installation(NewInstallation {
            uuid: Uuid::new_v4(),
            system_id: system.id,
            image_id: image.id,
            valid_until: Utc::now() + valid_for,
            snippet_text: String::new(),
            kickstart_override: kickstart_override.to_string(),
            comment: "integration".to_string(),
        })
        .await
        .unwrap()
}

async fn seed_appliance(store: &MemoryStore) -> Appliance {
    store
        .create_appliance(NewAppliance {
            name: "lab".to_string(),
            kind: ApplianceKind::Libvirt,
            uri: "qemu:///system".to_string(),
        })
        .await
        .unwrap()
}

/// Write `contents` at `relative` inside the image's boot tree
fn write_image_file(images: &tempfile::TempDir, image: &Image, relative: &str, contents: &str) {
    let path = images.path().join(image.id.to_string()).join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

/// Lay out `images/<id>/images/pxeboot/vmlinuz` so file requests can succeed
fn write_kernel(images: &tempfile::TempDir, image: &Image) {
    write_image_file(images, image, "images/pxeboot/vmlinuz", "kernel");
}

async fn state_of(store: &MemoryStore, uuid: Uuid) -> InstallState {
    store
        .find_installation_by_uuid(uuid, InstallState::Finished, Utc::now())
        .await
        .unwrap()
        .expect("installation should be live")
        .state
}

async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn kickstart(app: &Router, reported: &[&str]) -> (StatusCode, String) {
    let mut builder = Request::builder().uri("/ks/");
    for (i, value) in reported.iter().enumerate() {
        builder = builder.header(format!("X-RHN-Provisioning-MAC-{}", i), *value);
    }
    send(app, builder.body(Body::empty()).unwrap()).await
}

async fn post(app: &Router, uri: &str) -> StatusCode {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await.0
}

async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, body) = send(app, request).await;
    (status, serde_json::from_str(&body).unwrap_or(serde_json::Value::Null))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn test_health_check() {
    let t = create_test_app().await;

    let (status, body) = get(&t.app, "/health").await;
    assert_eq!(status, StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "metalboot-server");
    assert_eq!(json["storage"], "ok");
}

#[tokio::test]
async fn test_efi_install_end_to_end() {
    let t = create_test_app().await;
    let appliance = seed_appliance(&t.store).await;
    let system = seed_system(&t.store, "web01", &[mac(MAC)], Some(appliance.id)).await;
    let image = seed_image(&t.store, "fedora").await;
    write_kernel(&t.images, &image);
    let install = seed_installation(&t.store, &system, &image, Duration::hours(1), "").await;

    // boot script
    let (status, script) = get(&t.app, &format!("/boot/efi/{}/grub.cfg", MAC_DASHED)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(script.contains(&format!(
        "# SystemID={} ImageID={} InstallUUID={}",
        system.id, image.id, install.uuid
    )));
    assert!(script.contains(&format!(
        "linuxefi /boot/efi/{}/images/pxeboot/vmlinuz",
        MAC_DASHED
    )));
    assert!(script.contains("initrdefi"));
    assert_eq!(state_of(&t.store, install.uuid).await, InstallState::Booting);

    // kernel from the image directory
    let (status, kernel) = get(
        &t.app,
        &format!("/boot/efi/{}/images/pxeboot/vmlinuz", MAC_DASHED),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(kernel, "kernel");
    assert_eq!(state_of(&t.store, install.uuid).await, InstallState::Booting);

    // kickstart; the driver controls power so the installer shuts down
    let (status, ks) = kickstart(&t.app, &[&format!("eth0 {}", MAC)]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(ks.contains("--hostname=web01"));
    assert!(ks.contains(&format!(
        "liveimg --url=http://127.0.0.1:8000/boot/efi/{}/liveimg.tar.gz --checksum=f00d",
        MAC_DASHED
    )));
    assert!(ks.lines().any(|line| line == "shutdown"));
    assert!(ks.contains(&format!("/done/{}", install.uuid)));
    assert_eq!(state_of(&t.store, install.uuid).await, InstallState::Installing);

    // completion
    assert_eq!(post(&t.app, &format!("/done/{}", install.uuid)).await, StatusCode::OK);
    assert_eq!(state_of(&t.store, install.uuid).await, InstallState::Finished);
    let calls = t.recorder.wait_for(1).await;
    assert_eq!(calls, vec![("local", "uid-web01".to_string())]);

    // a second signal is refused and schedules nothing
    assert_eq!(
        post(&t.app, &format!("/done/{}", install.uuid)).await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(t.power.scheduled(), 1);
}

#[tokio::test]
async fn test_installing_system_boots_discovery_but_gets_kickstart() {
    let t = create_test_app().await;
    let system = seed_system(&t.store, "db01", &[mac(MAC)], None).await;
    let image = seed_image(&t.store, "rhel").await;
    let install = seed_installation(&t.store, &system, &image, Duration::hours(1), "").await;

    let (_, ks) = kickstart(&t.app, &[&format!("eth0 {}", MAC)]).await;
    assert!(ks.contains(&format!("InstallUUID={}", install.uuid)));
    // no appliance, so the installer reboots on its own
    assert!(ks.lines().any(|line| line == "reboot"));
    assert_eq!(state_of(&t.store, install.uuid).await, InstallState::Installing);

    // the installer reboot must not loop back into the installation
    let (status, script) = get(&t.app, &format!("/boot/bios/{}/grub.cfg", MAC_DASHED)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(script.contains(&format!("ImageID={}", t.discovery_image.id)));
    assert!(script.contains("linux /boot/bios/"));

    // but the kickstart is still served
    let (_, ks) = kickstart(&t.app, &[&format!("eth0 {}", MAC)]).await;
    assert!(ks.contains(&format!("InstallUUID={}", install.uuid)));
}

#[tokio::test]
async fn test_installer_artifacts_come_from_deployed_image() {
    let t = create_test_app().await;
    let system = seed_system(&t.store, "web01", &[mac(MAC)], None).await;
    let image = seed_image(&t.store, "fedora").await;
    let install = seed_installation(&t.store, &system, &image, Duration::hours(1), "").await;
    for (owner, label) in [(&image, "FEDORA"), (&t.discovery_image, "DISCOVERY")] {
        write_image_file(&t.images, owner, "liveimg.tar.gz", &format!("{}-LIVEIMG", label));
        write_image_file(&t.images, owner, "images/install.img", &format!("{}-STAGE2", label));
    }

    let (status, script) = get(&t.app, &format!("/boot/efi/{}/grub.cfg", MAC_DASHED)).await;
    assert_eq!(status, StatusCode::OK);
    let stage2 = Regex::new(r"inst\.stage2=http://127\.0\.0\.1:8000(\S+)")
        .unwrap()
        .captures(&script)
        .expect("stage2 on the kernel command line")[1]
        .to_string();

    let (status, ks) = kickstart(&t.app, &[&format!("eth0 {}", MAC)]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state_of(&t.store, install.uuid).await, InstallState::Installing);
    let liveimg = Regex::new(r"liveimg --url=http://127\.0\.0\.1:8000(\S+) --checksum=f00d")
        .unwrap()
        .captures(&ks)
        .expect("liveimg line in kickstart")[1]
        .to_string();

    // anaconda pulls both after it has fetched the kickstart
    let (status, body) = get(&t.app, &liveimg).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "FEDORA-LIVEIMG");
    let (status, body) = get(&t.app, &format!("{}/images/install.img", stage2)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "FEDORA-STAGE2");
    assert_eq!(state_of(&t.store, install.uuid).await, InstallState::Installing);

    // once finished the address belongs to discovery again
    assert_eq!(post(&t.app, &format!("/done/{}", install.uuid)).await, StatusCode::OK);
    let (_, body) = get(&t.app, &liveimg).await;
    assert_eq!(body, "DISCOVERY-LIVEIMG");
}

#[tokio::test]
async fn test_numeric_name_gets_fallback_hostname() {
    let t = create_test_app().await;
    let system = seed_system(&t.store, "1234", &[mac(MAC)], None).await;
    let image = seed_image(&t.store, "fedora").await;
    seed_installation(&t.store, &system, &image, Duration::hours(1), "").await;

    let (status, ks) = kickstart(&t.app, &[&format!("eth0 {}", MAC)]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(ks.contains(&format!("--hostname=system-{}", system.id)), "{}", ks);
}

#[tokio::test]
async fn test_unknown_mac_boots_most_recent_discovery() {
    let t = create_test_app().await;
    let discovery = t.store.find_system_by_mac(&HwAddr::null()).await.unwrap().unwrap();
    let newer = seed_image(&t.store, "discovery-next").await;
    seed_installation(&t.store, &discovery, &newer, Duration::days(730), "").await;

    for addr in ["de-ad-be-ef-00-01", "de-ad-be-ef-00-02", "de-ad-be-ef-00-01"] {
        let (status, script) = get(&t.app, &format!("/boot/ipxe/{}/script.ipxe", addr)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(script.contains(&format!("ImageID={}", newer.id)), "{}", script);
        assert!(script.contains("kernel "));
    }

    // a loader that does not identify itself also gets discovery
    let (_, script) = get(&t.app, "/boot/efi/grub.cfg").await;
    assert!(script.contains(&format!("ImageID={}", newer.id)));
}

#[tokio::test]
async fn test_expired_installation_is_ignored() {
    let t = create_test_app().await;
    let system = seed_system(&t.store, "stale", &[mac(MAC)], None).await;
    let image = seed_image(&t.store, "old").await;
    let install = seed_installation(&t.store, &system, &image, Duration::seconds(-1), "").await;

    let (_, script) = get(&t.app, &format!("/boot/efi/{}/grub.cfg", MAC_DASHED)).await;
    assert!(script.contains(&format!("ImageID={}", t.discovery_image.id)));
    assert!(!script.contains(&install.uuid.to_string()));

    assert_eq!(
        post(&t.app, &format!("/done/{}", install.uuid)).await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(t.power.scheduled(), 0);
}

#[tokio::test]
async fn test_concurrent_completion_succeeds_once() {
    let t = create_test_app().await;
    let appliance = seed_appliance(&t.store).await;
    let system = seed_system(&t.store, "race", &[mac(MAC)], Some(appliance.id)).await;
    let image = seed_image(&t.store, "fedora").await;
    let install = seed_installation(&t.store, &system, &image, Duration::hours(1), "").await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let app = t.app.clone();
            let uri = format!("/done/{}", install.uuid);
            tokio::spawn(async move { post(&app, &uri).await })
        })
        .collect();

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            StatusCode::OK => ok += 1,
            status => assert_eq!(status, StatusCode::BAD_REQUEST),
        }
    }

    assert_eq!(ok, 1);
    assert_eq!(t.power.scheduled(), 1);
    assert_eq!(t.recorder.wait_for(1).await.len(), 1);
}

#[tokio::test]
async fn test_done_rejects_garbage_uuid() {
    let t = create_test_app().await;

    assert_eq!(post(&t.app, "/done/not-a-uuid").await, StatusCode::BAD_REQUEST);
    assert_eq!(
        post(&t.app, &format!("/done/{}", Uuid::new_v4())).await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn test_repeated_requests_hit_the_cache() {
    let t = create_test_app().await;
    let uri = "/boot/efi/de-ad-be-ef-00-09/grub.cfg";

    let (_, first) = get(&t.app, uri).await;
    let queries = t.store.query_count();
    let (_, second) = get(&t.app, uri).await;

    assert_eq!(first, second);
    assert_eq!(t.store.query_count(), queries);

    let (_, stats) = get(&t.app, "/api/stats").await;
    let stats: serde_json::Value = serde_json::from_str(&stats).unwrap();
    assert_eq!(stats["cache"]["hits"], 1);
}

#[tokio::test]
async fn test_path_traversal_is_refused() {
    let t = create_test_app().await;
    let system = seed_system(&t.store, "web01", &[mac(MAC)], None).await;
    let image = seed_image(&t.store, "fedora").await;
    write_kernel(&t.images, &image);
    let install = seed_installation(&t.store, &system, &image, Duration::hours(1), "").await;

    let (status, _) = get(
        &t.app,
        &format!("/boot/efi/{}/../../../../etc/passwd", MAC_DASHED),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(&t.app, "/bootstrap/ipxe/../../etc/passwd").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // refused requests do not advance the installation
    assert_eq!(state_of(&t.store, install.uuid).await, InstallState::Queued);
}

#[tokio::test]
async fn test_missing_file_is_not_found() {
    let t = create_test_app().await;
    let system = seed_system(&t.store, "web01", &[mac(MAC)], None).await;
    let image = seed_image(&t.store, "fedora").await;
    let install = seed_installation(&t.store, &system, &image, Duration::hours(1), "").await;

    let (status, _) = get(&t.app, &format!("/boot/efi/{}/shimx64.efi", MAC_DASHED)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(state_of(&t.store, install.uuid).await, InstallState::Queued);

    let (status, _) = get(&t.app, "/boot/sparc/grub.cfg").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bootstrap_scripts() {
    let t = create_test_app().await;

    let (status, grub) = get(&t.app, "/boot/grub.cfg").await;
    assert_eq!(status, StatusCode::OK);
    assert!(grub.contains("configfile /boot/${grub_platform}/${net_default_mac}/grub.cfg"));

    let (status, ipxe) = get(&t.app, "/bootstrap/ipxe/chain.ipxe").await;
    assert_eq!(status, StatusCode::OK);
    assert!(ipxe.contains("chain http://127.0.0.1:8000/boot/ipxe/${net0/mac}/script.ipxe"));
}

#[tokio::test]
async fn test_kickstart_scans_reported_addresses() {
    let t = create_test_app().await;
    let system = seed_system(&t.store, "Web 01", &[mac(MAC)], None).await;
    let image = seed_image(&t.store, "fedora").await;
    let install = seed_installation(&t.store, &system, &image, Duration::hours(1), "").await;

    // the unknown first interface is skipped
    let (_, ks) = kickstart(
        &t.app,
        &["eth0 de:ad:be:ef:00:01", &format!("eth1 {}", MAC)],
    )
    .await;
    assert!(ks.contains(&format!("InstallUUID={}", install.uuid)));
    assert!(ks.contains("--hostname=web-01"));

    // nothing known: discovery kickstart
    let (_, ks) = kickstart(&t.app, &["eth0 de:ad:be:ef:00:02"]).await;
    assert!(ks.contains("discovery kickstart"));
    assert!(ks.contains("/api/systems"));

    // malformed header
    let (status, ks) = kickstart(&t.app, &["de:ad:be:ef:00:02"]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(ks.contains("metalboot error"));
}

#[tokio::test]
async fn test_kickstart_override_is_served_verbatim() {
    let t = create_test_app().await;
    let system = seed_system(&t.store, "custom", &[mac(MAC)], None).await;
    let image = seed_image(&t.store, "fedora").await;
    let custom = "text\nreboot\n%post\necho custom\n%end\n";
    let install = seed_installation(&t.store, &system, &image, Duration::hours(1), custom).await;

    let (_, ks) = kickstart(&t.app, &[&format!("eth0 {}", MAC)]).await;
    assert_eq!(ks, custom);
    assert_eq!(state_of(&t.store, install.uuid).await, InstallState::Installing);
}

#[tokio::test]
async fn test_register_system_merges_by_address() {
    let t = create_test_app().await;

    let (status, first) = post_json(
        &t.app,
        "/api/systems",
        json!({ "name": "db", "hw_addrs": ["aa:bb:cc:dd:ee:10"] }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, second) = post_json(
        &t.app,
        "/api/systems",
        json!({
            "hw_addrs": ["AA-BB-CC-DD-EE-11", "aa:bb:cc:dd:ee:10"],
            "facts": [{ "key": "vendor", "value": "QEMU" }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["id"], second["id"]);
    assert_eq!(second["name"], "db");
    assert_eq!(second["hw_addrs"].as_array().unwrap().len(), 2);

    let (status, _) = post_json(&t.app, "/api/systems", json!({ "hw_addrs": [] })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = get(&t.app, "/api/systems/db").await;
    assert_eq!(status, StatusCode::OK);
    let system: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(system["facts"][0]["value"], "QEMU");

    let (status, _) = get(&t.app, "/api/systems/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_enlist_and_deploy() {
    let t = create_test_app().await;
    *t.recorder.machines.lock().unwrap() = vec![
        EnlistResult {
            hw_addrs: vec![mac("52:54:00:00:00:01")],
            facts: Default::default(),
            uid: "vm-1".to_string(),
        },
        EnlistResult {
            hw_addrs: Vec::new(),
            facts: Default::default(),
            uid: "vm-without-nic".to_string(),
        },
        EnlistResult {
            hw_addrs: vec![mac("52:54:00:00:00:03")],
            facts: Default::default(),
            uid: "other".to_string(),
        },
    ];

    let (status, appliance) = post_json(
        &t.app,
        "/api/appliances",
        json!({ "name": "lab", "kind": "libvirt", "uri": "qemu:///system" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let appliance_id = appliance["id"].as_i64().unwrap();

    let (status, _) = post_json(
        &t.app,
        "/api/appliances",
        json!({ "name": "lab", "kind": "noop", "uri": "noop://" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, enlisted) = post_json(
        &t.app,
        &format!("/api/appliances/{}/enlist", appliance_id),
        json!({ "pattern": "^vm-" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(enlisted["total"], 1);
    let system_id = enlisted["systems"][0]["id"].as_i64().unwrap();
    assert_eq!(enlisted["systems"][0]["appliance_id"], appliance_id);

    let (status, image) = post_json(
        &t.app,
        "/api/images",
        json!({ "name": "fedora", "kind": "iso" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, deployed) = post_json(
        &t.app,
        "/api/installations",
        json!({ "system": system_id.to_string(), "image_id": image["id"] }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(deployed["boot_scheduled"], true);
    assert_eq!(deployed["installation"]["state"], "queued");

    let calls = t.recorder.wait_for(1).await;
    assert_eq!(calls, vec![("network", "vm-1".to_string())]);

    let (status, body) = get(&t.app, "/api/installations?threshold=queued").await;
    assert_eq!(status, StatusCode::OK);
    let listed: serde_json::Value = serde_json::from_str(&body).unwrap();
    // the deployment and the discovery installation
    assert_eq!(listed["total"], 2);

    let (status, _) = post_json(
        &t.app,
        "/api/installations",
        json!({ "system": system_id.to_string(), "image_id": 999 }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deploy_rejects_validity_out_of_range() {
    let t = create_test_app().await;
    let system = seed_system(&t.store, "web01", &[mac(MAC)], None).await;
    let image = seed_image(&t.store, "fedora").await;

    for secs in [10_000_000_000_000u64, u64::MAX] {
        let (status, body) = post_json(
            &t.app,
            "/api/installations",
            json!({ "system": system.id.to_string(), "image_id": image.id, "valid_for_secs": secs }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validity out of range");
    }

    let installations = t
        .store
        .find_installations_by_state_threshold(system.id, InstallState::Finished, Utc::now())
        .await
        .unwrap();
    assert!(installations.is_empty());

    // a sane validity is still accepted
    let (status, deployed) = post_json(
        &t.app,
        "/api/installations",
        json!({ "system": system.id.to_string(), "image_id": image.id, "valid_for_secs": 3600 }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(deployed["installation"]["state"], "queued");
}

#[tokio::test]
async fn test_installer_syslog_is_served_per_system() {
    let t = create_test_app().await;
    let system = seed_system(&t.store, "web01", &[mac(MAC)], None).await;
    let numeric = seed_system(&t.store, "1234", &[mac("aa:bb:cc:dd:ee:02")], None).await;

    let logs_dir = t.images.path().join("logs");
    let syslog = SyslogServer::bind("127.0.0.1:0", &logs_dir).await.unwrap();
    let addr = syslog.local_addr().unwrap();
    tokio::spawn(syslog.run());

    let (status, _) = get(&t.app, "/logs/web01").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let lines = [
        "<30>Oct 19 10:04:05 web01 anaconda[812]: Starting installer".to_string(),
        format!("<30>Oct 19 10:04:06 system-{} anaconda: numeric name", numeric.id),
    ];
    for line in &lines {
        client.send_to(line.as_bytes(), addr).await.unwrap();
    }

    let mut body = String::new();
    for _ in 0..100 {
        let (status, text) = get(&t.app, &format!("/logs/{}", system.id)).await;
        if status == StatusCode::OK {
            body = text;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(body, "10:04:05 Starting installer t:anaconda\n");

    for _ in 0..100 {
        let (status, text) = get(&t.app, "/logs/1234").await;
        if status == StatusCode::OK {
            assert_eq!(text, "10:04:06 numeric name t:anaconda\n");
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("log of system {} never appeared", numeric.id);
}
