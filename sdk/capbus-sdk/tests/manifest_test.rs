//! Tests for bus manifest loading and booting a bus from one.

use std::io::Write;
use std::time::Duration;

use capbus_sdk::{Bus, BusManifest, ErrorKind, Record, SdkError, Version};

const MANIFEST: &str = r#"
[bus]
publish_timeout_ms = 300
call_timeout_ms = 1500

[[schema]]
id = 0xEC40
version = "1.0"
name = "echo"
fields = [{ name = "text", type = "string" }]

[[schema]]
id = 0x7E30
version = "1.0"
fields = [{ name = "reading", type = "u64" }]

[[schema]]
id = 0x7E30
version = "1.1"
fields = [
    { name = "reading", type = "u64" },
    { name = "unit", type = "bytes[4]" },
]

[[service]]
name = "echo"
request = 0xEC40
response = 0xEC40

[[topic]]
name = "temps"
schema = 0x7E30
"#;

fn write_manifest(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("bus.toml");
    let mut f = std::fs::File::create(&path).expect("create file");
    f.write_all(contents.as_bytes()).expect("write");
    path
}

#[test]
fn load_complete_manifest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_manifest(&dir, MANIFEST);

    let manifest = BusManifest::load(&path).expect("parse manifest");
    assert_eq!(manifest.schemas.len(), 3);
    assert_eq!(manifest.schemas[0].name.as_deref(), Some("echo"));
    assert_eq!(manifest.service("echo").unwrap().schemas().request, 0xEC40);
    assert!(manifest.service("missing").is_none());

    let config = manifest.router_config();
    assert_eq!(config.publish_timeout, Duration::from_millis(300));
    assert_eq!(config.default_call_timeout, Duration::from_millis(1500));
    // Omitted values fall back to router defaults
    assert_eq!(manifest.bus.reply_timeout_ms, BusManifest::default().bus.reply_timeout_ms);
}

#[test]
fn missing_file_reports_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("absent.toml");
    match BusManifest::load(&path) {
        Err(SdkError::Io { path: p, .. }) => assert_eq!(p, path),
        other => panic!("expected Io error, got {:?}", other),
    }
}

#[test]
fn malformed_toml_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_manifest(&dir, "[[schema]\nid = 1");
    assert!(matches!(BusManifest::load(&path), Err(SdkError::Toml(_))));
}

#[test]
fn duplicate_service_is_rejected() {
    let contents = format!(
        "{}\n[[service]]\nname = \"echo\"\nrequest = 0xEC40\nresponse = 0xEC40\n",
        MANIFEST
    );
    let err = contents.parse::<BusManifest>().unwrap_err();
    assert!(matches!(err, SdkError::Manifest(_)));
}

#[test]
fn conflicting_versions_fail_install() {
    let manifest: BusManifest = r#"
        [[schema]]
        id = 9
        version = "1.0"
        fields = [{ name = "a", type = "u32" }]

        [[schema]]
        id = 9
        version = "1.1"
        fields = [{ name = "a", type = "u64" }]
    "#
    .parse()
    .unwrap();

    let err = Bus::from_manifest(&manifest).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateSchema);
}

#[test]
fn bus_boots_from_manifest() {
    let manifest: BusManifest = MANIFEST.parse().unwrap();
    let bus = Bus::from_manifest(&manifest).unwrap();

    assert_eq!(
        bus.registry().versions(0x7E30),
        vec![Version::new(1, 0), Version::new(1, 1)]
    );
    let topics = bus.router().list_topics();
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].name, "temps");

    let sensor = bus.spawn_process("sensor");
    let report = sensor
        .publish(
            "temps",
            &Record::new().with("reading", 21u64).with("unit", &b"degC"[..]),
        )
        .unwrap();
    assert_eq!(report.topic, "temps");
    assert!(report.delivered.is_empty());
}
