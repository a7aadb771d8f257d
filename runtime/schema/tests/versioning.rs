//! Versioning and round-trip behaviour of the registry
//!
//! - Round-trips across every field type
//! - Additive minor versions in both directions
//! - Major version breaks
//! - Descriptor-based registration

use capbus_schema::*;

const PROFILE: u32 = 0x0000_0F11;

fn v(major: u8, minor: u8) -> Version {
    Version::new(major, minor)
}

fn profile_v10() -> Layout {
    Layout::builder(PROFILE, v(1, 0))
        .field("uid", FieldType::U32)
        .field("name", FieldType::String)
        .build()
        .unwrap()
}

fn profile_v11() -> Layout {
    Layout::builder(PROFILE, v(1, 1))
        .field("uid", FieldType::U32)
        .field("name", FieldType::String)
        .field("avatar", FieldType::Bytes)
        .field("score", FieldType::I64)
        .build()
        .unwrap()
}

#[test]
fn round_trip_preserves_values() {
    let registry = SchemaRegistry::new();
    let layout = Layout::builder(1, v(1, 0))
        .field("a", FieldType::U8)
        .field("b", FieldType::U16)
        .field("c", FieldType::U32)
        .field("d", FieldType::U64)
        .field("e", FieldType::I32)
        .field("f", FieldType::I64)
        .field("g", FieldType::F64)
        .field("h", FieldType::Bool)
        .field("i", FieldType::FixedBytes(3))
        .field("j", FieldType::String)
        .field("k", FieldType::Bytes)
        .build()
        .unwrap();
    registry.register_layout(layout).unwrap();

    let samples = [
        Record::new()
            .with("a", 0u8)
            .with("b", 0u16)
            .with("c", 0u32)
            .with("d", 0u64)
            .with("e", 0i32)
            .with("f", 0i64)
            .with("g", 0.0f64)
            .with("h", false)
            .with("i", vec![0u8; 3])
            .with("j", "")
            .with("k", Vec::<u8>::new()),
        Record::new()
            .with("a", u8::MAX)
            .with("b", u16::MAX)
            .with("c", u32::MAX)
            .with("d", u64::MAX)
            .with("e", i32::MIN)
            .with("f", i64::MIN)
            .with("g", -1.5e300f64)
            .with("h", true)
            .with("i", vec![9u8, 8, 7])
            .with("j", "grüße, bus")
            .with("k", (0..=255u8).collect::<Vec<u8>>()),
    ];

    for record in &samples {
        let bytes = registry.encode(1, v(1, 0), record).unwrap();
        assert_eq!(&registry.decode(1, v(1, 0), &bytes).unwrap(), record);
    }
}

#[test]
fn additive_minor_is_accepted_and_breaking_minor_is_not() {
    let registry = SchemaRegistry::new();
    registry.register_layout(profile_v10()).unwrap();
    registry.register_layout(profile_v11()).unwrap();

    let reordered = Layout::builder(PROFILE, v(1, 2))
        .field("name", FieldType::String)
        .field("uid", FieldType::U32)
        .build()
        .unwrap();
    assert!(matches!(
        registry.register_layout(reordered),
        Err(SchemaError::DuplicateSchema { .. })
    ));

    // A new major may change anything
    let v2 = Layout::builder(PROFILE, v(2, 0))
        .field("uid", FieldType::U64)
        .build()
        .unwrap();
    registry.register_layout(v2).unwrap();
    assert_eq!(registry.versions(PROFILE), vec![v(1, 0), v(1, 1), v(2, 0)]);
    assert_eq!(registry.latest(PROFILE).unwrap().version(), v(2, 0));
}

#[test]
fn minor_inserted_between_must_fit_both_neighbours() {
    let registry = SchemaRegistry::new();
    registry.register_layout(profile_v10()).unwrap();
    let v12 = Layout::builder(PROFILE, v(1, 2))
        .field("uid", FieldType::U32)
        .field("name", FieldType::String)
        .field("avatar", FieldType::Bytes)
        .build()
        .unwrap();
    registry.register_layout(v12).unwrap();

    // v1.1 with a field v1.2 does not have
    let stray = Layout::builder(PROFILE, v(1, 1))
        .field("uid", FieldType::U32)
        .field("name", FieldType::String)
        .field("email", FieldType::String)
        .build()
        .unwrap();
    assert!(matches!(
        registry.register_layout(stray),
        Err(SchemaError::DuplicateSchema { .. })
    ));
}

/// A v1.1 writer talking to a reader that only knows v1.0
#[test]
fn newer_minor_payload_keeps_trailing_data() {
    let writer = SchemaRegistry::new();
    writer.register_layout(profile_v11()).unwrap();
    let record = Record::new()
        .with("uid", 42u32)
        .with("name", "ada")
        .with("avatar", vec![1u8, 2, 3])
        .with("score", -7i64);
    let bytes = writer.encode(PROFILE, v(1, 1), &record).unwrap();

    let reader = SchemaRegistry::new();
    reader.register_layout(profile_v10()).unwrap();
    let msg = reader.validate(PROFILE, v(1, 1), &bytes).unwrap();

    assert_eq!(msg.layout().version(), v(1, 0));
    assert_eq!(msg.u64("uid"), Some(42));
    assert_eq!(msg.str("name"), Some("ada"));
    assert!(msg.get("avatar").is_none());
    // avatar slot (8) + score (8) survive uninterpreted, as do the avatar bytes
    assert_eq!(msg.trailing_fixed().len(), 16);
    assert_eq!(msg.trailing_heap(), &[1u8, 2, 3][..]);

    assert_eq!(
        msg.to_record(),
        Record::new().with("uid", 42u32).with("name", "ada")
    );
}

/// A v1.0 writer talking to a reader that knows v1.1
#[test]
fn older_minor_payload_reads_missing_fields_as_absent() {
    let writer = SchemaRegistry::new();
    writer.register_layout(profile_v10()).unwrap();
    let bytes = writer
        .encode(PROFILE, v(1, 0), &Record::new().with("uid", 1u32).with("name", "bo"))
        .unwrap();

    let reader = SchemaRegistry::new();
    reader.register_layout(profile_v11()).unwrap();
    let msg = reader.validate(PROFILE, v(1, 0), &bytes).unwrap();
    assert_eq!(msg.layout().version(), v(1, 1));
    assert_eq!(msg.str("name"), Some("bo"));
    assert!(msg.get("score").is_none());
    assert_eq!(msg.to_record().len(), 2);
}

#[test]
fn same_version_size_must_match_exactly() {
    let registry = SchemaRegistry::new();
    registry.register_layout(profile_v10()).unwrap();
    let mut bytes = registry
        .encode(PROFILE, v(1, 0), &Record::new().with("uid", 1u32).with("name", "x"))
        .unwrap();

    // Claim one extra fixed byte
    bytes[0] += 1;
    bytes.insert(2 + 12, 0);
    assert!(matches!(
        registry.validate(PROFILE, v(1, 0), &bytes),
        Err(SchemaError::SchemaMismatch { .. })
    ));
}

#[test]
fn major_mismatch_is_incompatible() {
    let registry = SchemaRegistry::new();
    registry.register_layout(profile_v10()).unwrap();
    let bytes = registry
        .encode(PROFILE, v(1, 0), &Record::new().with("uid", 1u32).with("name", "x"))
        .unwrap();

    assert!(matches!(
        registry.validate(PROFILE, v(2, 0), &bytes),
        Err(SchemaError::VersionIncompatible { .. })
    ));
    assert!(matches!(
        registry.encode(PROFILE, v(1, 1), &Record::new()),
        Err(SchemaError::VersionIncompatible { .. })
    ));
}

#[test]
fn descriptor_registration() {
    let bytes = encode_descriptor(&profile_v11());
    let view = DescriptorView::parse(&bytes).unwrap();
    assert_eq!(view.field_count(), 4);
    let names: Vec<&str> = view.fields().map(|f| f.name).collect();
    assert_eq!(names, vec!["uid", "name", "avatar", "score"]);

    let registry = SchemaRegistry::new();
    let layout = registry.register_descriptor(&bytes).unwrap();
    assert_eq!(*layout, profile_v11());
    assert!(registry.contains(PROFILE));
}
