use std::fs;

use bundlekit::error::Error;
use bundlekit::object::Value;
use bundlekit::workset::{PPtr, PtrState, WorkingSet};
use bundlekit::{ByteSource, TitleConfig, TitleVariant};
use tempfile::NamedTempFile;

mod common;

#[test]
fn bundle_unpacks_into_decoded_objects_and_resources() {
    let asset = common::build_serialized_file(
        &[(1, common::text_asset_bytes("hello", "body text"))],
        &[],
    );
    let bundle = common::build_bundle(&[
        ("CAB-test", asset),
        ("CAB-test.resS", b"raw resource bytes".to_vec()),
    ]);

    let mut set = WorkingSet::new(TitleConfig::default());
    set.load_source("game.bundle", ByteSource::from_vec(bundle), 0).unwrap();

    assert_eq!(set.file_count(), 1);
    assert!(set.resource_names().any(|n| n == "CAB-test.resS"));

    let slot = set.file_index("CAB-test").unwrap();
    let value = set.object(slot, 1).unwrap();
    assert_eq!(value.get("m_Name").and_then(Value::as_str), Some("hello"));
    assert_eq!(value.get("m_Script").and_then(Value::as_str), Some("body text"));

    let dump = set.dump_object(slot, 1).unwrap();
    assert!(dump.contains("string m_Name = \"hello\""));
    assert!(dump.contains("string m_Script = \"body text\""));
}

#[test]
fn name_lookup_is_case_insensitive() {
    let asset = common::build_serialized_file(
        &[(1, common::text_asset_bytes("x", "y"))],
        &[],
    );
    let mut set = WorkingSet::new(TitleConfig::default());
    set.load_source("SharedAssets0.assets", ByteSource::from_vec(asset), 0).unwrap();
    assert!(set.file_index("sharedassets0.ASSETS").is_some());
}

#[test]
fn absent_pointer_stays_absent_until_clear() {
    let main = common::build_serialized_file(
        &[(1, common::text_asset_bytes("main", "body"))],
        &["shared.assets"],
    );
    let shared = common::build_serialized_file(
        &[(2, common::text_asset_bytes("shared", "payload"))],
        &[],
    );

    let mut set = WorkingSet::new(TitleConfig::default());
    set.load_source("main.assets", ByteSource::from_vec(main.clone()), 0).unwrap();
    let owner = set.file_index("main.assets").unwrap();
    assert_eq!(set.resolve_file(owner, 1), PtrState::Absent);

    // The confirmed miss is sticky: loading the dependency afterwards
    // does not revisit it.
    set.load_source("shared.assets", ByteSource::from_vec(shared.clone()), 0).unwrap();
    assert_eq!(set.resolve_file(owner, 1), PtrState::Absent);

    // Clear drops the cache; a fresh load resolves.
    set.clear();
    assert_eq!(set.file_count(), 0);
    set.load_source("main.assets", ByteSource::from_vec(main), 0).unwrap();
    set.load_source("shared.assets", ByteSource::from_vec(shared), 0).unwrap();
    let owner = set.file_index("main.assets").unwrap();
    let shared_slot = set.file_index("shared.assets").unwrap();
    assert_eq!(set.resolve_file(owner, 1), PtrState::Resolved(shared_slot));

    let target = set.resolve_object(owner, PPtr { file_id: 1, path_id: 2 }).unwrap();
    assert_eq!(target.get("m_Name").and_then(Value::as_str), Some("shared"));
}

#[test]
fn pointer_to_missing_object_is_not_found_not_an_error() {
    let main = common::build_serialized_file(
        &[(1, common::text_asset_bytes("main", "body"))],
        &[],
    );
    let mut set = WorkingSet::new(TitleConfig::default());
    set.load_source("main.assets", ByteSource::from_vec(main), 0).unwrap();
    let owner = set.file_index("main.assets").unwrap();

    assert!(set.resolve_object(owner, PPtr { file_id: 0, path_id: 999 }).is_none());
    assert!(set.resolve_object(owner, PPtr { file_id: 0, path_id: 0 }).is_none());
}

#[test]
fn dependencies_load_from_the_entry_directory() {
    let dir = tempfile::tempdir().unwrap();
    let main = common::build_serialized_file(
        &[(1, common::text_asset_bytes("main", "body"))],
        &["shared.assets", "absent.assets"],
    );
    let shared = common::build_serialized_file(
        &[(2, common::text_asset_bytes("shared", "payload"))],
        &[],
    );
    fs::write(dir.path().join("main.assets"), main).unwrap();
    fs::write(dir.path().join("shared.assets"), shared).unwrap();

    let mut set = WorkingSet::new(TitleConfig::default());
    set.load_with_dependencies(&dir.path().join("main.assets")).unwrap();

    // The present dependency joined the set; the absent one was skipped.
    assert_eq!(set.file_count(), 2);
    let owner = set.file_index("main.assets").unwrap();
    assert!(matches!(set.resolve_file(owner, 1), PtrState::Resolved(_)));
    assert_eq!(set.resolve_file(owner, 2), PtrState::Absent);
}

#[test]
fn shifted_signature_title_loads_through_the_transform() {
    let asset = common::build_serialized_file(
        &[(1, common::text_asset_bytes("hidden", "body"))],
        &[],
    );
    let bundle = common::build_bundle(&[("CAB-hidden", asset)]);
    let mut shifted = vec![0xAAu8; 16];
    shifted.extend_from_slice(&bundle);

    let temp = NamedTempFile::new().unwrap();
    fs::write(temp.path(), &shifted).unwrap();

    // Without the transform the stream matches no format and stays an
    // opaque resource.
    let mut set = WorkingSet::new(TitleConfig::default());
    set.load_path(temp.path()).unwrap();
    assert_eq!(set.file_count(), 0);

    let config = TitleConfig { variant: TitleVariant::ShiftedSignature, ..TitleConfig::default() };
    let mut set = WorkingSet::new(config);
    set.load_path(temp.path()).unwrap();
    let slot = set.file_index("CAB-hidden").unwrap();
    let value = set.object(slot, 1).unwrap();
    assert_eq!(value.get("m_Name").and_then(Value::as_str), Some("hidden"));
}

#[test]
fn cancellation_interrupts_batch_decoding() {
    let asset = common::build_serialized_file(
        &[
            (1, common::text_asset_bytes("a", "1")),
            (2, common::text_asset_bytes("b", "2")),
        ],
        &[],
    );
    let mut set = WorkingSet::new(TitleConfig::default());
    set.load_source("main.assets", ByteSource::from_vec(asset), 0).unwrap();
    let slot = set.file_index("main.assets").unwrap();

    set.cancel_token().cancel();
    match set.decode_all(slot) {
        Err(Error::Cancelled) => {}
        other => panic!("expected Cancelled, got {:?}", other.err()),
    }
}

#[test]
fn object_decoding_is_cached_per_path_id() {
    let asset = common::build_serialized_file(
        &[(1, common::text_asset_bytes("once", "body"))],
        &[],
    );
    let mut set = WorkingSet::new(TitleConfig::default());
    set.load_source("main.assets", ByteSource::from_vec(asset), 0).unwrap();
    let slot = set.file_index("main.assets").unwrap();

    let first = set.object(slot, 1).unwrap().clone();
    let second = set.object(slot, 1).unwrap();
    assert_eq!(&first, second);
}
