use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use pkiup_core::{UpgradeError, Version};

use super::*;

static TEST_CATALOG_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_catalog_root() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "pkiup-catalog-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_CATALOG_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("must create catalog root");
    path
}

fn write_version(root: &Path, dir_name: &str, manifest: &str) {
    let dir = root.join(dir_name);
    fs::create_dir_all(&dir).expect("must create version dir");
    fs::write(dir.join("manifest.toml"), manifest).expect("must write manifest");
}

fn v(raw: &str) -> Version {
    Version::parse(raw).expect("valid version")
}

#[test]
fn lists_versions_in_ascending_order() {
    let root = test_catalog_root();
    write_version(&root, "10.10.0", "");
    write_version(&root, "10.8.0", "");
    write_version(&root, "10.9", "");
    fs::write(root.join("README"), "not a version").expect("must write stray file");

    let catalog = VersionCatalog::open(&root);
    let versions = catalog.list_versions().expect("must list");
    assert_eq!(versions, vec![v("10.8.0"), v("10.9.0"), v("10.10.0")]);
    assert_eq!(catalog.latest().expect("must scan"), Some(v("10.10.0")));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn missing_root_is_an_empty_catalog() {
    let root = test_catalog_root().join("absent");
    let catalog = VersionCatalog::open(&root);
    assert!(catalog.list_versions().expect("must list").is_empty());
    assert_eq!(catalog.latest().expect("must scan"), None);
}

#[test]
fn pending_versions_are_strictly_greater() {
    let root = test_catalog_root();
    for name in ["1.0.0", "1.1.0", "1.2.0"] {
        write_version(&root, name, "");
    }

    let catalog = VersionCatalog::open(&root);
    assert_eq!(
        catalog.pending_versions(&v("1.0.0")).expect("must list"),
        vec![v("1.1.0"), v("1.2.0")]
    );
    assert!(catalog
        .pending_versions(&v("1.2.0"))
        .expect("must list")
        .is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn steps_follow_manifest_ordinals() {
    let root = test_catalog_root();
    write_version(
        &root,
        "10.8.0",
        r#"
[[scriptlets]]
ordinal = 3
name = "FixDefaultTomcatFiles"

[[scriptlets]]
ordinal = 1
name = "UpdateServerXml"
"#,
    );

    let catalog = VersionCatalog::open(&root);
    let steps = catalog.steps_for(&v("10.8.0")).expect("must load steps");
    let names = steps.iter().map(|step| step.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["UpdateServerXml", "FixDefaultTomcatFiles"]);
    assert_eq!(steps[1].index, 1);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn unparseable_directory_name_is_corruption() {
    let root = test_catalog_root();
    write_version(&root, "next", "");

    let err = VersionCatalog::open(&root)
        .list_versions()
        .expect_err("must fail");
    assert!(matches!(err, UpgradeError::CatalogCorruption { .. }));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn missing_manifest_is_corruption() {
    let root = test_catalog_root();
    fs::create_dir_all(root.join("1.1.0")).expect("must create version dir");

    let err = VersionCatalog::open(&root)
        .steps_for(&v("1.1.0"))
        .expect_err("must fail");
    match err {
        UpgradeError::CatalogCorruption { reason, .. } => {
            assert!(reason.contains("missing version manifest"))
        }
        other => panic!("unexpected error: {other}"),
    }

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn manifest_version_must_match_directory() {
    let root = test_catalog_root();
    write_version(&root, "1.1.0", "version = \"1.2.0\"\n");

    let err = VersionCatalog::open(&root)
        .pending_plan(&v("1.0.0"))
        .expect_err("must fail");
    assert!(err.to_string().contains("declares version 1.2.0"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn equivalent_directory_names_are_corruption() {
    let root = test_catalog_root();
    write_version(&root, "1.1", "");
    write_version(&root, "1.1.0", "");

    let err = VersionCatalog::open(&root)
        .list_versions()
        .expect_err("must fail");
    assert!(err.to_string().contains("declared twice"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn pending_plan_skips_applied_versions() {
    let root = test_catalog_root();
    write_version(&root, "1.0.0", "[[scriptlets]]\nordinal = 1\nname = \"Old\"\n");
    write_version(&root, "1.1.0", "[[scriptlets]]\nordinal = 1\nname = \"New\"\n");

    let plan = VersionCatalog::open(&root)
        .pending_plan(&v("1.0.0"))
        .expect("must plan");
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].0, v("1.1.0"));
    assert_eq!(plan[0].1[0].name, "New");

    let _ = fs::remove_dir_all(&root);
}
