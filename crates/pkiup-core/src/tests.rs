use std::path::Path;

use super::*;

#[test]
fn parse_full_and_short_versions() {
    assert_eq!(Version::parse("10.8.0").expect("must parse"), Version::new(10, 8, 0));
    assert_eq!(Version::parse("10.8").expect("must parse"), Version::new(10, 8, 0));
    assert_eq!(
        Version::parse("11.0-beta1").expect("must parse").to_string(),
        "11.0.0-beta1"
    );
}

#[test]
fn reject_malformed_versions() {
    for raw in ["", "latest", "10", "10.x.0", "1.2.3+build5"] {
        assert!(Version::parse(raw).is_err(), "'{raw}' must be rejected");
    }
}

#[test]
fn versions_are_totally_ordered() {
    let mut versions = ["10.10.0", "10.8.0", "10.9.0-beta1", "10.9.0", "9.99.99"]
        .iter()
        .map(|raw| Version::parse(raw).expect("must parse"))
        .collect::<Vec<_>>();
    versions.sort();
    let rendered = versions.iter().map(ToString::to_string).collect::<Vec<_>>();
    assert_eq!(
        rendered,
        vec!["9.99.99", "10.8.0", "10.9.0-beta1", "10.9.0", "10.10.0"]
    );
}

#[test]
fn parse_manifest_orders_steps_by_ordinal() {
    let content = r#"
version = "10.8.0"

[[scriptlets]]
ordinal = 3
name = "FixDefaultTomcatFiles"
message = "Fix links to default Tomcat files"

[[scriptlets]]
ordinal = 1
name = "UpdateServerXml"
"#;

    let manifest = VersionManifest::from_toml_str(content).expect("manifest should parse");
    let version = manifest.version.clone().expect("version declared");
    let steps = manifest.steps(&version);

    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].name, "UpdateServerXml");
    assert_eq!(steps[0].index, 0);
    assert_eq!(steps[0].ordinal, 1);
    assert_eq!(steps[1].name, "FixDefaultTomcatFiles");
    assert_eq!(steps[1].index, 1);
    assert_eq!(steps[1].label(), "03-FixDefaultTomcatFiles");
    assert_eq!(
        steps[1].message.as_deref(),
        Some("Fix links to default Tomcat files")
    );
}

#[test]
fn manifest_without_scriptlets_has_no_steps() {
    let manifest = VersionManifest::from_toml_str("").expect("empty manifest is valid");
    assert!(manifest.version.is_none());
    assert!(manifest.steps(&Version::new(1, 0, 0)).is_empty());
}

#[test]
fn manifest_rejects_duplicate_ordinals() {
    let content = r#"
[[scriptlets]]
ordinal = 1
name = "First"

[[scriptlets]]
ordinal = 1
name = "Second"
"#;
    let err = VersionManifest::from_toml_str(content).expect_err("duplicate must fail");
    assert!(err.to_string().contains("duplicate scriptlet ordinal 1"));
}

#[test]
fn manifest_rejects_blank_scriptlet_name() {
    let content = r#"
[[scriptlets]]
ordinal = 1
name = "  "
"#;
    assert!(VersionManifest::from_toml_str(content).is_err());
}

#[test]
fn manifest_rejects_bad_version_value() {
    let content = "version = \"ten\"\n";
    assert!(VersionManifest::from_toml_str(content).is_err());
}

#[test]
fn sha256_of_known_input() {
    assert_eq!(
        sha256_hex(b"abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[test]
fn only_repair_conditions_are_not_retryable() {
    let io = UpgradeError::state_io(Path::new("/tmp/state.json"), "disk full");
    assert!(io.is_retryable());
    assert!(io.to_string().contains("/tmp/state.json"));

    let repair = UpgradeError::NeedsRepair {
        instance_id: "pki-tomcat".to_string(),
        reason: "rollback failed".to_string(),
    };
    assert!(!repair.is_retryable());
}
