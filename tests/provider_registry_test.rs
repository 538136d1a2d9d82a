use std::path::Path;
use std::sync::Arc;

use scrivano::infrastructure::providers::{Capability, ProviderRegistry, RegistryError};

fn write_descriptor(root: &Path, name: &str, capabilities: &str, key_requirement: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let yaml = format!(
        r#"name: {name}
display_name: {name}
type: cloud
family: chat
capabilities: {capabilities}
api_key_requirement: {key_requirement}
base_url: https://api.{name}.example/v1
upstream_cache: false
supported_containers: [ogg]
accepts_uri: false
models: []
"#
    );
    std::fs::write(dir.join("defaults.yaml"), yaml).unwrap();
}

#[test]
fn given_descriptor_files_when_discovering_then_all_providers_are_found() {
    let tmp = tempfile::tempdir().unwrap();
    write_descriptor(tmp.path(), "northwind", "[transcription, refinement]", "none");
    write_descriptor(tmp.path(), "eastwind", "[transcription]", "none");
    // A directory without a descriptor is ignored.
    std::fs::create_dir_all(tmp.path().join("leftovers")).unwrap();

    let registry = ProviderRegistry::discover(tmp.path()).unwrap();
    let names: Vec<&str> = registry.descriptors().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["eastwind", "northwind"]);
}

#[test]
fn given_a_fixed_directory_then_discovery_is_deterministic() {
    let tmp = tempfile::tempdir().unwrap();
    write_descriptor(tmp.path(), "zulu", "[refinement]", "none");
    write_descriptor(tmp.path(), "alfa", "[transcription]", "none");

    let first: Vec<String> = ProviderRegistry::discover(tmp.path())
        .unwrap()
        .descriptors()
        .map(|d| d.name.clone())
        .collect();
    let second: Vec<String> = ProviderRegistry::discover(tmp.path())
        .unwrap()
        .descriptors()
        .map(|d| d.name.clone())
        .collect();
    assert_eq!(first, second);
    assert_eq!(first, vec!["alfa", "zulu"]);
}

#[test]
fn given_capability_queries_then_membership_is_checked_on_the_descriptor() {
    let tmp = tempfile::tempdir().unwrap();
    write_descriptor(tmp.path(), "northwind", "[transcription, refinement]", "none");
    write_descriptor(tmp.path(), "eastwind", "[transcription]", "none");

    let registry = ProviderRegistry::discover(tmp.path()).unwrap();
    assert_eq!(
        registry.capable(Capability::Transcription),
        vec!["eastwind".to_string(), "northwind".to_string()]
    );
    assert_eq!(
        registry.capable(Capability::Refinement),
        vec!["northwind".to_string()]
    );
}

#[test]
fn given_a_provider_without_the_capability_then_resolution_fails() {
    let tmp = tempfile::tempdir().unwrap();
    write_descriptor(tmp.path(), "eastwind", "[transcription]", "none");

    let registry = ProviderRegistry::discover(tmp.path()).unwrap();
    let err = registry.get_refinement("eastwind", "model-x").unwrap_err();
    assert!(matches!(err, RegistryError::MissingCapability { .. }));
}

#[test]
fn given_an_unknown_provider_then_resolution_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = ProviderRegistry::discover(tmp.path()).unwrap();
    let err = registry.get_transcription("ghost", "model-x").unwrap_err();
    assert!(matches!(err, RegistryError::UnknownProvider(_)));
}

#[test]
fn given_a_required_api_key_that_is_absent_then_the_error_names_the_variable() {
    let tmp = tempfile::tempdir().unwrap();
    write_descriptor(
        tmp.path(),
        "keyedprov_zq",
        "[transcription]",
        "required",
    );
    std::env::remove_var("KEYEDPROV_ZQ_API_KEY");

    let registry = ProviderRegistry::discover(tmp.path()).unwrap();
    let err = registry
        .get_transcription("keyedprov_zq", "model-x")
        .unwrap_err();
    match err {
        RegistryError::MissingApiKey { var, .. } => {
            assert_eq!(var, "KEYEDPROV_ZQ_API_KEY");
        }
        other => panic!("expected MissingApiKey, got {:?}", other),
    }
}

#[test]
fn given_instances_then_they_are_created_lazily_and_cached() {
    let tmp = tempfile::tempdir().unwrap();
    write_descriptor(tmp.path(), "northwind", "[transcription]", "none");

    let registry = ProviderRegistry::discover(tmp.path()).unwrap();
    let first = registry.get_transcription("northwind", "model-x").unwrap();
    let second = registry.get_transcription("northwind", "model-x").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}
