// tests/remote.rs

//! Publishing and deploying through the object-storage transport, with
//! injected provider faults.

mod common;

use common::{TestEnv, current_version, pseudo_random};
use depot::archive::pack;
use depot::deploy::DeployState;
use depot::transport::{MemoryObjectStore, keys};
use depot::{
    BuildOptions, ComponentOutcome, ComponentRef, ComposeOptions, CompressionFormat, DeployOptions,
    Deployer, FilesystemTransport, ReleaseComposer, RemoteTransport, RetryPolicy,
};
use std::time::Duration;
use tempfile::TempDir;

const PUBLISH_PART: usize = 1024;
const FETCH_PART: usize = 4096;

fn remote_env(objects: &MemoryObjectStore) -> TestEnv {
    let transport = RemoteTransport::new(objects.clone(), PUBLISH_PART).with_retry(RetryPolicy::immediate(3));
    TestEnv::with_transport(TempDir::new().unwrap(), Box::new(transport))
}

/// Pack a model whose archive spans several parts
fn pack_large(env: &TestEnv, version: &str) -> depot::ComponentManifest {
    let src = env.source(
        &format!("large-{}", version),
        &[("VERSION", version.as_bytes()), ("weights.bin", &pseudo_random(20_000, 42))],
    );
    let options = BuildOptions {
        compression: CompressionFormat::None,
        ..Default::default()
    };
    pack(&env.store, &src, "model", version, &options, false).unwrap()
}

#[test]
fn test_publish_retries_failed_parts() {
    let objects = MemoryObjectStore::new();
    let env = remote_env(&objects);
    let manifest = pack_large(&env, "1.0.0");

    objects.fail_next_part_uploads(2);
    env.publish("r1", &["model:1.0.0"]);

    let key = keys::component_archive("r1", "model", "1.0.0", &manifest.archive_file);
    let stored = objects.object_bytes(&key).unwrap();
    assert_eq!(stored.len() as u64, manifest.archive_size);
    assert_eq!(stored, std::fs::read(env.store.archive_path(&manifest)).unwrap());
    assert_eq!(objects.pending_uploads(), 0);
    assert!(objects.object_bytes("r1/release.json").is_some());
}

#[test]
fn test_publish_gives_up_after_retry_budget() {
    let objects = MemoryObjectStore::new();
    let env = remote_env(&objects);
    pack_large(&env, "1.0.0");

    objects.fail_next_part_uploads(10);
    let err = depot::ReleaseComposer::new(&env.store, env.transport.as_ref())
        .compose(
            "r1",
            &[depot::ComponentRef::new("model", "1.0.0")],
            &depot::ComposeOptions::default(),
        )
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(objects.pending_uploads(), 0);
    assert!(objects.object_bytes("r1/release.json").is_none());
    assert!(!env.store.has_release("r1"));
}

#[test]
fn test_interrupted_fetch_resumes_on_next_deploy() {
    let objects = MemoryObjectStore::new();
    let env = remote_env(&objects);
    let manifest = pack_large(&env, "1.0.0");
    env.publish("r1", &["model:1.0.0"]);

    let fetch = RemoteTransport::new(objects.clone(), FETCH_PART).with_retry(RetryPolicy::immediate(1));
    let deployer = Deployer::new(&fetch, env.target());

    // release.json and manifest.json take one read each, then two archive chunks
    objects.fail_range_reads_after(4, 1);
    let report = deployer.deploy("r1", &DeployOptions::default()).unwrap();
    match &report.component("model").unwrap().outcome {
        ComponentOutcome::Failed { state, retryable, .. } => {
            assert_eq!(*state, DeployState::Fetching);
            assert!(*retryable);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!env.target().join("current/model").exists());

    let release_len = objects.object_bytes("r1/release.json").unwrap().len() as u64;
    let manifest_len = objects
        .object_bytes(&keys::component_manifest("r1", "model", "1.0.0"))
        .unwrap()
        .len() as u64;
    let served_before = objects.stats().bytes_served;

    let report = deployer.deploy("r1", &DeployOptions::default()).unwrap();
    assert!(report.is_success());
    assert_eq!(current_version(&env.target(), "model"), "1.0.0");

    let resumed_archive = manifest.archive_size - 2 * FETCH_PART as u64;
    assert_eq!(
        objects.stats().bytes_served - served_before,
        release_len + manifest_len + resumed_archive
    );
}

#[test]
fn test_expired_deadline_aborts_upload() {
    let objects = MemoryObjectStore::new();
    let transport = RemoteTransport::new(objects.clone(), PUBLISH_PART)
        .with_retry(RetryPolicy::immediate(3))
        .with_timeout(Duration::ZERO);
    let env = TestEnv::with_transport(TempDir::new().unwrap(), Box::new(transport));
    pack_large(&env, "1.0.0");

    let err = depot::ReleaseComposer::new(&env.store, env.transport.as_ref())
        .compose(
            "r1",
            &[depot::ComponentRef::new("model", "1.0.0")],
            &depot::ComposeOptions::default(),
        )
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(objects.pending_uploads(), 0);
    assert!(objects.object_bytes("r1/release.json").is_none());
}

#[test]
fn test_interrupted_primary_falls_over_to_mirror() {
    let objects = MemoryObjectStore::new();
    let env = remote_env(&objects);
    pack_large(&env, "1.0.0");
    env.publish("r1", &["model:1.0.0"]);

    let mirror = FilesystemTransport::new(env.temp.path().join("mirror")).unwrap();
    let options = ComposeOptions {
        force: true,
        ..Default::default()
    };
    ReleaseComposer::new(&env.store, &mirror)
        .compose("r1", &[ComponentRef::new("model", "1.0.0")], &options)
        .unwrap();

    let primary = RemoteTransport::new(objects.clone(), FETCH_PART).with_retry(RetryPolicy::immediate(1));
    objects.fail_range_reads_after(4, 1);

    let report = Deployer::new(&primary, env.target())
        .with_fallback(&mirror)
        .deploy("r1", &DeployOptions::default())
        .unwrap();
    assert!(report.is_success());
    assert_eq!(
        report.component("model").unwrap().outcome,
        ComponentOutcome::Deployed { extracted: true }
    );
    assert_eq!(current_version(&env.target(), "model"), "1.0.0");
}
