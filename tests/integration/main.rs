//! Integration tests for envforge

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// envforge with state and config isolated in `dir`
    fn envforge(dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("envforge");
        cmd.env("ENVFORGE_STATE_DIR", dir.path().join("state"))
            .env("ENVFORGE_CONFIG", dir.path().join("config.toml"))
            .env_remove("RUST_LOG");
        cmd
    }

    #[test]
    fn help_displays() {
        let dir = TempDir::new().unwrap();
        envforge(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Fingerprint-cached image builds"))
            .stdout(predicate::str::contains("resume").not());
    }

    #[test]
    fn version_displays() {
        let dir = TempDir::new().unwrap();
        envforge(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("envforge"));
    }

    #[test]
    fn jobs_empty() {
        let dir = TempDir::new().unwrap();
        envforge(&dir)
            .arg("jobs")
            .assert()
            .success()
            .stdout(predicate::str::contains("No active build jobs"));
    }

    #[test]
    fn jobs_empty_json() {
        let dir = TempDir::new().unwrap();
        envforge(&dir)
            .args(["jobs", "--all", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }

    #[test]
    fn status_missing_job() {
        let dir = TempDir::new().unwrap();
        envforge(&dir)
            .args(["status", "3f2b8c1e-0000-4000-8000-000000000000"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Build job not found"));
    }

    #[test]
    fn images_empty() {
        let dir = TempDir::new().unwrap();
        envforge(&dir)
            .arg("images")
            .assert()
            .success()
            .stdout(predicate::str::contains("No cached images"));
    }

    #[test]
    fn images_remove_missing_entry() {
        let dir = TempDir::new().unwrap();
        envforge(&dir)
            .args(["images-remove", "us-east-1", "deadbeef"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No cached image"));
    }

    #[test]
    fn config_path() {
        let dir = TempDir::new().unwrap();
        envforge(&dir)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let dir = TempDir::new().unwrap();
        envforge(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("[network]"));
    }

    #[test]
    fn config_init_then_show() {
        let dir = TempDir::new().unwrap();
        envforge(&dir).args(["config", "init"]).assert().success();
        assert!(dir.path().join("config.toml").exists());
    }

    #[test]
    fn build_with_invalid_spec_fails_before_launch() {
        let dir = TempDir::new().unwrap();
        let spec = dir.path().join("spec.toml");
        let payload = dir.path().join("install.sh");
        std::fs::write(&spec, "base_os = \"\"\npackages = [\"gcc\"]\n").unwrap();
        std::fs::write(&payload, "echo hi\n").unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[general]\nprovider = \"memory\"\naudit_log = false\n",
        )
        .unwrap();

        envforge(&dir)
            .args(["build"])
            .arg(&spec)
            .arg("--payload")
            .arg(&payload)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid software spec"));
    }

    #[test]
    fn unknown_provider_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[general]\nprovider = \"gcp\"\n",
        )
        .unwrap();

        envforge(&dir)
            .arg("images")
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown provider"));
    }
}

mod pipeline_tests {
    use envforge::audit::AuditLog;
    use envforge::build::{
        BuildMode, BuildOptions, BuildOrchestrator, BuildRequest, BuildStateStore, BuildStatus,
        EnsureOutcome,
    };
    use envforge::cache::{HitSource, ImageCache};
    use envforge::config::schema::BuildConfig;
    use envforge::fingerprint::SoftwareSpec;
    use envforge::provider::MemoryCloud;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn orchestrator(dir: &TempDir, cloud: &Arc<MemoryCloud>, index: &str) -> Arc<BuildOrchestrator> {
        let cache = Arc::new(ImageCache::new(dir.path().join(index), cloud.clone()));
        let store = Arc::new(BuildStateStore::new(dir.path().join("jobs")));
        let config = BuildConfig {
            base_image: Some("ami-base".to_string()),
            ..BuildConfig::default()
        };
        Arc::new(
            BuildOrchestrator::new(
                cloud.clone(),
                cache,
                store,
                Arc::new(AuditLog::at(dir.path().join("audit.log"))),
                config,
            )
            .with_poll_intervals(Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    fn request(packages: &[&str]) -> BuildRequest {
        BuildRequest {
            spec: SoftwareSpec::new(packages.iter().copied(), "rocky9", "0.21.0", "5.3.1"),
            template: "cfd".to_string(),
            region: "eu-west-1".to_string(),
            payload: "spack install openfoam\n".to_string(),
            target: None,
        }
    }

    fn script_success(cloud: &MemoryCloud) {
        cloud.script_console([
            "[ENVFORGE-PROGRESS] Installing openfoam@2306 (1/1 packages, 0%)",
            "[ENVFORGE-PROGRESS] DONE",
        ]);
    }

    #[tokio::test]
    async fn built_image_is_reused_by_fingerprint() {
        let dir = TempDir::new().unwrap();
        let cloud = Arc::new(MemoryCloud::new());
        script_success(&cloud);
        let first = orchestrator(&dir, &cloud, "image-cache.json");

        let built = first
            .ensure_image(request(&["openfoam@2306", "gcc@11.3.0"]), BuildOptions::default())
            .await
            .unwrap();
        let EnsureOutcome::Built { job_id, image_id } = built else {
            panic!("expected a build, got {:?}", built);
        };

        let job = first.status(&job_id).await.unwrap();
        assert_eq!(job.status, BuildStatus::Complete);
        assert_eq!(job.image_id.as_deref(), Some(image_id.as_str()));
        assert_eq!(cloud.live_instances(), 0);

        // Same packages in another order hit the local index
        let again = first
            .ensure_image(request(&["gcc@11.3.0", "openfoam@2306"]), BuildOptions::default())
            .await
            .unwrap();
        assert!(matches!(&again, EnsureOutcome::Cached(hit) if hit.source == HitSource::Local));
        assert_eq!(again.image_id(), Some(image_id.as_str()));

        // A process with an empty index finds it through provider tags
        let other = orchestrator(&dir, &cloud, "other-index.json");
        let found = other
            .ensure_image(request(&["openfoam@2306", "gcc@11.3.0"]), BuildOptions::default())
            .await
            .unwrap();
        assert!(matches!(&found, EnsureOutcome::Cached(hit) if hit.source == HitSource::Provider));

        let audit = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
        assert!(audit.contains("build.started"));
        assert!(audit.contains("build.completed"));
    }

    #[tokio::test]
    async fn handoff_build_finishes_on_resume() {
        let dir = TempDir::new().unwrap();
        let cloud = Arc::new(MemoryCloud::new());
        script_success(&cloud);
        let launcher = orchestrator(&dir, &cloud, "image-cache.json");

        let options = BuildOptions {
            mode: BuildMode::Handoff,
            ..BuildOptions::default()
        };
        let started = launcher
            .ensure_image(request(&["openfoam@2306"]), options)
            .await
            .unwrap();
        let job_id = started.job_id().unwrap().to_string();
        assert_eq!(
            launcher.status(&job_id).await.unwrap().status,
            BuildStatus::Launching
        );

        // A separate worker picks the job up from the persisted record
        let worker = orchestrator(&dir, &cloud, "image-cache.json");
        let image_id = worker
            .resume(&job_id[..8], &BuildOptions::default())
            .await
            .unwrap();

        let job = worker.status(&job_id).await.unwrap();
        assert_eq!(job.status, BuildStatus::Complete);
        assert_eq!(job.image_id.as_deref(), Some(image_id.as_str()));
        assert!(launcher.list_jobs(false).await.unwrap().is_empty());
        assert_eq!(launcher.list_jobs(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_install_leaves_no_instance() {
        let dir = TempDir::new().unwrap();
        let cloud = Arc::new(MemoryCloud::new());
        cloud.script_console(["[ENVFORGE-PROGRESS] FAILED: spack exited with status 1"]);
        let orchestrator = orchestrator(&dir, &cloud, "image-cache.json");

        let err = orchestrator
            .ensure_image(request(&["openfoam@2306"]), BuildOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("spack exited with status 1"));

        let jobs = orchestrator.list_jobs(true).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, BuildStatus::Failed);
        assert_eq!(cloud.live_instances(), 0);
        assert!(orchestrator
            .list_cached_images(Some("eu-west-1"))
            .await
            .unwrap()
            .is_empty());
    }
}

mod network_tests {
    use envforge::audit::AuditLog;
    use envforge::config::schema::NetworkConfig;
    use envforge::network::{NetworkEnvironment, NetworkProvisioner};
    use envforge::provider::MemoryCloud;
    use envforge::wait::WaitPolicy;
    use envforge::ForgeError;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn provisioner(cloud: &Arc<MemoryCloud>) -> NetworkProvisioner {
        NetworkProvisioner::new(
            cloud.clone(),
            "us-east-2",
            NetworkConfig::default(),
            Arc::new(AuditLog::disabled()),
        )
        .with_wait_policy(
            WaitPolicy::with_timeout(Duration::from_secs(5))
                .with_intervals(Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    #[tokio::test]
    async fn environment_survives_save_and_delete() {
        let dir = TempDir::new().unwrap();
        let cloud = Arc::new(MemoryCloud::new());
        let provisioner = provisioner(&cloud);

        let env = provisioner.create_network("lab").await.unwrap();
        assert!(env.managed);
        assert_eq!(cloud.live_network_resources(), 6);

        let path = dir.path().join("lab.network.json");
        env.save(&path).await.unwrap();
        let loaded = NetworkEnvironment::load(&path).await.unwrap();
        assert_eq!(loaded, env);

        provisioner.delete_network(&loaded).await.unwrap();
        assert_eq!(cloud.live_network_resources(), 0);
    }

    #[tokio::test]
    async fn failure_at_any_step_leaves_nothing() {
        for operation in [
            "create_vpc",
            "create_internet_gateway",
            "attach_internet_gateway",
            "create_subnet",
            "create_route_table",
            "associate_route_table",
            "create_security_group",
            "authorize_ingress",
        ] {
            let cloud = Arc::new(MemoryCloud::new());
            cloud.fail_on(operation, 1);

            let err = provisioner(&cloud).create_network("lab").await.unwrap_err();
            assert!(
                matches!(err, ForgeError::Provider { .. }),
                "{}: unexpected error {}",
                operation,
                err
            );
            assert_eq!(cloud.live_network_resources(), 0, "leak after {}", operation);
        }
    }

    #[tokio::test]
    async fn unmanaged_environment_is_never_deleted() {
        let cloud = Arc::new(MemoryCloud::new());
        let provisioner = provisioner(&cloud);
        let mut env = provisioner.create_network("shared").await.unwrap();
        env.managed = false;

        provisioner.delete_network(&env).await.unwrap();
        assert_eq!(cloud.live_network_resources(), 6);
    }
}

mod retention_tests {
    use chrono::{Duration, Utc};
    use envforge::build::{BuildStateStore, BuildStatus};
    use tempfile::TempDir;

    #[tokio::test]
    async fn cleanup_keeps_unfinished_jobs_regardless_of_age() {
        let dir = TempDir::new().unwrap();
        let store = BuildStateStore::new(dir.path().join("jobs"));
        let month_ago = Utc::now() - Duration::days(30);

        let mut stuck = store.create("cfd", "cfd-image", "eu-west-1", 1).await.unwrap();
        stuck.status = BuildStatus::Installing;
        stuck.started_at = month_ago;
        stuck.updated_at = month_ago;
        store.save(&stuck).await.unwrap();

        let mut finished = store.create("cfd", "cfd-image", "eu-west-1", 1).await.unwrap();
        finished.fail("spot capacity").unwrap();
        finished.ended_at = Some(month_ago);
        store.save(&finished).await.unwrap();

        let removed = store.cleanup_older_than(Duration::hours(24)).await.unwrap();
        assert_eq!(removed, vec![finished.id.clone()]);

        let left = store.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, stuck.id);
    }
}
