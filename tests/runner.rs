//! Lifecycle tests for the DMG runner, driven through a recording executor.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mkdmg::dmg::{Config, Error, ExecError, Invocation, RecordingExecutor, Runner, State, Tool};

const ATTACH_OUTPUT: &str = "/dev/disk4          \tGUID_partition_scheme          \t\n\
                             /dev/disk4s1        \tApple_HFS                     \t/Volumes/TestVolume\n";

fn config_for(source: &tempfile::TempDir) -> Config {
    Config {
        source_dir: source.path().to_string_lossy().into_owned(),
        output_path: "test.dmg".into(),
        ..Default::default()
    }
}

fn attaching_executor() -> RecordingExecutor {
    RecordingExecutor::with_responder(|inv| match inv.first_arg() {
        Some("attach") => Ok(ATTACH_OUTPUT.to_string()),
        _ => Ok(String::new()),
    })
}

fn failed(tool: Tool, output: &str) -> ExecError {
    ExecError::Failed {
        tool,
        code: Some(1),
        output: output.to_string(),
    }
}

async fn ready_runner(config: Config, exec: RecordingExecutor) -> Runner<RecordingExecutor> {
    let mut runner = Runner::with_executor(config, exec);
    runner.setup().await.unwrap();
    runner
}

async fn mounted_runner(config: Config) -> Runner<RecordingExecutor> {
    let mut runner = ready_runner(config, attaching_executor()).await;
    runner.start().await.unwrap();
    runner.attach_disk_image().await.unwrap();
    runner
}

fn args(inv: &Invocation) -> Vec<&str> {
    inv.args.iter().map(String::as_str).collect()
}

#[tokio::test]
async fn setup_prepares_private_workspace() {
    let source = tempfile::tempdir().unwrap();
    let mut runner = ready_runner(config_for(&source), RecordingExecutor::new()).await;

    assert_eq!(runner.state(), State::Ready);
    let tmp = runner.temp_dir().unwrap().to_path_buf();
    assert!(tmp.is_dir());
    assert!(tmp.file_name().unwrap().to_string_lossy().starts_with("mkdmg-"));
    assert_eq!(runner.scratch_image().unwrap(), tmp.join("temp.dmg"));
    assert_eq!(runner.source_dir().unwrap(), source.path());
    assert!(runner.staging_dir().is_none());

    runner.cleanup();
    assert!(!tmp.exists());
    assert_eq!(runner.state(), State::Uninitialized);
}

#[tokio::test]
async fn cleanup_is_safe_to_repeat() {
    let source = tempfile::tempdir().unwrap();
    let mut never_setup = Runner::with_executor(config_for(&source), RecordingExecutor::new());
    never_setup.cleanup();
    never_setup.cleanup();

    let mut runner = ready_runner(config_for(&source), RecordingExecutor::new()).await;
    runner.cleanup();
    runner.cleanup();
    runner.cleanup();
    assert_eq!(runner.state(), State::Uninitialized);
}

#[tokio::test]
async fn dropping_runner_removes_temp_dir() {
    let source = tempfile::tempdir().unwrap();
    let runner = ready_runner(config_for(&source), RecordingExecutor::new()).await;
    let tmp = runner.temp_dir().unwrap().to_path_buf();
    drop(runner);
    assert!(!tmp.exists());
}

#[tokio::test]
async fn lifecycle_out_of_order_is_not_initialized() {
    let source = tempfile::tempdir().unwrap();
    let mut runner = Runner::with_executor(config_for(&source), RecordingExecutor::new());

    assert!(matches!(runner.start().await, Err(Error::NotInitialized)));
    assert!(matches!(runner.attach_disk_image().await, Err(Error::NotInitialized)));
    assert!(matches!(runner.detach_disk_image().await, Err(Error::NotInitialized)));
    assert!(matches!(runner.bless().await, Err(Error::NotInitialized)));
    assert!(matches!(runner.finalize_dmg().await, Err(Error::NotInitialized)));
    assert!(matches!(runner.codesign().await, Err(Error::NotInitialized)));
    assert!(matches!(runner.notarize().await, Err(Error::NotInitialized)));
    assert!(matches!(runner.generate_checksum().await, Err(Error::NotInitialized)));

    runner.setup().await.unwrap();
    assert!(matches!(runner.finalize_dmg().await, Err(Error::NotInitialized)));
    assert!(matches!(runner.codesign().await, Err(Error::NotInitialized)));

    runner.start().await.unwrap();
    assert!(matches!(runner.start().await, Err(Error::NotInitialized)));
    assert!(matches!(runner.detach_disk_image().await, Err(Error::NotInitialized)));

    assert_eq!(runner.executor().invocations().len(), 1);
}

#[tokio::test]
async fn failed_setup_leaves_runner_uninitialized() {
    let mut runner = Runner::with_executor(
        Config {
            source_dir: "src".into(),
            output_path: "bad.DMG".into(),
            ..Default::default()
        },
        RecordingExecutor::new(),
    );

    assert!(matches!(runner.setup().await, Err(Error::InvalidOutputExtension(_))));
    assert!(runner.settings().is_none());
    assert!(matches!(runner.start().await, Err(Error::NotInitialized)));
}

#[tokio::test]
async fn standard_create_arguments() {
    let source = tempfile::tempdir().unwrap();
    let config = Config {
        volume_name: "Vol".into(),
        volume_size_mb: 50,
        hdiutil_verbosity: 2,
        ..config_for(&source)
    };
    let mut runner = ready_runner(config, RecordingExecutor::new()).await;
    runner.start().await.unwrap();

    let scratch = runner.scratch_image().unwrap().to_string_lossy().into_owned();
    let src = source.path().to_string_lossy().into_owned();
    let inv = runner.executor().last().unwrap();
    assert_eq!(inv.tool, Tool::Hdiutil);
    assert_eq!(
        args(&inv),
        [
            "create", "-verbose", "-fs", "HFS+", "-fsargs", "-c c=64,a=16,e=16", "-size", "50m",
            "-format", "UDRW", "-volname", "Vol", "-srcfolder", src.as_str(), scratch.as_str(),
        ]
    );
    assert_eq!(runner.state(), State::Started);
}

#[tokio::test]
async fn sandbox_safe_uses_makehybrid_then_convert() {
    let source = tempfile::tempdir().unwrap();
    let config = Config {
        sandbox_safe: true,
        ..config_for(&source)
    };
    let mut runner = ready_runner(config, RecordingExecutor::new()).await;
    runner.start().await.unwrap();

    let scratch = runner.scratch_image().unwrap().to_string_lossy().into_owned();
    let src = source.path().to_string_lossy().into_owned();
    let calls = runner.executor().invocations();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        args(&calls[0]),
        ["makehybrid", "-default-volume-name", "test", "-hfs", "-r", src.as_str(), scratch.as_str()]
    );
    assert_eq!(
        args(&calls[1]),
        ["convert", scratch.as_str(), "-format", "UDRW", "-ov", "-o", scratch.as_str()]
    );
}

#[tokio::test]
async fn sandbox_safe_stops_when_makehybrid_fails() {
    let source = tempfile::tempdir().unwrap();
    let config = Config {
        sandbox_safe: true,
        ..config_for(&source)
    };
    let exec = RecordingExecutor::with_responder(|inv| Err(failed(inv.tool, "makehybrid failed")));
    let mut runner = ready_runner(config, exec).await;

    assert!(matches!(runner.start().await, Err(Error::Command(_))));
    assert_eq!(runner.executor().invocations().len(), 1);
    assert_eq!(runner.state(), State::Ready);
}

#[tokio::test]
async fn attach_parses_mount_point() {
    let source = tempfile::tempdir().unwrap();
    let runner = mounted_runner(config_for(&source)).await;

    assert_eq!(runner.mount_dir().unwrap().to_str(), Some("/Volumes/TestVolume"));
    let inv = runner.executor().last().unwrap();
    let scratch = runner.scratch_image().unwrap().to_string_lossy().into_owned();
    assert_eq!(args(&inv), ["attach", "-nobrowse", "-noverify", scratch.as_str()]);
}

#[tokio::test]
async fn attach_without_mount_point_is_mount_error() {
    let source = tempfile::tempdir().unwrap();
    let exec = RecordingExecutor::with_responder(|_| Ok("/dev/disk4\tGUID_partition_scheme\n".to_string()));
    let mut runner = ready_runner(config_for(&source), exec).await;
    runner.start().await.unwrap();

    let err = runner.attach_disk_image().await.unwrap_err();
    assert!(matches!(&err, Error::Mount(msg) if msg.contains("GUID_partition_scheme")));
    assert!(runner.mount_dir().is_none());
}

#[tokio::test]
async fn attach_tool_failure_keeps_raw_output() {
    let source = tempfile::tempdir().unwrap();
    let exec = RecordingExecutor::with_responder(|inv| match inv.first_arg() {
        Some("attach") => Err(failed(Tool::Hdiutil, "hdiutil: attach failed - Resource busy")),
        _ => Ok(String::new()),
    });
    let mut runner = ready_runner(config_for(&source), exec).await;
    runner.start().await.unwrap();

    let err = runner.attach_disk_image().await.unwrap_err();
    assert!(matches!(&err, Error::Mount(msg) if msg.contains("Resource busy")));
}

#[tokio::test]
async fn permissions_are_fixed_once() {
    let source = tempfile::tempdir().unwrap();
    let config = Config {
        bless: true,
        ..config_for(&source)
    };
    let mut runner = mounted_runner(config).await;

    runner.bless().await.unwrap();
    runner.bless().await.unwrap();
    runner.detach_disk_image().await.unwrap();
    runner.detach_disk_image().await.unwrap();

    let exec = runner.executor();
    assert_eq!(exec.count(Tool::Chmod), 1);
    assert_eq!(exec.count(Tool::Bless), 2);
    let chmod = exec.invocations().into_iter().find(|i| i.tool == Tool::Chmod).unwrap();
    assert_eq!(args(&chmod), ["-Rf", "go-w", "/Volumes/TestVolume"]);
    let detach = exec.last().unwrap();
    assert_eq!(args(&detach), ["detach", "/Volumes/TestVolume"]);
}

#[tokio::test]
async fn chmod_failure_is_wrapped_and_retried_next_time() {
    let source = tempfile::tempdir().unwrap();
    let chmod_calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&chmod_calls);
    let exec = RecordingExecutor::with_responder(move |inv| match inv.tool {
        Tool::Chmod if seen.fetch_add(1, Ordering::SeqCst) == 0 => Err(failed(Tool::Chmod, "")),
        _ if inv.first_arg() == Some("attach") => Ok(ATTACH_OUTPUT.to_string()),
        _ => Ok(String::new()),
    });
    let mut runner = ready_runner(config_for(&source), exec).await;
    runner.start().await.unwrap();
    runner.attach_disk_image().await.unwrap();

    let err = runner.detach_disk_image().await.unwrap_err();
    assert!(matches!(err, Error::Chmod(_)));
    assert!(err.to_string().starts_with("chmod failed:"));

    runner.detach_disk_image().await.unwrap();
    assert_eq!(chmod_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn bless_disabled_only_fixes_permissions() {
    let source = tempfile::tempdir().unwrap();
    let mut runner = mounted_runner(config_for(&source)).await;

    runner.bless().await.unwrap();
    assert_eq!(runner.executor().count(Tool::Chmod), 1);
    assert_eq!(runner.executor().count(Tool::Bless), 0);
}

#[tokio::test]
async fn bless_is_skipped_for_sandbox_safe_images() {
    let source = tempfile::tempdir().unwrap();
    let config = Config {
        bless: true,
        sandbox_safe: true,
        ..config_for(&source)
    };
    let mut runner = mounted_runner(config).await;

    runner.bless().await.unwrap();
    assert_eq!(runner.executor().count(Tool::Bless), 0);
    assert_eq!(runner.executor().count(Tool::Chmod), 1);
}

#[tokio::test]
async fn bless_targets_mount_folder() {
    let source = tempfile::tempdir().unwrap();
    let config = Config {
        bless: true,
        ..config_for(&source)
    };
    let mut runner = mounted_runner(config).await;

    runner.bless().await.unwrap();
    let inv = runner.executor().last().unwrap();
    assert_eq!(inv.tool, Tool::Bless);
    assert_eq!(args(&inv), ["--folder", "/Volumes/TestVolume"]);
}

#[tokio::test]
async fn finalize_converts_with_format_options() {
    let source = tempfile::tempdir().unwrap();
    let config = Config {
        image_format: "udbz".into(),
        output_path: "./dist//Final.dmg".into(),
        hdiutil_verbosity: 1,
        ..config_for(&source)
    };
    let mut runner = ready_runner(config, RecordingExecutor::new()).await;
    runner.start().await.unwrap();
    runner.finalize_dmg().await.unwrap();

    let scratch = runner.scratch_image().unwrap().to_string_lossy().into_owned();
    let inv = runner.executor().last().unwrap();
    assert_eq!(
        args(&inv),
        [
            "convert", "-quiet", scratch.as_str(), "-format", "UDBZ", "-imagekey", "bzip2-level=9", "-o",
            "dist/Final.dmg",
        ]
    );
    assert_eq!(runner.state(), State::Finalized);
}

async fn finalized_runner(config: Config, exec: RecordingExecutor) -> Runner<RecordingExecutor> {
    let mut runner = ready_runner(config, exec).await;
    runner.start().await.unwrap();
    runner.finalize_dmg().await.unwrap();
    runner
}

#[tokio::test]
async fn codesign_without_identity_is_noop() {
    let source = tempfile::tempdir().unwrap();
    let mut runner = finalized_runner(config_for(&source), RecordingExecutor::new()).await;
    let before = runner.executor().invocations().len();

    runner.codesign().await.unwrap();
    runner.notarize().await.unwrap();
    assert_eq!(runner.executor().invocations().len(), before);
    assert_eq!(runner.state(), State::Finalized);
}

#[tokio::test]
async fn reconverting_a_signed_image_requires_signing_again() {
    let source = tempfile::tempdir().unwrap();
    let config = Config {
        signing_identity: "ID".into(),
        ..config_for(&source)
    };
    let mut runner = finalized_runner(config, RecordingExecutor::new()).await;

    runner.codesign().await.unwrap();
    assert_eq!(runner.state(), State::Signed);
    runner.codesign().await.unwrap();
    assert_eq!(runner.state(), State::Signed);

    runner.finalize_dmg().await.unwrap();
    assert_eq!(runner.state(), State::Finalized);
    assert_eq!(runner.executor().last().unwrap().first_arg(), Some("convert"));
}

#[tokio::test]
async fn codesign_signs_then_verifies() {
    let source = tempfile::tempdir().unwrap();
    let config = Config {
        signing_identity: "Developer ID Application: Example".into(),
        ..config_for(&source)
    };
    let mut runner = finalized_runner(config, RecordingExecutor::new()).await;
    runner.codesign().await.unwrap();

    let calls: Vec<_> = runner
        .executor()
        .invocations()
        .into_iter()
        .filter(|i| i.tool == Tool::Codesign)
        .collect();
    assert_eq!(calls.len(), 2);
    assert_eq!(args(&calls[0]), ["-s", "Developer ID Application: Example", "test.dmg"]);
    assert_eq!(
        args(&calls[1]),
        ["--verify", "--deep", "--strict", "--verbose=2", "test.dmg"]
    );
    assert_eq!(runner.state(), State::Signed);
}

#[tokio::test]
async fn codesign_distinguishes_sign_and_verify_failures() {
    let source = tempfile::tempdir().unwrap();
    let config = Config {
        signing_identity: "ID".into(),
        ..config_for(&source)
    };

    let exec = RecordingExecutor::with_responder(|inv| match (inv.tool, inv.first_arg()) {
        (Tool::Codesign, Some("-s")) => Err(failed(Tool::Codesign, "")),
        _ => Ok(String::new()),
    });
    let mut runner = finalized_runner(config.clone(), exec).await;
    let err = runner.codesign().await.unwrap_err();
    assert!(matches!(&err, Error::Codesign(msg) if msg.contains("codesign command failed")));

    let exec = RecordingExecutor::with_responder(|inv| match (inv.tool, inv.first_arg()) {
        (Tool::Codesign, Some("--verify")) => Err(failed(Tool::Codesign, "")),
        _ => Ok(String::new()),
    });
    let mut runner = finalized_runner(config, exec).await;
    let err = runner.codesign().await.unwrap_err();
    assert!(matches!(&err, Error::Codesign(msg) if msg.contains("signature seems invalid")));
}

#[tokio::test]
async fn notarize_submits_then_staples() {
    let source = tempfile::tempdir().unwrap();
    let config = Config {
        notarize_credentials: "notary".into(),
        ..config_for(&source)
    };
    let mut runner = finalized_runner(config, RecordingExecutor::new()).await;
    runner.notarize().await.unwrap();

    let calls: Vec<_> = runner
        .executor()
        .invocations()
        .into_iter()
        .filter(|i| i.tool == Tool::Xcrun)
        .collect();
    assert_eq!(
        args(&calls[0]),
        ["notarytool", "submit", "test.dmg", "--keychain-profile", "notary"]
    );
    assert_eq!(args(&calls[1]), ["stapler", "staple", "test.dmg"]);
    assert_eq!(runner.state(), State::Notarized);
}

#[tokio::test]
async fn notarize_failures_are_distinguishable() {
    let source = tempfile::tempdir().unwrap();
    let config = Config {
        notarize_credentials: "notary".into(),
        ..config_for(&source)
    };

    let exec = RecordingExecutor::with_responder(|inv| match inv.first_arg() {
        Some("notarytool") => Err(failed(Tool::Xcrun, "")),
        _ => Ok(String::new()),
    });
    let mut runner = finalized_runner(config.clone(), exec).await;
    let err = runner.notarize().await.unwrap_err();
    assert!(matches!(&err, Error::Notarize(msg) if msg.starts_with("notarization failed")));

    let exec = RecordingExecutor::with_responder(|inv| match inv.first_arg() {
        Some("stapler") => Err(failed(Tool::Xcrun, "CloudKit query failed: Record not found")),
        _ => Ok(String::new()),
    });
    let mut runner = finalized_runner(config, exec).await;
    let err = runner.notarize().await.unwrap_err();
    assert!(matches!(
        &err,
        Error::Notarize(msg) if msg.starts_with("stapler failed") && msg.contains("Record not found")
    ));
}

#[tokio::test]
async fn simulate_mode_never_reaches_executor() {
    let source = tempfile::tempdir().unwrap();
    let config = Config {
        simulate: true,
        bless: true,
        signing_identity: "ID".into(),
        notarize_credentials: "notary".into(),
        checksum: "SHA512".into(),
        ..config_for(&source)
    };
    let mut runner = ready_runner(config, RecordingExecutor::new()).await;

    runner.start().await.unwrap();
    runner.attach_disk_image().await.unwrap();
    assert_eq!(
        runner.mount_dir().unwrap(),
        runner.temp_dir().unwrap().join("SIMULATED_MOUNT")
    );
    runner.bless().await.unwrap();
    runner.detach_disk_image().await.unwrap();
    runner.finalize_dmg().await.unwrap();
    runner.codesign().await.unwrap();
    runner.notarize().await.unwrap();
    assert_eq!(runner.generate_checksum().await.unwrap(), None);

    assert!(runner.executor().invocations().is_empty());
    assert!(!source.path().join("test.dmg.sha512").exists());
}

#[tokio::test]
async fn simulate_end_to_end_with_nonexistent_source() {
    let mut runner = Runner::with_executor(
        Config {
            source_dir: "src".into(),
            output_path: "MyApp.dmg".into(),
            simulate: true,
            ..Default::default()
        },
        RecordingExecutor::new(),
    );

    runner.setup().await.unwrap();
    runner.start().await.unwrap();
    runner.finalize_dmg().await.unwrap();
    assert!(runner.executor().invocations().is_empty());
    runner.cleanup();
}

#[tokio::test]
async fn checksum_sidecar_is_written_next_to_image() {
    let source = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let image = out.path().join("Release.dmg");
    let config = Config {
        output_path: image.to_string_lossy().into_owned(),
        checksum: "sha256".into(),
        ..config_for(&source)
    };
    let mut runner = finalized_runner(config, RecordingExecutor::new()).await;
    std::fs::write(&image, b"hello world").unwrap();

    let sidecar = runner.generate_checksum().await.unwrap().unwrap();
    assert_eq!(sidecar, out.path().join("Release.dmg.sha256"));
    assert_eq!(
        std::fs::read_to_string(sidecar).unwrap(),
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9  Release.dmg\n"
    );
}

#[tokio::test]
async fn checksum_without_image_is_checksum_error() {
    let source = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let config = Config {
        output_path: out.path().join("Missing.dmg").to_string_lossy().into_owned(),
        checksum: "SHA256".into(),
        ..config_for(&source)
    };
    let mut runner = finalized_runner(config, RecordingExecutor::new()).await;
    assert!(matches!(runner.generate_checksum().await, Err(Error::Checksum(_))));
}

#[tokio::test]
async fn exclusions_stage_a_filtered_copy() {
    let source = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(source.path().join("App.app/Contents")).unwrap();
    std::fs::write(source.path().join("App.app/Contents/Info.plist"), "x").unwrap();
    std::fs::write(source.path().join(".DS_Store"), "junk").unwrap();

    let config = Config {
        exclude_patterns: vec![".DS_Store".into()],
        ..config_for(&source)
    };
    let mut runner = ready_runner(config, RecordingExecutor::new()).await;

    let staging = runner.staging_dir().unwrap().to_path_buf();
    assert_eq!(staging, runner.temp_dir().unwrap().join("staging"));
    assert_eq!(runner.source_dir().unwrap(), staging);
    assert!(staging.join("App.app/Contents/Info.plist").is_file());
    assert!(!staging.join(".DS_Store").exists());

    runner.start().await.unwrap();
    let create = runner.executor().last().unwrap();
    assert!(create.args.contains(&staging.to_string_lossy().into_owned()));
}

#[tokio::test]
async fn bad_exclude_pattern_fails_setup() {
    let source = tempfile::tempdir().unwrap();
    let config = Config {
        exclude_patterns: vec!["[unclosed".into()],
        ..config_for(&source)
    };
    let mut runner = Runner::with_executor(config, RecordingExecutor::new());

    assert!(matches!(runner.setup().await, Err(Error::ExcludeCopy(_))));
    assert_eq!(runner.state(), State::Uninitialized);
    assert!(matches!(runner.start().await, Err(Error::NotInitialized)));
    runner.cleanup();
}
