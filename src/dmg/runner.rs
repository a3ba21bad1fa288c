//! Build lifecycle orchestration.
//!
//! A [`Runner`] drives one DMG build through its stages:
//!
//! 1. [`setup`](Runner::setup) validates the config and prepares a private working directory
//! 2. [`start`](Runner::start) creates a writable scratch image (UDRW)
//! 3. optionally [`attach_disk_image`](Runner::attach_disk_image), [`bless`](Runner::bless)
//!    and [`detach_disk_image`](Runner::detach_disk_image)
//! 4. [`finalize_dmg`](Runner::finalize_dmg) converts the scratch image to the final format
//! 5. optionally [`codesign`](Runner::codesign), [`notarize`](Runner::notarize) and
//!    [`generate_checksum`](Runner::generate_checksum)
//! 6. [`cleanup`](Runner::cleanup) removes the working directory
//!
//! Calling a stage out of order fails with [`Error::NotInitialized`].
//!
//! # Example
//!
//! ```no_run
//! use mkdmg::dmg::{Config, Runner};
//!
//! # async fn example() -> mkdmg::dmg::Result<()> {
//! let mut runner = Runner::new(Config {
//!     source_dir: "build/MyApp".into(),
//!     output_path: "dist/MyApp.dmg".into(),
//!     ..Default::default()
//! });
//!
//! let result = async {
//!     runner.setup().await?;
//!     runner.start().await?;
//!     runner.finalize_dmg().await
//! }
//! .await;
//! runner.cleanup();
//! result
//! # }
//! ```

use std::path::{Path, PathBuf};

use super::checksum;
use super::config::{Config, ValidatedConfig};
use super::error::{Error, Result};
use super::executor::{CommandExecutor, ExecError, SystemExecutor, Tool};
use super::staging;

/// Volume-root prefix hdiutil prints for mounted images.
const VOLUMES_PREFIX: &str = "/Volumes/";

/// Where a build currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Uninitialized,
    Ready,
    Started,
    Finalized,
    Signed,
    Notarized,
}

/// Paths and settings that exist only after a successful `setup()`.
#[derive(Debug)]
struct Workspace {
    settings: ValidatedConfig,
    source_dir: PathBuf,
    final_dmg: PathBuf,
    tmp_dir: PathBuf,
    scratch_dmg: PathBuf,
    staging_dir: Option<PathBuf>,
}

type CleanupAction = Box<dyn FnOnce() + Send>;

/// Drives a single DMG build.
///
/// External tools are run through `E`, which defaults to [`SystemExecutor`].
pub struct Runner<E = SystemExecutor> {
    config: Config,
    executor: E,
    state: State,
    workspace: Option<Workspace>,
    mount_dir: Option<PathBuf>,
    permissions_fixed: bool,
    cleanup_actions: Vec<CleanupAction>,
}

impl<E: std::fmt::Debug> std::fmt::Debug for Runner<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .field("state", &self.state)
            .field("workspace", &self.workspace)
            .field("mount_dir", &self.mount_dir)
            .field("permissions_fixed", &self.permissions_fixed)
            .field("cleanup_actions", &self.cleanup_actions.len())
            .finish()
    }
}

impl Runner<SystemExecutor> {
    /// Creates a runner that launches real processes.
    pub fn new(config: Config) -> Self {
        Self::with_executor(config, SystemExecutor::new())
    }
}

impl<E: CommandExecutor> Runner<E> {
    /// Creates a runner that sends every invocation to `executor`.
    pub fn with_executor(config: Config, executor: E) -> Self {
        Self {
            config,
            executor,
            state: State::Uninitialized,
            workspace: None,
            mount_dir: None,
            permissions_fixed: false,
            cleanup_actions: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Validated settings, available after `setup()`.
    pub fn settings(&self) -> Option<&ValidatedConfig> {
        self.workspace.as_ref().map(|ws| &ws.settings)
    }

    /// Directory used as the image source: the staging copy when exclusions are set.
    pub fn source_dir(&self) -> Option<&Path> {
        self.workspace.as_ref().map(|ws| ws.source_dir.as_path())
    }

    pub fn staging_dir(&self) -> Option<&Path> {
        self.workspace.as_ref().and_then(|ws| ws.staging_dir.as_deref())
    }

    pub fn temp_dir(&self) -> Option<&Path> {
        self.workspace.as_ref().map(|ws| ws.tmp_dir.as_path())
    }

    pub fn scratch_image(&self) -> Option<&Path> {
        self.workspace.as_ref().map(|ws| ws.scratch_dmg.as_path())
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.workspace.as_ref().map(|ws| ws.final_dmg.as_path())
    }

    pub fn mount_dir(&self) -> Option<&Path> {
        self.mount_dir.as_deref()
    }

    /// Validates the config and prepares the working directory.
    ///
    /// Any earlier workspace is cleaned up first. Only full success moves the
    /// runner to [`State::Ready`].
    pub async fn setup(&mut self) -> Result<()> {
        self.cleanup();

        let settings = self.config.validate()?;

        let tmp = tempfile::Builder::new()
            .prefix("mkdmg-")
            .tempdir()
            .map_err(Error::CreateDir)?;
        let tmp_dir = tmp.path().to_path_buf();
        log::debug!("Working directory: {}", tmp_dir.display());

        self.cleanup_actions.push(Box::new(move || {
            log::debug!("Removing temporary directory: {}", tmp.path().display());
            let path = tmp.path().to_path_buf();
            if let Err(e) = tmp.close() {
                log::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }));

        let scratch_dmg = tmp_dir.join("temp.dmg");
        let mut source_dir = settings.source_dir().to_path_buf();
        let mut staging_dir = None;

        if !settings.exclude_patterns().is_empty() {
            let stage = tmp_dir.join("staging");
            log::info!(
                "Staging {} without {:?}",
                source_dir.display(),
                settings.exclude_patterns()
            );
            staging::copy_with_exclusions(&source_dir, &stage, settings.exclude_patterns()).await?;
            source_dir = stage.clone();
            staging_dir = Some(stage);
        }

        self.workspace = Some(Workspace {
            final_dmg: settings.output_path().to_path_buf(),
            settings,
            source_dir,
            tmp_dir,
            scratch_dmg,
            staging_dir,
        });
        self.state = State::Ready;
        Ok(())
    }

    /// Creates the writable scratch image from the source directory.
    pub async fn start(&mut self) -> Result<()> {
        let ws = self.require(State::Ready, State::Ready)?;
        let settings = &ws.settings;
        let volume_name = settings.volume_name().to_string();
        let source = path_arg(&ws.source_dir)?;
        let scratch = path_arg(&ws.scratch_dmg)?;

        if settings.sandbox_safe() {
            log::info!("Creating sandbox-safe scratch image...");
            let makehybrid = strings(&[
                "makehybrid",
                "-default-volume-name",
                &volume_name,
                "-hfs",
                "-r",
                &source,
                &scratch,
            ]);
            self.hdiutil(makehybrid).await?;

            let convert = strings(&["convert", &scratch, "-format", "UDRW", "-ov", "-o", &scratch]);
            self.hdiutil(convert).await?;
        } else {
            log::info!("Creating scratch image...");
            let mut args = vec!["create".to_string()];
            args.extend(settings.filesystem_opts());
            args.extend(settings.volume_size_opts());
            args.extend(strings(&[
                "-format",
                "UDRW",
                "-volname",
                &volume_name,
                "-srcfolder",
                &source,
                &scratch,
            ]));
            self.hdiutil(args).await?;
        }

        self.state = State::Started;
        Ok(())
    }

    /// Mounts the scratch image read-write and records its mount point.
    pub async fn attach_disk_image(&mut self) -> Result<()> {
        let ws = self.require(State::Started, State::Started)?;

        if ws.settings.simulate() {
            let mount = ws.tmp_dir.join("SIMULATED_MOUNT");
            log::info!("[simulate] attach: using {}", mount.display());
            self.mount_dir = Some(mount);
            return Ok(());
        }

        let scratch = path_arg(&ws.scratch_dmg)?;
        let args = strings(&["attach", "-nobrowse", "-noverify", &scratch]);
        let output = self
            .hdiutil_output(args)
            .await
            .map_err(|e| Error::Mount(format!("{e}: {}", e.output().trim())))?;

        let mount = parse_mount_point(&output)
            .ok_or_else(|| Error::Mount(format!("couldn't find mount point: {output:?}")))?;
        log::info!("Attached scratch image at {}", mount.display());
        self.mount_dir = Some(mount);
        Ok(())
    }

    /// Fixes permissions on the mounted volume and unmounts it.
    pub async fn detach_disk_image(&mut self) -> Result<()> {
        let mount = self.require_mount()?;

        if self.simulating() {
            log::info!("[simulate] detach {}", mount.display());
            return Ok(());
        }

        self.fix_permissions().await?;
        self.hdiutil(strings(&["detach", &path_arg(&mount)?])).await?;
        log::info!("Detached {}", mount.display());
        Ok(())
    }

    /// Blesses the mounted volume when the config asks for it.
    ///
    /// Permissions are fixed even when blessing is disabled. Sandbox-safe
    /// images are never blessed.
    pub async fn bless(&mut self) -> Result<()> {
        let mount = self.require_mount()?;

        self.fix_permissions().await?;

        let settings = self.settings().ok_or(Error::NotInitialized)?;
        if !settings.bless() {
            return Ok(());
        }
        if settings.sandbox_safe() {
            log::info!("Skipping blessing on sandbox safe images");
            return Ok(());
        }

        self.run(Tool::Bless, strings(&["--folder", &path_arg(&mount)?]))
            .await?;
        Ok(())
    }

    /// Converts the scratch image into the final compressed image.
    ///
    /// Converting again overwrites any signed or notarized image, so the
    /// state drops back to [`State::Finalized`].
    pub async fn finalize_dmg(&mut self) -> Result<()> {
        let ws = self.require(State::Started, State::Notarized)?;
        let scratch = path_arg(&ws.scratch_dmg)?;
        let final_dmg = path_arg(&ws.final_dmg)?;

        log::info!(
            "Converting to {} at {}...",
            ws.settings.image_format(),
            ws.final_dmg.display()
        );
        let mut args = strings(&["convert", &scratch]);
        args.extend(ws.settings.image_format_opts());
        args.extend(strings(&["-o", &final_dmg]));
        self.hdiutil(args).await?;

        log::info!("✓ Created {}", final_dmg);
        self.state = State::Finalized;
        Ok(())
    }

    /// Signs the final image and verifies the signature.
    ///
    /// Does nothing without a signing identity.
    pub async fn codesign(&mut self) -> Result<()> {
        let ws = self.require(State::Finalized, State::Notarized)?;
        let Some(identity) = ws.settings.signing_identity().map(str::to_string) else {
            log::info!("Skipping codesign");
            return Ok(());
        };
        let final_dmg = path_arg(&ws.final_dmg)?;

        self.run(Tool::Codesign, strings(&["-s", &identity, &final_dmg]))
            .await
            .map_err(|e| Error::Codesign(format!("codesign command failed: {e}")))?;

        self.run(
            Tool::Codesign,
            strings(&["--verify", "--deep", "--strict", "--verbose=2", &final_dmg]),
        )
        .await
        .map_err(|e| Error::Codesign(format!("the signature seems invalid: {e}")))?;

        log::info!("✓ codesign complete");
        self.state = self.state.max(State::Signed);
        Ok(())
    }

    /// Submits the final image for notarization and staples the ticket.
    ///
    /// Does nothing without a keychain profile.
    pub async fn notarize(&mut self) -> Result<()> {
        let ws = self.require(State::Finalized, State::Notarized)?;
        let Some(profile) = ws.settings.notarize_profile().map(str::to_string) else {
            log::info!("Skipping notarization");
            return Ok(());
        };
        let final_dmg = path_arg(&ws.final_dmg)?;

        log::info!("Submitting {} for notarization...", final_dmg);
        self.run(
            Tool::Xcrun,
            strings(&["notarytool", "submit", &final_dmg, "--keychain-profile", &profile]),
        )
        .await
        .map_err(|e| Error::Notarize(format!("notarization failed: {e}")))?;

        log::info!("Stapling the notarization ticket");
        self.run_output(Tool::Xcrun, strings(&["stapler", "staple", &final_dmg]))
            .await
            .map_err(|e| Error::Notarize(format!("stapler failed: {e} (output: {})", e.output().trim())))?;

        log::info!("✓ Notarization complete");
        self.state = State::Notarized;
        Ok(())
    }

    /// Writes `<image>.sha256` or `<image>.sha512` next to the final image.
    ///
    /// Does nothing without a checksum algorithm or when simulating.
    pub async fn generate_checksum(&mut self) -> Result<Option<PathBuf>> {
        let ws = self.require(State::Finalized, State::Notarized)?;
        let Some(algorithm) = ws.settings.checksum() else {
            return Ok(None);
        };
        if ws.settings.simulate() {
            log::info!("[simulate] {} checksum of {}", algorithm, ws.final_dmg.display());
            return Ok(None);
        }

        checksum::write_sidecar(algorithm, &ws.final_dmg).await.map(Some)
    }

    /// Runs the registered cleanup actions and returns to
    /// [`State::Uninitialized`]. Safe to call any number of times.
    pub fn cleanup(&mut self) {
        for action in self.cleanup_actions.drain(..) {
            action();
        }
        self.workspace = None;
        self.mount_dir = None;
        self.permissions_fixed = false;
        self.state = State::Uninitialized;
    }

    /// Strips group/other write permission from the mounted volume, at most
    /// once per runner.
    async fn fix_permissions(&mut self) -> Result<()> {
        if self.permissions_fixed {
            return Ok(());
        }
        let mount = self.require_mount()?;

        log::info!("Fixing permissions");
        self.run(Tool::Chmod, strings(&["-Rf", "go-w", &path_arg(&mount)?]))
            .await
            .map_err(Error::Chmod)?;

        self.permissions_fixed = true;
        Ok(())
    }

    fn require(&self, earliest: State, latest: State) -> Result<&Workspace> {
        match &self.workspace {
            Some(ws) if (earliest..=latest).contains(&self.state) => Ok(ws),
            _ => Err(Error::NotInitialized),
        }
    }

    fn require_mount(&self) -> Result<PathBuf> {
        self.require(State::Started, State::Started)?;
        self.mount_dir.clone().ok_or(Error::NotInitialized)
    }

    fn simulating(&self) -> bool {
        self.settings().is_some_and(ValidatedConfig::simulate)
    }

    fn verbosity_applied(&self, args: Vec<String>) -> Vec<String> {
        match self.settings() {
            Some(settings) => settings.verbosity().apply(args),
            None => args,
        }
    }

    async fn hdiutil(&self, args: Vec<String>) -> std::result::Result<(), ExecError> {
        let args = self.verbosity_applied(args);
        self.run(Tool::Hdiutil, args).await
    }

    async fn hdiutil_output(&self, args: Vec<String>) -> std::result::Result<String, ExecError> {
        let args = self.verbosity_applied(args);
        self.run_output(Tool::Hdiutil, args).await
    }

    async fn run(&self, tool: Tool, args: Vec<String>) -> std::result::Result<(), ExecError> {
        if self.simulating() {
            log::info!("[simulate] {} {}", tool, args.join(" "));
            return Ok(());
        }
        log::debug!("Running {} {}", tool, args.join(" "));
        self.executor.run(tool, &args).await
    }

    async fn run_output(&self, tool: Tool, args: Vec<String>) -> std::result::Result<String, ExecError> {
        if self.simulating() {
            log::info!("[simulate] {} {}", tool, args.join(" "));
            return Ok(String::new());
        }
        log::debug!("Running {} {}", tool, args.join(" "));
        self.executor.run_output(tool, &args).await
    }
}

/// Finds the mount point in `hdiutil attach` output: the text from the first
/// `/Volumes/` on a line to the end of that line, minus trailing whitespace.
fn parse_mount_point(output: &str) -> Option<PathBuf> {
    output.lines().find_map(|line| {
        line.find(VOLUMES_PREFIX)
            .map(|idx| PathBuf::from(line[idx..].trim_end()))
    })
}

fn path_arg(path: &Path) -> Result<String> {
    path.to_str().map(str::to_string).ok_or_else(|| Error::UnsafeArgument {
        field: "path",
        reason: format!("{} contains non-UTF8 characters", path.display()),
    })
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
