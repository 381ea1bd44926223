use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use log::{debug, info, warn};

use crate::config::DevkitConfig;
use crate::process::{CommandRunner, ToolCommand, tail_lines};

const ERROR_TAIL_LINES: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyMode {
    #[default]
    Copy,
    Mirror,
    Move,
}

impl CopyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Mirror => "mirror",
            Self::Move => "move",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub mode: CopyMode,
    pub file_filters: Vec<String>,
    pub exclude_files: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub retries: u32,
    pub wait_seconds: u32,
    pub threads: Option<u32>,
    pub log_file: Option<PathBuf>,
    pub include_empty_dirs: bool,
    pub quiet: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            mode: CopyMode::Copy,
            file_filters: Vec::new(),
            exclude_files: Vec::new(),
            exclude_dirs: Vec::new(),
            retries: crate::config::DEFAULT_SYNC_RETRIES,
            wait_seconds: crate::config::DEFAULT_SYNC_WAIT_SECONDS,
            threads: None,
            log_file: None,
            include_empty_dirs: true,
            quiet: false,
        }
    }
}

impl MirrorOptions {
    /// Defaults taken from the `[sync]` settings section.
    pub fn from_config(config: &DevkitConfig) -> Self {
        Self {
            retries: config.sync_retries(),
            wait_seconds: config.sync_wait_seconds(),
            threads: config.sync.threads,
            ..Self::default()
        }
    }
}

/// Decoded robocopy exit code. Robocopy reports a bitmask, values below 8
/// mean every file was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RobocopyOutcome {
    pub code: i32,
}

impl RobocopyOutcome {
    pub const FILES_COPIED: i32 = 0x01;
    pub const EXTRA_FILES: i32 = 0x02;
    pub const MISMATCHED: i32 = 0x04;
    pub const COPY_FAILURES: i32 = 0x08;
    pub const FATAL: i32 = 0x10;

    pub fn from_code(code: i32) -> Self {
        Self { code }
    }

    fn has(self, flag: i32) -> bool {
        self.code & flag != 0
    }

    pub fn files_copied(self) -> bool {
        self.has(Self::FILES_COPIED)
    }

    pub fn extra_files(self) -> bool {
        self.has(Self::EXTRA_FILES)
    }

    pub fn mismatched(self) -> bool {
        self.has(Self::MISMATCHED)
    }

    pub fn copy_failures(self) -> bool {
        self.has(Self::COPY_FAILURES)
    }

    pub fn fatal(self) -> bool {
        self.has(Self::FATAL)
    }

    pub fn is_success(self) -> bool {
        (0..8).contains(&self.code)
    }

    pub fn describe(self) -> String {
        if self.code == 0 {
            return "no files were copied; source and destination are in sync".to_string();
        }
        if self.code < 0 {
            return format!("unexpected exit code {}", self.code);
        }
        let mut parts = Vec::new();
        if self.files_copied() {
            parts.push("files were copied");
        }
        if self.extra_files() {
            parts.push("extra files or directories were detected");
        }
        if self.mismatched() {
            parts.push("mismatched files or directories were detected");
        }
        if self.copy_failures() {
            parts.push("some files or directories could not be copied");
        }
        if self.fatal() {
            parts.push("serious error: robocopy did not copy any files");
        }
        if self.code > 0x1f {
            parts.push("unrecognized status bits");
        }
        parts.join("; ")
    }
}

pub fn robocopy_command(
    exe: &Path,
    source: &Path,
    destination: &Path,
    options: &MirrorOptions,
) -> ToolCommand {
    let mut command = ToolCommand::new(exe)
        .arg(path_arg(source))
        .arg(path_arg(destination));
    for filter in non_empty(&options.file_filters) {
        command = command.arg(filter);
    }
    match options.mode {
        CopyMode::Copy => {
            command = command.arg(if options.include_empty_dirs { "/E" } else { "/S" });
        }
        CopyMode::Mirror => command = command.arg("/MIR"),
        CopyMode::Move => {
            command = command
                .arg("/MOVE")
                .arg(if options.include_empty_dirs { "/E" } else { "/S" });
        }
    }
    let exclude_files = non_empty(&options.exclude_files);
    if !exclude_files.is_empty() {
        command = command.arg("/XF").args(exclude_files);
    }
    let exclude_dirs = non_empty(&options.exclude_dirs);
    if !exclude_dirs.is_empty() {
        command = command.arg("/XD").args(exclude_dirs);
    }
    command = command
        .arg(format!("/R:{}", options.retries))
        .arg(format!("/W:{}", options.wait_seconds));
    if let Some(threads) = options.threads {
        command = command.arg(format!("/MT:{}", threads.clamp(1, 128)));
    }
    if let Some(log_file) = &options.log_file {
        command = command.arg(format!("/LOG:{}", path_arg(log_file)));
    }
    if options.quiet {
        command = command.args(["/NP", "/NFL", "/NDL"]);
    }
    command
}

/// Run robocopy and translate its bitmask exit code.
pub fn sync_directories<R: CommandRunner>(
    runner: &mut R,
    exe: &Path,
    source: &Path,
    destination: &Path,
    options: &MirrorOptions,
) -> Result<RobocopyOutcome> {
    if !source.is_dir() {
        bail!("source directory does not exist: {}", source.display());
    }
    let command = robocopy_command(exe, source, destination, options);
    info!(
        "{} {} -> {}",
        options.mode.as_str(),
        source.display(),
        destination.display()
    );
    debug!("robocopy: {}", command.display());

    let output = runner.run(&command)?;
    let Some(code) = output.code else {
        bail!("robocopy was terminated before reporting an exit code");
    };
    let outcome = RobocopyOutcome::from_code(code);
    if !outcome.is_success() {
        bail!(
            "robocopy failed with exit code {code} ({})\n{}",
            outcome.describe(),
            tail_lines(&output.combined(), ERROR_TAIL_LINES)
        );
    }
    if outcome.mismatched() {
        warn!("robocopy: {}", outcome.describe());
    } else if outcome.extra_files() && options.mode != CopyMode::Mirror {
        warn!("destination contains files that are not in the source");
    }
    Ok(outcome)
}

fn non_empty(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn path_arg(path: &Path) -> String {
    let text = path.to_string_lossy().to_string();
    // A trailing backslash would escape robocopy's closing quote.
    if text.len() > 3 && text.ends_with('\\') {
        text.trim_end_matches('\\').to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use super::{CopyMode, MirrorOptions, RobocopyOutcome, robocopy_command, sync_directories};
    use crate::config::{DevkitConfig, SyncSection};
    use crate::process::testing::RecordingRunner;

    #[test]
    fn mirror_command_translates_all_options() {
        let command = robocopy_command(
            Path::new("robocopy.exe"),
            Path::new("build\\out\\"),
            Path::new("D:\\drop"),
            &MirrorOptions {
                mode: CopyMode::Mirror,
                file_filters: vec!["*.dll".to_string()],
                exclude_files: vec!["*.pdb".to_string(), "".to_string()],
                exclude_dirs: vec!["obj".to_string(), "bin".to_string()],
                retries: 1,
                wait_seconds: 2,
                threads: Some(16),
                log_file: Some(PathBuf::from("sync.log")),
                include_empty_dirs: true,
                quiet: true,
            },
        );
        assert_eq!(
            command.args,
            vec![
                "build\\out",
                "D:\\drop",
                "*.dll",
                "/MIR",
                "/XF",
                "*.pdb",
                "/XD",
                "obj",
                "bin",
                "/R:1",
                "/W:2",
                "/MT:16",
                "/LOG:sync.log",
                "/NP",
                "/NFL",
                "/NDL",
            ]
        );
    }

    #[test]
    fn move_without_empty_dirs_uses_s_switch() {
        let command = robocopy_command(
            Path::new("robocopy.exe"),
            Path::new("a"),
            Path::new("b"),
            &MirrorOptions {
                mode: CopyMode::Move,
                include_empty_dirs: false,
                ..MirrorOptions::default()
            },
        );
        assert_eq!(command.args, vec!["a", "b", "/MOVE", "/S", "/R:3", "/W:5"]);
    }

    #[test]
    fn options_pick_up_sync_settings() {
        let config = DevkitConfig {
            sync: SyncSection {
                retries: Some(0),
                wait_seconds: None,
                threads: Some(4),
            },
            ..DevkitConfig::default()
        };
        let options = MirrorOptions::from_config(&config);
        assert_eq!(options.retries, 0);
        assert_eq!(options.wait_seconds, 5);
        assert_eq!(options.threads, Some(4));
    }

    #[test]
    fn outcome_decodes_bitmask() {
        let outcome = RobocopyOutcome::from_code(3);
        assert!(outcome.is_success());
        assert!(outcome.files_copied());
        assert!(outcome.extra_files());
        assert!(!outcome.mismatched());

        let failure = RobocopyOutcome::from_code(9);
        assert!(!failure.is_success());
        assert!(failure.describe().contains("could not be copied"));
        assert!(failure.describe().contains("files were copied"));

        assert!(RobocopyOutcome::from_code(16).fatal());
        assert!(RobocopyOutcome::from_code(0).describe().contains("in sync"));
    }

    #[test]
    fn sync_fails_on_codes_at_or_above_eight() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("src");
        fs::create_dir_all(&source).expect("source");

        let mut runner = RecordingRunner::with_exit_codes(&[1]);
        let outcome = sync_directories(
            &mut runner,
            Path::new("robocopy.exe"),
            &source,
            &temp.path().join("dst"),
            &MirrorOptions::default(),
        )
        .expect("copied");
        assert!(outcome.files_copied());

        let mut runner = RecordingRunner::with_exit_codes(&[8]);
        let err = sync_directories(
            &mut runner,
            Path::new("robocopy.exe"),
            &source,
            &temp.path().join("dst"),
            &MirrorOptions::default(),
        )
        .expect_err("failure");
        assert!(err.to_string().contains("exit code 8"));
    }

    #[test]
    fn sync_requires_existing_source() {
        let temp = tempdir().expect("tempdir");
        let mut runner = RecordingRunner::default();
        let err = sync_directories(
            &mut runner,
            Path::new("robocopy.exe"),
            &temp.path().join("missing"),
            &temp.path().join("dst"),
            &MirrorOptions::default(),
        )
        .expect_err("missing source");
        assert!(err.to_string().contains("does not exist"));
        assert!(runner.commands.is_empty());
    }
}
