use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use log::{debug, info, warn};

use crate::process::{CommandRunner, ToolCommand, ToolOutput, tail_lines};

const ERROR_TAIL_LINES: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    SevenZip,
    Zip,
    Tar,
    GZip,
}

impl ArchiveFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "7z" | "7zip" => Ok(Self::SevenZip),
            "zip" => Ok(Self::Zip),
            "tar" => Ok(Self::Tar),
            "gz" | "gzip" => Ok(Self::GZip),
            _ => bail!("unsupported archive format: {value} (expected 7z|zip|tar|gzip)"),
        }
    }

    /// Infer the format from the archive's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
        match ext.as_str() {
            "7z" => Some(Self::SevenZip),
            "zip" | "nupkg" => Some(Self::Zip),
            "tar" => Some(Self::Tar),
            "gz" | "tgz" => Some(Self::GZip),
            _ => None,
        }
    }

    fn switch(self) -> &'static str {
        match self {
            Self::SevenZip => "-t7z",
            Self::Zip => "-tzip",
            Self::Tar => "-ttar",
            Self::GZip => "-tgzip",
        }
    }

    fn supports_solid(self) -> bool {
        self == Self::SevenZip
    }
}

#[derive(Debug, Clone)]
pub struct CompressOptions {
    pub format: Option<ArchiveFormat>,
    pub level: u8,
    pub recurse: bool,
    pub excludes: Vec<String>,
    pub password: Option<String>,
    pub solid: Option<bool>,
    pub volume_size: Option<String>,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            format: None,
            level: 5,
            recurse: true,
            excludes: Vec::new(),
            password: None,
            solid: None,
            volume_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwriteMode {
    #[default]
    Overwrite,
    Skip,
    Rename,
}

impl OverwriteMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "overwrite" | "all" => Ok(Self::Overwrite),
            "skip" => Ok(Self::Skip),
            "rename" => Ok(Self::Rename),
            _ => bail!("unsupported overwrite mode: {value} (expected overwrite|skip|rename)"),
        }
    }

    fn switch(self) -> &'static str {
        match self {
            Self::Overwrite => "-aoa",
            Self::Skip => "-aos",
            Self::Rename => "-aou",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub output_dir: Option<PathBuf>,
    pub overwrite: OverwriteMode,
    pub flatten: bool,
    pub password: Option<String>,
    pub includes: Vec<String>,
}

/// Meaning of a 7-Zip exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SevenZipExit {
    Ok,
    Warning,
    Fatal,
    CommandLine,
    OutOfMemory,
    UserStopped,
    Unknown(i32),
}

impl SevenZipExit {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Warning,
            2 => Self::Fatal,
            7 => Self::CommandLine,
            8 => Self::OutOfMemory,
            255 => Self::UserStopped,
            other => Self::Unknown(other),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Warning)
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Ok => "no error",
            Self::Warning => "warning (non-fatal errors, e.g. locked files were skipped)",
            Self::Fatal => "fatal error",
            Self::CommandLine => "command line error",
            Self::OutOfMemory => "not enough memory for operation",
            Self::UserStopped => "user stopped the process",
            Self::Unknown(_) => "unknown exit code",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub exit: SevenZipExit,
    pub output: String,
}

impl ArchiveReport {
    pub fn had_warnings(&self) -> bool {
        self.exit == SevenZipExit::Warning
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub size: Option<u64>,
    pub is_dir: bool,
}

/// Thin wrapper around a located `7z.exe`.
pub struct SevenZip<'a, R: CommandRunner> {
    exe: PathBuf,
    runner: &'a mut R,
}

impl<'a, R: CommandRunner> SevenZip<'a, R> {
    pub fn new(exe: impl Into<PathBuf>, runner: &'a mut R) -> Self {
        Self {
            exe: exe.into(),
            runner,
        }
    }

    pub fn compress(
        &mut self,
        archive: &Path,
        sources: &[PathBuf],
        options: &CompressOptions,
    ) -> Result<ArchiveReport> {
        let command = compress_command(&self.exe, archive, sources, options)?;
        info!(
            "compressing {} source(s) into {}",
            sources.len(),
            archive.display()
        );
        self.execute(&command, "compress")
    }

    pub fn extract(&mut self, archive: &Path, options: &ExtractOptions) -> Result<ArchiveReport> {
        let command = extract_command(&self.exe, archive, options)?;
        info!("extracting {}", archive.display());
        self.execute(&command, "extract")
    }

    pub fn test(&mut self, archive: &Path, password: Option<&str>) -> Result<ArchiveReport> {
        let mut command = ToolCommand::new(&self.exe)
            .arg("t")
            .arg(path_arg(archive));
        if let Some(password) = password {
            command = command.masked_arg(format!("-p{password}"));
        }
        command = command.arg("-y");
        self.execute(&command, "test")
    }

    pub fn list(&mut self, archive: &Path) -> Result<Vec<ArchiveEntry>> {
        let command = ToolCommand::new(&self.exe)
            .args(["l", "-slt"])
            .arg(path_arg(archive));
        let report = self.execute(&command, "list")?;
        Ok(parse_listing(&report.output))
    }

    fn execute(&mut self, command: &ToolCommand, operation: &str) -> Result<ArchiveReport> {
        debug!("7-Zip {operation}: {}", command.display());
        let output = self.runner.run(command)?;
        check_exit(&output, operation)
    }
}

pub fn compress_command(
    exe: &Path,
    archive: &Path,
    sources: &[PathBuf],
    options: &CompressOptions,
) -> Result<ToolCommand> {
    if sources.is_empty() {
        bail!("nothing to compress: no source paths given");
    }
    if options.level > 9 {
        bail!(
            "compression level {} is out of range (expected 0..=9)",
            options.level
        );
    }
    let format = options
        .format
        .or_else(|| ArchiveFormat::from_path(archive))
        .unwrap_or(ArchiveFormat::SevenZip);
    if format == ArchiveFormat::GZip && sources.len() > 1 {
        bail!("gzip archives hold a single file; got {} sources", sources.len());
    }

    let mut command = ToolCommand::new(exe)
        .arg("a")
        .arg(format.switch())
        .arg(format!("-mx={}", options.level));
    if options.recurse {
        command = command.arg("-r");
    }
    for pattern in &options.excludes {
        let pattern = pattern.trim();
        if !pattern.is_empty() {
            command = command.arg(format!("-x!{pattern}"));
        }
    }
    if let Some(password) = options.password.as_deref().filter(|value| !value.is_empty()) {
        command = command.masked_arg(format!("-p{password}"));
        if format == ArchiveFormat::SevenZip {
            command = command.arg("-mhe=on");
        }
    }
    if let Some(solid) = options.solid {
        if format.supports_solid() {
            command = command.arg(if solid { "-ms=on" } else { "-ms=off" });
        } else {
            warn!("solid mode is only supported for 7z archives; ignoring");
        }
    }
    if let Some(volume) = options.volume_size.as_deref().filter(|value| !value.trim().is_empty())
    {
        command = command.arg(format!("-v{}", volume.trim()));
    }
    command = command.arg("-y").arg(path_arg(archive));
    for source in sources {
        command = command.arg(path_arg(source));
    }
    Ok(command)
}

pub fn extract_command(
    exe: &Path,
    archive: &Path,
    options: &ExtractOptions,
) -> Result<ToolCommand> {
    if archive.as_os_str().is_empty() {
        bail!("archive path cannot be empty");
    }
    let mut command = ToolCommand::new(exe)
        .arg(if options.flatten { "e" } else { "x" })
        .arg(path_arg(archive));
    if let Some(output_dir) = &options.output_dir {
        command = command.arg(format!("-o{}", path_arg(output_dir)));
    }
    command = command.arg(options.overwrite.switch());
    if let Some(password) = options.password.as_deref().filter(|value| !value.is_empty()) {
        command = command.masked_arg(format!("-p{password}"));
    }
    command = command.arg("-y");
    for include in &options.includes {
        let include = include.trim();
        if !include.is_empty() {
            command = command.arg(include);
        }
    }
    Ok(command)
}

fn check_exit(output: &ToolOutput, operation: &str) -> Result<ArchiveReport> {
    let code = match output.code {
        Some(code) => code,
        None => bail!("7-Zip {operation} was terminated before reporting an exit code"),
    };
    let exit = SevenZipExit::from_code(code);
    let combined = output.combined();
    if !exit.is_success() {
        bail!(
            "7-Zip {operation} failed with exit code {code} ({})\n{}",
            exit.describe(),
            tail_lines(&combined, ERROR_TAIL_LINES)
        );
    }
    if exit == SevenZipExit::Warning {
        warn!(
            "7-Zip {operation} finished with warnings:\n{}",
            tail_lines(&combined, ERROR_TAIL_LINES)
        );
    }
    Ok(ArchiveReport {
        exit,
        output: output.stdout.clone(),
    })
}

/// Parse `7z l -slt` technical listing output into entries.
///
/// Blocks are separated by blank lines after the `----------` marker; the
/// archive header block before the marker is skipped.
pub fn parse_listing(stdout: &str) -> Vec<ArchiveEntry> {
    let mut entries = Vec::new();
    let Some((_, body)) = stdout.split_once("----------") else {
        return entries;
    };

    let mut path = None::<String>;
    let mut size = None::<u64>;
    let mut is_dir = false;
    for line in body.lines().chain(std::iter::once("")) {
        let line = line.trim();
        if line.is_empty() {
            if let Some(path) = path.take() {
                entries.push(ArchiveEntry { path, size, is_dir });
            }
            size = None;
            is_dir = false;
            continue;
        }
        let Some((key, value)) = line
            .split_once(" = ")
            .or_else(|| line.strip_suffix(" =").map(|key| (key, "")))
        else {
            continue;
        };
        match key {
            "Path" => path = Some(value.to_string()),
            "Size" => size = value.parse::<u64>().ok(),
            "Folder" => is_dir = value == "+",
            "Attributes" => is_dir = is_dir || value.starts_with('D'),
            _ => {}
        }
    }
    entries
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{
        ArchiveFormat, CompressOptions, ExtractOptions, OverwriteMode, SevenZip, SevenZipExit,
        compress_command, extract_command, parse_listing,
    };
    use crate::process::ToolOutput;
    use crate::process::testing::RecordingRunner;

    #[test]
    fn compress_translates_options_to_switches() {
        let command = compress_command(
            Path::new("7z.exe"),
            Path::new("out/release.7z"),
            &[PathBuf::from("bin/Release"), PathBuf::from("README.md")],
            &CompressOptions {
                level: 9,
                excludes: vec!["*.pdb".to_string(), " ".to_string()],
                password: Some("hunter2".to_string()),
                solid: Some(false),
                volume_size: Some("100m".to_string()),
                ..CompressOptions::default()
            },
        )
        .expect("command");
        assert_eq!(
            command.args,
            vec![
                "a",
                "-t7z",
                "-mx=9",
                "-r",
                "-x!*.pdb",
                "-phunter2",
                "-mhe=on",
                "-ms=off",
                "-v100m",
                "-y",
                "out/release.7z",
                "bin/Release",
                "README.md",
            ]
        );
        assert!(!command.display().contains("hunter2"));
    }

    #[test]
    fn compress_infers_zip_from_extension_and_skips_header_encryption() {
        let command = compress_command(
            Path::new("7z.exe"),
            Path::new("drop.zip"),
            &[PathBuf::from("dist")],
            &CompressOptions {
                recurse: false,
                password: Some("pw".to_string()),
                ..CompressOptions::default()
            },
        )
        .expect("command");
        assert_eq!(
            command.args,
            vec!["a", "-tzip", "-mx=5", "-ppw", "-y", "drop.zip", "dist"]
        );
    }

    #[test]
    fn compress_rejects_invalid_requests() {
        let exe = Path::new("7z.exe");
        let err = compress_command(exe, Path::new("a.7z"), &[], &CompressOptions::default())
            .expect_err("no sources");
        assert!(err.to_string().contains("nothing to compress"));

        let err = compress_command(
            exe,
            Path::new("a.7z"),
            &[PathBuf::from("x")],
            &CompressOptions {
                level: 10,
                ..CompressOptions::default()
            },
        )
        .expect_err("bad level");
        assert!(err.to_string().contains("out of range"));

        let err = compress_command(
            exe,
            Path::new("a.gz"),
            &[PathBuf::from("x"), PathBuf::from("y")],
            &CompressOptions::default(),
        )
        .expect_err("gzip multi");
        assert!(err.to_string().contains("single file"));
    }

    #[test]
    fn extract_translates_overwrite_and_flatten() {
        let command = extract_command(
            Path::new("7z.exe"),
            Path::new("pkg.zip"),
            &ExtractOptions {
                output_dir: Some(PathBuf::from("out dir")),
                overwrite: OverwriteMode::Skip,
                flatten: true,
                password: None,
                includes: vec!["*.dll".to_string()],
            },
        )
        .expect("command");
        assert_eq!(
            command.args,
            vec!["e", "pkg.zip", "-oout dir", "-aos", "-y", "*.dll"]
        );
    }

    #[test]
    fn exit_code_one_is_a_warning_not_an_error() {
        let mut runner = RecordingRunner::with_exit_codes(&[1]);
        let mut seven_zip = SevenZip::new("7z.exe", &mut runner);
        let report = seven_zip
            .extract(Path::new("a.7z"), &ExtractOptions::default())
            .expect("warning is success");
        assert!(report.had_warnings());
    }

    #[test]
    fn fatal_exit_code_includes_output_tail() {
        let mut runner = RecordingRunner::with_outputs(vec![ToolOutput {
            code: Some(2),
            stdout: "Scanning\nERROR: a.7z\nCan not open the file as archive\n".to_string(),
            stderr: String::new(),
        }]);
        let mut seven_zip = SevenZip::new("7z.exe", &mut runner);
        let err = seven_zip.test(Path::new("a.7z"), Some("pw")).expect_err("fatal");
        let message = err.to_string();
        assert!(message.contains("exit code 2 (fatal error)"));
        assert!(message.contains("Can not open the file as archive"));
        assert_eq!(runner.commands[0].args, vec!["t", "a.7z", "-ppw", "-y"]);
        assert_eq!(runner.commands[0].masked_args, vec![2]);
    }

    #[test]
    fn exit_codes_map_to_meanings() {
        assert_eq!(SevenZipExit::from_code(7), SevenZipExit::CommandLine);
        assert_eq!(SevenZipExit::from_code(8), SevenZipExit::OutOfMemory);
        assert_eq!(SevenZipExit::from_code(255), SevenZipExit::UserStopped);
        assert_eq!(SevenZipExit::from_code(3), SevenZipExit::Unknown(3));
        assert!(!SevenZipExit::from_code(255).is_success());
    }

    #[test]
    fn listing_parser_reads_technical_blocks() {
        let stdout = "\
7-Zip 23.01 (x64)

Listing archive: a.7z

--
Path = a.7z
Type = 7z
Physical Size = 512

----------
Path = docs
Size = 0
Attributes = D....
Folder = +

Path = docs/readme.txt
Size = 42
Attributes = A....
Folder = -

Path = empty.txt
Size =
Folder = -
";
        let entries = parse_listing(stdout);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, "docs");
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].path, "docs/readme.txt");
        assert_eq!(entries[1].size, Some(42));
        assert!(!entries[1].is_dir);
        assert_eq!(entries[2].size, None);
    }

    #[test]
    fn format_parsing_accepts_aliases() {
        assert_eq!(ArchiveFormat::parse("7zip").expect("7z"), ArchiveFormat::SevenZip);
        assert_eq!(ArchiveFormat::parse("GZIP").expect("gz"), ArchiveFormat::GZip);
        assert!(ArchiveFormat::parse("rar").is_err());
        assert_eq!(
            ArchiveFormat::from_path(Path::new("pkg.NUPKG")),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(OverwriteMode::parse("all").expect("all"), OverwriteMode::Overwrite);
    }
}
