//! Prerequisite discovery for the external tools devkit drives.
//!
//! Each tool is located through an ordered list of strategies: an explicit
//! path from the settings file, installer-written registry values, the
//! Visual Studio locator (`vswhere.exe`), well-known install folders and
//! finally the PATH.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use log::{debug, warn};

use crate::config::{DevkitConfig, SettingKey};
use crate::process::{self, CommandRunner, SystemRunner, ToolCommand, ToolOutput};
use crate::registry::{self, RegistryHive};

const SEVEN_ZIP_KEY: &str = r"SOFTWARE\7-Zip";
const VS7_KEY: &str = r"SOFTWARE\WOW6432Node\Microsoft\VisualStudio\SxS\VS7";
const VS7_VERSIONS: [&str; 3] = ["17.0", "16.0", "15.0"];
const NO_ARGS: &[&str] = &[];
const VERSION_ARGS: &[&str] = &["--version"];

/// Host operations needed for discovery, mockable in tests.
pub trait SystemProbe {
    fn registry_string(&self, hive: RegistryHive, key: &str, value: &str) -> Option<String>;
    fn path_exists(&self, path: &Path) -> bool;
    fn find_on_path(&self, name: &str) -> Option<PathBuf>;
    fn env_var(&self, key: &str) -> Option<String>;
    fn run(&mut self, command: &ToolCommand) -> Result<ToolOutput>;
}

/// The real machine.
#[derive(Debug, Default)]
pub struct LiveProbe {
    runner: SystemRunner,
}

impl SystemProbe for LiveProbe {
    fn registry_string(&self, hive: RegistryHive, key: &str, value: &str) -> Option<String> {
        registry::read_string(hive, key, value)
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn find_on_path(&self, name: &str) -> Option<PathBuf> {
        let path_var = env::var_os("PATH")?;
        let pathext = env::var("PATHEXT").ok();
        process::find_on_path(name, &path_var, pathext.as_deref())
    }

    fn env_var(&self, key: &str) -> Option<String> {
        env::var(key).ok().filter(|value| !value.trim().is_empty())
    }

    fn run(&mut self, command: &ToolCommand) -> Result<ToolOutput> {
        self.runner.run(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    SevenZip,
    Robocopy,
    VisualStudio,
    Git,
    DotNet,
}

impl Tool {
    pub const ALL: [Tool; 5] = [
        Self::SevenZip,
        Self::Robocopy,
        Self::VisualStudio,
        Self::Git,
        Self::DotNet,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::SevenZip => "7-Zip",
            Self::Robocopy => "robocopy",
            Self::VisualStudio => "Visual Studio (devenv.com)",
            Self::Git => "git",
            Self::DotNet => ".NET SDK",
        }
    }

    pub fn required(self) -> bool {
        matches!(self, Self::SevenZip | Self::Robocopy | Self::VisualStudio)
    }

    pub fn install_hint(self) -> &'static str {
        match self {
            Self::SevenZip => {
                "install 7-Zip from https://www.7-zip.org/ or set tools.seven_zip"
            }
            Self::Robocopy => "robocopy ships with Windows; set tools.robocopy if it lives elsewhere",
            Self::VisualStudio => {
                "install Visual Studio from https://visualstudio.microsoft.com/ or set tools.devenv"
            }
            Self::Git => "install Git from https://git-scm.com/download/win",
            Self::DotNet => "install the .NET SDK from https://dotnet.microsoft.com/download",
        }
    }

    fn setting(self) -> Option<SettingKey> {
        match self {
            Self::SevenZip => Some(SettingKey::SevenZip),
            Self::Robocopy => Some(SettingKey::Robocopy),
            Self::VisualStudio => Some(SettingKey::Devenv),
            Self::Git | Self::DotNet => None,
        }
    }

    fn path_name(self) -> &'static str {
        match self {
            Self::SevenZip => "7z",
            Self::Robocopy => "robocopy",
            Self::VisualStudio => "devenv.com",
            Self::Git => "git",
            Self::DotNet => "dotnet",
        }
    }

    fn version_args(self) -> Option<&'static [&'static str]> {
        match self {
            Self::SevenZip => Some(NO_ARGS),
            Self::Git | Self::DotNet => Some(VERSION_ARGS),
            Self::Robocopy | Self::VisualStudio => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationSource {
    Settings,
    Registry,
    Vswhere,
    WellKnown,
    Path,
}

impl LocationSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Settings => "settings",
            Self::Registry => "registry",
            Self::Vswhere => "vswhere",
            Self::WellKnown => "well-known",
            Self::Path => "PATH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLocation {
    pub path: PathBuf,
    pub source: LocationSource,
}

#[derive(Debug, Clone)]
pub struct ToolCheck {
    pub tool: Tool,
    pub location: Option<ToolLocation>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PrerequisiteReport {
    pub checks: Vec<ToolCheck>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PrerequisiteReport {
    pub fn all_required_found(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn check_prerequisites<P: SystemProbe>(
    probe: &mut P,
    config: &DevkitConfig,
) -> PrerequisiteReport {
    let mut report = PrerequisiteReport::default();

    for tool in Tool::ALL {
        let location = locate_tool_with_warnings(probe, config, tool, &mut report.warnings);
        let version = location
            .as_ref()
            .and_then(|location| probe_version(probe, tool, &location.path));
        match &location {
            Some(found) => debug!(
                "{} found at {} ({})",
                tool.name(),
                found.path.display(),
                found.source.as_str()
            ),
            None if tool.required() => report
                .errors
                .push(format!("{} not found: {}", tool.name(), tool.install_hint())),
            None => report.warnings.push(format!(
                "{} not found (optional): {}",
                tool.name(),
                tool.install_hint()
            )),
        }
        report.checks.push(ToolCheck {
            tool,
            location,
            version,
        });
    }

    report
}

/// Locate a tool, failing with its install hint when it is missing.
pub fn require_tool<P: SystemProbe>(
    probe: &mut P,
    config: &DevkitConfig,
    tool: Tool,
) -> Result<ToolLocation> {
    let mut warnings = Vec::new();
    let located = locate_tool_with_warnings(probe, config, tool, &mut warnings);
    for warning in warnings {
        warn!("{warning}");
    }
    match located {
        Some(location) => Ok(location),
        None => bail!("{} not found: {}", tool.name(), tool.install_hint()),
    }
}

pub fn locate_tool<P: SystemProbe>(
    probe: &mut P,
    config: &DevkitConfig,
    tool: Tool,
) -> Option<ToolLocation> {
    locate_tool_with_warnings(probe, config, tool, &mut Vec::new())
}

fn locate_tool_with_warnings<P: SystemProbe>(
    probe: &mut P,
    config: &DevkitConfig,
    tool: Tool,
    warnings: &mut Vec<String>,
) -> Option<ToolLocation> {
    if let Some(key) = tool.setting()
        && let Some(configured) = config.get(key)
    {
        let path = PathBuf::from(configured.trim());
        if probe.path_exists(&path) {
            return Some(ToolLocation {
                path,
                source: LocationSource::Settings,
            });
        }
        warnings.push(format!(
            "{} points at {} which does not exist; falling back to discovery",
            key.name(),
            path.display()
        ));
    }

    let discovered = match tool {
        Tool::SevenZip => locate_seven_zip(probe),
        Tool::Robocopy => locate_robocopy(probe),
        Tool::VisualStudio => locate_devenv(probe, config),
        Tool::Git | Tool::DotNet => None,
    };
    discovered.or_else(|| {
        probe
            .find_on_path(tool.path_name())
            .map(|path| ToolLocation {
                path,
                source: LocationSource::Path,
            })
    })
}

fn locate_seven_zip<P: SystemProbe>(probe: &P) -> Option<ToolLocation> {
    let registry_dirs = [
        (RegistryHive::LocalMachine, "Path64"),
        (RegistryHive::LocalMachine, "Path"),
        (RegistryHive::CurrentUser, "Path64"),
        (RegistryHive::CurrentUser, "Path"),
    ];
    for (hive, value) in registry_dirs {
        if let Some(dir) = probe.registry_string(hive, SEVEN_ZIP_KEY, value) {
            let path = PathBuf::from(dir).join("7z.exe");
            if probe.path_exists(&path) {
                return Some(ToolLocation {
                    path,
                    source: LocationSource::Registry,
                });
            }
        }
    }

    program_files_dirs(probe)
        .into_iter()
        .map(|dir| dir.join("7-Zip").join("7z.exe"))
        .find(|path| probe.path_exists(path))
        .map(|path| ToolLocation {
            path,
            source: LocationSource::WellKnown,
        })
}

fn locate_robocopy<P: SystemProbe>(probe: &P) -> Option<ToolLocation> {
    let system_root = probe
        .env_var("SystemRoot")
        .unwrap_or_else(|| r"C:\Windows".to_string());
    let path = PathBuf::from(system_root)
        .join("System32")
        .join("robocopy.exe");
    probe.path_exists(&path).then_some(ToolLocation {
        path,
        source: LocationSource::WellKnown,
    })
}

fn locate_devenv<P: SystemProbe>(probe: &mut P, config: &DevkitConfig) -> Option<ToolLocation> {
    if let Some(vswhere) = locate_vswhere(probe, config) {
        let command = ToolCommand::new(vswhere).args([
            "-latest",
            "-products",
            "*",
            "-property",
            "productPath",
            "-nologo",
        ]);
        match probe.run(&command) {
            Ok(output) if output.code == Some(0) => {
                if let Some(product) = output
                    .stdout
                    .lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                {
                    let devenv_com = PathBuf::from(product).with_extension("com");
                    if probe.path_exists(&devenv_com) {
                        return Some(ToolLocation {
                            path: devenv_com,
                            source: LocationSource::Vswhere,
                        });
                    }
                }
            }
            Ok(output) => debug!("vswhere exited with {:?}", output.code),
            Err(error) => debug!("vswhere failed: {error:#}"),
        }
    }

    for version in VS7_VERSIONS {
        if let Some(dir) = probe.registry_string(RegistryHive::LocalMachine, VS7_KEY, version) {
            let path = PathBuf::from(dir)
                .join("Common7")
                .join("IDE")
                .join("devenv.com");
            if probe.path_exists(&path) {
                return Some(ToolLocation {
                    path,
                    source: LocationSource::Registry,
                });
            }
        }
    }
    None
}

fn locate_vswhere<P: SystemProbe>(probe: &P, config: &DevkitConfig) -> Option<PathBuf> {
    if let Some(configured) = config.tools.vswhere.as_deref() {
        let path = PathBuf::from(configured.trim());
        if probe.path_exists(&path) {
            return Some(path);
        }
    }
    let program_files_x86 = probe
        .env_var("ProgramFiles(x86)")
        .unwrap_or_else(|| r"C:\Program Files (x86)".to_string());
    let path = PathBuf::from(program_files_x86)
        .join("Microsoft Visual Studio")
        .join("Installer")
        .join("vswhere.exe");
    if probe.path_exists(&path) {
        return Some(path);
    }
    probe.find_on_path("vswhere")
}

fn program_files_dirs<P: SystemProbe>(probe: &P) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for (key, fallback) in [
        ("ProgramFiles", r"C:\Program Files"),
        ("ProgramW6432", r"C:\Program Files"),
        ("ProgramFiles(x86)", r"C:\Program Files (x86)"),
    ] {
        let dir = PathBuf::from(probe.env_var(key).unwrap_or_else(|| fallback.to_string()));
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}

fn probe_version<P: SystemProbe>(probe: &mut P, tool: Tool, path: &Path) -> Option<String> {
    let args = tool.version_args()?;
    let command = ToolCommand::new(path).args(args.iter().copied());
    let output = match probe.run(&command) {
        Ok(output) => output,
        Err(error) => {
            debug!("version probe for {} failed: {error:#}", tool.name());
            return None;
        }
    };
    output
        .stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| parse_version_line(tool, line))
}

fn parse_version_line(tool: Tool, line: &str) -> String {
    match tool {
        // "7-Zip 23.01 (x64) : Copyright (c) 1999-2023 Igor Pavlov : 2023-06-20"
        Tool::SevenZip => line
            .split(':')
            .next()
            .unwrap_or(line)
            .trim()
            .to_string(),
        // "git version 2.43.0.windows.1"
        Tool::Git => line
            .strip_prefix("git version")
            .unwrap_or(line)
            .trim()
            .to_string(),
        _ => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet, VecDeque};
    use std::path::{Path, PathBuf};

    use anyhow::{Result, bail};

    use super::{LocationSource, SystemProbe, Tool, check_prerequisites, locate_tool, require_tool};
    use crate::config::{DevkitConfig, ToolsSection};
    use crate::process::{ToolCommand, ToolOutput};
    use crate::registry::RegistryHive;

    #[derive(Default)]
    struct MockProbe {
        registry: BTreeMap<(RegistryHive, String, String), String>,
        files: HashSet<PathBuf>,
        path_entries: BTreeMap<String, PathBuf>,
        env: BTreeMap<String, String>,
        outputs: VecDeque<ToolOutput>,
        commands: Vec<ToolCommand>,
    }

    impl MockProbe {
        fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
            self.files.insert(path.into());
            self
        }
    }

    impl SystemProbe for MockProbe {
        fn registry_string(&self, hive: RegistryHive, key: &str, value: &str) -> Option<String> {
            self.registry
                .get(&(hive, key.to_string(), value.to_string()))
                .cloned()
        }

        fn path_exists(&self, path: &Path) -> bool {
            self.files.contains(path)
        }

        fn find_on_path(&self, name: &str) -> Option<PathBuf> {
            self.path_entries.get(name).cloned()
        }

        fn env_var(&self, key: &str) -> Option<String> {
            self.env.get(key).cloned()
        }

        fn run(&mut self, command: &ToolCommand) -> Result<ToolOutput> {
            self.commands.push(command.clone());
            match self.outputs.pop_front() {
                Some(output) => Ok(output),
                None => bail!("no output queued"),
            }
        }
    }

    fn stdout(text: &str) -> ToolOutput {
        ToolOutput {
            code: Some(0),
            stdout: text.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn seven_zip_prefers_configured_path() {
        let configured = PathBuf::from(r"D:\tools\7z.exe");
        let mut probe = MockProbe::default().with_file(configured.clone());
        let config = DevkitConfig {
            tools: ToolsSection {
                seven_zip: Some(r"D:\tools\7z.exe".to_string()),
                ..ToolsSection::default()
            },
            ..DevkitConfig::default()
        };
        let location = locate_tool(&mut probe, &config, Tool::SevenZip).expect("located");
        assert_eq!(location.path, configured);
        assert_eq!(location.source, LocationSource::Settings);
    }

    #[test]
    fn seven_zip_falls_back_to_registry_install_dir() {
        let install = PathBuf::from(r"E:\Apps\7-Zip").join("7z.exe");
        let mut probe = MockProbe::default().with_file(install.clone());
        probe.registry.insert(
            (
                RegistryHive::LocalMachine,
                r"SOFTWARE\7-Zip".to_string(),
                "Path".to_string(),
            ),
            r"E:\Apps\7-Zip".to_string(),
        );
        let config = DevkitConfig {
            tools: ToolsSection {
                seven_zip: Some(r"Z:\missing\7z.exe".to_string()),
                ..ToolsSection::default()
            },
            ..DevkitConfig::default()
        };
        let location = locate_tool(&mut probe, &config, Tool::SevenZip).expect("located");
        assert_eq!(location.path, install);
        assert_eq!(location.source, LocationSource::Registry);
    }

    #[test]
    fn seven_zip_checks_program_files_then_path() {
        let well_known = PathBuf::from(r"C:\Program Files (x86)")
            .join("7-Zip")
            .join("7z.exe");
        let mut probe = MockProbe::default().with_file(well_known.clone());
        let location =
            locate_tool(&mut probe, &DevkitConfig::default(), Tool::SevenZip).expect("located");
        assert_eq!(location.path, well_known);
        assert_eq!(location.source, LocationSource::WellKnown);

        let mut probe = MockProbe::default();
        probe
            .path_entries
            .insert("7z".to_string(), PathBuf::from("/usr/bin/7z"));
        let location =
            locate_tool(&mut probe, &DevkitConfig::default(), Tool::SevenZip).expect("located");
        assert_eq!(location.source, LocationSource::Path);
    }

    #[test]
    fn robocopy_uses_system_root() {
        let expected = PathBuf::from(r"D:\Win")
            .join("System32")
            .join("robocopy.exe");
        let mut probe = MockProbe::default().with_file(expected.clone());
        probe
            .env
            .insert("SystemRoot".to_string(), r"D:\Win".to_string());
        let location =
            locate_tool(&mut probe, &DevkitConfig::default(), Tool::Robocopy).expect("located");
        assert_eq!(location.path, expected);
    }

    #[test]
    fn devenv_is_resolved_through_vswhere() {
        let vswhere = PathBuf::from(r"C:\Program Files (x86)")
            .join("Microsoft Visual Studio")
            .join("Installer")
            .join("vswhere.exe");
        let product = r"C:\VS\2022\Common7\IDE\devenv.exe";
        let devenv_com = PathBuf::from(product).with_extension("com");
        let mut probe = MockProbe::default()
            .with_file(vswhere.clone())
            .with_file(devenv_com.clone());
        probe.outputs.push_back(stdout(&format!("{product}\r\n")));

        let location =
            locate_tool(&mut probe, &DevkitConfig::default(), Tool::VisualStudio).expect("located");
        assert_eq!(location.path, devenv_com);
        assert_eq!(location.source, LocationSource::Vswhere);
        assert_eq!(probe.commands[0].program, vswhere);
        assert!(probe.commands[0].args.contains(&"productPath".to_string()));
    }

    #[test]
    fn devenv_falls_back_to_vs7_registry() {
        let devenv = PathBuf::from(r"C:\VS2017\")
            .join("Common7")
            .join("IDE")
            .join("devenv.com");
        let mut probe = MockProbe::default().with_file(devenv.clone());
        probe.registry.insert(
            (
                RegistryHive::LocalMachine,
                r"SOFTWARE\WOW6432Node\Microsoft\VisualStudio\SxS\VS7".to_string(),
                "15.0".to_string(),
            ),
            r"C:\VS2017\".to_string(),
        );
        let location =
            locate_tool(&mut probe, &DevkitConfig::default(), Tool::VisualStudio).expect("located");
        assert_eq!(location.path, devenv);
        assert_eq!(location.source, LocationSource::Registry);
    }

    #[test]
    fn report_separates_required_errors_from_optional_warnings() {
        let mut probe = MockProbe::default();
        probe
            .path_entries
            .insert("git".to_string(), PathBuf::from("/usr/bin/git"));
        probe.outputs.push_back(stdout("git version 2.43.0\n"));

        let report = check_prerequisites(&mut probe, &DevkitConfig::default());
        assert!(!report.all_required_found());
        assert_eq!(report.errors.len(), 3);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains(".NET SDK"));

        let git = report
            .checks
            .iter()
            .find(|check| check.tool == Tool::Git)
            .expect("git check");
        assert_eq!(git.version.as_deref(), Some("2.43.0"));
    }

    #[test]
    fn require_tool_reports_install_hint() {
        let mut probe = MockProbe::default();
        let error = require_tool(&mut probe, &DevkitConfig::default(), Tool::SevenZip)
            .expect_err("missing");
        assert!(error.to_string().contains("https://www.7-zip.org/"));
    }
}
