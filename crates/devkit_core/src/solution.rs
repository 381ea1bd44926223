use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{debug, info};
use walkdir::WalkDir;

use crate::process::{CommandRunner, ToolCommand, tail_lines};

const SOLUTION_SEARCH_DEPTH: usize = 2;
const ERROR_TAIL_LINES: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildAction {
    #[default]
    Build,
    Rebuild,
    Clean,
    Deploy,
}

impl BuildAction {
    fn switch(self) -> &'static str {
        match self {
            Self::Build => "/Build",
            Self::Rebuild => "/Rebuild",
            Self::Clean => "/Clean",
            Self::Deploy => "/Deploy",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Rebuild => "rebuild",
            Self::Clean => "clean",
            Self::Deploy => "deploy",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub solution: PathBuf,
    pub configuration: String,
    pub platform: Option<String>,
    pub project: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl BuildRequest {
    /// The solution configuration switch value, e.g. `Release|x64`.
    pub fn configuration_switch(&self) -> String {
        match self
            .platform
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            Some(platform) => format!("{}|{platform}", self.configuration.trim()),
            None => self.configuration.trim().to_string(),
        }
    }
}

/// Counts from devenv's closing `========== Build: ... ==========` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSummary {
    pub succeeded: u32,
    pub failed: u32,
    pub up_to_date: u32,
    pub skipped: u32,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub action: BuildAction,
    pub summary: Option<BuildSummary>,
    pub output: String,
}

pub fn devenv_command(
    exe: &Path,
    request: &BuildRequest,
    action: BuildAction,
) -> Result<ToolCommand> {
    if request.configuration.trim().is_empty() {
        bail!("build configuration cannot be empty");
    }
    let mut command = ToolCommand::new(exe)
        .arg(request.solution.to_string_lossy().to_string())
        .arg(action.switch())
        .arg(request.configuration_switch());
    if let Some(project) = request
        .project
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        command = command.arg("/Project").arg(project);
    }
    if let Some(log_file) = &request.log_file {
        command = command
            .arg("/Out")
            .arg(log_file.to_string_lossy().to_string());
    }
    if let Some(dir) = request.solution.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        command = command.current_dir(dir);
    }
    Ok(command)
}

pub fn run_build<R: CommandRunner>(
    runner: &mut R,
    exe: &Path,
    request: &BuildRequest,
    action: BuildAction,
) -> Result<BuildReport> {
    if !request.solution.is_file() {
        bail!("solution not found: {}", request.solution.display());
    }
    let command = devenv_command(exe, request, action)?;
    info!(
        "{} {} ({})",
        action.as_str(),
        request.solution.display(),
        request.configuration_switch()
    );
    debug!("devenv: {}", command.display());

    let output = runner.run(&command)?;
    let combined = output.combined();
    let summary = parse_build_summary(&combined);
    let failed_projects = summary.map(|summary| summary.failed).unwrap_or(0);
    match output.code {
        Some(0) if failed_projects == 0 => {}
        Some(code) => bail!(
            "devenv {} failed with exit code {code}{}\n{}",
            action.as_str(),
            summary
                .map(|summary| format!(" ({} project(s) failed)", summary.failed))
                .unwrap_or_default(),
            tail_lines(&combined, ERROR_TAIL_LINES)
        ),
        None => bail!("devenv was terminated before reporting an exit code"),
    }

    Ok(BuildReport {
        action,
        summary,
        output: combined,
    })
}

/// Find the last devenv summary line (`Build:`, `Rebuild All:`, `Clean:`, `Deploy:`).
pub fn parse_build_summary(output: &str) -> Option<BuildSummary> {
    output.lines().rev().find_map(parse_summary_line)
}

fn parse_summary_line(line: &str) -> Option<BuildSummary> {
    let inner = line
        .trim()
        .strip_prefix("==========")?
        .strip_suffix("==========")?
        .trim();
    let (_, counts) = inner.split_once(':')?;

    let mut summary = BuildSummary::default();
    let mut matched = false;
    for part in counts.split(',') {
        let part = part.trim();
        let Some((number, label)) = part.split_once(' ') else {
            continue;
        };
        let Ok(number) = number.trim().parse::<u32>() else {
            continue;
        };
        let field = match label.trim() {
            "succeeded" => &mut summary.succeeded,
            "failed" => &mut summary.failed,
            "up-to-date" => &mut summary.up_to_date,
            "skipped" => &mut summary.skipped,
            _ => continue,
        };
        *field = number;
        matched = true;
    }
    matched.then_some(summary)
}

/// Solutions under `root`, at most two directories deep, sorted by path.
pub fn discover_solutions(root: &Path) -> Result<Vec<PathBuf>> {
    let mut solutions = Vec::new();
    for entry in WalkDir::new(root).max_depth(SOLUTION_SEARCH_DEPTH + 1) {
        let entry = entry.with_context(|| format!("failed to scan {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_solution = entry
            .path()
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sln"));
        if is_solution {
            solutions.push(entry.into_path());
        }
    }
    solutions.sort();
    Ok(solutions)
}

/// Pick the solution to build: an explicit path (relative to `root`) or the
/// only discovered one.
pub fn resolve_solution(root: &Path, explicit: Option<&str>) -> Result<PathBuf> {
    if let Some(explicit) = explicit.map(str::trim).filter(|value| !value.is_empty()) {
        let path = PathBuf::from(explicit);
        let path = if path.is_absolute() {
            path
        } else {
            root.join(path)
        };
        if !path.is_file() {
            bail!("solution not found: {}", path.display());
        }
        return Ok(path);
    }

    let mut solutions = discover_solutions(root)?;
    match solutions.len() {
        0 => bail!(
            "no .sln file found under {}; set build.solution or pass --solution",
            root.display()
        ),
        1 => Ok(solutions.remove(0)),
        _ => {
            let listing = solutions
                .iter()
                .map(|path| format!("  - {}", path.display()))
                .collect::<Vec<_>>()
                .join("\n");
            bail!("multiple solutions found; choose one with --solution:\n{listing}")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use super::{
        BuildAction, BuildRequest, BuildSummary, devenv_command, discover_solutions,
        parse_build_summary, resolve_solution, run_build,
    };
    use crate::process::ToolOutput;
    use crate::process::testing::RecordingRunner;

    fn request(solution: PathBuf) -> BuildRequest {
        BuildRequest {
            solution,
            configuration: "Release".to_string(),
            platform: Some("x64".to_string()),
            project: None,
            log_file: None,
        }
    }

    #[test]
    fn devenv_command_includes_project_and_log() {
        let mut build = request(PathBuf::from("repo/App.sln"));
        build.project = Some("App.Core".to_string());
        build.log_file = Some(PathBuf::from("build.log"));
        let command =
            devenv_command(Path::new("devenv.com"), &build, BuildAction::Rebuild).expect("command");
        assert_eq!(
            command.args,
            vec![
                "repo/App.sln",
                "/Rebuild",
                "Release|x64",
                "/Project",
                "App.Core",
                "/Out",
                "build.log",
            ]
        );
        assert_eq!(command.cwd, Some(PathBuf::from("repo")));
    }

    #[test]
    fn configuration_switch_omits_blank_platform() {
        let mut build = request(PathBuf::from("App.sln"));
        build.platform = Some(" ".to_string());
        assert_eq!(build.configuration_switch(), "Release");
        build.configuration = String::new();
        assert!(devenv_command(Path::new("devenv.com"), &build, BuildAction::Build).is_err());
    }

    #[test]
    fn summary_parser_reads_last_summary_line() {
        let output = "\
1>------ Build started: Project: Core, Configuration: Release x64 ------
1>Core.csproj -> C:\\repo\\bin\\Core.dll
========== Build: 3 succeeded, 1 failed, 2 up-to-date, 0 skipped ==========
========== Build started at 10:00 and took 05.123 seconds ==========
";
        assert_eq!(
            parse_build_summary(output),
            Some(BuildSummary {
                succeeded: 3,
                failed: 1,
                up_to_date: 2,
                skipped: 0,
            })
        );
        assert_eq!(
            parse_build_summary("========== Rebuild All: 2 succeeded, 0 failed, 0 skipped =========="),
            Some(BuildSummary {
                succeeded: 2,
                ..BuildSummary::default()
            })
        );
        assert_eq!(parse_build_summary("nothing here"), None);
    }

    #[test]
    fn build_fails_when_summary_reports_failures() {
        let temp = tempdir().expect("tempdir");
        let solution = temp.path().join("App.sln");
        fs::write(&solution, "").expect("write sln");

        let mut runner = RecordingRunner::with_outputs(vec![ToolOutput {
            code: Some(1),
            stdout: "error CS1002: ; expected\n========== Build: 0 succeeded, 1 failed, 0 up-to-date, 0 skipped ==========\n".to_string(),
            stderr: String::new(),
        }]);
        let err = run_build(
            &mut runner,
            Path::new("devenv.com"),
            &request(solution.clone()),
            BuildAction::Build,
        )
        .expect_err("build failure");
        let message = err.to_string();
        assert!(message.contains("1 project(s) failed"));
        assert!(message.contains("CS1002"));

        let mut runner = RecordingRunner::with_outputs(vec![ToolOutput {
            code: Some(0),
            stdout: "========== Build: 1 succeeded, 0 failed, 0 up-to-date, 0 skipped ==========\n"
                .to_string(),
            stderr: String::new(),
        }]);
        let report = run_build(
            &mut runner,
            Path::new("devenv.com"),
            &request(solution),
            BuildAction::Build,
        )
        .expect("build ok");
        assert_eq!(report.summary.map(|summary| summary.succeeded), Some(1));
    }

    #[test]
    fn solutions_are_discovered_two_levels_deep() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("src").join("deep").join("deeper")).expect("dirs");
        fs::write(root.join("B.sln"), "").expect("b");
        fs::write(root.join("src").join("deep").join("A.sln"), "").expect("a");
        fs::write(root.join("src").join("deep").join("deeper").join("C.sln"), "").expect("c");

        let found = discover_solutions(root).expect("discover");
        assert_eq!(
            found,
            vec![root.join("B.sln"), root.join("src").join("deep").join("A.sln")]
        );

        let err = resolve_solution(root, None).expect_err("ambiguous");
        assert!(err.to_string().contains("multiple solutions"));
        let explicit = resolve_solution(root, Some("B.sln")).expect("explicit");
        assert_eq!(explicit, root.join("B.sln"));
    }
}
