use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const STATE_DIR_NAME: &str = ".devkit";
pub const SETTINGS_FILENAME: &str = "settings.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub state_dir_exists: bool,
    pub logs_dir_exists: bool,
    pub artifacts_dir_exists: bool,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\nlogs_dir={}\nartifacts_dir={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.logs_dir),
            normalize_for_display(&self.artifacts_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }

    pub fn default_changelog_path(&self) -> PathBuf {
        self.artifacts_dir.join("changelog.html")
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> RuntimeStatus {
    let project_root_exists = paths.project_root.exists();
    let state_dir_exists = paths.state_dir.exists();
    let logs_dir_exists = paths.logs_dir.exists();
    let artifacts_dir_exists = paths.artifacts_dir.exists();
    let config_exists = paths.config_path.exists();

    let mut warnings = Vec::new();
    if !state_dir_exists {
        warnings.push(".devkit/ is missing; run `devkit init` first".to_string());
    }
    if !config_exists {
        warnings.push(format!(
            "settings file {} is missing; run `devkit settings prompt`",
            normalize_for_display(&paths.config_path)
        ));
    }

    RuntimeStatus {
        project_root_exists,
        state_dir_exists,
        logs_dir_exists,
        artifacts_dir_exists,
        config_exists,
        warnings,
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);

    let state_dir = project_root.join(STATE_DIR_NAME);
    let logs_dir = state_dir.join("logs");
    let artifacts_dir = state_dir.join("artifacts");

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = lookup_env("DEVKIT_CONFIG").filter(|value| !value.trim().is_empty())
    {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join(SETTINGS_FILENAME), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        project_root,
        state_dir,
        logs_dir,
        artifacts_dir,
        config_path,
        root_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();

    let required_dirs = [
        paths.state_dir.clone(),
        paths.logs_dir.clone(),
        paths.artifacts_dir.clone(),
    ];
    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(
        &paths.config_path,
        &render_default_settings(paths),
        options.force,
    )?;

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_default_settings(paths: &ResolvedPaths) -> String {
    let artifacts_dir = normalize_for_display(&paths.artifacts_dir);
    format!(
        "# devkit machine-local settings (materialized by `devkit init`)\n# Fill in interactively with `devkit settings prompt`.\n\n[tools]\n# seven_zip = \"C:/Program Files/7-Zip/7z.exe\"\n# devenv = \"C:/Program Files/Microsoft Visual Studio/2022/Community/Common7/IDE/devenv.com\"\n# robocopy = \"C:/Windows/System32/robocopy.exe\"\n\n[build]\n# solution = \"MySolution.sln\"\nconfiguration = \"Debug\"\n# platform = \"Any CPU\"\n\n[sync]\nretries = 3\nwait_seconds = 5\n\n[github]\n# owner = \"your-org\"\n# repo = \"your-repo\"\n# Tokens are read from DEVKIT_GITHUB_TOKEN or GITHUB_TOKEN.\n\n[changelog]\noutput = \"{artifacts_dir}/changelog.html\"\ntitle = \"Changelog\"\nexclude_labels = [\"duplicate\", \"invalid\", \"wontfix\"]\ninclude_open = false\n",
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }

    if let Some(value) =
        lookup_env("DEVKIT_PROJECT_ROOT").filter(|value| !value.trim().is_empty())
    {
        return (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        );
    }

    match detect_project_root_heuristic(&context.cwd, context.executable_dir.as_deref()) {
        Some(root) => (root, ValueSource::Heuristic),
        None => (context.cwd.clone(), ValueSource::Default),
    }
}

fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> Option<PathBuf> {
    let mut seen = HashSet::new();
    for candidate in candidate_roots(cwd, executable_dir) {
        let key = normalize_for_display(&candidate);
        if !seen.insert(key) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).is_dir() || contains_solution(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn contains_solution(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(|entry| entry.ok()).any(|entry| {
        entry
            .path()
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sln"))
    })
}

fn candidate_roots(cwd: &Path, executable_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut out = ancestors(cwd);
    if let Some(exe_dir) = executable_dir {
        out.extend(ancestors(exe_dir));
    }
    out
}

fn ancestors(path: &Path) -> Vec<PathBuf> {
    path.ancestors().map(Path::to_path_buf).collect()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
