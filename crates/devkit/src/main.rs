use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use devkit_core::archive::{
    ArchiveFormat, CompressOptions, ExtractOptions, OverwriteMode, SevenZip,
};
use devkit_core::changelog::{ChangelogOptions, generate_changelog};
use devkit_core::config::{
    ConfigPatch, DevkitConfig, SettingKey, load_config, patch_config, validate_setting,
};
use devkit_core::github::{GitHubClient, GitHubClientConfig, RepoRef};
use devkit_core::mirror::{CopyMode, MirrorOptions, sync_directories};
use devkit_core::prereq::{LiveProbe, Tool, check_prerequisites, require_tool};
use devkit_core::process::SystemRunner;
use devkit_core::prompt::{PromptOptions, confirm_on_stdin, prompt_settings_on_stdin};
use devkit_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    normalize_for_display, resolve_paths,
};
use devkit_core::solution::{BuildAction, BuildRequest, resolve_solution, run_build};
use log::{LevelFilter, info};
use simplelog::{Config, SimpleLogger};

#[derive(Debug, Parser)]
#[command(
    name = "devkit",
    version,
    about = "Developer environment bootstrap and build automation for Windows .NET projects"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    /// Turn on verbose logging.
    ///
    /// - `-v`: Debug
    /// - `-vv`: Trace
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create .devkit/ and a default settings file.
    Init(InitArgs),
    /// Show the resolved runtime layout.
    Status,
    /// Inspect, prompt for or change persisted settings.
    Settings(SettingsArgs),
    /// Check that the required external tools are installed.
    Doctor,
    /// Drive 7-Zip.
    Archive(ArchiveArgs),
    /// Copy, mirror or move a directory tree with robocopy.
    Sync(SyncArgs),
    /// Build the solution with devenv.
    Build(BuildArgs),
    /// Generate an HTML changelog from GitHub milestones.
    Changelog(ChangelogArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing settings file")]
    force: bool,
}

#[derive(Debug, Args)]
struct SettingsArgs {
    #[command(subcommand)]
    command: SettingsSubcommand,
}

#[derive(Debug, Subcommand)]
enum SettingsSubcommand {
    Show,
    Prompt {
        #[arg(long = "key", value_name = "KEY", help = "Only prompt for these keys")]
        keys: Vec<String>,
        #[arg(long, help = "Accept current or default values without reading input")]
        defaults: bool,
    },
    Set {
        key: String,
        value: String,
    },
    Unset {
        key: String,
    },
}

#[derive(Debug, Args)]
struct ArchiveArgs {
    #[command(subcommand)]
    command: ArchiveSubcommand,
}

#[derive(Debug, Subcommand)]
enum ArchiveSubcommand {
    Compress(CompressArgs),
    Extract(ExtractArgs),
    List { archive: PathBuf },
    Test {
        archive: PathBuf,
        #[arg(long, value_name = "VAR")]
        password_env: Option<String>,
    },
}

#[derive(Debug, Args)]
struct CompressArgs {
    archive: PathBuf,
    #[arg(required = true)]
    sources: Vec<PathBuf>,
    #[arg(long, help = "7z, zip, tar or gzip (default: from the archive extension)")]
    format: Option<String>,
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u8).range(0..=9))]
    level: u8,
    #[arg(long, value_name = "PATTERN")]
    exclude: Vec<String>,
    #[arg(
        long,
        value_name = "VAR",
        help = "Read the archive password from this environment variable"
    )]
    password_env: Option<String>,
    #[arg(long, conflicts_with = "no_solid")]
    solid: bool,
    #[arg(long)]
    no_solid: bool,
    #[arg(long, value_name = "SIZE", help = "Split into volumes, e.g. 100m")]
    volume: Option<String>,
}

#[derive(Debug, Args)]
struct ExtractArgs {
    archive: PathBuf,
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,
    #[arg(long, default_value = "overwrite", help = "overwrite, skip or rename")]
    overwrite: String,
    #[arg(long, help = "Extract without the stored directory structure")]
    flat: bool,
    #[arg(long, value_name = "VAR")]
    password_env: Option<String>,
    #[arg(long, value_name = "PATTERN")]
    include: Vec<String>,
}

#[derive(Debug, Args)]
struct SyncArgs {
    source: PathBuf,
    destination: PathBuf,
    #[arg(
        long,
        conflicts_with = "move_files",
        help = "Delete destination files missing from the source"
    )]
    mirror: bool,
    #[arg(long = "move", help = "Delete source files after copying")]
    move_files: bool,
    #[arg(long, value_name = "PATTERN")]
    filter: Vec<String>,
    #[arg(long, value_name = "PATTERN")]
    exclude_file: Vec<String>,
    #[arg(long, value_name = "DIR")]
    exclude_dir: Vec<String>,
    #[arg(long)]
    retries: Option<u32>,
    #[arg(long, value_name = "SECONDS")]
    wait: Option<u32>,
    #[arg(long)]
    threads: Option<u32>,
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,
    #[arg(long)]
    quiet: bool,
    #[arg(long, short = 'y', help = "Do not ask before mirroring")]
    yes: bool,
}

#[derive(Debug, Args)]
struct BuildArgs {
    #[arg(long, value_name = "PATH")]
    solution: Option<String>,
    #[arg(long)]
    configuration: Option<String>,
    #[arg(long)]
    platform: Option<String>,
    #[arg(long)]
    project: Option<String>,
    #[arg(long, conflicts_with = "clean")]
    rebuild: bool,
    #[arg(long)]
    clean: bool,
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ChangelogArgs {
    #[arg(long)]
    owner: Option<String>,
    #[arg(long)]
    repo: Option<String>,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long, help = "Include milestones that are still open")]
    include_open: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let _ = SimpleLogger::init(log_level, Config::default());

    let runtime = RuntimeOptions::from_cli(&cli);
    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Settings(SettingsArgs { command })) => match command {
            SettingsSubcommand::Show => run_settings_show(&runtime),
            SettingsSubcommand::Prompt { keys, defaults } => {
                run_settings_prompt(&runtime, &keys, defaults)
            }
            SettingsSubcommand::Set { key, value } => run_settings_set(&runtime, &key, &value),
            SettingsSubcommand::Unset { key } => run_settings_unset(&runtime, &key),
        },
        Some(Commands::Doctor) => run_doctor(&runtime),
        Some(Commands::Archive(ArchiveArgs { command })) => run_archive(&runtime, command),
        Some(Commands::Sync(args)) => run_sync(&runtime, args),
        Some(Commands::Build(args)) => run_build_command(&runtime, args),
        Some(Commands::Changelog(args)) => run_changelog(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;
    println!("Initialized devkit runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths);
    println!("runtime status");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("project_root_source: {}", paths.root_source.as_str());
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("logs_dir_exists: {}", format_flag(status.logs_dir_exists));
    println!(
        "artifacts_dir_exists: {}",
        format_flag(status.artifacts_dir_exists)
    );
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("config_exists: {}", format_flag(status.config_exists));
    print_list("warnings", &status.warnings);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_settings_show(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    println!("settings");
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    for key in SettingKey::ALL {
        let value = config
            .get(key)
            .or_else(|| key.default_value().map(|value| format!("{value} (default)")))
            .unwrap_or_else(|| "<unset>".to_string());
        println!("{}: {value}", key.name());
    }
    println!(
        "github.token: {}",
        if config.github_token().is_some() {
            "<set>"
        } else {
            "<unset>"
        }
    );
    println!("github.api_url: {}", config.github_api_url());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_settings_prompt(runtime: &RuntimeOptions, keys: &[String], defaults: bool) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let keys = if keys.is_empty() {
        SettingKey::PROMPTED.to_vec()
    } else {
        keys.iter()
            .map(|key| SettingKey::parse(key))
            .collect::<Result<Vec<_>>>()?
    };

    let options = PromptOptions {
        accept_defaults: defaults,
        base_dir: paths.project_root.clone(),
        ..PromptOptions::default()
    };
    let patch = prompt_settings_on_stdin(&config, &keys, options)?;
    let wrote = patch_config(&paths.config_path, &patch)?;
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("changed_keys: {}", patch.entries.len());
    for (key, value) in &patch.entries {
        println!(
            "changed.{}: {}",
            key.name(),
            value.as_deref().unwrap_or("<unset>")
        );
    }
    println!("wrote_config: {wrote}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_settings_set(runtime: &RuntimeOptions, key: &str, value: &str) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let key = SettingKey::parse(key)?;
    validate_setting(key, value)?;
    let mut patch = ConfigPatch::default();
    patch.set(key, value.trim());
    let wrote = patch_config(&paths.config_path, &patch)?;
    println!("{}: {}", key.name(), value.trim());
    println!("wrote_config: {wrote}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_settings_unset(runtime: &RuntimeOptions, key: &str) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let key = SettingKey::parse(key)?;
    let mut patch = ConfigPatch::default();
    patch.unset(key);
    let wrote = patch_config(&paths.config_path, &patch)?;
    println!("{}: <unset>", key.name());
    println!("wrote_config: {wrote}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_doctor(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let mut probe = LiveProbe::default();
    let report = check_prerequisites(&mut probe, &config);
    println!("prerequisites");
    for check in &report.checks {
        let name = check.tool.name();
        match &check.location {
            Some(location) => {
                println!(
                    "{name}: {} ({})",
                    normalize_for_display(&location.path),
                    location.source.as_str()
                );
                if let Some(version) = &check.version {
                    println!("{name}.version: {version}");
                }
            }
            None => println!("{name}: <missing>"),
        }
    }
    print_list("warnings", &report.warnings);
    print_list("errors", &report.errors);
    print_diagnostics(runtime, &paths);
    if !report.all_required_found() {
        bail!(
            "{} required tool(s) missing; install them or set their paths with `devkit settings`",
            report.errors.len()
        );
    }
    Ok(())
}

fn run_archive(runtime: &RuntimeOptions, command: ArchiveSubcommand) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let location = require_tool(&mut LiveProbe::default(), &config, Tool::SevenZip)?;
    let mut runner = SystemRunner;
    let mut seven_zip = SevenZip::new(&location.path, &mut runner);

    match command {
        ArchiveSubcommand::Compress(args) => {
            let format = args.format.as_deref().map(ArchiveFormat::parse).transpose()?;
            let solid = if args.solid {
                Some(true)
            } else if args.no_solid {
                Some(false)
            } else {
                None
            };
            let options = CompressOptions {
                format,
                level: args.level,
                excludes: args.exclude,
                password: read_password(args.password_env.as_deref())?,
                solid,
                volume_size: args.volume,
                ..CompressOptions::default()
            };
            let report = seven_zip.compress(&args.archive, &args.sources, &options)?;
            println!("archive compress");
            println!("archive: {}", normalize_for_display(&args.archive));
            println!("sources: {}", args.sources.len());
            println!("exit: {}", report.exit.describe());
        }
        ArchiveSubcommand::Extract(args) => {
            let options = ExtractOptions {
                output_dir: args.output.clone(),
                overwrite: OverwriteMode::parse(&args.overwrite)?,
                flatten: args.flat,
                password: read_password(args.password_env.as_deref())?,
                includes: args.include,
            };
            let report = seven_zip.extract(&args.archive, &options)?;
            println!("archive extract");
            println!("archive: {}", normalize_for_display(&args.archive));
            println!(
                "output: {}",
                args.output
                    .as_deref()
                    .map(normalize_for_display)
                    .unwrap_or_else(|| ".".to_string())
            );
            println!("exit: {}", report.exit.describe());
        }
        ArchiveSubcommand::List { archive } => {
            let entries = seven_zip.list(&archive)?;
            println!("archive list");
            println!("archive: {}", normalize_for_display(&archive));
            println!("entries: {}", entries.len());
            for entry in entries {
                let size = entry
                    .size
                    .map(|size| size.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let kind = if entry.is_dir { "dir" } else { "file" };
                println!("entry: {kind} {size} {}", entry.path);
            }
        }
        ArchiveSubcommand::Test {
            archive,
            password_env,
        } => {
            let password = read_password(password_env.as_deref())?;
            let report = seven_zip.test(&archive, password.as_deref())?;
            println!("archive test");
            println!("archive: {}", normalize_for_display(&archive));
            println!("exit: {}", report.exit.describe());
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_sync(runtime: &RuntimeOptions, args: SyncArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let mode = if args.mirror {
        CopyMode::Mirror
    } else if args.move_files {
        CopyMode::Move
    } else {
        CopyMode::Copy
    };

    if mode == CopyMode::Mirror && !args.yes {
        let question = format!(
            "Mirroring deletes files in {} that are not in {}. Continue?",
            normalize_for_display(&args.destination),
            normalize_for_display(&args.source)
        );
        if !confirm_on_stdin(&question, false)? {
            println!("sync: aborted");
            return Ok(());
        }
    }

    let defaults = MirrorOptions::from_config(&config);
    let options = MirrorOptions {
        mode,
        file_filters: args.filter,
        exclude_files: args.exclude_file,
        exclude_dirs: args.exclude_dir,
        retries: args.retries.unwrap_or(defaults.retries),
        wait_seconds: args.wait.unwrap_or(defaults.wait_seconds),
        threads: args.threads.or(defaults.threads),
        log_file: args.log,
        quiet: args.quiet,
        ..defaults
    };

    let location = require_tool(&mut LiveProbe::default(), &config, Tool::Robocopy)?;
    let outcome = sync_directories(
        &mut SystemRunner,
        &location.path,
        &args.source,
        &args.destination,
        &options,
    )?;
    println!("sync {}", mode.as_str());
    println!("source: {}", normalize_for_display(&args.source));
    println!("destination: {}", normalize_for_display(&args.destination));
    println!("exit_code: {}", outcome.code);
    println!("result: {}", outcome.describe());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_build_command(runtime: &RuntimeOptions, args: BuildArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let explicit = args.solution.or_else(|| config.get(SettingKey::Solution));
    let solution = resolve_solution(&paths.project_root, explicit.as_deref())?;
    let action = if args.rebuild {
        BuildAction::Rebuild
    } else if args.clean {
        BuildAction::Clean
    } else {
        BuildAction::Build
    };
    let request = BuildRequest {
        solution,
        configuration: args
            .configuration
            .unwrap_or_else(|| config.configuration()),
        platform: args.platform.or_else(|| config.get(SettingKey::Platform)),
        project: args.project,
        log_file: args.log,
    };

    let location = require_tool(&mut LiveProbe::default(), &config, Tool::VisualStudio)?;
    let report = run_build(&mut SystemRunner, &location.path, &request, action)?;
    println!("build {}", action.as_str());
    println!("solution: {}", normalize_for_display(&request.solution));
    println!("configuration: {}", request.configuration_switch());
    match report.summary {
        Some(summary) => {
            println!("projects.succeeded: {}", summary.succeeded);
            println!("projects.failed: {}", summary.failed);
            println!("projects.up_to_date: {}", summary.up_to_date);
            println!("projects.skipped: {}", summary.skipped);
        }
        None => println!("projects: <no summary reported>"),
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_changelog(runtime: &RuntimeOptions, args: ChangelogArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let owner = args.owner.or_else(|| config.get(SettingKey::GitHubOwner));
    let repo = args.repo.or_else(|| config.get(SettingKey::GitHubRepo));
    let (Some(owner), Some(repo)) = (owner, repo) else {
        bail!("GitHub repository is not configured; set github.owner and github.repo or pass --owner/--repo");
    };
    let repo = RepoRef::new(&owner, &repo)?;

    let mut options = ChangelogOptions::from_config(&config);
    if let Some(title) = args.title {
        options.title = title;
    }
    options.include_open |= args.include_open;

    let output = args
        .output
        .or_else(|| config.get(SettingKey::ChangelogOutput).map(PathBuf::from))
        .map(|path| absolutize(&path, &paths.project_root))
        .unwrap_or_else(|| paths.default_changelog_path());

    let api_url = config.github_api_url();
    let mut client = GitHubClient::new(GitHubClientConfig::from_config(&config))?;
    let generated = generate_changelog(&mut client, &api_url, &repo, &options)?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&output, &generated.html)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!("changelog written to {}", output.display());

    println!("changelog");
    println!("repository: {}/{}", repo.owner, repo.repo);
    println!("releases: {}", generated.changelog.releases.len());
    println!(
        "issues: {}",
        generated
            .changelog
            .releases
            .iter()
            .map(|release| release.item_count())
            .sum::<usize>()
    );
    println!("requests: {}", client.request_count());
    println!("output: {}", normalize_for_display(&output));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn read_password(variable: Option<&str>) -> Result<Option<String>> {
    let Some(variable) = variable else {
        return Ok(None);
    };
    let value = env::var(variable)
        .with_context(|| format!("environment variable {variable} is not set"))?;
    if value.is_empty() {
        bail!("environment variable {variable} is empty");
    }
    Ok(Some(value))
}

fn load_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, DevkitConfig)> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    Ok((paths, config))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn absolutize(path: &Path, root: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn print_list(label: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    println!("{label}:");
    for value in values {
        println!("  - {value}");
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
