use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use log::debug;

/// A fully translated invocation of an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Indexes into `args` that must never be echoed (passwords).
    pub masked_args: Vec<usize>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            masked_args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn masked_arg(mut self, value: impl Into<String>) -> Self {
        self.masked_args.push(self.args.len());
        self.args.push(value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Render the command line for logs, quoting arguments with spaces.
    pub fn display(&self) -> String {
        let mut parts = vec![quote(&self.program.to_string_lossy())];
        for (index, arg) in self.args.iter().enumerate() {
            if self.masked_args.contains(&index) {
                parts.push("***".to_string());
            } else {
                parts.push(quote(arg));
            }
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (true, true) => String::new(),
        }
    }
}

pub trait CommandRunner {
    fn run(&mut self, command: &ToolCommand) -> Result<ToolOutput>;
}

/// Spawns real processes and captures their output.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&mut self, command: &ToolCommand) -> Result<ToolOutput> {
        debug!("running: {}", command.display());
        let mut process = Command::new(&command.program);
        process.args(&command.args);
        if let Some(cwd) = &command.cwd {
            process.current_dir(cwd);
        }
        let output = process
            .output()
            .with_context(|| format!("failed to launch {}", command.program.display()))?;
        let result = ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        debug!(
            "{} exited with {}",
            command.program_name(),
            result
                .code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "<signal>".to_string())
        );
        Ok(result)
    }
}

/// Search the directories of a PATH-style variable for `name`.
///
/// When `name` has no extension each PATHEXT entry is tried as well, so
/// `7z` finds `7z.exe` on Windows.
pub fn find_on_path(name: &str, path_var: &OsStr, pathext: Option<&str>) -> Option<PathBuf> {
    let extensions = candidate_extensions(name, pathext);
    for dir in std::env::split_paths(path_var) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        for candidate in &extensions {
            let path = dir.join(candidate);
            if path.is_file() {
                return Some(path);
            }
        }
    }
    None
}

fn candidate_extensions(name: &str, pathext: Option<&str>) -> Vec<String> {
    let mut candidates = vec![name.to_string()];
    if Path::new(name).extension().is_some() {
        return candidates;
    }
    if let Some(pathext) = pathext {
        for ext in pathext.split(';') {
            let ext = ext.trim();
            if ext.is_empty() {
                continue;
            }
            candidates.push(format!("{name}{}", ext.to_ascii_lowercase()));
        }
    }
    candidates
}

/// Last `count` non-empty lines of `text`, for error excerpts.
pub fn tail_lines(text: &str, count: usize) -> String {
    let lines = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

fn quote(value: &str) -> String {
    if value.is_empty() || value.contains(char::is_whitespace) {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}


#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::fs;

    use tempfile::tempdir;

    use super::{ToolCommand, ToolOutput, find_on_path, tail_lines};

    #[test]
    fn display_quotes_spaces_and_masks_secrets() {
        let command = ToolCommand::new(r"C:\Program Files\7-Zip\7z.exe")
            .arg("a")
            .masked_arg("-psecret")
            .arg("my archive.7z");
        assert_eq!(
            command.display(),
            r#""C:\Program Files\7-Zip\7z.exe" a *** "my archive.7z""#
        );
    }

    #[test]
    fn find_on_path_tries_pathext() {
        let temp = tempdir().expect("tempdir");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        fs::create_dir_all(&first).expect("first");
        fs::create_dir_all(&second).expect("second");
        fs::write(second.join("7z.exe"), "").expect("write tool");

        let path_var = std::env::join_paths([first, second.clone()]).expect("join paths");
        let found = find_on_path("7z", &path_var, Some(".COM;.EXE")).expect("found");
        assert_eq!(found, second.join("7z.exe"));
        assert!(find_on_path("git", &path_var, Some(".EXE")).is_none());
        assert!(find_on_path("7z", &OsString::new(), Some(".EXE")).is_none());
    }

    #[test]
    fn tail_lines_skips_blank_lines() {
        let text = "one\n\ntwo\nthree\n   \nfour\n";
        assert_eq!(tail_lines(text, 2), "three\nfour");
        assert_eq!(tail_lines(text, 10), "one\ntwo\nthree\nfour");
    }

    #[test]
    fn combined_output_joins_streams() {
        let output = ToolOutput {
            code: Some(0),
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
        };
        assert_eq!(output.combined(), "out\nerr");
    }
}
