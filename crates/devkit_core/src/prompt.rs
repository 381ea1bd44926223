use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input};
use log::{debug, info};

use crate::config::{ConfigPatch, DevkitConfig, SettingKey, SettingKind, validate_setting};

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
const CLEAR_MARKER: &str = "-";

#[derive(Debug, Clone)]
pub struct PromptOptions {
    /// Answer every prompt with its current or default value without reading input.
    pub accept_defaults: bool,
    pub require_existing_paths: bool,
    pub max_attempts: usize,
    /// Relative path answers are checked against this directory.
    pub base_dir: PathBuf,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            accept_defaults: false,
            require_existing_paths: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_dir: PathBuf::from("."),
        }
    }
}

/// Line-oriented prompter for piped input. Invalid answers are re-asked up
/// to `max_attempts` times and end of input is an error.
pub struct Prompter<R, W> {
    input: R,
    output: W,
    options: PromptOptions,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(input: R, output: W, options: PromptOptions) -> Self {
        Self {
            input,
            output,
            options,
        }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    /// Ask for each key in order and collect the answers as a patch.
    /// Keys whose value does not change produce no entry.
    pub fn prompt_settings(
        &mut self,
        config: &DevkitConfig,
        keys: &[SettingKey],
    ) -> Result<ConfigPatch> {
        let options = self.options.clone();
        collect_patch(self, &options, config, keys)
    }

    /// Ask a yes/no question. An empty answer picks `default`.
    pub fn confirm(&mut self, question: &str, default: bool) -> Result<bool> {
        self.ask_confirm(question, default)
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("failed to read answer")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

impl<R: BufRead, W: Write> Ask for Prompter<R, W> {
    fn ask(
        &mut self,
        key: SettingKey,
        shown: Option<&str>,
        check: &dyn Fn(&str) -> Result<()>,
    ) -> Result<Answer> {
        let max_attempts = self.options.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match shown {
                Some(value) => write!(self.output, "{} [{value}]: ", key.label())?,
                None => write!(self.output, "{}: ", key.label())?,
            }
            self.output.flush()?;

            let Some(answer) = self.read_line()? else {
                bail!("input closed while prompting for {}", key.name());
            };
            let value = match classify(&answer) {
                Answer::Value(value) => value,
                other => return Ok(other),
            };
            match check(&value) {
                Ok(()) => return Ok(Answer::Value(value)),
                Err(error) => {
                    writeln!(self.output, "  {error:#}")?;
                    debug!(
                        "rejected answer for {} (attempt {attempt}/{max_attempts})",
                        key.name()
                    );
                }
            }
        }
        bail!(
            "no valid value for {} after {max_attempts} attempt(s)",
            key.name()
        )
    }

    fn ask_confirm(&mut self, question: &str, default: bool) -> Result<bool> {
        let hint = if default { "Y/n" } else { "y/N" };
        let max_attempts = self.options.max_attempts.max(1);
        for _ in 0..max_attempts {
            write!(self.output, "{question} [{hint}]: ")?;
            self.output.flush()?;
            let Some(answer) = self.read_line()? else {
                bail!("input closed while waiting for confirmation");
            };
            match answer.to_ascii_lowercase().as_str() {
                "" => return Ok(default),
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => writeln!(self.output, "  please answer y or n")?,
            }
        }
        bail!("no valid confirmation after {max_attempts} attempt(s)")
    }
}

/// Prompter for an attached terminal, drawn with `dialoguer`. Invalid
/// answers are re-asked in place until they pass validation.
pub struct TerminalPrompter {
    options: PromptOptions,
    theme: ColorfulTheme,
}

impl TerminalPrompter {
    pub fn new(options: PromptOptions) -> Self {
        Self {
            options,
            theme: ColorfulTheme::default(),
        }
    }

    pub fn prompt_settings(
        &mut self,
        config: &DevkitConfig,
        keys: &[SettingKey],
    ) -> Result<ConfigPatch> {
        let options = self.options.clone();
        collect_patch(self, &options, config, keys)
    }

    pub fn confirm(&mut self, question: &str, default: bool) -> Result<bool> {
        self.ask_confirm(question, default)
    }
}

impl Ask for TerminalPrompter {
    fn ask(
        &mut self,
        key: SettingKey,
        shown: Option<&str>,
        check: &dyn Fn(&str) -> Result<()>,
    ) -> Result<Answer> {
        let prompt = match shown {
            Some(value) => format!("{} [{value}]", key.label()),
            None => key.label().to_string(),
        };
        let answer = Input::<String>::with_theme(&self.theme)
            .with_prompt(prompt)
            .allow_empty(true)
            .validate_with(|input: &String| -> Result<(), String> {
                match classify(input) {
                    Answer::Value(value) => check(&value).map_err(|error| format!("{error:#}")),
                    Answer::Keep | Answer::Clear => Ok(()),
                }
            })
            .interact_text()
            .with_context(|| format!("failed to read {}", key.name()))?;
        Ok(classify(&answer))
    }

    fn ask_confirm(&mut self, question: &str, default: bool) -> Result<bool> {
        Confirm::with_theme(&self.theme)
            .with_prompt(question)
            .default(default)
            .interact()
            .context("failed to read confirmation")
    }
}

/// Prompt on stdin: `dialoguer` widgets when stdin is a terminal, plain line
/// reads otherwise. `accept_defaults` never touches the input.
pub fn prompt_settings_on_stdin(
    config: &DevkitConfig,
    keys: &[SettingKey],
    options: PromptOptions,
) -> Result<ConfigPatch> {
    if !options.accept_defaults && io::stdin().is_terminal() {
        return TerminalPrompter::new(options).prompt_settings(config, keys);
    }
    let stdin = io::stdin();
    Prompter::new(stdin.lock(), io::stdout(), options).prompt_settings(config, keys)
}

pub fn confirm_on_stdin(question: &str, default: bool) -> Result<bool> {
    if io::stdin().is_terminal() {
        return TerminalPrompter::new(PromptOptions::default()).confirm(question, default);
    }
    let stdin = io::stdin();
    let mut prompter = Prompter::new(stdin.lock(), io::stdout(), PromptOptions::default());
    prompter.confirm(question, default)
}

trait Ask {
    /// Ask for one key. `shown` is the value an empty answer keeps and
    /// `check` rejects invalid values.
    fn ask(
        &mut self,
        key: SettingKey,
        shown: Option<&str>,
        check: &dyn Fn(&str) -> Result<()>,
    ) -> Result<Answer>;

    fn ask_confirm(&mut self, question: &str, default: bool) -> Result<bool>;
}

fn collect_patch(
    asker: &mut impl Ask,
    options: &PromptOptions,
    config: &DevkitConfig,
    keys: &[SettingKey],
) -> Result<ConfigPatch> {
    let mut patch = ConfigPatch::default();
    for key in keys.iter().copied() {
        let current = config.get(key);
        if options.accept_defaults {
            if current.is_none()
                && let Some(default) = key.default_value()
            {
                debug!("{} defaulted to {default}", key.name());
                patch.set(key, default);
            }
            continue;
        }

        let shown = current.clone().or_else(|| key.default_value());
        let check = |answer: &str| check_answer(options, key, answer);
        match asker.ask(key, shown.as_deref(), &check)? {
            Answer::Keep => {
                if current.is_none()
                    && let Some(default) = key.default_value()
                {
                    patch.set(key, default);
                }
            }
            Answer::Clear => {
                if current.is_some() {
                    patch.unset(key);
                }
            }
            Answer::Value(value) => {
                if current.as_deref() != Some(value.as_str()) {
                    patch.set(key, value);
                }
            }
        }
    }
    info!("{} setting(s) changed", patch.entries.len());
    Ok(patch)
}

fn check_answer(options: &PromptOptions, key: SettingKey, answer: &str) -> Result<()> {
    validate_setting(key, answer)?;
    if key.kind() == SettingKind::Path && options.require_existing_paths {
        let path = Path::new(answer);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            options.base_dir.join(path)
        };
        if !resolved.exists() {
            bail!("path does not exist: {}", resolved.display());
        }
    }
    Ok(())
}

fn classify(answer: &str) -> Answer {
    match answer.trim() {
        "" => Answer::Keep,
        CLEAR_MARKER => Answer::Clear,
        value => Answer::Value(value.to_string()),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Answer {
    Keep,
    Clear,
    Value(String),
}
