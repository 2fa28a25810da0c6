//! Code validation
//!
//! Generated code (and generated tests) are written into a fresh temporary
//! directory and checked with the language's own tooling under a fixed
//! wall-clock timeout. Only syntax / compile / test-run level checks are made.
//!
//! Before anything is spawned a pure-Rust delimiter-balance check catches the
//! most common syntax errors (unbalanced brackets, unterminated strings).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{run_process, ProcessOutput};

const MAX_DIAGNOSTIC_CHARS: usize = 4000;

/// Source language of generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Rust,
    JavaScript,
    Shell,
    Unknown,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Rust => "rust",
            Language::JavaScript => "javascript",
            Language::Shell => "shell",
            Language::Unknown => "unknown",
        }
    }

    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "py" | "pyw" => Language::Python,
            "rs" => Language::Rust,
            "js" | "mjs" | "cjs" => Language::JavaScript,
            "sh" | "bash" => Language::Shell,
            _ => Language::Unknown,
        }
    }

    /// Detect from the file path when there is one, otherwise from the code itself
    pub fn detect(path: Option<&str>, code: &str) -> Self {
        if let Some(ext) = path.and_then(|p| Path::new(p).extension()).and_then(|e| e.to_str()) {
            let lang = Self::from_extension(ext);
            if lang != Language::Unknown {
                return lang;
            }
        }

        let trimmed = code.trim_start();
        if trimmed.starts_with("#!/bin/sh") || trimmed.starts_with("#!/bin/bash") || trimmed.starts_with("#!/usr/bin/env bash") {
            return Language::Shell;
        }
        if trimmed.starts_with("#!/usr/bin/env python") {
            return Language::Python;
        }

        let has = |needle: &str| code.lines().any(|l| l.trim_start().starts_with(needle));
        if has("fn ") || has("pub fn ") || has("use std") || has("impl ") {
            Language::Rust
        } else if has("def ") || has("import ") || has("from ") || (has("class ") && code.contains("):")) {
            Language::Python
        } else if has("function ") || has("const ") || has("module.exports") || code.contains("=> {") {
            Language::JavaScript
        } else {
            Language::Unknown
        }
    }

    fn source_file(&self) -> &'static str {
        match self {
            Language::Python => "solution.py",
            Language::Rust => "solution.rs",
            Language::JavaScript => "solution.js",
            Language::Shell => "solution.sh",
            Language::Unknown => "solution.txt",
        }
    }

    fn test_file(&self) -> &'static str {
        match self {
            Language::Python => "test_solution.py",
            Language::JavaScript => "test_solution.js",
            _ => "test_solution.txt",
        }
    }

    /// Test file that sees the names defined by the code under test
    fn test_harness(&self, code: &str, tests: &str) -> String {
        match self {
            Language::Python => format!("from solution import *\n\n{}\n", tests.trim_end()),
            // no exports to require: run the tests in the same script
            Language::JavaScript => format!("{}\n\n{}\n", code.trim_end(), tests.trim_end()),
            _ => tests.to_string(),
        }
    }

    fn line_comment(&self) -> &'static str {
        match self {
            Language::Python | Language::Shell => "#",
            Language::Rust | Language::JavaScript => "//",
            Language::Unknown => "",
        }
    }
}

/// Validation outcome class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    Passed,
    Syntax,
    Compile,
    Test,
    Timeout,
    Crash,
}

impl ValidationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationKind::Passed => "passed",
            ValidationKind::Syntax => "syntax",
            ValidationKind::Compile => "compile",
            ValidationKind::Test => "test",
            ValidationKind::Timeout => "timeout",
            ValidationKind::Crash => "crash",
        }
    }
}

/// Result of validating one piece of code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub passed: bool,
    pub kind: ValidationKind,
    pub diagnostic: String,
    pub language: Language,
    pub duration_ms: u64,
}

impl ValidationOutcome {
    pub fn passed(language: Language, diagnostic: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            passed: true,
            kind: ValidationKind::Passed,
            diagnostic: diagnostic.into(),
            language,
            duration_ms,
        }
    }

    pub fn failed(kind: ValidationKind, language: Language, diagnostic: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            passed: false,
            kind,
            diagnostic: truncate_diagnostic(&diagnostic.into()),
            language,
            duration_ms,
        }
    }
}

fn truncate_diagnostic(text: &str) -> String {
    if text.chars().count() <= MAX_DIAGNOSTIC_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_DIAGNOSTIC_CHARS).collect();
    format!("{}\n... (truncated)", cut)
}

/// What to validate
#[derive(Debug, Clone, Default)]
pub struct ValidationRequest {
    pub code: String,
    pub tests: Option<String>,
    /// Target path, used for language detection only
    pub path: Option<String>,
    pub language: Option<Language>,
}

impl ValidationRequest {
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            ..Default::default()
        }
    }

    pub fn with_tests(mut self, tests: &str) -> Self {
        if !tests.trim().is_empty() {
            self.tests = Some(tests.to_string());
        }
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn language(&self) -> Language {
        self.language
            .unwrap_or_else(|| Language::detect(self.path.as_deref(), &self.code))
    }
}

/// Validator port used by the workflows.
///
/// Infallible by contract: every failure, including a missing runner, is
/// folded into the outcome.
#[async_trait]
pub trait CodeValidator: Send + Sync {
    async fn validate(&self, request: &ValidationRequest) -> ValidationOutcome;
}

/// Validator configuration
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Wall-clock budget for the whole validation
    pub timeout: Duration,
    /// When false only the static delimiter check runs
    pub run_commands: bool,
    pub python: String,
    pub node: String,
    pub rustc: String,
    pub max_output_bytes: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            run_commands: true,
            python: "python3".to_string(),
            node: "node".to_string(),
            rustc: "rustc".to_string(),
            max_output_bytes: 64 * 1024,
        }
    }
}

impl ValidatorConfig {
    /// Static checks only, no subprocesses
    pub fn static_only() -> Self {
        Self {
            run_commands: false,
            ..Default::default()
        }
    }
}

/// One command in a validation plan
struct Step {
    program: String,
    args: Vec<String>,
    /// Outcome class if the command exits non-zero
    on_failure: ValidationKind,
}

impl Step {
    fn new(program: &str, args: &[&str], on_failure: ValidationKind) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            on_failure,
        }
    }
}

/// Temp-directory validator backed by real toolchains
#[derive(Debug, Clone, Default)]
pub struct SandboxValidator {
    config: ValidatorConfig,
}

impl SandboxValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Files to write and commands to run for a language
    fn plan(&self, language: Language, code: &str, tests: Option<&str>, dir: &Path) -> (Vec<(&'static str, String)>, Vec<Step>) {
        let mut files = Vec::new();
        let mut steps = Vec::new();

        match language {
            Language::Python => {
                files.push((language.source_file(), code.to_string()));
                steps.push(Step::new(&self.config.python, &["-m", "py_compile", "solution.py"], ValidationKind::Syntax));
                if let Some(tests) = tests {
                    files.push((language.test_file(), language.test_harness(code, tests)));
                    steps.push(Step::new(&self.config.python, &["-m", "py_compile", "test_solution.py"], ValidationKind::Syntax));
                    steps.push(Step::new(&self.config.python, &["test_solution.py"], ValidationKind::Test));
                }
            }
            Language::Rust => match tests {
                Some(tests) => {
                    files.push((language.source_file(), format!("{}\n\n{}\n", code, tests)));
                    steps.push(Step::new(
                        &self.config.rustc,
                        &["--edition", "2021", "--test", "solution.rs", "-o", "solution_tests"],
                        ValidationKind::Compile,
                    ));
                    let binary = dir.join("solution_tests");
                    steps.push(Step::new(&binary.to_string_lossy(), &["--quiet"], ValidationKind::Test));
                }
                None => {
                    files.push((language.source_file(), code.to_string()));
                    steps.push(Step::new(
                        &self.config.rustc,
                        &["--edition", "2021", "--crate-type", "lib", "--emit", "metadata", "solution.rs"],
                        ValidationKind::Compile,
                    ));
                }
            },
            Language::JavaScript => {
                files.push((language.source_file(), code.to_string()));
                steps.push(Step::new(&self.config.node, &["--check", "solution.js"], ValidationKind::Syntax));
                if let Some(tests) = tests {
                    files.push((language.test_file(), language.test_harness(code, tests)));
                    steps.push(Step::new(&self.config.node, &["test_solution.js"], ValidationKind::Test));
                }
            }
            Language::Shell => {
                files.push((language.source_file(), code.to_string()));
                steps.push(Step::new("sh", &["-n", "solution.sh"], ValidationKind::Syntax));
            }
            Language::Unknown => {}
        }

        (files, steps)
    }

    async fn run_steps(&self, language: Language, code: &str, tests: Option<&str>, start: Instant) -> ValidationOutcome {
        let elapsed = |start: Instant| start.elapsed().as_millis() as u64;

        let dir = match TempDir::new() {
            Ok(d) => d,
            Err(e) => {
                return ValidationOutcome::failed(ValidationKind::Crash, language, format!("cannot create sandbox dir: {}", e), elapsed(start));
            }
        };

        let (files, steps) = self.plan(language, code, tests, dir.path());
        for (name, content) in &files {
            if let Err(e) = tokio::fs::write(dir.path().join(name), content).await {
                return ValidationOutcome::failed(ValidationKind::Crash, language, format!("cannot write {}: {}", name, e), elapsed(start));
            }
        }

        for step in &steps {
            let remaining = self.config.timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return ValidationOutcome::failed(ValidationKind::Timeout, language, timeout_message(self.config.timeout), elapsed(start));
            }

            let mut cmd = Command::new(&step.program);
            cmd.args(&step.args).current_dir(dir.path()).env_clear();
            for var in ["PATH", "HOME", "LANG", "SYSTEMROOT"] {
                if let Ok(value) = std::env::var(var) {
                    cmd.env(var, value);
                }
            }
            cmd.env("PYTHONDONTWRITEBYTECODE", "1");

            debug!("Validation step: {} {}", step.program, step.args.join(" "));
            let output = match run_process(cmd, remaining, self.config.max_output_bytes).await {
                Ok(out) => out,
                Err(e) => {
                    warn!("Validation runner '{}' unavailable: {:#}", step.program, e);
                    return ValidationOutcome::failed(
                        ValidationKind::Crash,
                        language,
                        format!("runner '{}' unavailable: {:#}", step.program, e),
                        elapsed(start),
                    );
                }
            };

            if let Some(outcome) = classify_step(step, &output, language, self.config.timeout, elapsed(start)) {
                return outcome;
            }
        }

        ValidationOutcome::passed(language, format!("{} check(s) passed", steps.len()), elapsed(start))
    }
}

fn timeout_message(timeout: Duration) -> String {
    format!("validation timed out after {}s", timeout.as_secs())
}

/// None when the step succeeded
fn classify_step(step: &Step, output: &ProcessOutput, language: Language, timeout: Duration, elapsed_ms: u64) -> Option<ValidationOutcome> {
    if output.timed_out {
        return Some(ValidationOutcome::failed(ValidationKind::Timeout, language, timeout_message(timeout), elapsed_ms));
    }
    match output.exit_code {
        Some(0) => None,
        Some(_) => Some(ValidationOutcome::failed(step.on_failure, language, output.combined(), elapsed_ms)),
        None => Some(ValidationOutcome::failed(
            ValidationKind::Crash,
            language,
            format!("{} terminated by signal\n{}", step.program, output.combined()),
            elapsed_ms,
        )),
    }
}

#[async_trait]
impl CodeValidator for SandboxValidator {
    async fn validate(&self, request: &ValidationRequest) -> ValidationOutcome {
        let start = Instant::now();
        let language = request.language();

        if request.code.trim().is_empty() {
            return ValidationOutcome::failed(ValidationKind::Syntax, language, "no code was generated", 0);
        }

        if let Err(diag) = check_delimiters(&request.code, language) {
            info!("Validation ({}): syntax pre-check failed: {}", language.as_str(), diag);
            return ValidationOutcome::failed(ValidationKind::Syntax, language, diag, start.elapsed().as_millis() as u64);
        }
        if let Some(tests) = &request.tests {
            if let Err(diag) = check_delimiters(tests, language) {
                return ValidationOutcome::failed(
                    ValidationKind::Syntax,
                    language,
                    format!("in tests: {}", diag),
                    start.elapsed().as_millis() as u64,
                );
            }
        }

        if !self.config.run_commands || language == Language::Unknown {
            return ValidationOutcome::passed(language, "static checks passed", start.elapsed().as_millis() as u64);
        }

        let outcome = self.run_steps(language, &request.code, request.tests.as_deref(), start).await;
        info!(
            "Validation ({}): {} in {}ms",
            language.as_str(),
            outcome.kind.as_str(),
            outcome.duration_ms
        );
        outcome
    }
}

/// Check that brackets balance and strings terminate.
///
/// Comments and string literals are skipped. Errors carry a 1-based line number.
pub fn check_delimiters(code: &str, language: Language) -> Result<(), String> {
    let chars: Vec<char> = code.chars().collect();
    let comment = language.line_comment();
    let comment_chars: Vec<char> = comment.chars().collect();
    let block_comments = matches!(language, Language::Rust | Language::JavaScript);

    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut i = 0usize;

    let starts_with = |i: usize, pat: &[char]| !pat.is_empty() && chars.len() >= i + pat.len() && chars[i..i + pat.len()] == *pat;

    while i < chars.len() {
        let c = chars[i];

        if c == '\n' {
            line += 1;
            i += 1;
            continue;
        }

        // line comment
        if starts_with(i, &comment_chars) {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        // block comment
        if block_comments && starts_with(i, &['/', '*']) {
            let open_line = line;
            i += 2;
            loop {
                if i >= chars.len() {
                    return Err(format!("line {}: unterminated block comment", open_line));
                }
                if starts_with(i, &['*', '/']) {
                    i += 2;
                    break;
                }
                if chars[i] == '\n' {
                    line += 1;
                }
                i += 1;
            }
            continue;
        }

        // Rust: lifetimes and char literals share the quote
        if language == Language::Rust && c == '\'' {
            if chars.get(i + 1) == Some(&'\\') {
                match (i + 2..chars.len().min(i + 12)).find(|&j| chars[j] == '\'') {
                    Some(end) => i = end + 1,
                    None => i += 1,
                }
            } else if chars.get(i + 2) == Some(&'\'') {
                i += 3;
            } else {
                i += 1;
            }
            continue;
        }

        // string literals
        let is_quote = c == '"' || (c == '\'' && language != Language::Rust) || (c == '`' && language == Language::JavaScript);
        if is_quote {
            let open_line = line;
            let triple = language == Language::Python && starts_with(i, &[c, c, c]);
            let delim_len = if triple { 3 } else { 1 };
            let multiline = triple || c == '`' || matches!(language, Language::Rust | Language::Shell);
            i += delim_len;
            loop {
                if i >= chars.len() {
                    return Err(format!("line {}: unterminated string literal", open_line));
                }
                let ch = chars[i];
                if ch == '\\' && language != Language::Shell || ch == '\\' && c == '"' {
                    i += 2;
                    continue;
                }
                if ch == '\n' {
                    if !multiline {
                        return Err(format!("line {}: unterminated string literal", open_line));
                    }
                    line += 1;
                }
                if triple {
                    if starts_with(i, &[c, c, c]) {
                        i += 3;
                        break;
                    }
                } else if ch == c {
                    i += 1;
                    break;
                }
                i += 1;
            }
            continue;
        }

        match c {
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err(format!(
                            "line {}: '{}' does not match '{}' opened on line {}",
                            line, c, open, open_line
                        ));
                    }
                    None => return Err(format!("line {}: unmatched '{}'", line, c)),
                }
            }
            _ => {}
        }
        i += 1;
    }

    match stack.pop() {
        Some((open, open_line)) => Err(format!("line {}: '{}' is never closed", open_line, open)),
        None => Ok(()),
    }
}
