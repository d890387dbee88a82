use std::{
    collections::HashMap,
    process::{Command, Stdio},
};

use anyhow::{Context, Result, bail};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StdioSpec {
    Inherit,
    Null,
}

impl StdioSpec {
    #[inline]
    fn to_stdio(self) -> Stdio {
        match self {
            StdioSpec::Inherit => Stdio::inherit(),
            StdioSpec::Null => Stdio::null(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CmdSpec {
    program: String,
    args: Vec<String>,
    stdout: StdioSpec,
    stderr: StdioSpec,
}

impl CmdSpec {
    #[must_use]
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout: StdioSpec::Inherit,
            stderr: StdioSpec::Inherit,
        }
    }

    #[must_use]
    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, it: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(it.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn stdout(mut self, s: StdioSpec) -> Self {
        self.stdout = s;
        self
    }

    #[must_use]
    pub fn stderr(mut self, s: StdioSpec) -> Self {
        self.stderr = s;
        self
    }

    pub fn render(&self) -> String {
        let mut out = sh_quote(&self.program);
        for a in &self.args {
            out.push(' ');
            out.push_str(&sh_quote(a));
        }
        out
    }

    fn to_command(&self, bin: &str) -> Command {
        let mut cmd = Command::new(bin);
        cmd.args(&self.args)
            .stdin(Stdio::inherit())
            .stdout(self.stdout.to_stdio())
            .stderr(self.stderr.to_stdio());
        cmd
    }
}

/// Executes external commands on behalf of the tooling ports.
pub trait Runner: Send + Sync {
    /// Runs to completion; a non-zero exit is an error.
    fn run(&self, cmd: &CmdSpec) -> Result<()>;
    /// Runs to completion and reports whether the exit status was zero.
    /// Only a failure to spawn is an error.
    fn probe(&self, cmd: &CmdSpec) -> Result<bool>;
}

#[derive(Default, Clone)]
pub struct ProcessRunner {
    bin_overrides: HashMap<String, String>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            bin_overrides: HashMap::new(),
        }
    }

    /// Redirects `program` to another executable, e.g. a stand-in script.
    #[cfg(test)]
    #[must_use]
    pub fn with_override(mut self, program: &str, bin: &str) -> Self {
        self.bin_overrides
            .insert(program.to_string(), bin.to_string());
        self
    }

    fn resolve_bin<'a>(&'a self, bin: &'a str) -> &'a str {
        self.bin_overrides
            .get(bin)
            .map(|s| s.as_str())
            .unwrap_or(bin)
    }
}

impl Runner for ProcessRunner {
    fn run(&self, cmd: &CmdSpec) -> Result<()> {
        tracing::debug!("exec: {}", cmd.render());

        let bin = self.resolve_bin(&cmd.program);
        let status = cmd
            .to_command(bin)
            .status()
            .with_context(|| format!("spawn {}", cmd.render()))?;
        if !status.success() {
            bail!("command failed: {} with {status}", cmd.render());
        }
        Ok(())
    }

    fn probe(&self, cmd: &CmdSpec) -> Result<bool> {
        tracing::trace!("exec(probe): {}", cmd.render());

        let bin = self.resolve_bin(&cmd.program);
        let status = cmd
            .to_command(bin)
            .status()
            .with_context(|| format!("spawn {}", cmd.render()))?;
        Ok(status.success())
    }
}

fn sh_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".into();
    }
    if !s
        .bytes()
        .any(|b| b == b' ' || b == b'\'' || b == b'"' || b == b'\\')
    {
        return s.to_string();
    }
    let mut out = String::from("'");
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sh_quote_empty() {
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn sh_quote_with_space() {
        assert_eq!(
            sh_quote("/mnt/ntnx/default container"),
            "'/mnt/ntnx/default container'"
        );
    }

    #[test]
    fn sh_quote_with_single_quote() {
        assert_eq!(sh_quote("don't"), "'don'\\''t'");
    }

    #[test]
    fn render_mount_command() {
        let cmd = CmdSpec::new("mount")
            .args(["-t", "nfs", "-o", "ro"])
            .arg("10.0.0.10:/ctr1")
            .arg("/mnt/ntnx/ctr1");
        assert_eq!(
            cmd.render(),
            "mount -t nfs -o ro 10.0.0.10:/ctr1 /mnt/ntnx/ctr1"
        );
    }

    #[test]
    #[cfg(unix)]
    fn probe_reports_exit_status_without_error() {
        let runner = ProcessRunner::new()
            .with_override("yes-bin", "true")
            .with_override("no-bin", "false");
        assert!(runner.probe(&CmdSpec::new("yes-bin")).unwrap());
        assert!(!runner.probe(&CmdSpec::new("no-bin")).unwrap());
    }

    #[test]
    #[cfg(unix)]
    fn run_fails_on_nonzero_exit() {
        let runner = ProcessRunner::new().with_override("no-bin", "false");
        let err = runner.run(&CmdSpec::new("no-bin").arg("x")).unwrap_err();
        assert!(err.to_string().contains("command failed: no-bin x"), "{err}");
    }
}
