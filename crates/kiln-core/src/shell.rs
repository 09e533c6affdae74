use crate::CoreError;
use kiln_config::{TemplateContext, TemplateError};
use std::io;
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs a shell command line on the build host.
pub trait ShellRunner: Send + Sync {
    fn run(&self, command: &str) -> io::Result<ShellOutput>;
}

/// Runs commands through `/bin/sh -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemShell;

impl ShellRunner for SystemShell {
    fn run(&self, command: &str) -> io::Result<ShellOutput> {
        let output = Command::new("/bin/sh").arg("-c").arg(command).output()?;
        Ok(ShellOutput {
            // Killed by a signal: report as failure.
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// The `command_wrapper` template, e.g. `sudo {{.Command}}`.
#[derive(Debug, Clone)]
pub struct CommandWrapper {
    template: String,
    context: TemplateContext,
}

impl CommandWrapper {
    pub fn new(template: impl Into<String>, context: TemplateContext) -> Self {
        Self {
            template: template.into(),
            context,
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn wrap(&self, command: &str) -> Result<String, TemplateError> {
        self.context
            .clone()
            .with_var("Command", command)
            .render(&self.template)
    }

    /// Wrap `command`, run it, and fail on a non-zero exit status.
    pub fn run(&self, shell: &dyn ShellRunner, command: &str) -> Result<ShellOutput, CoreError> {
        let wrapped = self.wrap(command)?;
        debug!("executing: {wrapped}");
        let output = shell.run(&wrapped)?;
        if !output.success() {
            return Err(CoreError::CommandFailed {
                command: wrapped,
                status: output.status,
                stderr: output.stderr.trim().to_owned(),
            });
        }
        Ok(output)
    }
}

/// Quote `arg` for `/bin/sh` unless it consists of safe characters only.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./-=:,@+%".contains(c));
    if safe {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
