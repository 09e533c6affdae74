use crate::shell::{shell_quote, CommandWrapper, ShellOutput, ShellRunner};
use crate::ui::Ui;
use crate::CoreError;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Hook fired while the chroot is mounted and populated.
pub const HOOK_PROVISION: &str = "provision";

/// Runs commands inside the build environment.
pub trait Communicator {
    fn run(&self, command: &str) -> Result<ShellOutput, CoreError>;
}

/// Provisioning extension point invoked by name during a build.
pub trait Hook: Send + Sync {
    fn run(&self, name: &str, ui: &dyn Ui, comm: &dyn Communicator) -> Result<(), CoreError>;
}

/// Executes commands in the chroot via `chroot <root> /bin/sh -c ...`,
/// through the configured command wrapper.
pub struct ChrootCommunicator {
    root: PathBuf,
    shell: Arc<dyn ShellRunner>,
    wrapper: CommandWrapper,
}

impl ChrootCommunicator {
    pub fn new(root: impl Into<PathBuf>, shell: Arc<dyn ShellRunner>, wrapper: CommandWrapper) -> Self {
        Self {
            root: root.into(),
            shell,
            wrapper,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chroot_command(&self, command: &str) -> String {
        format!(
            "chroot {} /bin/sh -c {}",
            shell_quote(&self.root.to_string_lossy()),
            shell_quote(command)
        )
    }
}

impl Communicator for ChrootCommunicator {
    fn run(&self, command: &str) -> Result<ShellOutput, CoreError> {
        self.wrapper
            .run(self.shell.as_ref(), &self.chroot_command(command))
    }
}

/// Runs a fixed list of shell commands on the `provision` hook.
#[derive(Debug, Clone, Default)]
pub struct CommandHook {
    commands: Vec<String>,
}

impl CommandHook {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }
}

impl Hook for CommandHook {
    fn run(&self, name: &str, ui: &dyn Ui, comm: &dyn Communicator) -> Result<(), CoreError> {
        if name != HOOK_PROVISION {
            return Ok(());
        }
        for command in &self.commands {
            ui.message(&format!("Provisioning with: {command}"));
            let output = comm.run(command)?;
            for line in output.stdout.lines() {
                ui.message(line);
            }
        }
        Ok(())
    }
}
