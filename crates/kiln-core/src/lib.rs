//! Chroot image build pipeline for kiln.
//!
//! The `Builder` turns a prepared configuration into an ordered list of steps
//! (device preparation, mounts, provisioning, snapshot, registration, region
//! copies, tagging), seeds a state bag with the collaborators those steps
//! need, drives them through a `kiln_multistep::Runner`, and packages the
//! registered images as an `Artifact`.

pub mod artifact;
pub mod builder;
pub mod hook;
pub mod keys;
pub mod lock;
pub mod prereq;
pub mod shell;
pub mod steps;
pub mod teardown;
pub mod ui;

pub use artifact::{artifact_from_state, Artifact};
pub use builder::{ui_pause_fn, Builder};
pub use hook::{ChrootCommunicator, CommandHook, Communicator, Hook, HOOK_PROVISION};
pub use lock::HostLock;
pub use prereq::{check_chroot_prereqs, format_missing, MissingPrereq};
pub use shell::{shell_quote, CommandWrapper, ShellOutput, ShellRunner, SystemShell};
pub use ui::Ui;

use kiln_multistep::{RunnerError, StepError};
use kiln_platform::PlatformError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("builder has not been prepared")]
    NotPrepared,
    #[error("{0}")]
    Step(StepError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("template error: {0}")]
    Template(#[from] kiln_config::TemplateError),
    #[error("command '{command}' exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("{0}")]
    Invalid(String),
    #[error("failed to destroy {} image(s): {}", .0.len(), .0.join("; "))]
    Destroy(Vec<String>),
}
