use std::io;

/// User-facing output of a build.
pub trait Ui: Send + Sync {
    /// Progress line for a step.
    fn say(&self, message: &str);

    /// Indented detail under the last `say`.
    fn message(&self, message: &str);

    fn error(&self, message: &str);

    /// Prompt the user and return the line they typed.
    fn ask(&self, prompt: &str) -> io::Result<String>;
}
