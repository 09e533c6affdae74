use console::{Style, Term};
use kiln_core::Ui;
use std::io;

/// Terminal UI. Progress goes to stdout, or to stderr when stdout is reserved
/// for JSON output.
pub struct TermUi {
    out: Term,
    err: Term,
    prefix: String,
}

impl TermUi {
    pub fn new(builder_id: &str, json: bool) -> Self {
        Self {
            out: if json { Term::stderr() } else { Term::stdout() },
            err: Term::stderr(),
            prefix: builder_id.to_owned(),
        }
    }
}

impl Ui for TermUi {
    fn say(&self, message: &str) {
        let line = Style::new()
            .bold()
            .apply_to(format!("==> {}: {message}", self.prefix));
        let _ = self.out.write_line(&line.to_string());
    }

    fn message(&self, message: &str) {
        let _ = self.out.write_line(&format!("    {}: {message}", self.prefix));
    }

    fn error(&self, message: &str) {
        let line = Style::new()
            .red()
            .bold()
            .apply_to(format!("==> {}: {message}", self.prefix));
        let _ = self.err.write_line(&line.to_string());
    }

    fn ask(&self, prompt: &str) -> io::Result<String> {
        let line = Style::new().yellow().apply_to(prompt);
        self.err.write_line(&line.to_string())?;
        self.err.read_line()
    }
}
