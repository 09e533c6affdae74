use super::{
    config_error, json_pretty, load_layers, template_context, EXIT_CANCELLED, EXIT_SUCCESS,
};
use crate::ui::TermUi;
use kiln_core::{check_chroot_prereqs, format_missing, Builder, CommandHook};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

pub fn run(configs: &[PathBuf], vars: &[String], debug: bool, json: bool) -> Result<u8, String> {
    let ctx = template_context(vars)?;
    let mut layers = load_layers(configs)?;
    if debug {
        let mut overlay = toml::Table::new();
        overlay.insert("debug".to_owned(), toml::Value::Boolean(true));
        layers.push(overlay);
    }

    let mut builder = Builder::new().with_context(ctx);
    builder.prepare(&layers).map_err(|e| config_error(&e))?;
    let Some(config) = builder.config().cloned() else {
        return Err("builder has not been prepared".to_owned());
    };

    if config.platform != "mock" {
        if std::env::var("KILN_SKIP_PREREQS").as_deref() != Ok("1") {
            let missing = check_chroot_prereqs();
            if !missing.is_empty() {
                return Err(format_missing(&missing));
            }
        }
        if effective_uid() != 0 && !config.command_wrapper.contains("sudo") {
            warn!("not running as root; mounting and chroot will likely fail without a command_wrapper such as 'sudo {{{{.Command}}}}'");
        }
    }

    let builder = Arc::new(builder);
    let cancelled = Arc::new(AtomicBool::new(false));
    install_cancel_handler(Arc::clone(&builder), Arc::clone(&cancelled));

    let ui = Arc::new(TermUi::new(&config.builder_id, json));
    let hook = Arc::new(CommandHook::new(config.provision_commands.clone()));
    let artifact = builder.run(ui, hook).map_err(|e| format!("build failed: {e}"))?;

    match artifact {
        Some(artifact) => {
            if json {
                let payload = serde_json::json!({
                    "id": artifact.id(),
                    "builder_id": artifact.builder_id(),
                    "images": artifact.images,
                });
                println!("{}", json_pretty(&payload)?);
            } else {
                println!("{artifact}");
            }
            Ok(EXIT_SUCCESS)
        }
        None if cancelled.load(Ordering::SeqCst) => {
            eprintln!("build cancelled");
            Ok(EXIT_CANCELLED)
        }
        None => {
            eprintln!("build finished without creating any images");
            Ok(EXIT_SUCCESS)
        }
    }
}

/// First Ctrl-C cancels the build between steps so cleanup can run; a second
/// one exits immediately.
fn install_cancel_handler(builder: Arc<Builder>, cancelled: Arc<AtomicBool>) {
    let result = ctrlc::set_handler(move || {
        if cancelled.swap(true, Ordering::SeqCst) {
            std::process::exit(i32::from(EXIT_CANCELLED));
        }
        eprintln!("\ninterrupt received, cancelling after the current step...");
        builder.cancel();
    });
    if let Err(e) = result {
        warn!("failed to install Ctrl-C handler: {e}");
    }
}

#[allow(unsafe_code)]
fn effective_uid() -> u32 {
    // SAFETY: geteuid() takes no arguments and cannot fail.
    unsafe { libc::geteuid() }
}
