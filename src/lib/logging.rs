use std::{fs, sync::OnceLock};

use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::{
    config::LoggingConfig,
    error::{ReadHistoryError, Result},
};

const LOG_FILE_PREFIX: &str = "readdbx.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static INSTALLED: OnceLock<()> = OnceLock::new();
static PANIC_HOOK: OnceLock<()> = OnceLock::new();

/// Installs the global tracing subscriber. `RUST_LOG` wins over the
/// configured level. Later calls are no-ops.
pub fn init(config: &LoggingConfig) -> Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|err| {
            ReadHistoryError::Config(format!("invalid log level `{}`: {err}", config.level))
        })?;
    let stdout_layer = fmt::layer().with_target(false);

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = non_blocking::NonBlockingBuilder::default()
                .lossy(false)
                .finish(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer);

    match subscriber.try_init() {
        Ok(()) => {
            if let Some(guard) = guard {
                let _ = FILE_GUARD.set(guard);
            }
            install_panic_hook();
        }
        Err(_) => {
            // Another subscriber owns the process; let the file worker exit.
            drop(guard);
        }
    }
    let _ = INSTALLED.set(());
    Ok(())
}

fn install_panic_hook() {
    PANIC_HOOK.get_or_init(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                tracing::error!(
                    target: "panic",
                    file = location.file(),
                    line = location.line(),
                    message = %info
                );
            } else {
                tracing::error!(target: "panic", message = %info);
            }
            default_hook(info);
        }));
    });
}
