//! Helpers for wiring the `log` facade used by the datastore to stderr.
//!
//! The datastore itself never installs a logger.  Applications and tests call [log_to_stderr] once; the filter is
//! read from `DORM_LOG` (same syntax as `RUST_LOG`), falling back to `info`.

/// Environment variable holding the filter directives.
pub const FILTER_ENV: &str = "DORM_LOG";

/// Log to stderr.
///
/// If called multiple times in the same process, only applies once.
pub fn log_to_stderr() {
    log_to_stderr_with_default(log::LevelFilter::Info);
}

/// Like [log_to_stderr], but with a caller-chosen level for when `DORM_LOG` is unset.
///
/// Useful in tests that want to see every synthesized statement: pass [log::LevelFilter::Debug].
pub fn log_to_stderr_with_default(default: log::LevelFilter) {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let env = env_logger::Env::default().filter_or(FILTER_ENV, default.to_string());
        // try_init: a test harness may already have installed something.
        let _ = env_logger::Builder::from_env(env)
            .format(|buf, record| {
                use std::io::Write;

                let now = time::OffsetDateTime::now_utc();

                writeln!(
                    buf,
                    "{} {} time={} target={}",
                    record.level(),
                    record.args(),
                    now,
                    record.target()
                )
            })
            .is_test(cfg!(test))
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_calls_are_harmless() {
        log_to_stderr();
        log_to_stderr_with_default(log::LevelFilter::Trace);
        log::info!("still logging");
    }
}
