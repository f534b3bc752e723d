//! The Small PMS - Property management back-office
//!
//! The workflow layer behind the lodging admin dashboard. Staff manage
//! properties and rooms, assign tenancies, collect rent and deposits, and
//! settle deposits at move-out. Every workflow function takes an explicit
//! [`db::DbState`] handle and a JSON payload in the shape the dashboard's
//! forms submit, and returns a JSON result or an error string the dashboard
//! surfaces as a toast.
//!
//! Multi-step workflows (tenancy assignment, move-out) run inside a single
//! `BEGIN IMMEDIATE` transaction, so a failed step never leaves the
//! registry, tenancy, payment, and ledger tables inconsistent with each
//! other.

use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod db;
pub mod deposits;
pub mod notifications;
pub mod payments;
pub mod properties;
pub mod tenancy;

/// Initialize structured logging (console + daily rolling file).
///
/// Call once at process start, before opening the database.
pub fn init_logging(log_dir: &Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,the_small_pms=debug"));

    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "pms");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the guard alive for the lifetime of the process — dropping it
    // flushes logs. Leaked intentionally since logging runs until exit.
    std::mem::forget(guard);

    info!("The Small PMS v{} logging initialized", env!("CARGO_PKG_VERSION"));
}
