//! Process-wide backend initialization.
//!
//! `init` must run before the first process is created. The backend runtime
//! lives for the rest of the program; there is no teardown.

use super::backend::Backend;
use once_cell::sync::OnceCell;

static RUNTIME: OnceCell<&'static str> = OnceCell::new();

/// Initializes the backend runtime once per process. Later calls are no-ops,
/// whichever backend they pass.
pub fn init<B: Backend>(backend: &B) {
    let mut ran = false;
    let name = RUNTIME.get_or_init(|| {
        backend.init();
        ran = true;
        backend.name()
    });

    if ran {
        tracing::info!("{} backend initialized", name);
    } else {
        tracing::debug!("backend runtime already initialized by {}", name);
    }
}

pub fn is_initialized() -> bool {
    RUNTIME.get().is_some()
}
