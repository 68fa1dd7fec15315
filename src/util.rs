//! Small shared helpers (ambient). Tracing init follows this codebase's own
//! once-guarded pattern: cheap to call from every binary entry point and from
//! tests, idempotent if called more than once.

static INIT_ONCE: std::sync::Once = std::sync::Once::new();

pub fn init_tracing_once() {
    INIT_ONCE.call_once(|| {
        let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
    });
}
