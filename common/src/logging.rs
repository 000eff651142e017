/// Inicializa `tracing` con el filtro de `RUST_LOG` o, si no está, con `default_filter`
/// (ej: "master=debug,common=info").
pub fn init_tracing(default_filter: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());

    // try_init: en tests puede llamarse más de una vez
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
