use once_cell::sync::Lazy;

static VERBOSE: Lazy<bool> =
    Lazy::new(|| matches!(std::env::var("TESSERA_DEBUG").as_deref(), Ok("1")));

/// Whether `TESSERA_DEBUG=1` verbose routing logs are enabled.
pub fn verbose() -> bool {
    *VERBOSE
}

/// Log one routed statement. Promoted to info level under `TESSERA_DEBUG=1`
/// so routing decisions are visible without reconfiguring the log filter.
pub(crate) fn trace_route(table: &str, shard: &str, sql: &str) {
    if verbose() {
        log::info!("[ROUTE] table={table} shard={shard} sql={sql}");
    } else {
        log::debug!("[ROUTE] table={table} shard={shard} sql={sql}");
    }
}
