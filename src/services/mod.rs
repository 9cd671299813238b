/// Raw replies to validated, deduplicated entries.
pub mod entries;
/// Winner selection through the reasoning model.
pub mod judge;
/// Open, collect and close ticks.
pub mod lifecycle;
/// Contest catalog and announcement texts.
pub mod prompts;
/// Bounded retry and timeouts for external calls.
pub mod retry;
/// Background store health checks and reconnection.
pub mod store_monitor;
/// Named timers firing the lifecycle ticks.
pub mod trigger;
