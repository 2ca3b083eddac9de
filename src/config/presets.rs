//! Thin preset factories over [`super::Config::build`] (SPEC_FULL.md §4.1).
//! Each preset only adjusts the fields it cares about; validation always
//! goes through the same builder, so presets can't drift from the rules
//! applied to hand-written options.

use super::{ConnectionOptionsPartial, Options, TabOptionsPartial};
use crate::error::Result;

/// Favors low-latency reconnects and a disabled-by-default auto-accept, for
/// interactive use.
pub fn performance(
    base: Options,
    default_name: impl FnOnce() -> String,
    default_room: impl FnOnce() -> String,
) -> Result<super::Config> {
    let mut options = base;
    options.connection = Some(ConnectionOptionsPartial {
        reconnect_delay_ms: Some(500),
        connection_timeout_ms: Some(5_000),
        ..options.connection.unwrap_or_default()
    });
    super::Config::build(options, default_name, default_room)
}

/// Disables the tab registry keep-alive (no persistent disambiguation) and
/// tightens reconnect attempts, for users who don't want per-tab state
/// lingering in storage.
pub fn privacy(
    base: Options,
    default_name: impl FnOnce() -> String,
    default_room: impl FnOnce() -> String,
) -> Result<super::Config> {
    let mut options = base;
    options.tabs = Some(TabOptionsPartial { enabled: Some(false), ..options.tabs.unwrap_or_default() });
    super::Config::build(options, default_name, default_room)
}

/// Verbose, patient reconnects suited to local development against a
/// flaky broker.
pub fn development(
    base: Options,
    default_name: impl FnOnce() -> String,
    default_room: impl FnOnce() -> String,
) -> Result<super::Config> {
    let mut options = base;
    options.debug = Some(true);
    options.connection = Some(ConnectionOptionsPartial {
        max_reconnect_attempts: Some(u32::MAX),
        ..options.connection.unwrap_or_default()
    });
    super::Config::build(options, default_name, default_room)
}

/// Conservative reconnect/backoff policy for a production deployment.
pub fn production(
    base: Options,
    default_name: impl FnOnce() -> String,
    default_room: impl FnOnce() -> String,
) -> Result<super::Config> {
    let mut options = base;
    options.debug = Some(false);
    options.connection = Some(ConnectionOptionsPartial {
        max_reconnect_attempts: Some(20),
        reconnect_delay_ms: Some(3_000),
        ..options.connection.unwrap_or_default()
    });
    super::Config::build(options, default_name, default_room)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;

    fn names() -> (impl FnOnce() -> String, impl FnOnce() -> String) {
        (|| "anon".to_string(), || "default".to_string())
    }

    #[test]
    fn performance_preset_is_valid_and_fast() {
        let (n, r) = names();
        let cfg = performance(Options::default(), n, r).unwrap();
        assert_eq!(cfg.connection.reconnect_delay_ms, 500);
    }

    #[test]
    fn privacy_preset_disables_tabs() {
        let (n, r) = names();
        let cfg = privacy(Options::default(), n, r).unwrap();
        assert!(!cfg.tabs.enabled);
    }

    #[test]
    fn development_preset_is_verbose() {
        let (n, r) = names();
        let cfg = development(Options::default(), n, r).unwrap();
        assert!(cfg.debug);
    }

    #[test]
    fn production_preset_disables_debug() {
        let (n, r) = names();
        let cfg = production(Options::default(), n, r).unwrap();
        assert!(!cfg.debug);
        assert_eq!(cfg.connection.max_reconnect_attempts, 20);
    }
}
