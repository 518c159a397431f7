use tether_tools::{MeasureKind, PermissionRule, TerminationSignal};

use super::{Config, LogFormat};

/// Split `family:value,family:value` lists, skipping malformed entries.
fn family_pairs(var: &str, raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| match entry.split_once(':') {
            Some((family, value)) if !family.trim().is_empty() && !value.trim().is_empty() => {
                Some((family.trim().to_owned(), value.trim().to_owned()))
            }
            _ => {
                tracing::warn!("ignoring malformed {var} entry: {entry}");
                None
            }
        })
        .collect()
}

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_runtime();
        self.apply_env_overrides_policy();
    }

    fn apply_env_overrides_runtime(&mut self) {
        if let Ok(v) = std::env::var("TETHER_LOG_FILTER") {
            self.logging.filter = v;
        }
        if let Ok(v) = std::env::var("TETHER_LOG_FORMAT") {
            match v.parse::<LogFormat>() {
                Ok(format) => self.logging.format = format,
                Err(e) => tracing::warn!("ignoring invalid TETHER_LOG_FORMAT value: {e}"),
            }
        }
        if let Ok(v) = std::env::var("TETHER_DEFAULT_TIMEOUT") {
            match v.parse::<u64>() {
                Ok(secs) => self.tools.runner.default_timeout_secs = secs,
                Err(_) => tracing::warn!("ignoring invalid TETHER_DEFAULT_TIMEOUT value: {v}"),
            }
        }
        if let Ok(v) = std::env::var("TETHER_MAX_TIMEOUT") {
            match v.parse::<u64>() {
                Ok(secs) => self.tools.runner.max_timeout_secs = secs,
                Err(_) => tracing::warn!("ignoring invalid TETHER_MAX_TIMEOUT value: {v}"),
            }
        }
        if let Ok(v) = std::env::var("TETHER_MAX_OUTPUT_BYTES") {
            match v.parse::<usize>() {
                Ok(bytes) => self.tools.runner.max_output_bytes = bytes,
                Err(_) => tracing::warn!("ignoring invalid TETHER_MAX_OUTPUT_BYTES value: {v}"),
            }
        }
        if let Ok(v) = std::env::var("TETHER_KILL_SIGNAL") {
            match v.parse::<TerminationSignal>() {
                Ok(signal) => self.tools.runner.kill_signal = signal,
                Err(e) => tracing::warn!("ignoring invalid TETHER_KILL_SIGNAL value: {e}"),
            }
        }
        if let Ok(v) = std::env::var("TETHER_SHAPE_MEASURE") {
            match v.parse::<MeasureKind>() {
                Ok(measure) => self.tools.shape.measure = measure,
                Err(e) => tracing::warn!("ignoring invalid TETHER_SHAPE_MEASURE value: {e}"),
            }
        }
        if let Ok(v) = std::env::var("TETHER_LAZY_TOOLS")
            && let Ok(lazy) = v.parse::<bool>()
        {
            self.tools.registry.lazy = lazy;
        }
        if let Ok(v) = std::env::var("TETHER_AUDIT_ENABLED")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.tools.audit.enabled = enabled;
        }
        if let Ok(v) = std::env::var("TETHER_AUDIT_DESTINATION") {
            self.tools.audit.destination = v;
        }
    }

    fn apply_env_overrides_policy(&mut self) {
        let policy = &mut self.tools.policy;
        // Appended after file rules, so a configured deny for the same action still wins.
        if let Ok(v) = std::env::var("TETHER_ALLOWED_ACTIONS") {
            for (family, action) in family_pairs("TETHER_ALLOWED_ACTIONS", &v) {
                policy
                    .commands
                    .entry(family)
                    .or_default()
                    .push(PermissionRule::allow(action));
            }
        }
        if let Ok(v) = std::env::var("TETHER_ALLOWED_ROOTS") {
            for (family, root) in family_pairs("TETHER_ALLOWED_ROOTS", &v) {
                policy.roots.entry(family).or_default().push(root);
            }
        }
        if let Ok(v) = std::env::var("TETHER_EXPOSED_TOOLS") {
            for (family, pattern) in family_pairs("TETHER_EXPOSED_TOOLS", &v) {
                policy.exposure.entry(family).or_default().push(pattern);
            }
        }
    }
}
