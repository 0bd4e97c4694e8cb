use std::{path::PathBuf, time::Duration};

/// Reads `ZAPLINE_*` settings through `get`, so tests need not touch the
/// process environment.
struct Vars<F> {
    get: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.get)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn usize(&self, name: &str) -> Option<usize> {
        self.string(name).and_then(|v| v.parse::<usize>().ok())
    }

    fn u64(&self, name: &str) -> Option<u64> {
        self.string(name).and_then(|v| v.parse::<u64>().ok())
    }

    fn millis(&self, name: &str, lo: u64, hi: u64, default: Duration) -> Duration {
        self.u64(name)
            .map(|v| Duration::from_millis(v.clamp(lo, hi)))
            .unwrap_or(default)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Port of bot 0; bot `n` listens on `base_port + n`.
    pub base_port: u16,
    pub worker_command: String,
    /// Arguments placed before the positional `(bot_id, port, webhook_url)`.
    pub worker_args: Vec<String>,
    pub data_root: PathBuf,
    /// Bots without their own webhook get `<base>/api/whatsapp/webhook/<id>`.
    pub default_webhook_base: Option<String>,
    pub poll_interval: Duration,
    pub spawn_grace: Duration,
    pub stop_timeout: Duration,
    pub status_timeout: Duration,
    pub send_timeout: Duration,
    /// `None` disables the starting -> active fallback.
    pub starting_fallback: Option<Duration>,
    pub log_max_lines: usize,
    pub log_file_max_bytes: u64,
    pub log_file_max_files: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_port: 8000,
            worker_command: "node".to_string(),
            worker_args: vec!["whatsapp_module/whatsapp_bot.js".to_string()],
            data_root: PathBuf::from("./data"),
            default_webhook_base: None,
            poll_interval: Duration::from_secs(5),
            spawn_grace: Duration::from_secs(3),
            stop_timeout: Duration::from_secs(10),
            status_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(30),
            starting_fallback: Some(Duration::from_secs(30)),
            log_max_lines: 1000,
            log_file_max_bytes: 10 * 1024 * 1024, // 10 MiB
            log_file_max_files: 3,
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let env = Vars { get };
        let d = Self::default();

        let starting_fallback = match env.u64("ZAPLINE_STARTING_FALLBACK_SEC") {
            Some(0) => None,
            Some(v) => Some(Duration::from_secs(v.clamp(1, 3600))),
            None => d.starting_fallback,
        };

        Self {
            base_port: env
                .u64("ZAPLINE_BASE_PORT")
                .map(|v| v.clamp(1024, 60_000) as u16)
                .unwrap_or(d.base_port),
            worker_command: env.string("ZAPLINE_WORKER_COMMAND").unwrap_or(d.worker_command),
            worker_args: env
                .string("ZAPLINE_WORKER_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or(d.worker_args),
            data_root: env
                .string("ZAPLINE_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.data_root),
            default_webhook_base: env
                .string("ZAPLINE_PUBLIC_URL")
                .map(|v| v.trim_end_matches('/').to_string()),
            poll_interval: env.millis("ZAPLINE_POLL_INTERVAL_MS", 250, 60_000, d.poll_interval),
            spawn_grace: env.millis("ZAPLINE_SPAWN_GRACE_MS", 100, 60_000, d.spawn_grace),
            stop_timeout: env
                .u64("ZAPLINE_STOP_TIMEOUT_SEC")
                .map(|v| Duration::from_secs(v.clamp(1, 300)))
                .unwrap_or(d.stop_timeout),
            status_timeout: env.millis("ZAPLINE_STATUS_TIMEOUT_MS", 250, 30_000, d.status_timeout),
            send_timeout: env.millis("ZAPLINE_SEND_TIMEOUT_MS", 1000, 120_000, d.send_timeout),
            starting_fallback,
            log_max_lines: env
                .usize("ZAPLINE_LOG_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(d.log_max_lines),
            log_file_max_bytes: env
                .u64("ZAPLINE_LOG_FILE_MAX_BYTES")
                .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
                .unwrap_or(d.log_file_max_bytes),
            log_file_max_files: env
                .usize("ZAPLINE_LOG_FILE_MAX_FILES")
                .map(|v| v.clamp(1, 20))
                .unwrap_or(d.log_file_max_files),
        }
    }

    /// Working directory (session data, logs, run.json) of one bot.
    pub fn instance_dir(&self, bot_id: zapline_instance::BotId) -> PathBuf {
        self.data_root.join("instances").join(bot_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> SupervisorConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SupervisorConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let cfg = from_pairs(&[("ZAPLINE_BASE_PORT", "  "), ("ZAPLINE_POLL_INTERVAL_MS", "soon")]);
        let d = SupervisorConfig::default();
        assert_eq!(cfg.base_port, d.base_port);
        assert_eq!(cfg.poll_interval, d.poll_interval);
        assert_eq!(cfg.starting_fallback, d.starting_fallback);
        assert_eq!(cfg.default_webhook_base, None);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let cfg = from_pairs(&[
            ("ZAPLINE_BASE_PORT", "80"),
            ("ZAPLINE_POLL_INTERVAL_MS", "5"),
            ("ZAPLINE_STOP_TIMEOUT_SEC", "9999"),
            ("ZAPLINE_LOG_FILE_MAX_FILES", "0"),
            ("ZAPLINE_STARTING_FALLBACK_SEC", "90000"),
        ]);
        assert_eq!(cfg.base_port, 1024);
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.stop_timeout, Duration::from_secs(300));
        assert_eq!(cfg.log_file_max_files, 1);
        assert_eq!(cfg.starting_fallback, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn zero_fallback_disables_it() {
        let cfg = from_pairs(&[("ZAPLINE_STARTING_FALLBACK_SEC", "0")]);
        assert_eq!(cfg.starting_fallback, None);
    }

    #[test]
    fn worker_and_webhook_settings_are_parsed() {
        let cfg = from_pairs(&[
            ("ZAPLINE_WORKER_COMMAND", "bun"),
            ("ZAPLINE_WORKER_ARGS", "run  bot.ts"),
            ("ZAPLINE_PUBLIC_URL", "https://control.example/"),
        ]);
        assert_eq!(cfg.worker_command, "bun");
        assert_eq!(cfg.worker_args, vec!["run", "bot.ts"]);
        assert_eq!(cfg.default_webhook_base.as_deref(), Some("https://control.example"));
    }
}
