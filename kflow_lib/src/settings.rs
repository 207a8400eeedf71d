use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;
use thiserror::Error;

pub const ENV_PREFIX: &str = "KFLOW_";
const SINK_PROPS_PREFIX: &str = "sink.props.";
const MASKED_WORDS: [&str; 3] = ["password", "secret", "token"];

pub const DEFAULT_CONFIG: &str = "\
# kflow collector settings, one `key: value` per line
server.address: 0.0.0.0,
server.port: 4739,
server.threads: 4,
server.buffer.size: 8388608,
server.shutdown.timeout.ms: 5000,
socket_stats.validity.secs: 15,
sink.topic: flows,
sink.producers: 2,
sink.queue.size: 10000,
sink.props.path: ./kflow_db.sqlite,
sink.props.journal_mode: WAL,
metrics.interval.secs: 60,
log.level: info
";

//keys that can be overridden from the environment, in dump order
const SCALAR_KEYS: [&str; 12] = [
    "server.address",
    "server.port",
    "server.threads",
    "server.buffer.size",
    "server.shutdown.timeout.ms",
    "socket_stats.validity.secs",
    "sink.topic",
    "sink.producers",
    "sink.queue.size",
    "metrics.interval.secs",
    "log.level",
    "log.file",
];

//props the sqlite publisher reads, so `_` in their env names can map back to `.`
const KNOWN_SINK_PROPS: [&str; 3] = ["path", "busy_timeout.ms", "journal_mode"];

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("unable to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerSettings {
    pub address: Ipv4Addr,
    pub port: u16,
    pub threads: usize,
    pub buffer_size: usize,
    pub shutdown_timeout: Duration,
    pub socket_stats_validity: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            address: Ipv4Addr::UNSPECIFIED,
            port: 4739,
            threads: 4,
            buffer_size: 8 * 1024 * 1024,
            shutdown_timeout: Duration::from_millis(5000),
            socket_stats_validity: Duration::from_secs(15),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SinkSettings {
    pub topic: String,
    pub producers: usize,
    pub queue_size: usize,
    /// Passed to each publisher untouched.
    pub props: BTreeMap<String, String>,
}

impl Default for SinkSettings {
    fn default() -> Self {
        SinkSettings {
            topic: "flows".to_string(),
            producers: 2,
            queue_size: 10_000,
            props: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            level: LevelFilter::Info,
            file: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub sink: SinkSettings,
    /// Zero disables the periodic metrics report.
    pub metrics_interval: Duration,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            server: ServerSettings::default(),
            sink: SinkSettings::default(),
            metrics_interval: Duration::from_secs(60),
            log: LogSettings::default(),
        }
    }
}

impl Settings {
    /// Defaults, then the settings file, then `KFLOW_*` environment variables.
    /// A missing file is created with the default contents first.
    pub fn load(file: &Path) -> Result<Self, SettingsError> {
        let config_string = match fs::read_to_string(file) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                write_default_config(file)?;
                DEFAULT_CONFIG.to_string()
            }
            Err(e) => {
                return Err(SettingsError::Io {
                    path: file.to_path_buf(),
                    source: e,
                })
            }
        };

        let mut settings = Settings::from_config_str(&config_string)?;
        settings.apply_env(std::env::vars())?;
        Ok(settings)
    }

    pub fn from_config_str(config_string: &str) -> Result<Self, SettingsError> {
        let mut settings = Settings::default();
        for (key, value) in parse_config_string(config_string)? {
            settings.set(&key, &value)?;
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Only `KFLOW_`-prefixed names of known keys are considered, e.g.
    /// `KFLOW_SERVER_PORT` for `server.port`. `KFLOW_SINK_PROPS_<NAME>` sets a
    /// sink property; `<NAME>` resolves against the props already configured
    /// and the ones the publisher knows, otherwise it is lower-cased as is.
    pub fn apply_env(&mut self, vars: impl IntoIterator<Item = (String, String)>) -> Result<(), SettingsError> {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        for key in SCALAR_KEYS {
            if let Some(value) = vars.get(&env_name(key)) {
                self.set(key, value)?;
            }
        }

        let props_env_prefix = env_name(SINK_PROPS_PREFIX);
        for (name, value) in &vars {
            let Some(suffix) = name.strip_prefix(&props_env_prefix) else {
                continue;
            };
            if suffix.is_empty() {
                continue;
            }
            let prop = self.sink_prop_for_env(suffix);
            self.set(&format!("{SINK_PROPS_PREFIX}{prop}"), value)?;
        }
        self.validate()
    }

    fn sink_prop_for_env(&self, suffix: &str) -> String {
        self.sink
            .props
            .keys()
            .map(String::as_str)
            .chain(KNOWN_SINK_PROPS)
            .find(|prop| prop.to_ascii_uppercase().replace('.', "_") == suffix)
            .map(str::to_string)
            .unwrap_or_else(|| suffix.to_ascii_lowercase())
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let value = value.trim();
        if let Some(prop) = key.strip_prefix(SINK_PROPS_PREFIX) {
            if prop.is_empty() {
                return Err(invalid(key, "empty property name"));
            }
            self.sink.props.insert(prop.to_string(), value.to_string());
            return Ok(());
        }
        match key {
            "server.address" => self.server.address = parse_value(key, value)?,
            "server.port" => self.server.port = parse_value(key, value)?,
            "server.threads" => self.server.threads = parse_value(key, value)?,
            "server.buffer.size" => self.server.buffer_size = parse_value(key, value)?,
            "server.shutdown.timeout.ms" => {
                self.server.shutdown_timeout = Duration::from_millis(parse_value(key, value)?)
            }
            "socket_stats.validity.secs" => {
                self.server.socket_stats_validity = Duration::from_secs(parse_value(key, value)?)
            }
            "sink.topic" => self.sink.topic = value.to_string(),
            "sink.producers" => self.sink.producers = parse_value(key, value)?,
            "sink.queue.size" => self.sink.queue_size = parse_value(key, value)?,
            "metrics.interval.secs" => self.metrics_interval = Duration::from_secs(parse_value(key, value)?),
            "log.level" => self.log.level = parse_value(key, value)?,
            "log.file" => self.log.file = Some(PathBuf::from(value)),
            _ => return Err(invalid(key, "unknown setting")),
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.server.threads == 0 {
            return Err(invalid("server.threads", "must be at least 1"));
        }
        if self.sink.producers == 0 {
            return Err(invalid("sink.producers", "must be at least 1"));
        }
        if self.sink.queue_size == 0 {
            return Err(invalid("sink.queue.size", "must be at least 1"));
        }
        if self.sink.topic.is_empty() {
            return Err(invalid("sink.topic", "must not be empty"));
        }
        Ok(())
    }

    /// Settings as `key: value` lines with secrets in sink properties masked.
    pub fn dump_masked(&self) -> String {
        let mut dump = String::new();
        let _ = writeln!(dump, "server.address: {}", self.server.address);
        let _ = writeln!(dump, "server.port: {}", self.server.port);
        let _ = writeln!(dump, "server.threads: {}", self.server.threads);
        let _ = writeln!(dump, "server.buffer.size: {}", self.server.buffer_size);
        let _ = writeln!(dump, "server.shutdown.timeout.ms: {}", self.server.shutdown_timeout.as_millis());
        let _ = writeln!(dump, "socket_stats.validity.secs: {}", self.server.socket_stats_validity.as_secs());
        let _ = writeln!(dump, "sink.topic: {}", self.sink.topic);
        let _ = writeln!(dump, "sink.producers: {}", self.sink.producers);
        let _ = writeln!(dump, "sink.queue.size: {}", self.sink.queue_size);
        for (name, value) in &self.sink.props {
            let lowered = name.to_ascii_lowercase();
            let value = if MASKED_WORDS.iter().any(|w| lowered.contains(w)) {
                "***"
            } else {
                value.as_str()
            };
            let _ = writeln!(dump, "{SINK_PROPS_PREFIX}{name}: {value}");
        }
        let _ = writeln!(dump, "metrics.interval.secs: {}", self.metrics_interval.as_secs());
        let _ = write!(dump, "log.level: {}", self.log.level);
        if let Some(file) = &self.log.file {
            let _ = write!(dump, "\nlog.file: {}", file.display());
        }
        dump
    }
}

/// Splits a settings file into `(key, value)` pairs. Blank lines and `#`
/// comments are skipped, a trailing comma on a line is ignored. A `#` only
/// starts a comment at the beginning of a line or after whitespace.
pub fn parse_config_string(config_string: &str) -> Result<Vec<(String, String)>, SettingsError> {
    let mut entries = Vec::new();
    for (index, raw_line) in config_string.lines().enumerate() {
        let line = strip_comment(raw_line).trim();
        let line = line.strip_suffix(',').unwrap_or(line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(SettingsError::Parse {
                line: index + 1,
                message: format!("expected `key: value`, got {line:?}"),
            });
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(SettingsError::Parse {
                line: index + 1,
                message: "missing key".to_string(),
            });
        }
        entries.push((key.to_string(), value.trim().to_string()));
    }
    Ok(entries)
}

fn strip_comment(line: &str) -> &str {
    let mut previous = None;
    for (position, c) in line.char_indices() {
        if c == '#' && previous.map_or(true, char::is_whitespace) {
            return &line[..position];
        }
        previous = Some(c);
    }
    line
}

pub fn env_name(key: &str) -> String {
    format!("{ENV_PREFIX}{}", key.to_ascii_uppercase().replace('.', "_"))
}

fn write_default_config(file: &Path) -> Result<(), SettingsError> {
    let io_error = |e| SettingsError::Io {
        path: file.to_path_buf(),
        source: e,
    };
    let mut temp_file = fs::File::create(file).map_err(io_error)?;
    temp_file.write_all(DEFAULT_CONFIG.as_bytes()).map_err(io_error)?;
    temp_file.sync_all().map_err(io_error)
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, SettingsError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| invalid(key, &e.to_string()))
}

fn invalid(key: &str, message: &str) -> SettingsError {
    SettingsError::Invalid {
        key: key.to_string(),
        message: message.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let settings = Settings::from_config_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(settings.server, ServerSettings::default());
        assert_eq!(settings.sink.topic, "flows");
        assert_eq!(settings.sink.producers, 2);
        assert_eq!(settings.sink.props.get("path").map(String::as_str), Some("./kflow_db.sqlite"));
        assert_eq!(settings.metrics_interval, Duration::from_secs(60));
        assert_eq!(settings.log.level, LevelFilter::Info);
    }

    #[test]
    fn test_parse_config_string() {
        let entries = parse_config_string("# comment\n\nserver.port: 2055,\n  sink.topic : ipfix # trailing\n").unwrap();
        assert_eq!(
            entries,
            vec![
                ("server.port".to_string(), "2055".to_string()),
                ("sink.topic".to_string(), "ipfix".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_errors_report_line() {
        match parse_config_string("server.port: 1\nnot a setting\n") {
            Err(SettingsError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_values_are_validated() {
        assert!(matches!(
            Settings::from_config_str("server.port: 70000"),
            Err(SettingsError::Invalid { key, .. }) if key == "server.port"
        ));
        assert!(matches!(
            Settings::from_config_str("server.threads: 0"),
            Err(SettingsError::Invalid { key, .. }) if key == "server.threads"
        ));
        assert!(matches!(
            Settings::from_config_str("server.colour: blue"),
            Err(SettingsError::Invalid { key, .. }) if key == "server.colour"
        ));
        assert!(Settings::from_config_str("log.level: chatty").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut settings = Settings::from_config_str("server.port: 2055\nsink.topic: ipfix").unwrap();
        settings
            .apply_env(vec![
                ("KFLOW_SERVER_PORT".to_string(), "4740".to_string()),
                ("KFLOW_SOCKET_STATS_VALIDITY_SECS".to_string(), "30".to_string()),
                ("UNRELATED".to_string(), "1".to_string()),
            ])
            .unwrap();
        assert_eq!(settings.server.port, 4740);
        assert_eq!(settings.server.socket_stats_validity, Duration::from_secs(30));
        assert_eq!(settings.sink.topic, "ipfix");
        assert_eq!(env_name("server.buffer.size"), "KFLOW_SERVER_BUFFER_SIZE");
    }

    #[test]
    fn test_env_sets_sink_props() {
        let mut settings =
            Settings::from_config_str("sink.props.journal_mode: WAL\nsink.props.sasl.password: changeme").unwrap();
        settings
            .apply_env(vec![
                ("KFLOW_SINK_PROPS_JOURNAL_MODE".to_string(), "DELETE".to_string()),
                ("KFLOW_SINK_PROPS_BUSY_TIMEOUT_MS".to_string(), "250".to_string()),
                ("KFLOW_SINK_PROPS_SASL_PASSWORD".to_string(), "s3cret".to_string()),
                ("KFLOW_SINK_PROPS_PATH".to_string(), ":memory:".to_string()),
                ("KFLOW_SINK_PROPS_CLIENT_ID".to_string(), "kflow-1".to_string()),
            ])
            .unwrap();

        let props = &settings.sink.props;
        assert_eq!(props["journal_mode"], "DELETE");
        assert_eq!(props["busy_timeout.ms"], "250");
        assert_eq!(props["sasl.password"], "s3cret");
        assert_eq!(props["path"], ":memory:");
        assert_eq!(props["client_id"], "kflow-1");
        assert!(!props.contains_key("sasl_password"));
        assert!(!settings.dump_masked().contains("s3cret"));
    }

    #[test]
    fn test_hash_inside_value_is_kept() {
        let settings = Settings::from_config_str(
            "sink.props.sasl.password: abc#123,\nsink.topic: ipfix #comment\n#server.port: 1",
        )
        .unwrap();
        assert_eq!(settings.sink.props.get("sasl.password").map(String::as_str), Some("abc#123"));
        assert_eq!(settings.sink.topic, "ipfix");
        assert_eq!(settings.server.port, 4739);
    }

    #[test]
    fn test_dump_masks_secrets() {
        let settings = Settings::from_config_str("sink.props.sasl.password: hunter2\nsink.props.path: :memory:").unwrap();
        let dump = settings.dump_masked();
        assert!(dump.contains("sink.props.sasl.password: ***"));
        assert!(dump.contains("sink.props.path: :memory:"));
        assert!(!dump.contains("hunter2"));
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = std::env::temp_dir().join(format!("kflow-settings-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("config.ini");
        let _ = fs::remove_file(&file);

        let settings = Settings::load(&file).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), DEFAULT_CONFIG);
        assert_eq!(settings.server.threads, 4);

        fs::remove_dir_all(&dir).unwrap();
    }
}
