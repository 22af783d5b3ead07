use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_TEMPLATE: &str = "KCPE-Hatua-Network-Secondary-Application-_-2024.pdf";
const DEFAULT_DOCUMENT_PREFIX: &str = "Hatua_Application_";
const DEFAULT_EMAIL_BODY: &str = "Hello,\n\nPlease find attached the application forms for {{SCHOLARSHIP_APPLICANTS}} together with a summary of the serial numbers and their Google Drive links.\n\nFor questions contact {{SCHOLARSHIP_APPLICANTS_CHAMPION}} on {{phoneNumber}}.\n\nRegards,\n{{SENDER_NAME}}\n{{SENDER_TEAM}}";

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// How `POST /webhook` treats an accepted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Acknowledge with 202 and hand the batch to the background worker.
    Deferred,
    /// Run the batch before answering and return the report with a 200.
    Inline,
}

impl ProcessingMode {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "deferred" | "async" | "background" => Ok(Self::Deferred),
            "inline" | "sync" => Ok(Self::Inline),
            other => Err(ConfigError::Invalid {
                key: "APP_PROCESSING_MODE",
                value: other.to_string(),
            }),
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub webhook: WebhookConfig,
    pub documents: DocumentConfig,
    pub queue: QueueConfig,
    pub drive: DriveConfig,
    pub tracker: TrackerConfig,
    pub mail: MailConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .or_else(|_| env::var("PORT"))
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let telemetry = TelemetryConfig::from_env()?;

        let webhook = WebhookConfig {
            api_key: required("WEBHOOK_API_KEY")?,
            mode: ProcessingMode::parse(&optional("APP_PROCESSING_MODE", "deferred"))?,
        };

        let documents = DocumentConfig::from_env()?;

        let queue = QueueConfig {
            directory: PathBuf::from(optional("APP_QUEUE_DIR", "./var/queue")),
        };

        let drive = DriveConfig {
            credentials_path: PathBuf::from(required("GOOGLE_CREDENTIALS_PATH")?),
            folder_id: required("GOOGLE_DRIVE_FOLDER_ID")?,
        };

        let tracker = TrackerConfig {
            api_url: optional("AIRTABLE_API_URL", "https://api.airtable.com"),
            token: required("AIRTABLE_PAT")?,
            base_id: required("BASE_ID")?,
            table_name: required("TABLE_NAME")?,
            link_field: optional("TRACKER_LINK_FIELD", "Application Form PDF"),
            status_field: optional("TRACKER_STATUS_FIELD", "Status"),
            status_label: optional("TRACKER_STATUS_LABEL", "Form Shared on Email"),
            min_interval: Duration::from_millis(parse_number("TRACKER_MIN_INTERVAL_MS", 500)?),
            max_retries: parse_number("TRACKER_MAX_RETRIES", 3)?,
            backoff: Duration::from_millis(parse_number("TRACKER_BACKOFF_MS", 1_000)?),
            max_backoff: Duration::from_millis(parse_number("TRACKER_MAX_BACKOFF_MS", 30_000)?),
        };

        let username = required("EMAIL_USER")?;
        let domain = env::var("EMAIL_DOMAIN").unwrap_or_else(|_| {
            username
                .rsplit_once('@')
                .map(|(_, domain)| domain.to_string())
                .unwrap_or_else(|| "localhost".to_string())
        });
        let mail = MailConfig {
            smtp_host: optional("SMTP_HOST", "smtp.gmail.com"),
            smtp_port: parse_number("SMTP_PORT", 587)?,
            password: required("EMAIL_PASSWORD")?,
            username,
            domain,
            subject: optional("EMAIL_SUBJECT", "Scholarship application forms"),
            body_template: optional("EMAIL_BODY", DEFAULT_EMAIL_BODY),
            sender_name: optional("SENDER_NAME", "Scholarship Team"),
            sender_team: optional("SENDER_TEAM", ""),
            applicants_champion: optional("SCHOLARSHIP_APPLICANTS_CHAMPION", ""),
            applicants_label: optional("SCHOLARSHIP_APPLICANTS", ""),
        };

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry,
            webhook,
            documents,
            queue,
            drive,
            tracker,
            mail,
        })
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing { key }),
    }
}

fn optional(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_number<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            value: raw.clone(),
        }),
        Err(_) => Ok(default),
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Full,
}

impl LogFormat {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "full" => Ok(Self::Full),
            other => Err(ConfigError::Invalid {
                key: "APP_LOG_FORMAT",
                value: other.to_string(),
            }),
        }
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub format: LogFormat,
}

impl TelemetryConfig {
    /// Logging settings alone, for commands that need nothing else.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(Self {
            log_level: optional("APP_LOG_LEVEL", "info"),
            format: LogFormat::parse(&optional("APP_LOG_FORMAT", "compact"))?,
        })
    }
}

/// Ingress authentication and processing mode.
#[derive(Clone)]
pub struct WebhookConfig {
    pub api_key: String,
    pub mode: ProcessingMode,
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Template location and scratch space for stamped documents.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    pub template_path: PathBuf,
    pub file_prefix: String,
    pub work_dir: PathBuf,
    pub qr_timeout: Duration,
}

impl DocumentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(Self {
            template_path: PathBuf::from(optional("APP_TEMPLATE_PATH", DEFAULT_TEMPLATE)),
            file_prefix: optional("APP_DOCUMENT_PREFIX", DEFAULT_DOCUMENT_PREFIX),
            work_dir: env::var("APP_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir()),
            qr_timeout: Duration::from_secs(parse_number("APP_QR_TIMEOUT_SECS", 15)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub directory: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub credentials_path: PathBuf,
    pub folder_id: String,
}

#[derive(Clone)]
pub struct TrackerConfig {
    pub api_url: String,
    pub token: String,
    pub base_id: String,
    pub table_name: String,
    pub link_field: String,
    pub status_field: String,
    pub status_label: String,
    pub min_interval: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl fmt::Debug for TrackerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerConfig")
            .field("api_url", &self.api_url)
            .field("base_id", &self.base_id)
            .field("table_name", &self.table_name)
            .field("min_interval", &self.min_interval)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct MailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub domain: String,
    pub subject: String,
    pub body_template: String,
    pub sender_name: String,
    pub sender_team: String,
    pub applicants_champion: String,
    pub applicants_label: String,
}

impl fmt::Debug for MailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailConfig")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("username", &self.username)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    Missing { key: &'static str },
    Invalid { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::Missing { key } => write!(f, "{key} must be set"),
            ConfigError::Invalid { key, value } => {
                write!(f, "{key} has an unsupported value '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort | ConfigError::Missing { .. } | ConfigError::Invalid { .. } => {
                None
            }
        }
    }
}
