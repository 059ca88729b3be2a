use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default, deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub annotation: AnnotationConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    pub device: String,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub input_size: u32,
    pub max_detections: usize,
    pub num_instances: usize,
    pub labels_file: Option<PathBuf>,
    pub preload: bool,
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("yolov8n.onnx"),
            device: "cpu".to_string(),
            confidence_threshold: 0.25,
            iou_threshold: 0.7,
            input_size: 640,
            max_detections: 300,
            num_instances: default_model_instances(),
            labels_file: None,
            preload: true,
        }
    }
}

impl ModelConfig {
    pub fn get_path(&self) -> &Path {
        &self.model_path
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(format!(
                "iou_threshold must be within [0, 1], got {}",
                self.iou_threshold
            ));
        }
        if self.input_size == 0 {
            return Err("input_size must be greater than 0".to_string());
        }
        if self.num_instances == 0 {
            return Err("num_instances must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Guards placed in front of the detector.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InferenceConfig {
    /// Defaults to the number of model instances.
    pub max_concurrent: Option<usize>,
    /// `0` disables the timeout.
    pub timeout_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            timeout_ms: 30_000,
        }
    }
}

impl InferenceConfig {
    pub fn get_timeout(&self) -> Option<std::time::Duration> {
        (self.timeout_ms > 0).then(|| std::time::Duration::from_millis(self.timeout_ms))
    }
}

/// Upper bound for `annotation.confidence_decimals`.
pub const MAX_CONFIDENCE_DECIMALS: u32 = 9;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnnotationConfig {
    pub confidence_decimals: Option<u32>,
    pub font_path: Option<PathBuf>,
    pub font_size: f32,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            confidence_decimals: None,
            font_path: None,
            font_size: 16.0,
        }
    }
}

impl AnnotationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(decimals) = self.confidence_decimals {
            if decimals > MAX_CONFIDENCE_DECIMALS {
                return Err(format!(
                    "confidence_decimals must be at most {}, got {}",
                    MAX_CONFIDENCE_DECIMALS, decimals
                ));
            }
        }
        if self.font_size.is_nan() || self.font_size <= 0. {
            return Err(format!("font_size must be positive, got {}", self.font_size));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

/// Plain environment variables recognised on top of the `APP_` layer.
const ENV_OVERRIDES: [(&str, &str); 4] = [
    ("YOLO_MODEL_PATH", "model.model_path"),
    ("YOLO_CONF_THRESHOLD", "model.confidence_threshold"),
    ("YOLO_DEVICE", "model.device"),
    ("PORT", "server.port"),
];

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    load_configuration(&configuration_directory, &environment, |key| {
        std::env::var(key).ok()
    })
}

pub fn load_configuration<F>(
    configuration_directory: &Path,
    environment: &Environment,
    lookup: F,
) -> Result<Config, config::ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut builder = config::Config::builder()
        .add_source(config::File::from(configuration_directory.join("base.yaml")).required(false))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        );

    for (variable, key) in ENV_OVERRIDES {
        builder = builder.set_override_option(key, lookup(variable))?;
    }

    let config: Config = builder.build()?.try_deserialize::<Config>()?;

    if let Err(e) = config
        .model
        .validate()
        .and_then(|_| config.annotation.validate())
    {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_configuration_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_configuration(dir.path(), &Environment::Local, no_env).unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.model.model_path, PathBuf::from("yolov8n.onnx"));
        assert_eq!(config.model.device, "cpu");
        assert!((config.model.confidence_threshold - 0.25).abs() < f32::EPSILON);
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.annotation.confidence_decimals.is_none());
    }

    #[test]
    fn test_environment_file_overrides_base() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("base.yaml"),
            "log_level: info\nserver:\n  port: 9000\nmodel:\n  device: cpu\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("production.yaml"),
            "log_level: debug\nmodel:\n  device: \"cuda:1\"\n",
        )
        .unwrap();

        let config = load_configuration(dir.path(), &Environment::Production, no_env).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.model.device, "cuda:1");
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_service_variables_override_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base.yaml"), "server:\n  port: 9000\n").unwrap();

        let vars: HashMap<&str, &str> = HashMap::from([
            ("YOLO_MODEL_PATH", "/models/yolov8s.onnx"),
            ("YOLO_CONF_THRESHOLD", "0.5"),
            ("YOLO_DEVICE", "cuda"),
            ("PORT", "8081"),
        ]);
        let config = load_configuration(dir.path(), &Environment::Local, |key| {
            vars.get(key).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(config.model.model_path, PathBuf::from("/models/yolov8s.onnx"));
        assert!((config.model.confidence_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.model.device, "cuda");
        assert_eq!(config.server.port, 8081);
    }

    #[test]
    fn test_out_of_range_threshold_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_configuration(dir.path(), &Environment::Local, |key| {
            (key == "YOLO_CONF_THRESHOLD").then(|| "1.5".to_string())
        });

        assert!(result.is_err());
    }

    #[test]
    fn test_excessive_confidence_decimals_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("base.yaml"),
            "annotation:\n  confidence_decimals: 400\n",
        )
        .unwrap();

        let result = load_configuration(dir.path(), &Environment::Local, no_env);
        assert!(result.is_err());

        fs::write(
            dir.path().join("base.yaml"),
            "annotation:\n  confidence_decimals: 3\n",
        )
        .unwrap();
        let config = load_configuration(dir.path(), &Environment::Local, no_env).unwrap();
        assert_eq!(config.annotation.confidence_decimals, Some(3));
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        let level: Result<LogLevel, _> = "trace".to_string().try_into();
        assert!(level.is_err());
    }
}
