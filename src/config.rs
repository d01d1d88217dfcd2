use std::path::PathBuf;

use actix_web::http::Uri;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub artifacts: ArtifactSettings,
    pub frontend: FrontendSettings,
    pub cors: CorsSettings,
    pub log: LogSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Worker threads; actix picks one per physical core when unset.
    pub workers: Option<usize>,
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArtifactSettings {
    pub dir: PathBuf,
    pub scaler: String,
    pub model: String,
}

impl ArtifactSettings {
    pub fn scaler_path(&self) -> PathBuf {
        self.dir.join(&self.scaler)
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(&self.model)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FrontendSettings {
    /// Directory holding the built single-page app (`index.html` + assets).
    pub dist_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

/// Reads settings from defaults, an optional `config/base` file, `APP_*`
/// environment variables and finally the bare `PORT` variable most hosting
/// platforms set.
pub fn get_configuration() -> Result<Settings, ConfigError> {
    build_settings(
        Environment::with_prefix("APP"),
        std::env::var("PORT").ok(),
    )
}

fn build_settings(env: Environment, port: Option<String>) -> Result<Settings, ConfigError> {
    Config::builder()
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 5000_i64)?
        .set_default("artifacts.dir", "Model")?
        .set_default("artifacts.scaler", "scaler.json")?
        .set_default("artifacts.model", "ridge.json")?
        .set_default("frontend.dist_dir", "../frontend/dist")?
        .set_default(
            "cors.allowed_origins",
            vec![
                "http://localhost:5173",
                "https://algerian-fire-prediction-app.vercel.app",
            ],
        )?
        .set_default("log.level", "info")?
        .set_default("log.format", "pretty")?
        .add_source(File::with_name("config/base").required(false))
        .add_source(
            env.prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("cors.allowed_origins")
                .try_parsing(true),
        )
        .set_override_option("server.port", port)?
        .build()?
        .try_deserialize::<Settings>()
        .and_then(|mut settings| {
            settings.cors.allowed_origins = normalize_origins(settings.cors.allowed_origins)?;
            Ok(settings)
        })
}

/// Trims list entries, drops empty ones and rejects anything that is not a
/// `scheme://host[:port]` origin, so a bad allow-list fails before binding.
fn normalize_origins(origins: Vec<String>) -> Result<Vec<String>, ConfigError> {
    origins
        .into_iter()
        .map(|origin| origin.trim().trim_end_matches('/').to_string())
        .filter(|origin| !origin.is_empty())
        .map(|origin| {
            let valid = origin
                .parse::<Uri>()
                .map(|uri| {
                    uri.scheme().is_some()
                        && uri.host().is_some()
                        && uri.path_and_query()
                            .map_or(true, |p| matches!(p.as_str(), "" | "/"))
                })
                .unwrap_or(false);
            if valid {
                Ok(origin)
            } else {
                Err(ConfigError::Message(format!(
                    "cors.allowed_origins: {:?} is not a valid origin",
                    origin
                )))
            }
        })
        .collect()
}
