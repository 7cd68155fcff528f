use std::env;

use crate::error::ChatError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Mongo,
    Memory,
}

#[derive(Clone)]
pub struct Config {
    pub bind_addr: String,
    pub store_backend: StoreBackend,
    pub mongo_uri: String,
    pub database_name: String,
    pub jwt_secret: String,
    pub jwt_expiration_secs: i64,
    pub jwt_refresh_expiration_secs: i64,
    pub frontend_origin: String,
    /// Public base used when building image URLs.
    pub base_url: String,
    pub push_enabled: bool,
    pub fcm_server_key: Option<String>,
    pub fcm_endpoint: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ChatError> {
        dotenv::dotenv().ok();

        let store_backend = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "mongo".to_string())
            .to_lowercase()
            .as_str()
        {
            "mongo" => StoreBackend::Mongo,
            "memory" => StoreBackend::Memory,
            other => {
                return Err(ChatError::Config(format!("unknown STORE_BACKEND '{}'", other)))
            }
        };

        let mongo_uri = match (env::var("MONGO_URI"), &store_backend) {
            (Ok(uri), _) => uri,
            (Err(_), StoreBackend::Memory) => String::new(),
            (Err(_), StoreBackend::Mongo) => {
                return Err(ChatError::Config("MONGO_URI must be set".to_string()))
            }
        };

        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| ChatError::Config("JWT_SECRET must be set".to_string()))?;

        let push_enabled = env::var("PUSH_ENABLED")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            store_backend,
            mongo_uri,
            database_name: env::var("DATABASE_NAME").unwrap_or_else(|_| "chat_db".to_string()),
            jwt_secret,
            jwt_expiration_secs: parse_secs("JWT_EXPIRATION_SECS", 86_400)?,
            jwt_refresh_expiration_secs: parse_secs("JWT_REFRESH_EXPIRATION_SECS", 604_800)?,
            frontend_origin: env::var("FRONTEND_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            base_url: env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string())
                .trim_end_matches('/')
                .to_string(),
            push_enabled,
            fcm_server_key: env::var("FCM_SERVER_KEY").ok(),
            fcm_endpoint: env::var("FCM_ENDPOINT")
                .unwrap_or_else(|_| "https://fcm.googleapis.com/fcm/send".to_string()),
        })
    }

    /// Settings for tests and the in-memory backend.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            store_backend: StoreBackend::Memory,
            mongo_uri: String::new(),
            database_name: "chat_test".to_string(),
            jwt_secret: "test-secret".to_string(),
            jwt_expiration_secs: 3600,
            jwt_refresh_expiration_secs: 7200,
            frontend_origin: "http://localhost:3000".to_string(),
            base_url: "http://chat.test".to_string(),
            push_enabled: false,
            fcm_server_key: None,
            fcm_endpoint: "http://localhost/fcm".to_string(),
        }
    }
}

fn parse_secs(key: &str, default: i64) -> Result<i64, ChatError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ChatError::Config(format!("{} must be a number of seconds", key))),
        Err(_) => Ok(default),
    }
}
