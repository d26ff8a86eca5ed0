use std::{collections::HashMap, fs};

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_bind: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:5000".into(),
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bind_matches_the_original_port() {
        assert_eq!(Settings::default().server_bind, "127.0.0.1:5000");
    }

    #[test]
    fn toml_bind_addr_is_recognized() {
        let file_cfg: HashMap<String, String> =
            toml::from_str("bind_addr = \"0.0.0.0:8080\"").expect("parse");
        assert_eq!(file_cfg.get("bind_addr").map(String::as_str), Some("0.0.0.0:8080"));
    }
}
