use acme_manager::AcmeSettings;
use anyhow::Result;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::Deserialize;
use tracing::info;

pub const DEFAULT_CONFIG: &str = include_str!("../certd.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Bearer token required on the /acme endpoints; empty disables the
    /// check.
    #[serde(default)]
    pub auth_token: String,
}

/// Layer the default configuration under the system-wide file, the working
/// directory file and an optional explicitly passed one.
pub fn load_config_figment(config_file: Option<&str>) -> Figment {
    let mut figment =
        Figment::from(rocket::Config::default()).merge(Toml::string(DEFAULT_CONFIG));
    for dir in ["/etc/certd", "."] {
        let path = format!("{dir}/certd.toml");
        if std::path::Path::new(&path).exists() {
            info!("loading config file: {path}");
            figment = figment.merge(Toml::file(path));
        }
    }
    match config_file {
        Some(path) => figment.merge(Toml::file(path)),
        None => figment,
    }
}

pub fn acme_settings(figment: &Figment) -> Result<AcmeSettings> {
    Ok(figment.focus("acme").extract()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let figment = Figment::from(rocket::Config::default()).merge(Toml::string(DEFAULT_CONFIG));
        let settings = acme_settings(&figment).unwrap();
        assert!(!settings.enable_client);
        assert_eq!(settings.certificate_filename, "cert.pem");
        assert_eq!(
            settings.account_key_path(),
            std::path::Path::new("/var/lib/certd/acme_account_key.pem")
        );
        let api: ApiConfig = figment.focus("api").extract().unwrap();
        assert_eq!(api.auth_token, "");
    }

    #[test]
    fn leaf_config_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let leaf = dir.path().join("override.toml");
        std::fs::write(
            &leaf,
            r#"
[acme]
enable_client = true
challenge_handler_type = "files"
"#,
        )
        .unwrap();

        let figment = load_config_figment(leaf.to_str());
        let settings = acme_settings(&figment).unwrap();
        assert!(settings.enable_client);
        assert_eq!(
            settings.challenge_handler_type,
            acme_manager::ChallengeHandlerType::Files
        );
        // Untouched keys keep their defaults.
        assert_eq!(settings.certificate_key_filename, "key.pem");
    }
}
