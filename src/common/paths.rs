use std::path::PathBuf;
use std::fs;
use crate::common::error::{AttendanceError, Result};

const DEV_BASE_DIR: &str = "./dev_data";
const SYSTEM_CONFIG_FILE: &str = "/etc/class-attendance/attendance.toml";
const SYSTEM_MODELS_DIR: &str = "/usr/share/class-attendance/models";

pub enum RunMode {
    Development(PathBuf),  // Base directory for dev mode
    System,
    User,                  // Per-user config, system models
}

pub struct Paths {
    mode: RunMode,
}

impl Paths {
    pub fn new(dev: bool) -> Result<Self> {
        if dev {
            let base_dir = PathBuf::from(DEV_BASE_DIR);
            fs::create_dir_all(base_dir.join("configs"))?;
            fs::create_dir_all(base_dir.join("captures"))?;

            tracing::info!("Development mode - using local directory: {}", base_dir.display());
            return Ok(Self { mode: RunMode::Development(base_dir) });
        }

        if std::env::var("USER").unwrap_or_default() == "root" {
            return Ok(Self { mode: RunMode::System });
        }

        if dirs::config_dir().is_none() {
            return Err(AttendanceError::Config("Could not find user config directory".into()));
        }
        Ok(Self { mode: RunMode::User })
    }

    pub fn config_file(&self) -> PathBuf {
        match &self.mode {
            RunMode::Development(base) => base.join("configs/attendance.toml"),
            RunMode::System => PathBuf::from(SYSTEM_CONFIG_FILE),
            RunMode::User => {
                // Try user config first, then system config
                if let Some(config_dir) = dirs::config_dir() {
                    let user_config = config_dir.join("class-attendance/attendance.toml");
                    if user_config.exists() {
                        return user_config;
                    }
                }
                PathBuf::from(SYSTEM_CONFIG_FILE)
            }
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        match &self.mode {
            RunMode::Development(_) => PathBuf::from("./models"),
            RunMode::System | RunMode::User => PathBuf::from(SYSTEM_MODELS_DIR),
        }
    }

    /// Where annotated snapshots go; only development mode keeps them.
    pub fn captures_dir(&self) -> Option<PathBuf> {
        match &self.mode {
            RunMode::Development(base) => Some(base.join("captures")),
            RunMode::System | RunMode::User => None,
        }
    }

    pub fn is_development(&self) -> bool {
        matches!(self.mode, RunMode::Development(_))
    }
}
