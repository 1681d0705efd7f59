//! Turning a config file, a data directory and CLI flags into one
//! [`GatewayConfig`].
//!
//! Precedence, lowest first: built-in defaults, the TOML file, the data
//! directory conventions (`node.key`, `db/`), then explicit flags.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use dedi_protocol::config::{GatewayConfig, KmsBackend, StorageBackend};
use dedi_protocol::crypto::keys::NodeKeypair;

use crate::cli::{InitArgs, RunArgs};

pub const CONFIG_FILE: &str = "config.toml";
pub const KEY_FILE: &str = "node.key";
pub const DB_DIR: &str = "db";

/// Parse a TOML config file. Missing sections take their defaults.
pub fn load_file(path: &Path) -> Result<GatewayConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
}

/// Resolve the effective configuration for `run`.
pub fn resolve(args: &RunArgs) -> Result<GatewayConfig> {
    let default_path = args.data_dir.join(CONFIG_FILE);
    let mut config = match &args.config {
        Some(path) => load_file(path)?,
        None if default_path.exists() => load_file(&default_path)?,
        None => GatewayConfig::default(),
    };

    if args.ephemeral {
        config.backends.storage = StorageBackend::Memory;
        config.backends.kms = KmsBackend::Memory {
            secret_key_hex: None,
        };
    } else {
        apply_data_dir(&mut config, &args.data_dir);
    }

    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(name) = &args.node_name {
        config.node_name = name.clone();
    }
    if let Some(difficulty) = args.difficulty {
        config.admission.default_difficulty = difficulty;
    }

    config.validate()?;
    Ok(config)
}

/// Point default in-memory backends at the data directory. Backends the
/// config file chose explicitly are left alone.
fn apply_data_dir(config: &mut GatewayConfig, data_dir: &Path) {
    if config.backends.storage == StorageBackend::Memory {
        config.backends.storage = StorageBackend::Sled {
            path: data_dir.join(DB_DIR),
        };
    }
    let key_path = data_dir.join(KEY_FILE);
    if matches!(
        config.backends.kms,
        KmsBackend::Memory {
            secret_key_hex: None
        }
    ) && key_path.exists()
    {
        config.backends.kms = KmsBackend::KeyFile { path: key_path };
    }
}

/// What `init` wrote.
pub struct Initialized {
    pub key_path: PathBuf,
    pub config_path: PathBuf,
    pub keypair: NodeKeypair,
}

/// Create the data directory with a fresh node key and a starter config.
pub fn initialize(args: &InitArgs) -> Result<Initialized> {
    let data_dir = &args.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let key_path = data_dir.join(KEY_FILE);
    if key_path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists; pass --force to replace the node identity",
            key_path.display()
        );
    }
    let keypair = NodeKeypair::generate();
    std::fs::write(&key_path, keypair.to_hex())
        .with_context(|| format!("failed to write node key to {}", key_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict {}", key_path.display()))?;
    }

    let config_path = data_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        let mut config = GatewayConfig::default();
        config.endpoint = args.endpoint.clone();
        config.backends.storage = StorageBackend::Sled {
            path: data_dir.join(DB_DIR),
        };
        config.backends.kms = KmsBackend::KeyFile {
            path: key_path.clone(),
        };
        let text = toml::to_string_pretty(&config).context("failed to render config")?;
        std::fs::write(&config_path, text)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
    }

    Ok(Initialized {
        key_path,
        config_path,
        keypair,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;

    fn run_args(data_dir: &Path) -> RunArgs {
        RunArgs {
            config: None,
            data_dir: data_dir.to_path_buf(),
            listen: "127.0.0.1:0".into(),
            endpoint: None,
            node_name: None,
            difficulty: None,
            ephemeral: false,
            log_format: LogFormat::Pretty,
        }
    }

    #[test]
    fn init_then_resolve_uses_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let init = initialize(&InitArgs {
            data_dir: dir.path().to_path_buf(),
            endpoint: "http://10.1.2.3:8720".into(),
            force: false,
        })
        .unwrap();
        assert!(init.config_path.exists());

        let config = resolve(&run_args(dir.path())).unwrap();
        assert_eq!(config.endpoint, "http://10.1.2.3:8720");
        assert_eq!(
            config.backends.kms,
            KmsBackend::KeyFile {
                path: init.key_path.clone()
            }
        );
        assert_eq!(
            config.backends.storage,
            StorageBackend::Sled {
                path: dir.path().join(DB_DIR)
            }
        );
    }

    #[test]
    fn init_refuses_to_replace_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let args = InitArgs {
            data_dir: dir.path().to_path_buf(),
            endpoint: "http://127.0.0.1:8720".into(),
            force: false,
        };
        initialize(&args).unwrap();
        assert!(initialize(&args).is_err());
    }

    #[test]
    fn flags_override_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "node_name = \"from-file\"\n\n[admission]\ndefault_difficulty = 12\n",
        )
        .unwrap();

        let mut args = run_args(dir.path());
        args.config = Some(path);
        let config = resolve(&args).unwrap();
        assert_eq!(config.node_name, "from-file");
        assert_eq!(config.admission.default_difficulty, 12);

        args.difficulty = Some(22);
        args.node_name = Some("from-flag".into());
        let config = resolve(&args).unwrap();
        assert_eq!(config.node_name, "from-flag");
        assert_eq!(config.admission.default_difficulty, 22);
    }

    #[test]
    fn invalid_values_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = run_args(dir.path());
        args.ephemeral = true;
        args.difficulty = Some(300);
        assert!(resolve(&args).is_err());
    }
}
