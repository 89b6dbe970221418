//! stet: Split-Trust Encryption Tool CLI
//!
//! Usage:
//!   stet encrypt [--config stet.toml] [--blob-id ID] <input> <output>
//!   stet decrypt [--config stet.toml] <input> <output>
//!   stet version
//!
//! `-` means stdin/stdout. Decrypt output is staged (temp file or memory)
//! and only materialised after the whole stream authenticates, so a failed
//! decrypt leaves no partial plaintext behind.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stet_client::{SecureSessionFactory, StetClient};
use stet_core::config::{AsymmetricKeys, DecryptConfig, EkmTlsOptions, EncryptConfig};
use stet_ekm::StaticTokenProvider;
use stet_kms::LazyKmsClient;

#[derive(Parser, Debug)]
#[command(name = "stet", version, about = "Split-Trust Encryption Tool")]
struct Cli {
    /// Path to stet.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "STET_CONFIG",
        default_value = "/etc/stet/stet.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "STET_LOG", default_value = "warn")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "STET_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Bearer token presented to external key managers
    #[arg(long, env = "STET_EKM_TOKEN", hide_env_values = true)]
    ekm_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a file into a STET container
    Encrypt {
        /// Input path, or `-` for stdin
        input: String,
        /// Output path, or `-` for stdout
        output: String,
        /// Blob identifier bound into the authenticated metadata
        /// (default: random UUID)
        #[arg(long)]
        blob_id: Option<String>,
    },

    /// Decrypt a STET container
    Decrypt {
        /// Input path, or `-` for stdin
        input: String,
        /// Output path, or `-` for stdout
        output: String,
    },

    /// Print version information
    Version,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

/// Top-level stet.toml layout.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct StetConfig {
    encrypt: Option<EncryptConfig>,
    decrypt: Option<DecryptConfig>,
    keys: AsymmetricKeys,
    kms: KmsConfig,
    ekm: EkmTlsOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct KmsConfig {
    /// Cloud KMS gRPC endpoint
    endpoint: String,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://cloudkms.googleapis.com".into(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log, &cli.log_format);

    match cli.command {
        Commands::Encrypt {
            input,
            output,
            blob_id,
        } => cmd_encrypt(&cli.config, cli.ekm_token, &input, &output, blob_id).await,
        Commands::Decrypt { input, output } => {
            cmd_decrypt(&cli.config, cli.ekm_token, &input, &output).await
        }
        Commands::Version => {
            println!("stet {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn cmd_encrypt(
    config_path: &Path,
    ekm_token: Option<String>,
    input: &str,
    output: &str,
    blob_id: Option<String>,
) -> Result<()> {
    let config = load_config(config_path).await?;
    let encrypt_config = config
        .encrypt
        .clone()
        .with_context(|| format!("{} has no [encrypt] section", config_path.display()))?;

    let client = build_client(&config, ekm_token);
    let cancel = cancel_on_ctrl_c();

    let mut reader = open_input(input)?;
    let mut staged = StagedOutput::create(output)?;
    let mut writer = staged.writer();
    let result = client
        .encrypt(
            &mut reader,
            &mut writer,
            &encrypt_config,
            &config.keys,
            blob_id,
            &cancel,
        )
        .await?;
    staged.commit()?;

    info!(blob_id = %result.blob_id, "encrypted");
    for uri in &result.key_uris_used {
        eprintln!("used key: {uri}");
    }
    eprintln!("blob ID: {}", result.blob_id);
    Ok(())
}

async fn cmd_decrypt(
    config_path: &Path,
    ekm_token: Option<String>,
    input: &str,
    output: &str,
) -> Result<()> {
    let config = load_config(config_path).await?;
    let decrypt_config = config
        .decrypt
        .clone()
        .with_context(|| format!("{} has no [decrypt] section", config_path.display()))?;

    let client = build_client(&config, ekm_token);
    let cancel = cancel_on_ctrl_c();

    let mut reader = open_input(input)?;
    let mut staged = StagedOutput::create(output)?;
    let mut writer = staged.writer();
    let result = client
        .decrypt(
            &mut reader,
            &mut writer,
            &decrypt_config,
            &config.keys,
            &cancel,
        )
        .await?;
    staged.commit()?;

    info!(blob_id = %result.blob_id, "decrypted");
    for uri in &result.key_uris_used {
        eprintln!("used key: {uri}");
    }
    eprintln!("blob ID: {}", result.blob_id);
    Ok(())
}

fn build_client(config: &StetConfig, ekm_token: Option<String>) -> StetClient {
    let kms = LazyKmsClient::new(config.kms.endpoint.clone());
    let token_provider = StaticTokenProvider::new(ekm_token.unwrap_or_default());
    let ekm = SecureSessionFactory::new(Arc::new(token_provider), config.ekm.clone());
    StetClient::new(Arc::new(kms), Arc::new(ekm))
}

async fn load_config(path: &Path) -> Result<StetConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    } else {
        warn!("config file not found: {} (using defaults)", path.display());
        Ok(StetConfig::default())
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            handle.cancel();
        }
    });
    cancel
}

fn open_input(spec: &str) -> Result<Box<dyn Read>> {
    if spec == "-" {
        Ok(Box::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(spec).with_context(|| format!("opening {spec}"))?;
        Ok(Box::new(file))
    }
}

/// Output staging: a temp file next to the destination (renamed into place
/// on success) or an in-memory buffer for stdout. Nothing user-visible is
/// produced unless the operation completes.
enum StagedOutput {
    File {
        temp: tempfile::NamedTempFile,
        destination: PathBuf,
    },
    Stdout {
        buffer: Vec<u8>,
    },
}

impl StagedOutput {
    fn create(spec: &str) -> Result<Self> {
        if spec == "-" {
            return Ok(Self::Stdout { buffer: Vec::new() });
        }
        let destination = PathBuf::from(spec);
        let dir = destination
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let temp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        Ok(Self::File { temp, destination })
    }

    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Self::File { temp, .. } => temp.as_file_mut(),
            Self::Stdout { buffer } => buffer,
        }
    }

    fn commit(self) -> Result<()> {
        match self {
            Self::File { temp, destination } => {
                temp.persist(&destination)
                    .with_context(|| format!("writing {}", destination.display()))?;
                Ok(())
            }
            Self::Stdout { buffer } => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&buffer)?;
                stdout.flush()?;
                Ok(())
            }
        }
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, EnvFilter};

    // With `-` as input or output, stdout carries blob or plaintext bytes
    // and stdin carries data; diagnostics must stay on stderr in every
    // format.
    let builder = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[encrypt.key_config]
split = { shamir = { shares = 2, threshold = 2 } }
kek_infos = [
    { kek_uri = "gcp-kms://projects/p/locations/l/keyRings/r/cryptoKeys/k" },
    { rsa_fingerprint = "Zm9v" },
]

[[decrypt.key_configs]]
split = "none"
kek_infos = [{ kek_uri = "gcp-kms://projects/p/locations/l/keyRings/r/cryptoKeys/k" }]

[keys]
public_key_files = ["/tmp/pub.pem"]
private_key_files = ["/tmp/priv.pem"]

[kms]
endpoint = "https://kms.internal:443"

[ekm]
insecure_skip_verify = true
"#;
        let config: StetConfig = toml::from_str(toml_str).unwrap();

        let encrypt = config.encrypt.unwrap();
        encrypt.key_config.validate().unwrap();
        assert_eq!(encrypt.key_config.kek_infos.len(), 2);

        let decrypt = config.decrypt.unwrap();
        assert_eq!(decrypt.key_configs.len(), 1);

        assert_eq!(config.keys.public_key_files.len(), 1);
        assert_eq!(config.kms.endpoint, "https://kms.internal:443");
        assert!(config.ekm.insecure_skip_verify);
    }

    #[test]
    fn test_parse_defaults() {
        let config: StetConfig = toml::from_str("").unwrap();
        assert!(config.encrypt.is_none());
        assert!(config.decrypt.is_none());
        assert_eq!(config.kms.endpoint, "https://cloudkms.googleapis.com");
        assert!(!config.ekm.insecure_skip_verify);
    }

    #[test]
    fn test_staged_output_commits_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("out.bin");

        let mut staged = StagedOutput::create(destination.to_str().unwrap()).unwrap();
        staged.writer().write_all(b"done").unwrap();
        assert!(!destination.exists());

        staged.commit().unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"done");
    }

    #[test]
    fn test_staged_output_dropped_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("out.bin");

        {
            let mut staged = StagedOutput::create(destination.to_str().unwrap()).unwrap();
            staged.writer().write_all(b"partial").unwrap();
        }
        assert!(!destination.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "temp file must be cleaned up");
    }
}
