use crate::services::blob::{BlobBackend, ClusterRegistry, FsBackend, MemoryBackend};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, sync::Arc, time::Duration};

pub const MIB: u64 = 1024 * 1024;

/// Smallest size a non-final multipart part may have.
pub const DEFAULT_MIN_PART_SIZE: u64 = 5 * MIB;
/// Largest single part accepted by `upload_part`.
pub const DEFAULT_MAX_PART_SIZE: u64 = 5 * 1024 * MIB;

/// Limits the write and multipart engines enforce.
#[derive(Debug, Clone, Copy)]
pub struct EngineLimits {
    pub min_part_size: u64,
    pub max_part_size: u64,
    /// Largest single read served by `read_range`.
    pub max_read_size: u64,
    /// Bytes moved per read/write while recompacting.
    pub copy_block: u64,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            min_part_size: DEFAULT_MIN_PART_SIZE,
            max_part_size: DEFAULT_MAX_PART_SIZE,
            max_read_size: 20 * MIB,
            copy_block: 8 * MIB,
        }
    }
}

/// One `name=kind[:path]` pool definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolSpec {
    Fs { name: String, root: PathBuf },
    Memory { name: String },
}

impl PoolSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let (name, kind) = raw
            .split_once('=')
            .with_context(|| format!("pool definition `{}` is missing `=`", raw))?;
        let name = name.trim();
        if name.is_empty() {
            bail!("pool definition `{}` has an empty name", raw);
        }
        match kind.trim().split_once(':') {
            Some(("fs", root)) if !root.is_empty() => Ok(Self::Fs {
                name: name.to_string(),
                root: PathBuf::from(root),
            }),
            None if kind.trim() == "memory" => Ok(Self::Memory {
                name: name.to_string(),
            }),
            _ => bail!("pool definition `{}` must be `name=fs:<dir>` or `name=memory`", raw),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Fs { name, .. } | Self::Memory { name } => name,
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: String,
    pub database_url: String,
    pub pools: Vec<PoolSpec>,
    pub default_pool: String,
    pub blob_pool_size: usize,
    pub min_part_size: u64,
    pub max_part_size: u64,
    pub heartbeat_idle: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Hierarchical object storage gateway")]
pub struct Args {
    /// Host to bind to (overrides HARBOR_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides HARBOR_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for default pool data (overrides HARBOR_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Database URL (overrides HARBOR_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Blob pool definition, `name=fs:<dir>` or `name=memory`; repeatable
    /// (overrides HARBOR_POOLS, comma separated)
    #[arg(long = "pool")]
    pub pools: Vec<String>,

    /// Pool used for new buckets (overrides HARBOR_DEFAULT_POOL)
    #[arg(long)]
    pub default_pool: Option<String>,

    /// Concurrent backend operations per pool (overrides HARBOR_BLOB_POOL_SIZE)
    #[arg(long)]
    pub blob_pool_size: Option<usize>,

    /// Minimum size of non-final multipart parts in bytes
    #[arg(long)]
    pub min_part_size: Option<u64>,

    /// Maximum size of a single multipart part in bytes
    #[arg(long)]
    pub max_part_size: Option<u64>,

    /// Seconds without progress before a completion heartbeat is sent
    #[arg(long)]
    pub heartbeat_idle_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    fn merge(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("HARBOR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse::<u16>("HARBOR_PORT")?.unwrap_or(3000);
        let env_data = env::var("HARBOR_DATA_DIR").unwrap_or_else(|_| "./data".into());
        let env_db = env::var("HARBOR_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/harbor.db".into());
        let env_pools = env::var("HARBOR_POOLS").unwrap_or_default();
        let env_default_pool =
            env::var("HARBOR_DEFAULT_POOL").unwrap_or_else(|_| "default".into());

        let data_dir = args.data_dir.unwrap_or(env_data);

        let raw_pools: Vec<String> = if args.pools.is_empty() {
            env_pools
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            args.pools
        };
        let mut pools = raw_pools
            .iter()
            .map(|raw| PoolSpec::parse(raw))
            .collect::<Result<Vec<_>>>()?;

        let default_pool = args.default_pool.unwrap_or(env_default_pool);
        if !pools.iter().any(|p| p.name() == default_pool) {
            pools.push(PoolSpec::Fs {
                name: default_pool.clone(),
                root: PathBuf::from(&data_dir).join("pools").join(&default_pool),
            });
        }

        let heartbeat_secs = match args.heartbeat_idle_secs {
            Some(secs) => secs,
            None => env_parse::<u64>("HARBOR_HEARTBEAT_IDLE_SECS")?.unwrap_or(10),
        };

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            data_dir,
            database_url: args.database_url.unwrap_or(env_db),
            pools,
            default_pool,
            blob_pool_size: match args.blob_pool_size {
                Some(size) => size,
                None => env_parse::<usize>("HARBOR_BLOB_POOL_SIZE")?.unwrap_or(16),
            },
            min_part_size: match args.min_part_size {
                Some(size) => size,
                None => env_parse::<u64>("HARBOR_MIN_PART_SIZE")?.unwrap_or(DEFAULT_MIN_PART_SIZE),
            },
            max_part_size: match args.max_part_size {
                Some(size) => size,
                None => env_parse::<u64>("HARBOR_MAX_PART_SIZE")?.unwrap_or(DEFAULT_MAX_PART_SIZE),
            },
            heartbeat_idle: Duration::from_secs(heartbeat_secs.max(1)),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn limits(&self) -> EngineLimits {
        EngineLimits {
            min_part_size: self.min_part_size,
            max_part_size: self.max_part_size,
            ..EngineLimits::default()
        }
    }

    /// Build the blob pool registry once at start-up.
    pub fn registry(&self) -> ClusterRegistry {
        let mut builder = ClusterRegistry::builder(self.blob_pool_size);
        for spec in &self.pools {
            let backend: Arc<dyn BlobBackend> = match spec {
                PoolSpec::Fs { root, .. } => Arc::new(FsBackend::new(root.clone())),
                PoolSpec::Memory { .. } => Arc::new(MemoryBackend::new()),
            };
            builder = builder.pool(spec.name(), backend);
        }
        builder.build()
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_specs_parse() {
        assert_eq!(
            PoolSpec::parse("hot=fs:/srv/hot").unwrap(),
            PoolSpec::Fs {
                name: "hot".into(),
                root: PathBuf::from("/srv/hot")
            }
        );
        assert_eq!(
            PoolSpec::parse("scratch=memory").unwrap(),
            PoolSpec::Memory {
                name: "scratch".into()
            }
        );
        assert!(PoolSpec::parse("nameless").is_err());
        assert!(PoolSpec::parse("=memory").is_err());
        assert!(PoolSpec::parse("x=s3:bucket").is_err());
    }

    #[test]
    fn default_pool_is_added_under_data_dir() {
        let args = Args::parse_from([
            "harbor-store",
            "--data-dir",
            "/tmp/harbor",
            "--pool",
            "cold=memory",
            "--min-part-size",
            "1024",
            "--heartbeat-idle-secs",
            "3",
        ]);
        let cfg = AppConfig::merge(args).unwrap();
        assert_eq!(cfg.pools.len(), 2);
        assert!(cfg.pools.iter().any(|p| p.name() == cfg.default_pool));
        assert_eq!(cfg.limits().min_part_size, 1024);
        assert_eq!(cfg.heartbeat_idle, Duration::from_secs(3));
        let registry = cfg.registry();
        assert!(registry.open("cold").is_ok());
        assert!(registry.open(&cfg.default_pool).is_ok());
    }
}
