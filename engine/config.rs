use crate::cluster::ClusterMode;
use clap::{CommandFactory, Parser};
use serde::Deserialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_BINARY_PORT: u16 = 9091;
pub const DEFAULT_HTTP_PORT: u16 = 9090;
pub const DEFAULT_WORKER_POOL_SIZE: usize = 8;
pub const DEFAULT_DYNAMIC_WATCHDOG_TIME_LIMIT_MS: u32 = 10_000;
pub const DEFAULT_RESERVED_GPU_MEM: usize = 1 << 27;
pub const DEFAULT_RENDER_MEM_BYTES: usize = 500_000_000;
pub const DEFAULT_CALCITE_MAX_MEM: usize = 1024;

pub const CATALOG_DIR: &str = "mapd_catalogs";
pub const SYSTEM_DB: &str = "mapd";
pub const DATA_DIR: &str = "mapd_data";
pub const LOG_DIR: &str = "mapd_log";

const USAGE: &str = "mapd_server <catalog path> [--cpu|--gpu] [-p <port number>] \
                     [--http-port <http port number>] [--flush-log] [--version|-v]";

#[derive(Parser, Debug, Clone)]
#[command(name = "mapd_server", override_usage = USAGE, disable_version_flag = true)]
pub struct Cli {
    /// Directory path to MapD catalogs
    #[arg(value_name = "DATA", conflicts_with = "data")]
    pub data_dir: Option<String>,

    /// Directory path to MapD catalogs
    #[arg(long, value_name = "PATH")]
    pub data: Option<String>,

    /// Path to mapd.conf
    #[arg(long, value_name = "FILE")]
    pub config: Option<String>,

    /// Run on CPU only
    #[arg(long, conflicts_with = "gpu")]
    pub cpu: bool,

    /// Run on GPUs (Default)
    #[arg(long)]
    pub gpu: bool,

    /// Enable read-only mode
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub read_only: Option<bool>,

    /// Port number
    #[arg(short, long)]
    pub port: Option<u16>,

    /// HTTP port number
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Immediately flush logs to disk. Set to false if this is a performance bottleneck.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub flush_log: Option<bool>,

    /// Size of memory reserved for CPU buffers [bytes]
    #[arg(long)]
    pub cpu_buffer_mem_bytes: Option<usize>,

    /// Number of gpus to use
    #[arg(long, allow_negative_numbers = true)]
    pub num_gpus: Option<i32>,

    /// First gpu to use
    #[arg(long)]
    pub start_gpu: Option<i32>,

    /// Print Release Version Number
    #[arg(short, long)]
    pub version: bool,

    /// Print advanced help messages
    #[arg(long)]
    pub help_advanced: bool,

    /// Calcite port number
    #[arg(long, hide = true, allow_negative_numbers = true)]
    pub calcite_port: Option<i32>,

    /// Enable debugger support for the JIT
    #[arg(long, hide = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub jit_debug: Option<bool>,

    /// Disable execution over multiple fragments in a single round-trip to GPU
    #[arg(long, hide = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub disable_multifrag: Option<bool>,

    /// Enable loop joins
    #[arg(long, hide = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub allow_loop_joins: Option<bool>,

    /// Reserved memory for GPU, not use mapd allocator
    #[arg(long, hide = true)]
    pub res_gpu_mem: Option<usize>,

    /// Disable legacy syntax
    #[arg(long, hide = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub disable_legacy_syntax: Option<bool>,

    /// Server thread pool size. Increasing may adversely affect render performance and stability.
    #[arg(long, hide = true)]
    pub tthreadpool_size: Option<usize>,

    /// Number of reader threads to use
    #[arg(long, hide = true)]
    pub num_reader_threads: Option<usize>,

    /// Enable watchdog
    #[arg(long, hide = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub enable_watchdog: Option<bool>,

    /// Enable dynamic watchdog
    #[arg(long, hide = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub enable_dynamic_watchdog: Option<bool>,

    /// Dynamic watchdog time limit, in milliseconds
    #[arg(long, hide = true, num_args = 0..=1, require_equals = true, default_missing_value = "10000")]
    pub dynamic_watchdog_time_limit: Option<u32>,

    /// Value of epoch to 'rollback' to
    #[arg(long, hide = true, allow_negative_numbers = true)]
    pub start_epoch: Option<i32>,

    /// Size of block to use on GPU
    #[arg(long, hide = true)]
    pub cuda_block_size: Option<usize>,

    /// Size of grid to use on GPU
    #[arg(long, hide = true)]
    pub cuda_grid_size: Option<usize>,

    /// Max memory available to calcite JVM
    #[arg(long, hide = true)]
    pub calcite_max_mem: Option<usize>,

    /// Directory path to mapd DB to convert from
    #[arg(long, hide = true, value_name = "DIR")]
    pub db_convert: Option<String>,

    /// Use the new result set
    #[arg(long, hide = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub use_result_set: Option<bool>,

    /// Use 64-bit count. A bare flag turns it off.
    #[arg(long, hide = true, num_args = 0..=1, require_equals = true, default_missing_value = "false")]
    pub bigint_count: Option<bool>,

    /// Allow the queries which failed on GPU to retry on CPU, even when watchdog is enabled
    #[arg(long, hide = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub allow_cpu_retry: Option<bool>,

    /// Path to file containing mapd queries
    #[arg(long, hide = true, value_name = "FILE")]
    pub db_query_list: Option<String>,

    /// Cluster config; run as aggregator over the listed leaves
    #[arg(long, hide = true, value_name = "FILE")]
    pub cluster: Option<String>,

    /// String server config; run as a db leaf
    #[arg(long, hide = true, value_name = "FILE")]
    pub string_servers: Option<String>,

    /// High availability group id
    #[arg(long, hide = true)]
    pub ha_group_id: Option<String>,

    /// High availability unique server id
    #[arg(long, hide = true)]
    pub ha_unique_server_id: Option<String>,

    /// High availability brokers
    #[arg(long, hide = true)]
    pub ha_brokers: Option<String>,

    /// High availability shared data directory
    #[arg(long, hide = true)]
    pub ha_shared_data: Option<String>,
}

impl Cli {
    pub fn print_advanced_help() -> std::io::Result<()> {
        let mut cmd = Cli::command();
        let ids: Vec<String> = cmd
            .get_arguments()
            .map(|arg| arg.get_id().to_string())
            .collect();
        for id in ids {
            cmd = cmd.mut_arg(id, |arg| arg.hide(false));
        }
        cmd.print_help()
    }

    fn fill_from(&mut self, file: ConfigFile) {
        macro_rules! fill {
            ($cli:ident, $file:ident; $($field:ident),* $(,)?) => {
                $( if $cli.$field.is_none() { $cli.$field = $file.$field; } )*
            };
        }

        let cli = self;
        fill!(
            cli, file;
            data,
            read_only,
            port,
            http_port,
            flush_log,
            cpu_buffer_mem_bytes,
            num_gpus,
            start_gpu,
            calcite_port,
            jit_debug,
            disable_multifrag,
            allow_loop_joins,
            res_gpu_mem,
            disable_legacy_syntax,
            tthreadpool_size,
            num_reader_threads,
            enable_watchdog,
            enable_dynamic_watchdog,
            dynamic_watchdog_time_limit,
            start_epoch,
            cuda_block_size,
            cuda_grid_size,
            calcite_max_mem,
            db_convert,
            use_result_set,
            bigint_count,
            allow_cpu_retry,
            db_query_list,
            cluster,
            string_servers,
            ha_group_id,
            ha_unique_server_id,
            ha_brokers,
            ha_shared_data,
        );

        cli.cpu |= file.cpu.unwrap_or(false);
        cli.gpu |= file.gpu.unwrap_or(false);
    }
}

/// Keys mirror the long flag names. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ConfigFile {
    data: Option<String>,
    cpu: Option<bool>,
    gpu: Option<bool>,
    read_only: Option<bool>,
    port: Option<u16>,
    http_port: Option<u16>,
    flush_log: Option<bool>,
    cpu_buffer_mem_bytes: Option<usize>,
    num_gpus: Option<i32>,
    start_gpu: Option<i32>,
    calcite_port: Option<i32>,
    jit_debug: Option<bool>,
    disable_multifrag: Option<bool>,
    allow_loop_joins: Option<bool>,
    res_gpu_mem: Option<usize>,
    disable_legacy_syntax: Option<bool>,
    tthreadpool_size: Option<usize>,
    num_reader_threads: Option<usize>,
    enable_watchdog: Option<bool>,
    enable_dynamic_watchdog: Option<bool>,
    dynamic_watchdog_time_limit: Option<u32>,
    start_epoch: Option<i32>,
    cuda_block_size: Option<usize>,
    cuda_grid_size: Option<usize>,
    calcite_max_mem: Option<usize>,
    db_convert: Option<String>,
    use_result_set: Option<bool>,
    bigint_count: Option<bool>,
    allow_cpu_retry: Option<bool>,
    db_query_list: Option<String>,
    cluster: Option<String>,
    string_servers: Option<String>,
    ha_group_id: Option<String>,
    ha_unique_server_id: Option<String>,
    ha_brokers: Option<String>,
    ha_shared_data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaParameter {
    UniqueServerId,
    Brokers,
    SharedData,
}

impl fmt::Display for HaParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = match self {
            HaParameter::UniqueServerId => "--ha-unique-server-id",
            HaParameter::Brokers => "--ha-brokers",
            HaParameter::SharedData => "--ha-shared-data",
        };
        f.write_str(flag)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Usage Error: {0}")]
    Usage(String),

    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config file {path}: {source}")]
    FileParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Usage Error: --cluster and --string-servers cannot both be specified")]
    ClusterModeConflict,

    #[error("Starting server in HA mode {0} must be set")]
    MissingHaParameter(HaParameter),
}

impl ConfigError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ConfigError::MissingHaParameter(HaParameter::UniqueServerId) => 5,
            ConfigError::MissingHaParameter(HaParameter::Brokers) => 6,
            ConfigError::MissingHaParameter(HaParameter::SharedData) => 7,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Cpu,
    Gpu,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::Cpu => f.write_str("cpu"),
            DeviceMode::Gpu => f.write_str("gpu"),
        }
    }
}

/// Execution toggles handed to the request processor unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPolicy {
    pub read_only: bool,
    pub allow_multifrag: bool,
    pub allow_loop_joins: bool,
    pub enable_legacy_syntax: bool,
    pub enable_watchdog: bool,
    pub enable_dynamic_watchdog: bool,
    pub dynamic_watchdog_time_limit_ms: u32,
    pub jit_debug: bool,
    pub allow_cpu_retry: bool,
    pub use_result_set: bool,
    pub bigint_count: bool,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            read_only: false,
            allow_multifrag: true,
            allow_loop_joins: false,
            enable_legacy_syntax: true,
            enable_watchdog: true,
            enable_dynamic_watchdog: false,
            dynamic_watchdog_time_limit_ms: DEFAULT_DYNAMIC_WATCHDOG_TIME_LIMIT_MS,
            jit_debug: false,
            allow_cpu_retry: false,
            use_result_set: true,
            bigint_count: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySettings {
    /// 0 lets the processor size CPU buffers from available memory.
    pub cpu_buffer_mem_bytes: usize,
    pub render_mem_bytes: usize,
    pub reserved_gpu_mem: usize,
    /// -1 uses every GPU detected.
    pub num_gpus: i32,
    pub start_gpu: i32,
    pub num_reader_threads: usize,
    pub cuda_block_size: usize,
    pub cuda_grid_size: usize,
    pub calcite_max_mem: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            cpu_buffer_mem_bytes: 0,
            render_mem_bytes: DEFAULT_RENDER_MEM_BYTES,
            reserved_gpu_mem: DEFAULT_RESERVED_GPU_MEM,
            num_gpus: -1,
            start_gpu: 0,
            num_reader_threads: 0,
            cuda_block_size: 0,
            cuda_grid_size: 0,
            calcite_max_mem: DEFAULT_CALCITE_MAX_MEM,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HaParameters {
    pub group_id: String,
    pub unique_server_id: String,
    pub brokers: String,
    pub shared_data: String,
}

impl HaParameters {
    pub fn is_enabled(&self) -> bool {
        !self.group_id.is_empty()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.unique_server_id.is_empty() {
            return Err(ConfigError::MissingHaParameter(HaParameter::UniqueServerId));
        }
        if self.brokers.is_empty() {
            return Err(ConfigError::MissingHaParameter(HaParameter::Brokers));
        }
        if self.shared_data.is_empty() {
            return Err(ConfigError::MissingHaParameter(HaParameter::SharedData));
        }
        Ok(())
    }
}

/// Immutable server configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub binary_port: u16,
    pub http_port: u16,
    pub worker_pool_size: usize,
    pub device: DeviceMode,
    pub execution: ExecutionPolicy,
    pub memory: MemorySettings,
    pub start_epoch: i32,
    pub calcite_port: i32,
    pub flush_log: bool,
    pub cluster: ClusterMode,
    pub ha: HaParameters,
    pub warmup_script: Option<PathBuf>,
    pub db_convert_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            binary_port: DEFAULT_BINARY_PORT,
            http_port: DEFAULT_HTTP_PORT,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            device: DeviceMode::Gpu,
            execution: ExecutionPolicy::default(),
            memory: MemorySettings::default(),
            start_epoch: -1,
            calcite_port: -1,
            flush_log: true,
            cluster: ClusterMode::Standalone,
            ha: HaParameters::default(),
            warmup_script: None,
            db_convert_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn resolve(mut cli: Cli) -> Result<Self, ConfigError> {
        if let Some(raw) = cli.config.as_deref() {
            let path = PathBuf::from(trim_quotes(raw));
            cli.fill_from(read_config_file(&path)?);
        }

        let defaults = ServerConfig::default();
        let data_dir = cli
            .data_dir
            .or(cli.data)
            .map(|raw| PathBuf::from(trim_quotes(&raw)))
            .unwrap_or(defaults.data_dir);

        let worker_pool_size = cli.tthreadpool_size.unwrap_or(defaults.worker_pool_size);
        if worker_pool_size == 0 {
            return Err(ConfigError::Usage(
                "--tthreadpool-size must be at least 1".to_string(),
            ));
        }

        let memory = MemorySettings {
            cpu_buffer_mem_bytes: cli
                .cpu_buffer_mem_bytes
                .unwrap_or(defaults.memory.cpu_buffer_mem_bytes),
            render_mem_bytes: defaults.memory.render_mem_bytes,
            reserved_gpu_mem: cli.res_gpu_mem.unwrap_or(defaults.memory.reserved_gpu_mem),
            num_gpus: cli.num_gpus.unwrap_or(defaults.memory.num_gpus),
            start_gpu: cli.start_gpu.unwrap_or(defaults.memory.start_gpu),
            num_reader_threads: cli
                .num_reader_threads
                .unwrap_or(defaults.memory.num_reader_threads),
            cuda_block_size: cli.cuda_block_size.unwrap_or(defaults.memory.cuda_block_size),
            cuda_grid_size: cli.cuda_grid_size.unwrap_or(defaults.memory.cuda_grid_size),
            calcite_max_mem: cli.calcite_max_mem.unwrap_or(defaults.memory.calcite_max_mem),
        };

        let device = if (cli.cpu && !cli.gpu) || memory.num_gpus == 0 {
            DeviceMode::Cpu
        } else {
            DeviceMode::Gpu
        };

        let base = &defaults.execution;
        let execution = ExecutionPolicy {
            read_only: cli.read_only.unwrap_or(base.read_only),
            allow_multifrag: cli
                .disable_multifrag
                .map(|disabled| !disabled)
                .unwrap_or(base.allow_multifrag),
            allow_loop_joins: cli.allow_loop_joins.unwrap_or(base.allow_loop_joins),
            enable_legacy_syntax: cli
                .disable_legacy_syntax
                .map(|disabled| !disabled)
                .unwrap_or(base.enable_legacy_syntax),
            enable_watchdog: cli.enable_watchdog.unwrap_or(base.enable_watchdog),
            enable_dynamic_watchdog: cli
                .enable_dynamic_watchdog
                .unwrap_or(base.enable_dynamic_watchdog),
            dynamic_watchdog_time_limit_ms: cli
                .dynamic_watchdog_time_limit
                .unwrap_or(base.dynamic_watchdog_time_limit_ms),
            jit_debug: cli.jit_debug.unwrap_or(base.jit_debug),
            allow_cpu_retry: cli.allow_cpu_retry.unwrap_or(base.allow_cpu_retry),
            use_result_set: cli.use_result_set.unwrap_or(base.use_result_set),
            bigint_count: cli.bigint_count.unwrap_or(base.bigint_count),
        };

        let cluster = match (optional_path(cli.cluster), optional_path(cli.string_servers)) {
            (Some(_), Some(_)) => return Err(ConfigError::ClusterModeConflict),
            (Some(config), None) => ClusterMode::Aggregator { config },
            (None, Some(config)) => ClusterMode::StringServers { config },
            (None, None) => ClusterMode::Standalone,
        };

        let ha = HaParameters {
            group_id: cli.ha_group_id.unwrap_or_default(),
            unique_server_id: cli.ha_unique_server_id.unwrap_or_default(),
            brokers: cli.ha_brokers.unwrap_or_default(),
            shared_data: cli.ha_shared_data.unwrap_or_default(),
        };
        ha.validate()?;

        Ok(ServerConfig {
            data_dir,
            binary_port: cli.port.unwrap_or(defaults.binary_port),
            http_port: cli.http_port.unwrap_or(defaults.http_port),
            worker_pool_size,
            device,
            execution,
            memory,
            start_epoch: cli.start_epoch.unwrap_or(defaults.start_epoch),
            calcite_port: cli.calcite_port.unwrap_or(defaults.calcite_port),
            flush_log: cli.flush_log.unwrap_or(defaults.flush_log),
            cluster,
            ha,
            warmup_script: optional_path(cli.db_query_list),
            db_convert_dir: optional_path(cli.db_convert),
        })
    }

    pub fn binary_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.binary_port))
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.http_port))
    }

    pub fn system_catalog_path(&self) -> PathBuf {
        self.data_dir.join(CATALOG_DIR).join(SYSTEM_DB)
    }

    pub fn data_store_path(&self) -> PathBuf {
        self.data_dir.join(DATA_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join(LOG_DIR)
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::FileParse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn trim_quotes(raw: &str) -> &str {
    raw.trim_matches(|c| c == '"' || c == '\'')
}

fn optional_path(raw: Option<String>) -> Option<PathBuf> {
    raw.map(|value| trim_quotes(&value).to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
