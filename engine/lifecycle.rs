use crate::cluster::{ClusterConfigError, ClusterTopology};
use crate::config::{ConfigError, ServerConfig};
use crate::handler::Processor;
use crate::instance_lock::{InstanceLock, InstanceLockError};
use crate::protocol::{DualProtocolServer, ServerPair, TransportError};
use crate::telemetry::{self, LogFile, ServerMetrics};
use crate::warmup::{self, WarmupReport};
use nix::sys::signal::Signal;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Validating,
    LockAcquired,
    Serving,
    Terminated,
    FatalAborted,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{message}")]
    Precondition { message: String },

    #[error(transparent)]
    Lock(#[from] InstanceLockError),

    #[error(transparent)]
    ClusterConfig(#[from] ClusterConfigError),

    #[error("Failed to initialize logging: {0:#}")]
    Logging(anyhow::Error),

    #[error("Failed to register signal handler: {0}")]
    Signal(#[source] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("No High Availability module available, please contact MapD support")]
    HaUnavailable,
}

impl BootstrapError {
    pub fn exit_code(&self) -> u8 {
        match self {
            BootstrapError::Config(e) => e.exit_code(),
            _ => 1,
        }
    }

    fn precondition(message: String) -> Self {
        BootstrapError::Precondition { message }
    }
}

/// Validated startup: preconditions checked, instance lock held, logging on.
pub struct Lifecycle {
    config: ServerConfig,
    topology: ClusterTopology,
    lock: InstanceLock,
    log_file: LogFile,
    state: LifecycleState,
}

impl Lifecycle {
    pub async fn new(config: ServerConfig) -> Result<Self, BootstrapError> {
        verify_preconditions(&config)?;

        let topology = config.cluster.load_topology()?;
        let lock = InstanceLock::for_data_dir(&config.data_dir)?;
        let log_file = telemetry::init(&config.log_dir(), config.flush_log)
            .map_err(BootstrapError::Logging)?;

        let mut lifecycle = Self {
            config,
            topology,
            lock,
            log_file,
            state: LifecycleState::Validating,
        };
        lifecycle.state = transition(lifecycle.state, LifecycleState::LockAcquired);
        log_startup_parameters(&lifecycle.config);

        Ok(lifecycle)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Builds the processor, opens both listeners and kicks off warmup.
    pub async fn start(self) -> Result<Serving, BootstrapError> {
        match self.try_start().await {
            Ok(serving) => Ok(serving),
            Err(e) => {
                transition(LifecycleState::LockAcquired, LifecycleState::FatalAborted);
                tracing::error!("Startup aborted: {}", e);
                Err(e)
            }
        }
    }

    async fn try_start(self) -> Result<Serving, BootstrapError> {
        let Lifecycle {
            config,
            topology,
            lock,
            log_file,
            state,
        } = self;

        let signal_task = register_termination_handler(log_file.clone())?;

        let processor = Arc::new(Processor::new(&config, topology));

        if config.ha.is_enabled() {
            return Err(BootstrapError::HaUnavailable);
        }

        let server = DualProtocolServer::start(
            processor.clone(),
            config.worker_pool_size,
            config.binary_addr(),
            config.http_addr(),
        )
        .await?;

        let metrics = server.metrics();
        let metrics_task = {
            let metrics = metrics.clone();
            tokio::spawn(async move { metrics.report_loop().await })
        };

        let warmup = spawn_warmup(
            processor.clone(),
            config.warmup_script.clone().unwrap_or_default(),
            metrics,
        );

        let state = transition(state, LifecycleState::Serving);

        Ok(Serving {
            server,
            processor,
            warmup: Some(warmup),
            metrics_task,
            signal_task,
            lock,
            log_file,
            state,
        })
    }

    pub async fn run(self) -> Result<(), BootstrapError> {
        let serving = self.start().await?;
        serving.wait().await;
        Ok(())
    }
}

/// A server with both listeners accepting. Dropping it releases the lock.
pub struct Serving {
    server: ServerPair,
    processor: Arc<Processor>,
    warmup: Option<JoinHandle<WarmupReport>>,
    metrics_task: JoinHandle<()>,
    signal_task: JoinHandle<()>,
    lock: InstanceLock,
    log_file: LogFile,
    state: LifecycleState,
}

impl Serving {
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn local_addrs(&self) -> (SocketAddr, SocketAddr) {
        self.server.local_addrs()
    }

    pub fn processor(&self) -> Arc<Processor> {
        self.processor.clone()
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.server.metrics()
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Waits for the warmup replay. Returns `None` once it has been taken.
    pub async fn warmup_finished(&mut self) -> Option<WarmupReport> {
        let handle = self.warmup.take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!("Warmup task failed: {}", e);
                None
            }
        }
    }

    /// Blocks until both listeners stop accepting.
    pub async fn wait(self) -> LifecycleState {
        let Serving {
            server,
            metrics_task,
            signal_task,
            lock,
            log_file,
            state,
            ..
        } = self;

        server.wait().await;

        metrics_task.abort();
        signal_task.abort();
        let state = transition(state, LifecycleState::Terminated);
        if let Err(e) = log_file.flush() {
            eprintln!("Failed to flush {}: {}", log_file.path().display(), e);
        }
        drop(lock);
        state
    }
}

fn transition(from: LifecycleState, to: LifecycleState) -> LifecycleState {
    tracing::info!("Server state {:?} -> {:?}", from, to);
    to
}

fn verify_preconditions(config: &ServerConfig) -> Result<(), BootstrapError> {
    if let Some(script) = &config.warmup_script {
        require(script, |p| format!("File containing DB queries {} does not exist.", p))?;
    }
    if let Some(dir) = &config.db_convert_dir {
        require(dir, |p| format!("Data conversion source directory {} does not exist.", p))?;
    }

    require(&config.data_dir, |p| format!("Data directory {} does not exist.", p))?;
    require(&config.system_catalog_path(), |p| {
        format!("MapD system catalogs does not exist at {}. Run initdb", p)
    })?;
    require(&config.data_store_path(), |p| {
        format!("MapD data directory does not exist at {}. Run initdb", p)
    })?;

    Ok(())
}

fn require(path: &Path, describe: impl FnOnce(String) -> String) -> Result<(), BootstrapError> {
    if path.exists() {
        Ok(())
    } else {
        Err(BootstrapError::precondition(describe(path.display().to_string())))
    }
}

fn log_startup_parameters(config: &ServerConfig) {
    let policy = &config.execution;
    let memory = &config.memory;

    tracing::info!("MapD Server {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!(
        "Binary port {}, HTTP port {}, worker pool size {}",
        config.binary_port,
        config.http_port,
        config.worker_pool_size
    );
    tracing::info!(
        "Device mode {} (num gpus {}, start gpu {})",
        config.device,
        memory.num_gpus,
        memory.start_gpu
    );
    tracing::info!("Watchdog is set to {}", policy.enable_watchdog);
    tracing::info!(
        "Dynamic Watchdog is set to {} with time limit {} ms",
        policy.enable_dynamic_watchdog,
        policy.dynamic_watchdog_time_limit_ms
    );
    tracing::info!(
        "Read only {}, multifrag {}, loop joins {}, legacy syntax {}",
        policy.read_only,
        policy.allow_multifrag,
        policy.allow_loop_joins,
        policy.enable_legacy_syntax
    );
    tracing::info!(
        "CPU buffer {} bytes, reserved GPU mem {} bytes, render mem {} bytes",
        memory.cpu_buffer_mem_bytes,
        memory.reserved_gpu_mem,
        memory.render_mem_bytes
    );
    if config.cluster.is_distributed() {
        tracing::info!("Cluster mode: {:?}", config.cluster);
    }
}

fn register_termination_handler(log_file: LogFile) -> Result<JoinHandle<()>, BootstrapError> {
    let mut terminate = signal(SignalKind::terminate()).map_err(BootstrapError::Signal)?;

    Ok(tokio::spawn(async move {
        if terminate.recv().await.is_none() {
            return;
        }

        let signum = Signal::SIGTERM as i32;
        tracing::info!("Interrupt signal ({}) received.", signum);
        if let Err(e) = log_file.flush() {
            eprintln!("Failed to flush {}: {}", log_file.path().display(), e);
        }
        std::process::exit(signum);
    }))
}

fn spawn_warmup(
    processor: Arc<Processor>,
    script: PathBuf,
    metrics: Arc<ServerMetrics>,
) -> JoinHandle<WarmupReport> {
    tokio::task::spawn_blocking(move || {
        let report = warmup::run(processor.as_ref(), &script);
        metrics.add_warmup_queries(report.queries_executed as u64);
        report
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HaParameter, CATALOG_DIR, DATA_DIR, SYSTEM_DB};

    fn config_for(dir: &Path) -> ServerConfig {
        ServerConfig {
            data_dir: dir.to_path_buf(),
            ..ServerConfig::default()
        }
    }

    fn seed_data_dir(dir: &Path) {
        std::fs::create_dir_all(dir.join(CATALOG_DIR).join(SYSTEM_DB)).unwrap();
        std::fs::create_dir_all(dir.join(DATA_DIR)).unwrap();
    }

    #[test]
    fn exit_codes_follow_the_error_kind() {
        let ha = BootstrapError::from(ConfigError::MissingHaParameter(HaParameter::Brokers));
        assert_eq!(ha.exit_code(), 6);
        assert_eq!(BootstrapError::HaUnavailable.exit_code(), 1);
        assert_eq!(BootstrapError::precondition("x".into()).exit_code(), 1);
    }

    #[test]
    fn missing_data_dir_is_reported_first() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&dir.path().join("absent"));

        let err = verify_preconditions(&config).unwrap_err();
        assert!(err.to_string().starts_with("Data directory"));
    }

    #[test]
    fn missing_warmup_script_is_checked_before_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(&dir.path().join("absent"));
        config.warmup_script = Some(dir.path().join("queries.txt"));

        let err = verify_preconditions(&config).unwrap_err();
        assert!(err.to_string().contains("queries.txt"));
    }

    #[test]
    fn missing_data_store_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CATALOG_DIR).join(SYSTEM_DB)).unwrap();

        let err = verify_preconditions(&config_for(dir.path())).unwrap_err();
        assert!(err.to_string().contains(DATA_DIR));
    }

    #[test]
    fn seeded_directory_passes() {
        let dir = tempfile::tempdir().unwrap();
        seed_data_dir(dir.path());
        verify_preconditions(&config_for(dir.path())).unwrap();
    }
}
