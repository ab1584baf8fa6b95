//! Warm VM pool: pre-booted microVMs with bounded latency and bounded
//! resource use.
//!
//! The pool keeps between `min_idle` and `max_idle` booted VMs idle,
//! never exceeding `max_total` across idle and in-use. Acquire prefers
//! the oldest idle VM, creates on demand below the total bound, and
//! refuses at the bound rather than queueing.

use crate::network::NetworkAllocator;
use crate::runner::VmHandle;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zephyr_core::ids::VmId;
use zephyr_core::metrics::MetricsSink;
use zephyr_core::ports::{HypervisorDriver, VmSpec};
use zephyr_core::{Error, Result};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_idle: usize,
    pub max_idle: usize,
    pub max_total: usize,
    /// Idle VMs beyond `min_idle` older than this are reaped.
    pub max_idle_time: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 1,
            max_idle: 2,
            max_total: 4,
            max_idle_time: Duration::from_secs(600),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Image and sizing shared by every pool VM.
#[derive(Debug, Clone)]
pub struct VmTemplate {
    pub kernel: String,
    pub rootfs: String,
    pub vcpus: u32,
    pub memory_mb: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// One pool-owned VM.
#[derive(Debug, Clone)]
pub struct PooledVm {
    pub id: VmId,
    pub network: zephyr_core::ports::VmNetwork,
    pub index: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub use_count: u64,
}

impl PooledVm {
    pub fn handle(&self) -> VmHandle {
        VmHandle {
            id: self.id,
            guest_ip: self.network.guest_ip,
        }
    }
}

struct PoolInner {
    state: PoolState,
    idle: VecDeque<PooledVm>,
    in_use: HashMap<VmId, PooledVm>,
    /// VMs being created right now; reserved against `max_total`.
    creating: usize,
    next_index: u64,
    replenish_scheduled: bool,
}

/// The warm pool.
pub struct VmPool {
    driver: Arc<dyn HypervisorDriver>,
    network: Arc<NetworkAllocator>,
    template: VmTemplate,
    config: PoolConfig,
    metrics: Arc<dyn MetricsSink>,
    inner: Mutex<PoolInner>,
    replenish_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl VmPool {
    pub fn new(
        driver: Arc<dyn HypervisorDriver>,
        network: Arc<NetworkAllocator>,
        template: VmTemplate,
        config: PoolConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Arc<Self>> {
        if config.min_idle > config.max_idle || config.max_idle > config.max_total {
            return Err(Error::InvalidConfig(format!(
                "pool bounds must satisfy min_idle <= max_idle <= max_total, got {}/{}/{}",
                config.min_idle, config.max_idle, config.max_total
            )));
        }
        Ok(Arc::new(Self {
            driver,
            network,
            template,
            config,
            metrics,
            inner: Mutex::new(PoolInner {
                state: PoolState::Stopped,
                idle: VecDeque::new(),
                in_use: HashMap::new(),
                creating: 0,
                next_index: 0,
                replenish_scheduled: false,
            }),
            replenish_task: std::sync::Mutex::new(None),
            health_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }))
    }

    pub async fn state(&self) -> PoolState {
        self.inner.lock().await.state
    }

    pub async fn idle_count(&self) -> usize {
        self.inner.lock().await.idle.len()
    }

    pub async fn in_use_count(&self) -> usize {
        self.inner.lock().await.in_use.len()
    }

    /// Boot the pool: replenish to `min_idle` and start the health timer.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != PoolState::Stopped {
                return Err(Error::Internal("pool already started".to_string()));
            }
            inner.state = PoolState::Starting;
        }

        self.replenish_once().await;

        {
            let mut inner = self.inner.lock().await;
            inner.state = PoolState::Running;
        }

        let pool = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let interval = self.config.health_check_interval;
        *self.health_task.lock().await = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.health_pass().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        }));

        info!(min_idle = self.config.min_idle, max_total = self.config.max_total, "VM pool running");
        Ok(())
    }

    /// Take a VM: oldest idle entry first, on-demand creation below
    /// `max_total`, `PoolExhausted` at the bound.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledVm> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != PoolState::Running {
                return Err(Error::Internal("pool is not running".to_string()));
            }
            if let Some(mut vm) = inner.idle.pop_front() {
                vm.use_count += 1;
                vm.last_used_at = Utc::now();
                inner.in_use.insert(vm.id, vm.clone());
                self.report_gauges(&inner);
                drop(inner);
                self.schedule_replenish();
                return Ok(vm);
            }
            let total = inner.idle.len() + inner.in_use.len() + inner.creating;
            if total >= self.config.max_total {
                return Err(Error::PoolExhausted {
                    in_use: inner.in_use.len(),
                    max_total: self.config.max_total,
                });
            }
            inner.creating += 1;
        }

        // Idle supply was empty: create synchronously.
        let created = self.create_vm().await;
        let mut inner = self.inner.lock().await;
        inner.creating -= 1;
        match created {
            Ok(mut vm) => {
                vm.use_count += 1;
                vm.last_used_at = Utc::now();
                inner.in_use.insert(vm.id, vm.clone());
                self.report_gauges(&inner);
                Ok(vm)
            }
            Err(e) => Err(e),
        }
    }

    /// Return a VM. Destroyed when asked, or when idle is already at
    /// `max_idle`; otherwise it goes back on the warm list.
    pub async fn release(&self, id: &VmId, destroy: bool) -> Result<()> {
        let (vm, must_destroy) = {
            let mut inner = self.inner.lock().await;
            let mut vm = inner
                .in_use
                .remove(id)
                .ok_or_else(|| Error::NotFound(format!("vm {id} is not in use")))?;
            vm.last_used_at = Utc::now();
            let must_destroy = destroy || inner.idle.len() >= self.config.max_idle;
            if !must_destroy {
                inner.idle.push_back(vm.clone());
            }
            self.report_gauges(&inner);
            (vm, must_destroy)
        };

        if must_destroy {
            self.destroy_vm(vm).await;
            let inner = self.inner.lock().await;
            self.report_gauges(&inner);
        }
        Ok(())
    }

    /// Drain and stop. Waits for any in-flight replenish, then destroys
    /// every VM in parallel.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != PoolState::Running && inner.state != PoolState::Starting {
                return Ok(());
            }
            inner.state = PoolState::Stopping;
        }
        self.shutdown.cancel();

        if let Some(task) = self.health_task.lock().await.take() {
            let _ = task.await;
        }
        self.await_replenish().await;

        let vms: Vec<PooledVm> = {
            let mut inner = self.inner.lock().await;
            let mut vms: Vec<PooledVm> = inner.idle.drain(..).collect();
            vms.extend(inner.in_use.drain().map(|(_, vm)| vm));
            vms
        };

        join_all(vms.into_iter().map(|vm| self.destroy_vm(vm))).await;

        let mut inner = self.inner.lock().await;
        inner.state = PoolState::Stopped;
        self.report_gauges(&inner);
        info!("VM pool stopped");
        Ok(())
    }

    /// Kick a background replenish; a no-op while one is in flight.
    fn schedule_replenish(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let task = tokio::spawn(async move {
            {
                let mut inner = pool.inner.lock().await;
                if inner.replenish_scheduled
                    || !matches!(inner.state, PoolState::Running | PoolState::Starting)
                {
                    return;
                }
                inner.replenish_scheduled = true;
            }
            pool.replenish_once().await;
            pool.inner.lock().await.replenish_scheduled = false;
        });
        *self.replenish_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// Create VMs until the idle target is met or capacity runs out.
    /// Creation failures are logged and counted, never propagated.
    async fn replenish_once(&self) {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if !matches!(inner.state, PoolState::Running | PoolState::Starting) {
                    return;
                }
                let shortfall = self.config.min_idle.saturating_sub(inner.idle.len());
                let capacity = self
                    .config
                    .max_total
                    .saturating_sub(inner.idle.len() + inner.in_use.len() + inner.creating);
                if shortfall.min(capacity) == 0 {
                    return;
                }
                inner.creating += 1;
            }

            let created = self.create_vm().await;
            let mut inner = self.inner.lock().await;
            inner.creating -= 1;
            match created {
                Ok(vm) => {
                    if matches!(inner.state, PoolState::Running | PoolState::Starting) {
                        inner.idle.push_back(vm);
                        self.report_gauges(&inner);
                    } else {
                        drop(inner);
                        self.destroy_vm(vm).await;
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "VM replenish creation failed");
                    self.metrics.incr_counter("pool_create_failures_total", &[], 1);
                    return;
                }
            }
        }
    }

    async fn await_replenish(&self) {
        let task = self
            .replenish_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Reap idle VMs beyond `min_idle` that have sat unused past
    /// `max_idle_time`, then top back up.
    async fn health_pass(self: &Arc<Self>) {
        let stale: Vec<PooledVm> = {
            let mut inner = self.inner.lock().await;
            if inner.state != PoolState::Running {
                return;
            }
            let now = Utc::now();
            let max_idle_time = chrono::Duration::from_std(self.config.max_idle_time)
                .unwrap_or_else(|_| chrono::Duration::zero());
            let min_idle = self.config.min_idle;

            let mut keep = VecDeque::new();
            let mut stale = Vec::new();
            for (position, vm) in inner.idle.drain(..).enumerate() {
                if position >= min_idle && now - vm.last_used_at > max_idle_time {
                    stale.push(vm);
                } else {
                    keep.push_back(vm);
                }
            }
            inner.idle = keep;
            self.report_gauges(&inner);
            stale
        };

        for vm in stale {
            debug!(vm_id = %vm.id, "Reaping stale idle VM");
            self.destroy_vm(vm).await;
        }

        self.schedule_replenish();
    }

    async fn create_vm(&self) -> Result<PooledVm> {
        let index = {
            let mut inner = self.inner.lock().await;
            let index = inner.next_index;
            inner.next_index += 1;
            index
        };

        let network = self.network.allocate().await?;
        let id = VmId::new();
        let spec = VmSpec {
            id,
            kernel: self.template.kernel.clone(),
            rootfs: self.template.rootfs.clone(),
            vcpus: self.template.vcpus,
            memory_mb: self.template.memory_mb,
            network: network.clone(),
        };

        let boot_started = std::time::Instant::now();
        if let Err(e) = self.driver.create(&spec).await {
            let _ = self.network.release(&network).await;
            return Err(e);
        }
        if let Err(e) = self.driver.start(&id).await {
            let _ = self.driver.destroy(&id).await;
            let _ = self.network.release(&network).await;
            return Err(e);
        }
        self.metrics.observe_histogram(
            "vm_boot_seconds",
            &[],
            boot_started.elapsed().as_secs_f64(),
        );

        let now = Utc::now();
        debug!(vm_id = %id, index, "VM booted");
        Ok(PooledVm {
            id,
            network,
            index,
            created_at: now,
            last_used_at: now,
            use_count: 0,
        })
    }

    async fn destroy_vm(&self, vm: PooledVm) {
        if let Err(e) = self.driver.destroy(&vm.id).await {
            error!(vm_id = %vm.id, error = %e, "VM destroy failed");
        }
        if let Err(e) = self.network.release(&vm.network).await {
            error!(vm_id = %vm.id, error = %e, "VM network release failed");
        }
    }

    fn report_gauges(&self, inner: &PoolInner) {
        self.metrics
            .set_gauge("pool_idle", &[], inner.idle.len() as f64);
        self.metrics
            .set_gauge("pool_in_use", &[], inner.in_use.len() as f64);
    }
}
