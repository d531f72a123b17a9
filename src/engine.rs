//! Engine lifecycle
//!
//! The engine wires a device to the stack and the forwarder:
//!
//! ```text
//! device <-> pump <-> NetStack <-> Forwarder <-> SOCKS5 proxy
//!                                           \--> DNS resolver
//! ```
//!
//! [`Engine::start`] spawns the stack task and the pump task. Shutdown stops
//! the stack first so intercepted connections are aborted, gives in-flight
//! forwards a grace period to finish, and finally stops the pump, which closes
//! the device.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{PumpError, StackError, Tun2SocksError};
use crate::forward::{ForwardStats, ForwardStatsSnapshot, Forwarder};
use crate::pump::{self, PumpStats, PumpStatsSnapshot};
use crate::socks5::ProxyUrl;
use crate::stack::{build_stack, StackStats, StackStatsSnapshot};

/// How long [`Engine::stop`] waits for forward tasks to finish
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Combined engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub stack: StackStatsSnapshot,
    pub pump: PumpStatsSnapshot,
    pub forward: ForwardStatsSnapshot,
}

struct StatsHandles {
    stack: Arc<StackStats>,
    pump: Arc<PumpStats>,
    forward: Arc<ForwardStats>,
}

struct Running {
    stack_cancel: CancellationToken,
    pump_cancel: CancellationToken,
    stack: JoinHandle<Result<(), StackError>>,
    /// Taken by [`Engine::wait`] once the pump has been joined
    pump: Option<JoinHandle<Result<(), PumpError>>>,
    forwarder: Forwarder,
}

/// tun2socks engine
///
/// # Example
///
/// ```no_run
/// use tun2socks::config::EngineConfig;
/// use tun2socks::device::ChannelDevice;
/// use tun2socks::engine::Engine;
///
/// # async fn example() -> tun2socks::error::Result<()> {
/// let (device, _handle) = ChannelDevice::pair(256);
/// let mut engine = Engine::new(EngineConfig::default());
/// engine.start(device)?;
/// engine.wait().await?;
/// engine.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    config: EngineConfig,
    running: Option<Running>,
    stats: Option<StatsHandles>,
}

impl Engine {
    #[must_use]
    pub const fn new(config: EngineConfig) -> Self {
        Self {
            config,
            running: None,
            stats: None,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start forwarding traffic read from `device`
    ///
    /// Must be called within a Tokio runtime. The device is owned by the
    /// pump from now on and closed when the engine stops.
    ///
    /// # Errors
    ///
    /// - `Tun2SocksError::Engine` if the engine is already running
    /// - `Tun2SocksError::Config` / `Socks5` for an invalid configuration
    /// - `Tun2SocksError::Stack` if the stack cannot be built
    pub fn start<D>(&mut self, device: D) -> Result<(), Tun2SocksError>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.running.is_some() {
            return Err(Tun2SocksError::engine("engine is already running"));
        }

        self.config.validate()?;
        let proxy = ProxyUrl::parse(&self.config.proxy.url)?;
        let forwarder = Forwarder::new(proxy.clone(), &self.config.proxy, &self.config.forward);

        let (stack, link) = build_stack(
            &self.config.stack,
            self.config.device.mtu,
            Arc::new(forwarder.clone()),
        )?;

        let pump_stats = Arc::new(PumpStats::default());
        self.stats = Some(StatsHandles {
            stack: stack.stats(),
            pump: Arc::clone(&pump_stats),
            forward: forwarder.stats(),
        });

        let stack_cancel = CancellationToken::new();
        let pump_cancel = CancellationToken::new();
        let stack_task = tokio::spawn(stack.run(stack_cancel.clone()));
        let pump_task = tokio::spawn(pump::run(pump_cancel.clone(), device, link, pump_stats));

        info!(
            proxy = %proxy,
            mtu = self.config.device.mtu,
            dns_resolver = %self.config.forward.dns_resolver,
            "Engine started"
        );

        self.running = Some(Running {
            stack_cancel,
            pump_cancel,
            stack: stack_task,
            pump: Some(pump_task),
            forwarder,
        });
        Ok(())
    }

    /// Wait for the pump to terminate
    ///
    /// Resolves when the device closes, a device error occurs, or the engine
    /// is stopped. A clean close and cancellation both yield `Ok(())`.
    ///
    /// # Errors
    ///
    /// - `Tun2SocksError::Pump` for a fatal device error
    /// - `Tun2SocksError::Engine` if the engine is not running, the pump was
    ///   already joined, or the pump task panicked
    pub async fn wait(&mut self) -> Result<(), Tun2SocksError> {
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| Tun2SocksError::engine("engine is not running"))?;
        let pump = running
            .pump
            .as_mut()
            .ok_or_else(|| Tun2SocksError::engine("pump already finished"))?;

        let joined = pump.await;
        running.pump = None;

        match joined {
            Ok(Ok(()) | Err(PumpError::Cancelled)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(Tun2SocksError::engine(format!("pump task failed: {e}"))),
        }
    }

    /// Stop the engine and wait for its tasks
    ///
    /// Calling this on a stopped engine does nothing.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        info!("Stopping engine");

        running.stack_cancel.cancel();
        match running.stack.await {
            Ok(Ok(())) => debug!("Stack task joined"),
            Ok(Err(e)) => warn!("Stack stopped with error: {}", e),
            Err(e) => warn!("Stack task failed: {}", e),
        }

        let tasks = running.forwarder.tasks();
        tasks.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, tasks.wait()).await.is_err() {
            warn!(
                "{} forward tasks still running after {}s",
                tasks.len(),
                SHUTDOWN_GRACE.as_secs()
            );
        }

        running.pump_cancel.cancel();
        if let Some(pump) = running.pump {
            match pump.await {
                Ok(Ok(()) | Err(PumpError::Cancelled)) => debug!("Pump task joined"),
                Ok(Err(e)) => warn!("Pump stopped with error: {}", e),
                Err(e) => warn!("Pump task failed: {}", e),
            }
        }

        info!("Engine stopped");
    }

    /// Current counters; zero before the first start
    #[must_use]
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats
            .as_ref()
            .map(|handles| EngineStatsSnapshot {
                stack: handles.stack.snapshot(),
                pump: handles.pump.snapshot(),
                forward: handles.forward.snapshot(),
            })
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
