// Device Module
//
// INTENTION: The public face of a robocluster device. A Device publishes
// events to its group and reacts to events from it, runs background tasks,
// and talks to serial peripherals. All of that work happens on one dedicated
// scheduler thread; the methods here only marshal registrations onto it and
// manage its lifecycle.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;

use crate::config::DeviceConfig;
use crate::error::DeviceError;
use crate::handler::{self, Handler};
use crate::network::{MulticastOptions, TransportFactory};
use crate::packet::{Encoding, Packet};
use crate::serial::SerialTransport;
use crate::util::duration::Seconds;
use crate::util::logging::{Component, Logger};

mod engine;
mod loops;

use engine::{Command, Launch, Parked};
use loops::halt_requested;

/// Lifecycle state of a Device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            DeviceState::Stopped => "stopped",
            DeviceState::Starting => "starting",
            DeviceState::Running => "running",
            DeviceState::Stopping => "stopping",
        };
        f.write_str(state)
    }
}

/// Cloneable handle that publishes on behalf of a device.
///
/// Publishing never blocks: packets go onto the device's outbound queue and
/// are sent in order by its send loop. Packets published while the device is
/// stopped wait for the next start.
#[derive(Clone)]
pub struct Publisher {
    name: Arc<str>,
    queue: UnboundedSender<Packet>,
}

impl Publisher {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish `data` under `<device name>/<topic>`
    pub fn publish(&self, topic: &str, data: impl Serialize) -> Result<()> {
        let data = serde_json::to_value(data)?;
        self.queue
            .send(Packet::from_topic(&self.name, topic, data))
            .map_err(|_| DeviceError::Closed)?;
        Ok(())
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher").field("name", &self.name).finish()
    }
}

/// Requests a halt of a running device, from any thread.
///
/// A request made while the device is stopped is discarded by the next start.
#[derive(Clone)]
pub struct ShutdownHandle {
    halt: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.halt.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.halt.borrow()
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("requested", &self.is_shutdown())
            .finish()
    }
}

struct Running {
    thread: JoinHandle<Parked>,
}

/// A named member of a multicast group
pub struct Device {
    config: DeviceConfig,
    logger: Logger,
    factory: Arc<dyn TransportFactory>,
    commands: UnboundedSender<Command>,
    publisher: Publisher,
    halt: Arc<watch::Sender<bool>>,
    state: DeviceState,
    parked: Option<Parked>,
    running: Option<Running>,
}

impl Device {
    /// A device on the multicast address derived from `group`
    pub fn new(name: &str, group: &str) -> Self {
        Self::with_config(DeviceConfig::new(name, group))
    }

    pub fn with_config(config: DeviceConfig) -> Self {
        let factory = MulticastOptions::from_config(&config);
        Self::with_transport(config, factory)
    }

    /// A device whose network transport is built by `factory`
    pub fn with_transport(config: DeviceConfig, factory: impl TransportFactory) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (queue, outbound) = mpsc::unbounded_channel();
        let logger = Logger::new(Component::Device, &config.name);
        let publisher = Publisher {
            name: Arc::from(config.name.as_str()),
            queue,
        };

        Self {
            config,
            logger,
            factory: Arc::new(factory),
            commands,
            publisher,
            halt: Arc::new(watch::channel(false).0),
            state: DeviceState::Stopped,
            parked: Some(Parked::new(command_rx, outbound)),
            running: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn group(&self) -> &str {
        &self.config.group
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == DeviceState::Running
    }

    // Publishing

    /// Publish `data` under `<name>/<topic>`. Never blocks.
    pub fn publish(&self, topic: &str, data: impl Serialize) -> Result<()> {
        self.publisher.publish(topic, data)
    }

    /// A cloneable publisher for use inside handlers, tasks and other threads
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    // Registration

    /// Call `callback` for every event matching `pattern`
    pub fn on<F, Fut>(&self, pattern: &str, callback: F) -> Result<(), DeviceError>
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(pattern, Handler::from_async(callback))
    }

    /// Like `on`, for a synchronous callback
    pub fn on_sync<F>(&self, pattern: &str, callback: F) -> Result<(), DeviceError>
    where
        F: Fn(String, Value) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(pattern, Handler::from_sync(callback))
    }

    pub fn subscribe(&self, pattern: &str, handler: Handler) -> Result<(), DeviceError> {
        self.send(Command::Subscribe {
            pattern: pattern.to_string(),
            handler,
        })
    }

    /// Run `task` once, as soon as the scheduler is live
    pub fn task<F, Fut>(&self, task: F) -> Result<(), DeviceError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.send(Command::Spawn(handler::task_from_async(task)))
    }

    pub fn task_sync<F>(&self, task: F) -> Result<(), DeviceError>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.send(Command::Spawn(handler::task_from_sync(task)))
    }

    /// Run `body` forever: call it, await it, sleep `period`.
    ///
    /// Iterations never overlap, so the effective period is `period` plus the
    /// time `body` takes. A failing iteration is logged and the loop goes on.
    pub fn every<F, Fut>(&self, period: impl Into<Seconds>, body: F) -> Result<(), DeviceError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let period = period.into();
        let logger = self.logger.with_component(Component::Scheduler);
        let on_error = move |e: anyhow::Error| {
            logger.warn(format!("Periodic task (every {}) failed: {:#}", period, e));
        };
        self.send(Command::Spawn(handler::periodic(period, body, on_error)))
    }

    /// Suspend the calling task for `duration`
    pub fn sleep(duration: impl Into<Seconds>) -> tokio::time::Sleep {
        handler::sleep(duration)
    }

    // Serial lines

    /// Attach a tty at `path`; it is opened by its read loop once running
    pub fn attach(&self, path: &str, encoding: Encoding) -> Result<(), DeviceError> {
        self.link(SerialTransport::new(path, encoding))
    }

    /// Attach a pre-built serial transport. Replaces any transport at the same path.
    pub fn link(&self, transport: SerialTransport) -> Result<(), DeviceError> {
        self.send(Command::Attach(transport))
    }

    /// Subscribe on the private registry of the serial transport at `path`
    pub fn on_serial<F, Fut>(&self, path: &str, pattern: &str, callback: F) -> Result<(), DeviceError>
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.send(Command::SubscribeSerial {
            path: path.to_string(),
            pattern: pattern.to_string(),
            handler: Handler::from_async(callback),
        })
    }

    fn send(&self, command: Command) -> Result<(), DeviceError> {
        self.commands.send(command).map_err(|_| DeviceError::Closed)
    }

    // Lifecycle

    /// Start the scheduler thread. Returns once the network transport is bound.
    pub fn start(&mut self) -> Result<(), DeviceError> {
        if self.state != DeviceState::Stopped {
            return Err(DeviceError::AlreadyRunning);
        }
        let parked = self.parked.take().ok_or(DeviceError::Crashed)?;
        self.state = DeviceState::Starting;

        let (ready_tx, ready_rx) = sync_channel(1);
        self.halt.send_replace(false);
        let halt_rx = self.halt.subscribe();
        let launch = Launch {
            logger: self.logger.with_component(Component::Scheduler),
            parked,
            factory: self.factory.clone(),
            policy: self.config.failure_policy,
            halt: halt_rx,
            ready: ready_tx,
        };

        let spawned = std::thread::Builder::new()
            .name(format!("robocluster-{}", self.config.name))
            .spawn(move || engine::run(launch));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.state = DeviceState::Stopped;
                self.logger.error(format!("Failed to spawn scheduler thread: {}", e));
                return Err(DeviceError::Spawn(e));
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.running = Some(Running { thread });
                self.state = DeviceState::Running;
                self.logger
                    .info(format!("Started in group {}", self.config.group));
                Ok(())
            }
            Ok(Err(e)) => {
                self.logger.error(format!("Failed to start: {:#}", e));
                self.join(thread)?;
                Err(DeviceError::Startup(e))
            }
            Err(_) => {
                // the thread died before reporting
                self.join(thread)?;
                Err(DeviceError::Crashed)
            }
        }
    }

    /// Halt the scheduler and join its thread
    pub fn stop(&mut self) -> Result<(), DeviceError> {
        let running = self.running.take().ok_or(DeviceError::NotRunning)?;
        self.state = DeviceState::Stopping;
        self.halt.send_replace(true);
        self.join(running.thread)?;
        self.logger.info("Stopped");
        Ok(())
    }

    /// Block until the scheduler thread exits. Returns at once when not started.
    pub fn wait(&mut self) -> Result<(), DeviceError> {
        match self.running.take() {
            Some(running) => self.join(running.thread),
            None => Ok(()),
        }
    }

    /// Start, run until Ctrl-C, stop. Returns `Interrupted` after a Ctrl-C.
    pub fn run(&mut self) -> Result<(), DeviceError> {
        let logger = self.logger.clone();
        let interrupted = self.run_with(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                logger.warn(format!("Cannot listen for Ctrl-C: {}", e));
                std::future::pending::<()>().await;
            }
        })?;
        if interrupted {
            Err(DeviceError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Start, run until `shutdown` resolves or a halt is requested, stop.
    ///
    /// Blocks the calling thread; do not call it from inside an async runtime.
    pub fn run_until<F>(&mut self, shutdown: F) -> Result<(), DeviceError>
    where
        F: Future<Output = ()>,
    {
        self.run_with(shutdown).map(|_| ())
    }

    /// Handle that halts the device from any thread, including its own handlers
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            halt: self.halt.clone(),
        }
    }

    /// True when `shutdown` finished first
    fn run_with<F>(&mut self, shutdown: F) -> Result<bool, DeviceError>
    where
        F: Future<Output = ()>,
    {
        self.start()?;
        let mut halted = self.halt.subscribe();

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                self.stop()?;
                return Err(DeviceError::Spawn(e));
            }
        };
        let interrupted = runtime.block_on(async {
            tokio::select! {
                _ = shutdown => true,
                _ = halt_requested(&mut halted) => false,
            }
        });
        drop(runtime);

        if interrupted {
            self.logger.info("Shutdown requested");
        }
        if self.running.is_some() {
            self.stop()?;
        }
        Ok(interrupted)
    }

    fn join(&mut self, thread: JoinHandle<Parked>) -> Result<(), DeviceError> {
        let joined = thread.join();
        self.state = DeviceState::Stopped;
        match joined {
            Ok(parked) => {
                self.parked = Some(parked);
                Ok(())
            }
            Err(_) => {
                self.logger.error("Scheduler thread panicked");
                Err(DeviceError::Crashed)
            }
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.config.name)
            .field("group", &self.config.group)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.running.is_some() {
            if let Err(e) = self.stop() {
                self.logger.error(format!("Failed to stop on drop: {}", e));
            }
        }
    }
}
