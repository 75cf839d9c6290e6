// Device engine
//
// INTENTION: Everything that runs on a device's scheduler thread. The engine
// owns the event registries and the task arena; the outside world reaches it
// only through the command channel and the halt signal. While the device is
// stopped the engine's state is parked inside the `Device` and handed back
// to the next run.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinError, JoinSet};

use super::loops::{halt_requested, receive_loop, send_loop, serial_read_loop, Inbound, Outbox};
use crate::config::FailurePolicy;
use crate::handler::{Handler, HandlerFuture, TaskFactory};
use crate::network::{NetworkTransport, TransportFactory};
use crate::packet::Packet;
use crate::routing::EventRegistry;
use crate::serial::SerialTransport;
use crate::util::logging::{Component, Logger};

/// Registration messages marshaled onto the scheduler
pub(crate) enum Command {
    Subscribe {
        pattern: String,
        handler: Handler,
    },
    SubscribeSerial {
        path: String,
        pattern: String,
        handler: Handler,
    },
    Spawn(TaskFactory),
    Attach(SerialTransport),
}

/// Engine state kept across runs
pub(crate) struct Parked {
    pub commands: UnboundedReceiver<Command>,
    pub outbound: Outbox,
    pub events: EventRegistry<Handler>,
    pub serial: HashMap<String, SerialTransport>,
}

impl Parked {
    pub fn new(commands: UnboundedReceiver<Command>, outbound: UnboundedReceiver<Packet>) -> Self {
        Self {
            commands,
            outbound: Outbox::new(outbound),
            events: EventRegistry::new(),
            serial: HashMap::new(),
        }
    }
}

/// Everything the scheduler thread needs for one run
pub(crate) struct Launch {
    pub logger: Logger,
    pub parked: Parked,
    pub factory: Arc<dyn TransportFactory>,
    pub policy: FailurePolicy,
    pub halt: watch::Receiver<bool>,
    pub ready: SyncSender<Result<()>>,
}

/// Body of the scheduler thread. Returns the parked state for the next run.
pub(crate) fn run(launch: Launch) -> Parked {
    let Launch {
        logger,
        parked,
        factory,
        policy,
        halt,
        ready,
    } = launch;

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(anyhow::Error::new(e).context("Failed to build scheduler runtime")));
            return parked;
        }
    };

    let transport = {
        let _context = runtime.enter();
        factory.bind()
    };
    let transport = match transport {
        Ok(transport) => transport,
        Err(e) => {
            let _ = ready.send(Err(e));
            return parked;
        }
    };

    let _ = ready.send(Ok(()));
    logger.debug("Scheduler live");
    runtime.block_on(serve(logger, parked, transport, policy, halt))
}

struct Reader {
    generation: u64,
    abort: AbortHandle,
}

struct Engine {
    logger: Logger,
    dispatch_logger: Logger,
    serial_logger: Logger,
    policy: FailurePolicy,
    events: EventRegistry<Handler>,
    serial: HashMap<String, SerialTransport>,
    readers: HashMap<String, Reader>,
    next_generation: u64,
    tasks: JoinSet<()>,
    inbound: UnboundedSender<Inbound>,
    live: bool,
}

async fn serve(
    logger: Logger,
    parked: Parked,
    transport: Arc<dyn NetworkTransport>,
    policy: FailurePolicy,
    mut halt: watch::Receiver<bool>,
) -> Parked {
    let Parked {
        mut commands,
        mut outbound,
        events,
        serial,
    } = parked;
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();

    let mut engine = Engine {
        dispatch_logger: logger.with_component(Component::Dispatch),
        serial_logger: logger.with_component(Component::Serial),
        logger,
        policy,
        events,
        serial,
        readers: HashMap::new(),
        next_generation: 0,
        tasks: JoinSet::new(),
        inbound: inbound_tx,
        live: false,
    };

    // registrations made while stopped come first
    while let Ok(command) = commands.try_recv() {
        engine.apply(command);
    }
    engine.go_live(transport.clone());

    let mut send = Box::pin(send_loop(
        transport,
        &mut outbound,
        halt.clone(),
        policy,
        engine.logger.with_component(Component::Sender),
    ));
    let mut send_done = false;

    loop {
        tokio::select! {
            biased;
            _ = halt_requested(&mut halt) => break,
            Some(command) = commands.recv() => engine.apply(command),
            Some(inbound) = inbound_rx.recv() => engine.route(inbound),
            Some(joined) = engine.tasks.join_next() => engine.reap(joined),
            _ = &mut send, if !send_done => {
                send_done = true;
            }
        }
    }

    engine.logger.debug("Halt requested, draining tasks");
    if !send_done {
        send.await;
    } else {
        drop(send);
    }
    engine.shutdown().await;

    Parked {
        commands,
        outbound,
        events: engine.events,
        serial: engine.serial,
    }
}

impl Engine {
    fn go_live(&mut self, transport: Arc<dyn NetworkTransport>) {
        self.live = true;
        self.tasks.spawn(receive_loop(
            transport,
            self.inbound.clone(),
            self.policy,
            self.logger.with_component(Component::Receiver),
        ));
        let paths: Vec<String> = self.serial.keys().cloned().collect();
        for path in paths {
            self.spawn_reader(&path);
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Subscribe { pattern, handler } => {
                self.logger.debug(format!("Subscribed to {}", pattern));
                self.events.subscribe(&pattern, handler);
            }
            Command::SubscribeSerial {
                path,
                pattern,
                handler,
            } => match self.serial.get_mut(&path) {
                Some(transport) => {
                    transport.subscribe(&pattern, handler);
                }
                None => self.serial_logger.warn(format!(
                    "No serial line attached at {}, dropping subscription to {}",
                    path, pattern
                )),
            },
            Command::Spawn(task) => {
                let work = task();
                self.tasks
                    .spawn(isolate(work, "Task".to_string(), self.logger.clone()));
            }
            Command::Attach(transport) => {
                let path = transport.path().to_string();
                if self.serial.insert(path.clone(), transport).is_some() {
                    self.serial_logger
                        .info(format!("Replaced serial transport at {}", path));
                }
                if self.live {
                    self.spawn_reader(&path);
                }
            }
        }
    }

    fn spawn_reader(&mut self, path: &str) {
        let Some(transport) = self.serial.get(path) else {
            return;
        };
        if let Some(previous) = self.readers.remove(path) {
            previous.abort.abort();
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let abort = self.tasks.spawn(serial_read_loop(
            transport.endpoint().clone(),
            generation,
            self.inbound.clone(),
            self.policy,
            self.serial_logger.clone(),
        ));
        self.readers
            .insert(path.to_string(), Reader { generation, abort });
    }

    fn route(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Network { packet, .. } => {
                dispatch(&self.events, packet, &mut self.tasks, &self.dispatch_logger);
            }
            Inbound::Serial {
                path,
                generation,
                packet,
            } => {
                let current = self.readers.get(&path).map(|reader| reader.generation);
                if current != Some(generation) {
                    // read by a loop that has since been replaced
                    return;
                }
                if let Some(transport) = self.serial.get(&path) {
                    dispatch(transport.events(), packet, &mut self.tasks, &self.dispatch_logger);
                }
            }
        }
    }

    fn reap(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                self.logger.error(format!("Task panicked: {}", e));
            }
        }
    }

    async fn shutdown(&mut self) {
        self.tasks.abort_all();
        while let Some(joined) = self.tasks.join_next().await {
            self.reap(joined);
        }
        self.readers.clear();
        self.live = false;
        self.logger.debug("All tasks drained");
    }
}

/// Spawn every handler matching the packet's event. Never waits on them.
fn dispatch(
    registry: &EventRegistry<Handler>,
    packet: Packet,
    tasks: &mut JoinSet<()>,
    logger: &Logger,
) -> usize {
    let (event, data) = packet.into_parts();
    let mut spawned = 0;
    for handler in registry.matching(&event) {
        let work = handler.invoke(event.clone(), data.clone());
        tasks.spawn(isolate(work, format!("Handler for {}", event), logger.clone()));
        spawned += 1;
    }
    if spawned == 0 {
        logger.trace(format!("No handlers for {}", event));
    }
    spawned
}

async fn isolate(work: HandlerFuture, label: String, logger: Logger) {
    if let Err(e) = work.await {
        logger.warn(format!("{} failed: {:#}", label, e));
    }
}
