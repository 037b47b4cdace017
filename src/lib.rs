//! Beacon: a link-local multicast DNS (mDNS, RFC 6762) and DNS-SD
//! (RFC 6763) library.
//!
//! The [`Responder`] registers services and answers queries for them on the
//! local link, probing for name ownership and renaming on conflict the way
//! Bonjour and Avahi do. The [`Querier`] resolves `.local` questions and
//! discovers services with one-shot queries. Both share port 5353 with any
//! system mDNS daemon already running.
//!
//! # Example
//!
//! ```no_run
//! use beacon_mdns as mdns;
//!
//! # fn main() -> Result<(), mdns::Error> {
//! let responder = mdns::Responder::new()?;
//! let service = mdns::Service::new("My Web Server", "_http._tcp", 8080)
//!     .with_txt("path", "/")
//!     .with_txt("version", "1.0");
//! let _handle = responder.register(service)?;
//!
//! // The service stays advertised until the handle goes out of scope.
//! std::thread::sleep(std::time::Duration::from_secs(60));
//! # Ok(())
//! # }
//! ```
//!
//! Discovery from another process:
//!
//! ```no_run
//! use beacon_mdns as mdns;
//!
//! # fn main() -> Result<(), mdns::Error> {
//! let querier = mdns::Querier::new()?;
//! let response = querier.query("_http._tcp.local", mdns::RecordType::Ptr)?;
//! for instance in response.pointers() {
//!     println!("found {}", instance);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use futures::sync::{mpsc, oneshot};
use futures::Future;
use log::warn;
use tokio_core::reactor::Core;

mod buffer;
pub mod error;
pub mod fsm;
pub mod ifaces;
pub mod name;
#[cfg(windows)]
#[path = "netwin.rs"]
mod net;
#[cfg(not(windows))]
mod net;
mod options;
pub mod proto;
pub mod querier;
pub mod ratelimit;
pub mod response;
pub mod services;
pub mod transport;
pub mod wire;

pub use crate::error::{Error, Result};
pub use crate::options::Options;
pub use crate::proto::RecordType;
pub use crate::querier::QueryResponse;
pub use crate::services::Service;

use crate::fsm::{Command, Fsm};
use crate::name::Name;
use crate::querier::{QuerierCommand, QuerierFsm};
use crate::services::{ServiceData, Services, ServicesInner};
use crate::transport::UdpTransport;

/// The responder: owns the registry, answers queries, probes and announces
/// registered services.
///
/// All network activity happens on a dedicated background thread running
/// the protocol engine; this handle only exchanges messages with it.
/// Dropping the last handle shuts the engine down and joins the thread.
pub struct Responder {
    commands: mpsc::UnboundedSender<Command>,
    services: Services,
    shutdown: Arc<Shutdown<Command>>,
}

/// A registered service. Dropping the handle unregisters the service and
/// multicasts its goodbye.
pub struct ServiceHandle {
    instance: String,
    commands: mpsc::UnboundedSender<Command>,
    _shutdown: Arc<Shutdown<Command>>,
}

impl Responder {
    /// A responder with default [`Options`].
    pub fn new() -> Result<Responder> {
        Responder::with_options(Options::default())
    }

    /// Spawns the engine thread, binds the shared socket, and joins the
    /// multicast group on the selected interfaces.
    pub fn with_options(options: Options) -> Result<Responder> {
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(0);

        let thread = thread::Builder::new()
            .name("mdns-responder".to_owned())
            .spawn(move || {
                let (mut core, fsm, services, commands) = match responder_parts(&options) {
                    Ok(parts) => parts,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok((services, commands)));
                if let Err(err) = core.run(fsm) {
                    warn!("mdns responder engine failed: {}", err);
                }
            })
            .map_err(|e| Error::network("spawn", e))?;

        let (services, commands) = ready_rx.recv().map_err(|_| Error::Cancelled)??;
        Ok(Responder {
            commands: commands.clone(),
            services,
            shutdown: Arc::new(Shutdown {
                commands,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// Registers a service and blocks until it is established on the link
    /// (probing plus announcements, typically under two seconds) or fails.
    ///
    /// On a name conflict the service is renamed with a `" (N)"` suffix and
    /// probing restarts; the handle carries the name that finally won. Ten
    /// failed attempts surface as an error.
    pub fn register(&self, service: Service) -> Result<ServiceHandle> {
        let data = ServiceData::from_service(&service)?;
        let (done, wait) = oneshot::channel();
        self.commands
            .unbounded_send(Command::Register { data, done })
            .map_err(|_| Error::Cancelled)?;
        let instance = wait.wait().map_err(|_| Error::Cancelled)??;
        Ok(ServiceHandle {
            instance,
            commands: self.commands.clone(),
            _shutdown: self.shutdown.clone(),
        })
    }

    /// Unregisters by instance name, multicasting a goodbye if the service
    /// was established.
    pub fn unregister(&self, instance: &str) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.commands
            .unbounded_send(Command::Unregister {
                instance: instance.to_owned(),
                done,
            })
            .map_err(|_| Error::Cancelled)?;
        wait.wait().map_err(|_| Error::Cancelled)?
    }

    /// Instance names currently registered.
    pub fn instances(&self) -> Vec<String> {
        self.services.read().unwrap().instances()
    }

    /// Stops the engine and joins its thread.
    pub fn close(self) -> Result<()> {
        let _ = self.commands.unbounded_send(Command::Shutdown);
        Ok(())
    }
}

impl ServiceHandle {
    /// The instance name that won probing; differs from the requested name
    /// after a conflict rename.
    pub fn instance(&self) -> &str {
        &self.instance
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        let (done, _ignored) = oneshot::channel();
        let _ = self.commands.unbounded_send(Command::Unregister {
            instance: self.instance.clone(),
            done,
        });
    }
}

/// The querier: one-shot `.local` resolution and service discovery.
pub struct Querier {
    commands: mpsc::UnboundedSender<QuerierCommand>,
    timeout: std::time::Duration,
    _shutdown: Arc<Shutdown<QuerierCommand>>,
}

impl Querier {
    /// A querier with default [`Options`].
    pub fn new() -> Result<Querier> {
        Querier::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Result<Querier> {
        let timeout = options.timeout;
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(0);

        let thread = thread::Builder::new()
            .name("mdns-querier".to_owned())
            .spawn(move || {
                let (mut core, fsm, commands) = match querier_parts(&options) {
                    Ok(parts) => parts,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(commands));
                if let Err(err) = core.run(fsm) {
                    warn!("mdns querier engine failed: {}", err);
                }
            })
            .map_err(|e| Error::network("spawn", e))?;

        let commands = ready_rx.recv().map_err(|_| Error::Cancelled)??;
        Ok(Querier {
            commands: commands.clone(),
            timeout,
            _shutdown: Arc::new(Shutdown {
                commands,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// Multicasts one question and collects answers for the configured
    /// window. An empty response after the window is not an error.
    pub fn query(&self, name: &str, rtype: RecordType) -> Result<QueryResponse> {
        let name = Name::from_str(name)?;
        let (done, wait) = oneshot::channel();
        self.commands
            .unbounded_send(QuerierCommand::Query {
                name,
                rtype,
                window: self.timeout,
                done,
            })
            .map_err(|_| Error::Cancelled)?;
        wait.wait().map_err(|_| Error::Cancelled)
    }

    /// Stops the engine and joins its thread.
    pub fn close(self) -> Result<()> {
        let _ = self.commands.unbounded_send(QuerierCommand::Shutdown);
        Ok(())
    }
}

/// Shared shutdown guard: tells the engine to stop, then joins its thread.
struct Shutdown<C: ShutdownCommand> {
    commands: mpsc::UnboundedSender<C>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

trait ShutdownCommand {
    fn shutdown() -> Self;
}

impl ShutdownCommand for Command {
    fn shutdown() -> Command {
        Command::Shutdown
    }
}

impl ShutdownCommand for QuerierCommand {
    fn shutdown() -> QuerierCommand {
        QuerierCommand::Shutdown
    }
}

impl<C: ShutdownCommand> Drop for Shutdown<C> {
    fn drop(&mut self) {
        let _ = self.commands.unbounded_send(C::shutdown());
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

/// Everything the responder thread needs, built on that thread so the
/// reactor handle stays local to it.
fn responder_parts(
    options: &Options,
) -> Result<(
    Core,
    Fsm<UdpTransport>,
    Services,
    mpsc::UnboundedSender<Command>,
)> {
    let core = Core::new().map_err(|e| Error::network("reactor", e))?;
    let interfaces = options.select_interfaces()?;
    let addresses = ifaces::addresses(&interfaces);

    let hostname = local_hostname()?;
    let services: Services = Arc::new(RwLock::new(ServicesInner::new(hostname, addresses.clone())));

    let transport = UdpTransport::new(&core.handle(), &addresses, options.limiter())?;
    let (fsm, commands) = Fsm::new(&core.handle(), transport, &services);
    Ok((core, fsm, services, commands))
}

fn querier_parts(
    options: &Options,
) -> Result<(
    Core,
    QuerierFsm<UdpTransport>,
    mpsc::UnboundedSender<QuerierCommand>,
)> {
    let core = Core::new().map_err(|e| Error::network("reactor", e))?;
    let interfaces = options.select_interfaces()?;
    let addresses = ifaces::addresses(&interfaces);

    let transport = UdpTransport::new(&core.handle(), &addresses, options.limiter())?;
    let (fsm, commands) = QuerierFsm::new(&core.handle(), transport);
    Ok((core, fsm, commands))
}

/// The machine's first hostname label with `.local` appended.
fn local_hostname() -> Result<Name> {
    let raw = net::gethostname().map_err(|e| Error::network("gethostname", e))?;
    let short = raw.split('.').next().unwrap_or("").trim().to_owned();
    if short.is_empty() {
        return Err(Error::validation(
            "hostname",
            raw,
            "system hostname is empty",
        ));
    }
    Name::from_str(&format!("{}.local", short))
}
