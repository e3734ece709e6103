//! Receiver state machine.
//!
//! ```text
//! ParseArguments -> HandleArguments -> ConvertAddress -> CreateSocket
//!   -> SetupServerSocket -> BindSocket -> StartListening -> SetupSignalHandler
//!   -> Poll <-> { HandleNewClient, HandleClients }
//! Poll (cancelled) -> Cleanup -> Exit
//! any failure -> Error -> Cleanup -> Exit
//! ```

use crate::cli::ServerArgs;
use crate::error::{SessionError, SessionResultExt};
use crate::fsm::{Machine, SessionContext, State, Transitions};
use crate::journal::TransferJournal;
use crate::logger::{Logger, TextLogger};
use crate::mux::{Delivery, Multiplexer, Readiness};
use crate::net;
use crate::signal::{self, CancellationToken};
use clap::Parser;
use socket2::Socket;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    ParseArguments,
    HandleArguments,
    ConvertAddress,
    CreateSocket,
    SetupServerSocket,
    BindSocket,
    StartListening,
    SetupSignalHandler,
    Poll,
    HandleNewClient,
    HandleClients,
    Error,
    Cleanup,
    Exit,
}

impl State for ServerState {
    const INITIAL: Self = ServerState::ParseArguments;
    const ERROR: Self = ServerState::Error;
    const EXIT: Self = ServerState::Exit;
    const ALL: &'static [Self] = &[
        ServerState::ParseArguments,
        ServerState::HandleArguments,
        ServerState::ConvertAddress,
        ServerState::CreateSocket,
        ServerState::SetupServerSocket,
        ServerState::BindSocket,
        ServerState::StartListening,
        ServerState::SetupSignalHandler,
        ServerState::Poll,
        ServerState::HandleNewClient,
        ServerState::HandleClients,
        ServerState::Error,
        ServerState::Cleanup,
        ServerState::Exit,
    ];

    fn name(self) -> &'static str {
        match self {
            ServerState::ParseArguments => "ParseArguments",
            ServerState::HandleArguments => "HandleArguments",
            ServerState::ConvertAddress => "ConvertAddress",
            ServerState::CreateSocket => "CreateSocket",
            ServerState::SetupServerSocket => "SetupServerSocket",
            ServerState::BindSocket => "BindSocket",
            ServerState::StartListening => "StartListening",
            ServerState::SetupSignalHandler => "SetupSignalHandler",
            ServerState::Poll => "Poll",
            ServerState::HandleNewClient => "HandleNewClient",
            ServerState::HandleClients => "HandleClients",
            ServerState::Error => "Error",
            ServerState::Cleanup => "Cleanup",
            ServerState::Exit => "Exit",
        }
    }

    fn transitions(self) -> Transitions<Self> {
        use ServerState::*;
        let (success, failure): (&'static [ServerState], ServerState) = match self {
            ParseArguments => (&[HandleArguments, Exit], Error),
            HandleArguments => (&[ConvertAddress], Error),
            ConvertAddress => (&[CreateSocket], Error),
            CreateSocket => (&[SetupServerSocket], Error),
            SetupServerSocket => (&[BindSocket], Error),
            BindSocket => (&[StartListening], Error),
            StartListening => (&[SetupSignalHandler], Error),
            SetupSignalHandler => (&[Poll], Error),
            Poll => (&[HandleNewClient, HandleClients, Cleanup], Error),
            HandleNewClient => (&[Poll], Error),
            HandleClients => (&[Poll], Error),
            Error => (&[Cleanup], Cleanup),
            Cleanup => (&[Exit], Exit),
            Exit => (&[], Exit),
        };
        Transitions { success, failure }
    }
}

pub struct ServerSession {
    ctx: SessionContext<ServerState>,
    argv: Vec<OsString>,
    args: Option<ServerArgs>,
    port: u16,
    addr: Option<SocketAddr>,
    socket: Option<Socket>,
    mux: Option<Multiplexer>,
    journal: Option<TransferJournal>,
    cancel: CancellationToken,
    signal_hook: bool,
    accepted: u64,
    frames: u64,
}

impl ServerSession {
    /// `argv[0]` is the program name, as with `std::env::args_os`.
    pub fn new<I, T>(argv: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self {
            ctx: SessionContext::new("server"),
            argv: argv.into_iter().map(Into::into).collect(),
            args: None,
            port: 0,
            addr: None,
            socket: None,
            mux: None,
            journal: None,
            cancel: CancellationToken::new(),
            signal_hook: true,
            accepted: 0,
            frames: 0,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.ctx.set_logger(logger);
        self
    }

    /// Install the Ctrl-C hook in `SetupSignalHandler` (the default).
    ///
    /// The hook can only be installed once per process, so embedders that
    /// run several sessions turn it off and cancel through
    /// [`ServerSession::cancellation`] instead.
    pub fn signal_hook(mut self, on: bool) -> Self {
        self.signal_hook = on;
        self
    }

    /// Handle that stops the poll loop when cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bound address once the session is listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.mux.as_ref().and_then(|m| m.local_addr().ok())
    }

    fn args(&self) -> Result<&ServerArgs, SessionError> {
        self.args
            .as_ref()
            .ok_or_else(|| SessionError::new("handle_arguments", "arguments were never parsed"))
    }

    fn addr(&self) -> Result<SocketAddr, SessionError> {
        self.addr
            .ok_or_else(|| SessionError::new("convert_address", "address was never converted"))
    }

    fn socket(&self) -> Result<&Socket, SessionError> {
        self.socket
            .as_ref()
            .ok_or_else(|| SessionError::new("create_socket", "socket was never created"))
    }

    fn mux(&mut self) -> Result<&mut Multiplexer, SessionError> {
        self.mux
            .as_mut()
            .ok_or_else(|| SessionError::new("poll", "server is not listening"))
    }

    fn parse_arguments(&mut self) -> Result<ServerState, SessionError> {
        let args = match ServerArgs::try_parse_from(&self.argv) {
            Ok(args) => args,
            Err(e) if !e.use_stderr() => {
                eprint!("{}", e.render());
                return Ok(ServerState::Exit);
            }
            Err(e) => {
                return Err(SessionError::new(
                    "parse_arguments",
                    e.render().to_string().trim_end(),
                ))
            }
        };

        if let Some(path) = &args.log_file {
            let logger = TextLogger::new(path).during("parse_arguments", "Failed to open log file")?;
            self.ctx.set_logger(Arc::new(logger));
        } else if args.trace {
            self.ctx.set_logger(Arc::new(TextLogger::stderr()));
        }
        self.ctx.set_trace(args.trace);
        self.args = Some(args);
        Ok(ServerState::HandleArguments)
    }

    fn handle_arguments(&mut self) -> Result<ServerState, SessionError> {
        let args = self.args()?;
        let port = net::parse_port(&args.port).during("handle_arguments", "Failed to handle arguments")?;
        if !args.directory.is_dir() {
            return Err(SessionError::new(
                "handle_arguments",
                format!("Not a directory: {}", args.directory.display()),
            ));
        }
        let journal = args.journal.clone().map(TransferJournal::new);
        self.port = port;
        self.journal = journal;
        Ok(ServerState::ConvertAddress)
    }

    fn convert_address(&mut self) -> Result<ServerState, SessionError> {
        let ip = net::resolve_address(&self.args()?.address)
            .during("convert_address", "Failed to convert address")?;
        self.addr = Some(SocketAddr::new(ip, self.port));
        Ok(ServerState::CreateSocket)
    }

    fn create_socket(&mut self) -> Result<ServerState, SessionError> {
        let addr = self.addr()?;
        let socket = net::create_socket(&addr).during("create_socket", "Failed to create socket")?;
        self.socket = Some(socket);
        Ok(ServerState::SetupServerSocket)
    }

    fn setup_server_socket(&mut self) -> Result<ServerState, SessionError> {
        net::enable_address_reuse(self.socket()?)
            .during("setup_server_socket", "Failed to set socket options")?;
        Ok(ServerState::BindSocket)
    }

    fn bind_socket(&mut self) -> Result<ServerState, SessionError> {
        let addr = self.addr()?;
        println!("Binding to: {}", addr);
        net::bind_socket(self.socket()?, &addr).during("bind", "Failed to bind socket")?;
        Ok(ServerState::StartListening)
    }

    fn start_listening(&mut self) -> Result<ServerState, SessionError> {
        let socket = self
            .socket
            .take()
            .ok_or_else(|| SessionError::new("listen", "socket was never created"))?;
        let listener = net::start_listening(socket, net::DEFAULT_BACKLOG)
            .during("listen", "Failed to start listening")?;
        let mux = Multiplexer::new(listener, self.cancel.clone())
            .during("listen", "Failed to set up readiness polling")?;
        match mux.local_addr() {
            Ok(local) => println!("Listening for incoming connections on {}", local),
            Err(_) => println!("Listening for incoming connections..."),
        }
        self.mux = Some(mux);
        Ok(ServerState::SetupSignalHandler)
    }

    fn setup_signal_handler(&mut self) -> Result<ServerState, SessionError> {
        if self.signal_hook {
            signal::install_interrupt_hook(self.cancel.clone())
                .during("setup_signal_handler", "Failed to set up signal handler")?;
        }
        Ok(ServerState::Poll)
    }

    fn poll(&mut self) -> Result<ServerState, SessionError> {
        let readiness = self.mux()?.wait().during("poll", "Poll error")?;
        Ok(match readiness {
            Readiness::NewClient => ServerState::HandleNewClient,
            Readiness::Clients => ServerState::HandleClients,
            Readiness::Cancelled => ServerState::Cleanup,
        })
    }

    fn handle_new_client(&mut self) -> Result<ServerState, SessionError> {
        let (id, peer) = self.mux()?.admit().during("accept", "Failed to accept client")?;
        self.accepted += 1;
        println!("New connection established: {} from {}", id, peer);
        self.ctx.logger().connected(&id.to_string(), &peer);
        Ok(ServerState::Poll)
    }

    fn handle_clients(&mut self) -> Result<ServerState, SessionError> {
        let directory = self.args()?.directory.clone();
        let mux = self
            .mux
            .as_mut()
            .ok_or_else(|| SessionError::new("handle_clients", "server is not listening"))?;
        let delivery = Delivery {
            directory: &directory,
            logger: self.ctx.logger().as_ref(),
            journal: self.journal.as_ref(),
        };
        let report = mux.service_ready(&delivery);
        self.frames += report.frames as u64;
        Ok(ServerState::Poll)
    }

    fn report_error(&mut self) -> Result<ServerState, SessionError> {
        if let Some(record) = self.ctx.take_error() {
            eprintln!("Error: {}", record.describe());
        }
        Ok(ServerState::Cleanup)
    }

    fn cleanup(&mut self) -> Result<ServerState, SessionError> {
        self.socket = None;
        if let Some(mut mux) = self.mux.take() {
            let open = mux.close_all();
            if open > 0 {
                println!("Closed {} open connection(s)", open);
            }
        }
        if !self.ctx.failed() {
            println!(
                "Server exited successfully: {} client(s), {} file(s) received",
                self.accepted, self.frames
            );
        }
        Ok(ServerState::Exit)
    }
}

impl Machine for ServerSession {
    type State = ServerState;

    fn context(&mut self) -> &mut SessionContext<ServerState> {
        &mut self.ctx
    }

    fn handle(&mut self, state: ServerState) -> Result<ServerState, SessionError> {
        match state {
            ServerState::ParseArguments => self.parse_arguments(),
            ServerState::HandleArguments => self.handle_arguments(),
            ServerState::ConvertAddress => self.convert_address(),
            ServerState::CreateSocket => self.create_socket(),
            ServerState::SetupServerSocket => self.setup_server_socket(),
            ServerState::BindSocket => self.bind_socket(),
            ServerState::StartListening => self.start_listening(),
            ServerState::SetupSignalHandler => self.setup_signal_handler(),
            ServerState::Poll => self.poll(),
            ServerState::HandleNewClient => self.handle_new_client(),
            ServerState::HandleClients => self.handle_clients(),
            ServerState::Error => self.report_error(),
            ServerState::Cleanup => self.cleanup(),
            ServerState::Exit => Ok(ServerState::Exit),
        }
    }
}
