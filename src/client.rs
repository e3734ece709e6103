//! Sender state machine.
//!
//! ```text
//! ParseArguments -> HandleArguments -> ConvertAddress -> CreateSocket
//!   -> ConnectSocket -> SendFile (once per file) -> Cleanup -> Exit
//! any failure -> Error -> Cleanup -> Exit
//! ```

use crate::cli::ClientArgs;
use crate::codec;
use crate::error::{SessionError, SessionResultExt};
use crate::fsm::{Machine, SessionContext, State, Transitions};
use crate::logger::{Logger, TextLogger};
use crate::net;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use socket2::Socket;
use std::ffi::OsString;
use std::io::{BufWriter, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    ParseArguments,
    HandleArguments,
    ConvertAddress,
    CreateSocket,
    ConnectSocket,
    SendFile,
    Error,
    Cleanup,
    Exit,
}

impl State for ClientState {
    const INITIAL: Self = ClientState::ParseArguments;
    const ERROR: Self = ClientState::Error;
    const EXIT: Self = ClientState::Exit;
    const ALL: &'static [Self] = &[
        ClientState::ParseArguments,
        ClientState::HandleArguments,
        ClientState::ConvertAddress,
        ClientState::CreateSocket,
        ClientState::ConnectSocket,
        ClientState::SendFile,
        ClientState::Error,
        ClientState::Cleanup,
        ClientState::Exit,
    ];

    fn name(self) -> &'static str {
        match self {
            ClientState::ParseArguments => "ParseArguments",
            ClientState::HandleArguments => "HandleArguments",
            ClientState::ConvertAddress => "ConvertAddress",
            ClientState::CreateSocket => "CreateSocket",
            ClientState::ConnectSocket => "ConnectSocket",
            ClientState::SendFile => "SendFile",
            ClientState::Error => "Error",
            ClientState::Cleanup => "Cleanup",
            ClientState::Exit => "Exit",
        }
    }

    fn transitions(self) -> Transitions<Self> {
        use ClientState::*;
        let (success, failure): (&'static [ClientState], ClientState) = match self {
            ParseArguments => (&[HandleArguments, Exit], Error),
            HandleArguments => (&[ConvertAddress], Error),
            ConvertAddress => (&[CreateSocket], Error),
            CreateSocket => (&[ConnectSocket], Error),
            ConnectSocket => (&[SendFile], Error),
            SendFile => (&[SendFile, Cleanup], Error),
            Error => (&[Cleanup], Cleanup),
            Cleanup => (&[Exit], Exit),
            Exit => (&[], Exit),
        };
        Transitions { success, failure }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SendStats {
    pub files: u64,
    pub bytes: u64,
    pub chunks: u64,
}

pub struct ClientSession {
    ctx: SessionContext<ClientState>,
    argv: Vec<OsString>,
    args: Option<ClientArgs>,
    port: u16,
    addr: Option<SocketAddr>,
    socket: Option<Socket>,
    stream: Option<BufWriter<TcpStream>>,
    files: Vec<PathBuf>,
    cursor: usize,
    stats: SendStats,
    started: Option<Instant>,
}

impl ClientSession {
    /// `argv[0]` is the program name, as with `std::env::args_os`.
    pub fn new<I, T>(argv: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self {
            ctx: SessionContext::new("client"),
            argv: argv.into_iter().map(Into::into).collect(),
            args: None,
            port: 0,
            addr: None,
            socket: None,
            stream: None,
            files: Vec::new(),
            cursor: 0,
            stats: SendStats::default(),
            started: None,
        }
    }

    /// Replace the default no-op logger; `--trace`/`--log-file` still win.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.ctx.set_logger(logger);
        self
    }

    pub fn stats(&self) -> SendStats {
        self.stats
    }

    /// Files that will be (or were) sent, after missing ones were dropped.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    fn args(&self) -> Result<&ClientArgs, SessionError> {
        self.args
            .as_ref()
            .ok_or_else(|| SessionError::new("handle_arguments", "arguments were never parsed"))
    }

    fn addr(&self) -> Result<SocketAddr, SessionError> {
        self.addr
            .ok_or_else(|| SessionError::new("convert_address", "address was never converted"))
    }

    fn parse_arguments(&mut self) -> Result<ClientState, SessionError> {
        let args = match ClientArgs::try_parse_from(&self.argv) {
            Ok(args) => args,
            Err(e) if !e.use_stderr() => {
                // -h / --version: usage goes to stderr, nothing touches the network
                eprint!("{}", e.render());
                return Ok(ClientState::Exit);
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
        Ok(ClientState::HandleArguments)
    }

    fn handle_arguments(&mut self) -> Result<ClientState, SessionError> {
        let args = self.args()?;
        let port = net::parse_port(&args.port).during("handle_arguments", "Failed to handle arguments")?;
        let mut files = Vec::with_capacity(args.files.len());
        for path in &args.files {
            if path.exists() {
                files.push(path.clone());
            } else {
                eprintln!("Skipping {}: no such file", path.display());
            }
        }
        self.port = port;
        self.files = files;
        self.cursor = 0;
        Ok(ClientState::ConvertAddress)
    }

    fn convert_address(&mut self) -> Result<ClientState, SessionError> {
        let ip = net::resolve_address(&self.args()?.address)
            .during("convert_address", "Failed to convert address")?;
        self.addr = Some(SocketAddr::new(ip, self.port));
        Ok(ClientState::CreateSocket)
    }

    fn create_socket(&mut self) -> Result<ClientState, SessionError> {
        let addr = self.addr()?;
        let socket = net::create_socket(&addr).during("create_socket", "Failed to create socket")?;
        self.socket = Some(socket);
        Ok(ClientState::ConnectSocket)
    }

    fn connect_socket(&mut self) -> Result<ClientState, SessionError> {
        let addr = self.addr()?;
        let socket = self
            .socket
            .take()
            .ok_or_else(|| SessionError::new("connect", "socket was never created"))?;
        println!("Connecting to: {}", addr);
        let stream = net::connect_socket(socket, &addr).during("connect", "Failed to connect socket")?;
        println!("Connected to: {}", addr);
        self.ctx.logger().connected("server", &addr);
        self.stream = Some(BufWriter::new(stream));
        self.started = Some(Instant::now());
        Ok(ClientState::SendFile)
    }

    fn send_file(&mut self) -> Result<ClientState, SessionError> {
        let Some(path) = self.files.get(self.cursor).cloned() else {
            return Ok(ClientState::Cleanup);
        };
        let show_progress = self.args.as_ref().is_some_and(|a| a.progress);
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SessionError::new("send_file", "not connected"))?;

        let bar = show_progress.then(|| progress_bar(&path));
        let sent = codec::send_file(stream, &path, |n| {
            if let Some(bar) = &bar {
                bar.inc(n);
            }
        });
        if let Some(bar) = &bar {
            bar.finish_and_clear();
        }
        let summary = sent.during("send_file", &format!("Failed to send {}", path.display()))?;

        let name = summary.filename.to_string_lossy();
        println!("Sent {} ({} bytes)", name, summary.file_len);
        self.ctx
            .logger()
            .frame_sent(&name, u64::from(summary.file_len), summary.chunks);
        self.stats.files += 1;
        self.stats.bytes += u64::from(summary.file_len);
        self.stats.chunks += summary.chunks;
        self.cursor += 1;

        if self.cursor < self.files.len() {
            Ok(ClientState::SendFile)
        } else {
            Ok(ClientState::Cleanup)
        }
    }

    fn report_error(&mut self) -> Result<ClientState, SessionError> {
        if let Some(record) = self.ctx.take_error() {
            eprintln!("Error: {}", record.describe());
        }
        Ok(ClientState::Cleanup)
    }

    fn cleanup(&mut self) -> Result<ClientState, SessionError> {
        self.files.clear();
        self.cursor = 0;
        self.socket = None;
        if let Some(mut stream) = self.stream.take() {
            stream.flush().during("close", "Failed to flush socket")?;
            let stream = stream
                .into_inner()
                .map_err(|e| e.into_error())
                .during("close", "Failed to flush socket")?;
            net::close_stream(&stream).during("close", "Failed to close socket")?;
        }
        if !self.ctx.failed() {
            let seconds = self.started.map_or(0.0, |t| t.elapsed().as_secs_f64());
            if self.started.is_some() {
                println!(
                    "Sent {} file(s), {} bytes in {:.2}s",
                    self.stats.files, self.stats.bytes, seconds
                );
            }
            self.ctx
                .logger()
                .done(self.stats.files, self.stats.bytes, seconds);
        }
        Ok(ClientState::Exit)
    }
}

fn progress_bar(path: &std::path::Path) -> ProgressBar {
    let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.green}] {bytes}/{total_bytes} {bytes_per_sec}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.set_message(
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    bar
}

impl Machine for ClientSession {
    type State = ClientState;

    fn context(&mut self) -> &mut SessionContext<ClientState> {
        &mut self.ctx
    }

    fn handle(&mut self, state: ClientState) -> Result<ClientState, SessionError> {
        match state {
            ClientState::ParseArguments => self.parse_arguments(),
            ClientState::HandleArguments => self.handle_arguments(),
            ClientState::ConvertAddress => self.convert_address(),
            ClientState::CreateSocket => self.create_socket(),
            ClientState::ConnectSocket => self.connect_socket(),
            ClientState::SendFile => self.send_file(),
            ClientState::Error => self.report_error(),
            ClientState::Cleanup => self.cleanup(),
            ClientState::Exit => Ok(ClientState::Exit),
        }
    }
}
