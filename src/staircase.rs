//! Client for the external adaptive-staircase parameter server. The server
//! is a child process we launch and own; we talk to it over a TCP socket
//! using length-prefixed JSON frames. Per trial the client asks for the
//! next parameters, runs the trial, and tells the server the outcome; the
//! server eventually reports that its strategy is finished. Every answered
//! ask is recorded as an [`Exchange`] so that an interrupted session can be
//! replayed into a fresh server process ("priming") before resuming.
//!
//! Wire format, both directions: a 4-byte big-endian payload length
//! followed by the payload. Requests are JSON (`{"type": "ask"}`,
//! `{"type": "tell", "message": {...}}`, `{"type": "exit"}`); the ask
//! response is a JSON parameter object and the tell response is a bare
//! acknowledgement string.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt,
    io::{self, Read, Write},
    net::TcpStream,
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

/// Address the staircase server listens on.
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:5555";

/// How long to keep retrying the initial connection while the server
/// process warms up.
pub const DEFAULT_STARTUP_WAIT: Duration = Duration::from_secs(30);

/// Upper bound on a sane frame. Parameter payloads are tiny; anything
/// bigger means the stream is out of sync.
const MAX_FRAME_LEN: u32 = 1 << 20;

/// Protocol failures are fatal and not retried, but the caller must still
/// flush persistence and take the server process down before exiting.
#[derive(Debug)]
pub enum ProtocolError {
    /// The peer did not answer within the configured timeout.
    Timeout,
    /// The peer answered with something that does not parse.
    Malformed(String),
    /// The connection dropped mid-exchange.
    ConnectionLost,
    /// The peer announced a frame larger than any sane payload.
    OversizedFrame(u32),
    /// A request was made in a state that cannot accept it.
    BadState(&'static str),
    /// Any other socket-level failure.
    IoError(io::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ProtocolError::Timeout => Cow::from("server did not respond in time"),
            ProtocolError::Malformed(e) => Cow::from(format!("malformed server response: {}", e)),
            ProtocolError::ConnectionLost => Cow::from("connection to server lost"),
            ProtocolError::OversizedFrame(len) => {
                Cow::from(format!("oversized frame announced: {} bytes", len))
            }
            ProtocolError::BadState(what) => Cow::from(format!("protocol misuse: {}", what)),
            ProtocolError::IoError(e) => Cow::from(format!("io error: {}", e)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProtocolError::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ProtocolError::ConnectionLost,
            _ => ProtocolError::IoError(value),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(value: serde_json::Error) -> Self {
        ProtocolError::Malformed(value.to_string())
    }
}

/// Write one length-prefixed frame.
pub fn send_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame.
pub fn recv_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::OversizedFrame(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// The parameter mapping inside an ask response or a tell. The server
/// deals in single-element arrays per parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialConfig {
    /// Stimulus duration, seconds.
    #[serde(rename = "stimulusDuration")]
    pub stimulus_duration: Vec<f64>,
    /// Disparity amplitude, arcmin.
    #[serde(rename = "disparityAmplitude")]
    pub disparity_amplitude: Vec<f64>,
}

impl TrialConfig {
    /// Build a config from single values.
    pub fn new(stimulus_duration: f64, disparity_amplitude: f64) -> Self {
        TrialConfig {
            stimulus_duration: vec![stimulus_duration],
            disparity_amplitude: vec![disparity_amplitude],
        }
    }

    /// The stimulus duration in seconds.
    pub fn duration_s(&self) -> f64 {
        self.stimulus_duration.first().copied().unwrap_or(0.0)
    }

    /// The disparity amplitude in arcmin.
    pub fn disparity_arcmin(&self) -> f64 {
        self.disparity_amplitude.first().copied().unwrap_or(0.0)
    }
}

/// The server's answer to an ask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialParameters {
    /// Next trial's parameters.
    pub config: TrialConfig,
    /// True once the strategy has all the data it wants.
    pub is_finished: bool,
}

/// One ask/tell unit: the parameters the server handed out and the outcome
/// we observed. The outcome is recorded as 0 until the tell goes out, so a
/// crash between ask and tell still leaves a replayable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    /// The parameters that were presented.
    pub config: TrialConfig,
    /// 1 if the response was correct, else 0.
    pub outcome: u8,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Request<'a> {
    Ask,
    Tell { message: &'a Exchange },
    Exit,
}

/// Where the client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No socket yet.
    Disconnected,
    /// Socket open, not yet primed.
    Connected,
    /// Replaying a previous run's exchanges.
    Priming,
    /// Between trials; an ask may be issued.
    Ready,
    /// Ask sent, waiting for parameters.
    AwaitingParameters,
    /// Tell sent, waiting for the acknowledgement.
    AwaitingAck,
    /// Strategy finished or run abandoned; only cleanup remains.
    Finished,
}

/// The protocol session with the staircase server.
pub struct StaircaseClient {
    stream: TcpStream,
    state: ClientState,
    exchanges: Vec<Exchange>,
}

impl StaircaseClient {
    /// Connect to the server, retrying while it warms up. `io_timeout`
    /// bounds every subsequent read; `None` means block indefinitely,
    /// which matches how the apparatus historically ran.
    pub fn connect(
        addr: &str,
        startup_wait: Duration,
        io_timeout: Option<Duration>,
    ) -> Result<Self, ProtocolError> {
        let deadline = Instant::now() + startup_wait;
        let stream = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!("server not up yet ({}), retrying", e);
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(e) => return Err(e.into()),
            }
        };
        stream.set_read_timeout(io_timeout)?;
        stream.set_nodelay(true)?;
        info!("connected to staircase server at {}", addr);
        Ok(StaircaseClient {
            stream,
            state: ClientState::Connected,
            exchanges: Vec::new(),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Every exchange recorded so far, replayed ones included, in order.
    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    /// Replay a previous run's exchanges so the server's model picks up
    /// where it left off. Each stored exchange goes out as an ask (whose
    /// answer is discarded) followed by the stored tell. An empty seed
    /// skips straight to ready. Must complete before the first real ask.
    pub fn prime(&mut self, stored: &[Exchange]) -> Result<(), ProtocolError> {
        if self.state != ClientState::Connected {
            return Err(ProtocolError::BadState("prime() after the session started"));
        }
        self.state = ClientState::Priming;
        if !stored.is_empty() {
            info!("priming server with {} stored exchanges", stored.len());
        }
        for exchange in stored {
            self.send(&Request::Ask)?;
            recv_frame(&mut self.stream)?;
            self.send(&Request::Tell { message: exchange })?;
            recv_frame(&mut self.stream)?;
            self.exchanges.push(exchange.clone());
        }
        self.state = ClientState::Ready;
        Ok(())
    }

    /// Ask the server for the next trial's parameters. Unless the server
    /// is finished, the exchange is recorded immediately, before any tell,
    /// so nothing already answered can be lost to a crash mid-trial.
    pub fn ask(&mut self) -> Result<TrialParameters, ProtocolError> {
        if self.state != ClientState::Ready {
            return Err(ProtocolError::BadState("ask() outside the ready state"));
        }
        self.state = ClientState::AwaitingParameters;
        self.send(&Request::Ask)?;
        let raw = recv_frame(&mut self.stream)?;
        let params: TrialParameters = serde_json::from_slice(&raw)?;

        if params.is_finished {
            info!("server reports the strategy is finished");
            self.state = ClientState::Finished;
        } else {
            if params.config.stimulus_duration.is_empty()
                || params.config.disparity_amplitude.is_empty()
            {
                return Err(ProtocolError::Malformed(
                    "parameter arrays are empty".to_string(),
                ));
            }
            self.exchanges.push(Exchange {
                config: params.config.clone(),
                outcome: 0,
            });
            self.state = ClientState::Ready;
        }
        Ok(params)
    }

    /// Report the outcome of the trial that used the last asked
    /// parameters. Returns the server's acknowledgement string.
    pub fn tell(&mut self, outcome: u8) -> Result<String, ProtocolError> {
        if self.state != ClientState::Ready {
            return Err(ProtocolError::BadState("tell() outside the ready state"));
        }
        let exchange = match self.exchanges.last_mut() {
            Some(exchange) => {
                exchange.outcome = outcome;
                exchange.clone()
            }
            None => return Err(ProtocolError::BadState("tell() before any ask")),
        };
        self.state = ClientState::AwaitingAck;
        self.send(&Request::Tell { message: &exchange })?;
        let ack = recv_frame(&mut self.stream)?;
        self.state = ClientState::Ready;
        let ack = String::from_utf8_lossy(&ack).into_owned();
        debug!("server response: {}", ack);
        Ok(ack)
    }

    /// Ask the server process to exit and mark the session finished. Safe
    /// to call on any state and on a dead socket; the subsequent process
    /// kill is what actually guarantees the server goes away.
    pub fn finish(&mut self) {
        if let Err(e) = self.send(&Request::Exit) {
            warn!("could not send exit request: {}", e);
        }
        self.state = ClientState::Finished;
    }

    fn send(&mut self, request: &Request) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(request)?;
        send_frame(&mut self.stream, &payload)
    }
}

/// The staircase server child process. Whoever holds this owns the
/// process: it is signalled and then force-killed on drop, so the server
/// cannot outlive the session on any exit path, panics included.
pub struct ServerProcess {
    child: Option<Child>,
}

impl ServerProcess {
    /// Launch the server command.
    pub fn launch(program: &str, args: &[String]) -> io::Result<Self> {
        info!("launching staircase server: {} {}", program, args.join(" "));
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()?;
        Ok(ServerProcess { child: Some(child) })
    }

    /// Take the server down: a graceful SIGTERM first, then a hard kill.
    /// Both are always issued; the graceful path alone has been seen to
    /// hang on a busy strategy.
    pub fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            let pid = child.id() as libc::pid_t;
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            if let Err(e) = child.kill() {
                warn!("kill failed (server already gone?): {}", e);
            }
            match child.wait() {
                Ok(status) => info!("staircase server exited: {}", status),
                Err(e) => warn!("could not reap staircase server: {}", e),
            }
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! An in-process stand-in for the staircase server, speaking the same
    //! framed protocol over a loopback socket.

    use super::*;
    use serde_json::{json, Value};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;

    /// Scripted parameter triples: (duration, disparity, is_finished).
    pub(crate) struct MockServer {
        /// Address to hand to [`StaircaseClient::connect`].
        pub addr: String,
        /// Every request frame the server received, in order.
        pub received: Arc<Mutex<Vec<Value>>>,
        handle: Option<JoinHandle<()>>,
    }

    impl MockServer {
        /// Serve scripted ask answers; once the script runs dry, every
        /// further ask reports `is_finished: true`.
        pub(crate) fn start(script: Vec<(f64, f64, bool)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let received = Arc::new(Mutex::new(Vec::new()));
            let log = Arc::clone(&received);

            let handle = std::thread::spawn(move || {
                let (mut stream, _) = listener.accept().unwrap();
                let mut script = script.into_iter();
                loop {
                    let raw = match recv_frame(&mut stream) {
                        Ok(raw) => raw,
                        Err(_) => break,
                    };
                    let request: Value = serde_json::from_slice(&raw).unwrap();
                    log.lock().unwrap().push(request.clone());
                    match request["type"].as_str() {
                        Some("ask") => {
                            let (dur, disp, fin) = script.next().unwrap_or((0.0, 0.0, true));
                            let reply = json!({
                                "config": {
                                    "stimulusDuration": [dur],
                                    "disparityAmplitude": [disp],
                                },
                                "is_finished": fin,
                            });
                            send_frame(&mut stream, reply.to_string().as_bytes()).unwrap();
                        }
                        Some("tell") => {
                            send_frame(&mut stream, b"acq").unwrap();
                        }
                        _ => break,
                    }
                }
            });

            MockServer {
                addr,
                received,
                handle: Some(handle),
            }
        }

        /// Wait for the server thread to wind down (it ends on an exit
        /// request or when the client hangs up).
        pub(crate) fn join(&mut self) {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }

        /// The request types received so far, e.g. `["ask", "tell"]`.
        pub(crate) fn request_types(&self) -> Vec<String> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .map(|v| v["type"].as_str().unwrap_or("?").to_string())
                .collect()
        }
    }

    impl Drop for MockServer {
        fn drop(&mut self) {
            if let Some(handle) = self.handle.take() {
                // The server thread ends when the client closes or exits.
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockServer;
    use super::*;
    use std::io::Cursor;

    fn connect(server: &MockServer) -> StaircaseClient {
        StaircaseClient::connect(
            &server.addr,
            Duration::from_secs(5),
            Some(Duration::from_secs(5)),
        )
        .unwrap()
    }

    #[test]
    fn frames_round_trip() {
        let mut buf = Vec::new();
        send_frame(&mut buf, b"{\"type\":\"ask\"}").unwrap();
        let mut cursor = Cursor::new(buf);
        let payload = recv_frame(&mut cursor).unwrap();
        assert_eq!(payload, b"{\"type\":\"ask\"}");
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            recv_frame(&mut cursor),
            Err(ProtocolError::OversizedFrame(_))
        ));
    }

    #[test]
    fn truncated_frame_is_connection_loss() {
        let mut buf = Vec::new();
        send_frame(&mut buf, b"hello").unwrap();
        buf.truncate(6);
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            recv_frame(&mut cursor),
            Err(ProtocolError::ConnectionLost)
        ));
    }

    #[test]
    fn requests_serialize_to_the_wire_shape() {
        let ask = serde_json::to_value(Request::Ask).unwrap();
        assert_eq!(ask, serde_json::json!({"type": "ask"}));

        let exchange = Exchange {
            config: TrialConfig::new(0.75, 12.0),
            outcome: 1,
        };
        let tell = serde_json::to_value(Request::Tell { message: &exchange }).unwrap();
        assert_eq!(
            tell,
            serde_json::json!({
                "type": "tell",
                "message": {
                    "config": {
                        "stimulusDuration": [0.75],
                        "disparityAmplitude": [12.0],
                    },
                    "outcome": 1,
                }
            })
        );
    }

    #[test]
    fn ask_records_the_exchange_before_any_tell() {
        let server = MockServer::start(vec![(0.5, 10.0, false)]);
        let mut client = connect(&server);
        client.prime(&[]).unwrap();

        let params = client.ask().unwrap();
        assert!(!params.is_finished);
        assert_eq!(params.config.duration_s(), 0.5);
        assert_eq!(params.config.disparity_arcmin(), 10.0);

        // Recorded immediately after the ask response, outcome still 0.
        assert_eq!(client.exchanges().len(), 1);
        assert_eq!(client.exchanges()[0].outcome, 0);

        client.tell(1).unwrap();
        assert_eq!(client.exchanges()[0].outcome, 1);
        client.finish();
    }

    #[test]
    fn finished_ask_records_no_exchange() {
        let server = MockServer::start(vec![]);
        let mut client = connect(&server);
        client.prime(&[]).unwrap();

        let params = client.ask().unwrap();
        assert!(params.is_finished);
        assert_eq!(client.state(), ClientState::Finished);
        assert!(client.exchanges().is_empty());
        client.finish();
    }

    #[test]
    fn priming_replays_the_stored_sequence_in_order() {
        let stored = vec![
            Exchange {
                config: TrialConfig::new(0.6, 8.0),
                outcome: 1,
            },
            Exchange {
                config: TrialConfig::new(0.4, 16.0),
                outcome: 0,
            },
        ];
        // Two priming asks consume script entries, then one real ask.
        let mut server = MockServer::start(vec![
            (0.6, 8.0, false),
            (0.4, 16.0, false),
            (0.3, 20.0, false),
        ]);
        let mut client = connect(&server);
        client.prime(&stored).unwrap();
        client.ask().unwrap();
        client.finish();
        server.join();

        assert_eq!(
            server.request_types(),
            vec!["ask", "tell", "ask", "tell", "ask", "exit"]
        );
        // The replayed tells carry the stored outcomes, in order.
        let received = server.received.lock().unwrap();
        assert_eq!(received[1]["message"]["outcome"], 1);
        assert_eq!(received[3]["message"]["outcome"], 0);
        // The replayed exchanges seed the in-memory sequence.
        drop(received);
        assert_eq!(client.exchanges().len(), 3);
        assert_eq!(client.exchanges()[0].outcome, 1);
    }

    #[test]
    fn empty_priming_sends_nothing() {
        let server = MockServer::start(vec![(0.5, 5.0, false)]);
        let mut client = connect(&server);
        client.prime(&[]).unwrap();
        assert!(server.request_types().is_empty());
        assert_eq!(client.state(), ClientState::Ready);
        client.finish();
    }

    #[test]
    fn malformed_response_is_a_protocol_error() {
        use std::net::TcpListener;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            recv_frame(&mut stream).unwrap();
            send_frame(&mut stream, b"this is not json").unwrap();
        });

        let mut client =
            StaircaseClient::connect(&addr, Duration::from_secs(5), Some(Duration::from_secs(5)))
                .unwrap();
        client.prime(&[]).unwrap();
        assert!(matches!(client.ask(), Err(ProtocolError::Malformed(_))));
        handle.join().unwrap();
    }

    #[test]
    fn silent_server_times_out() {
        use std::net::TcpListener;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            // Hold the socket open without answering.
            std::thread::sleep(Duration::from_millis(300));
            drop(stream);
        });

        let mut client = StaircaseClient::connect(
            &addr,
            Duration::from_secs(5),
            Some(Duration::from_millis(50)),
        )
        .unwrap();
        client.prime(&[]).unwrap();
        assert!(matches!(client.ask(), Err(ProtocolError::Timeout)));
        handle.join().unwrap();
    }

    #[test]
    fn tell_before_ask_is_a_state_error() {
        let server = MockServer::start(vec![]);
        let mut client = connect(&server);
        client.prime(&[]).unwrap();
        assert!(matches!(client.tell(1), Err(ProtocolError::BadState(_))));
        client.finish();
    }
}
