use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use super::{RobotConnector, RobotTransport, TransportError};
use twinsync_core::RobotConfig;

/// Line transport over a plain TCP socket. Lines go out terminated with
/// CRLF; inbound lines are stripped of their terminator.
pub struct TcpRobotTransport {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

#[async_trait]
impl RobotTransport for TcpRobotTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        Ok(buf.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn close(&mut self) {
        self.writer.shutdown().await.ok();
    }
}

/// Connects [`TcpRobotTransport`]s to the endpoint named in a
/// [`RobotConfig`].
pub struct TcpRobotConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpRobotConnector {
    pub fn new(cfg: &RobotConfig) -> Self {
        Self {
            addr: format!("{}:{}", cfg.ip, cfg.port),
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
        }
    }
}

#[async_trait]
impl RobotConnector for TcpRobotConnector {
    async fn connect(&self) -> Result<Box<dyn RobotTransport>, TransportError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.addr.clone()))?
            .map_err(|e| TransportError::Connect {
                addr: self.addr.clone(),
                source: e,
            })?;
        stream.set_nodelay(true).ok();
        let (read, write) = stream.into_split();
        Ok(Box::new(TcpRobotTransport {
            reader: BufReader::new(read),
            writer: write,
        }))
    }
}

/// In-process stand-in for a robot controller.
///
/// Accepts `PLAN_*` commands (answering `OK`), records every line it is
/// sent, and answers `GET_FAST` with a synthetic frame derived from the
/// last applied plan. Failure injection covers the reconnect paths:
/// refused connects, dropped reads, and stalled reads (to exercise the
/// read timeout).
#[derive(Default)]
pub struct SimRobotDevice {
    state: StdMutex<SimState>,
}

#[derive(Default)]
struct SimState {
    plan: HashMap<&'static str, String>,
    commands: Vec<String>,
    connects: u32,
    refuse_connects: u32,
    drop_reads: u32,
    stall_reads: bool,
    nak_plans: bool,
}

const PLAN_FIELDS: [&str; 6] = ["DI", "GI", "GO", "DO", "R", "VAR"];

impl SimRobotDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every line the device has been sent, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Last applied value for one plan field (`"DI"`, `"VAR"`, ...).
    pub fn applied(&self, field: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        PLAN_FIELDS
            .iter()
            .find(|f| **f == field)
            .and_then(|f| state.plan.get(f).cloned())
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connects(&self, n: u32) {
        self.state.lock().unwrap().refuse_connects = n;
    }

    /// Drop the connection on the next `n` `GET_FAST` reads.
    pub fn drop_reads(&self, n: u32) {
        self.state.lock().unwrap().drop_reads = n;
    }

    /// Stall every read forever; the session's read deadline fires.
    pub fn stall_reads(&self, stall: bool) {
        self.state.lock().unwrap().stall_reads = stall;
    }

    /// Answer plan commands with `NG` instead of `OK`.
    pub fn nak_plans(&self, nak: bool) {
        self.state.lock().unwrap().nak_plans = nak;
    }

    fn fast_response(state: &SimState) -> Vec<String> {
        let mut lines = vec!["J=10.0,20.0,30.0,40.0,50.0,60.0".to_string()];
        for field in ["DI", "GI", "GO", "DO"] {
            if let Some(csv) = state.plan.get(field) {
                if !csv.is_empty() {
                    let pairs: Vec<String> =
                        csv.split(',').map(|k| format!("{k}:1")).collect();
                    lines.push(format!("{field}={}", pairs.join(",")));
                }
            }
        }
        if let Some(csv) = state.plan.get("R") {
            if !csv.is_empty() {
                let pairs: Vec<String> = csv
                    .split(',')
                    .map(|k| format!("{k}:{k}|{k}.5"))
                    .collect();
                lines.push(format!("R={}", pairs.join(",")));
            }
        }
        if let Some(csv) = state.plan.get("VAR") {
            if !csv.is_empty() {
                let pairs: Vec<String> =
                    csv.split(',').map(|n| format!("{n}:val_{n}")).collect();
                lines.push(format!("VAR={}", pairs.join(",")));
            }
        }
        lines.push("END".to_string());
        lines
    }
}

/// One live connection to a [`SimRobotDevice`].
pub struct SimRobotTransport {
    device: Arc<SimRobotDevice>,
    pending: VecDeque<String>,
    broken: bool,
}

#[async_trait]
impl RobotTransport for SimRobotTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut state = self.device.state.lock().unwrap();
        state.commands.push(line.to_string());

        if let Some(rest) = line.strip_prefix("PLAN_") {
            if let Some((field, value)) = rest.split_once('=') {
                if state.nak_plans {
                    self.pending.push_back("NG".to_string());
                } else if let Some(f) = PLAN_FIELDS.iter().copied().find(|f| *f == field) {
                    state.plan.insert(f, value.to_string());
                    self.pending.push_back("OK".to_string());
                } else {
                    self.pending.push_back("NG".to_string());
                }
            }
        } else if line == "GET_FAST" {
            if state.drop_reads > 0 {
                state.drop_reads -= 1;
                self.broken = true;
            } else {
                self.pending.extend(SimRobotDevice::fast_response(&state));
            }
        }
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        // While stalled nothing arrives; the caller's read deadline is
        // what gives up first.
        while self.device.state.lock().unwrap().stall_reads {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if self.broken {
            return Err(TransportError::Closed);
        }
        self.pending.pop_front().ok_or(TransportError::Closed)
    }

    async fn close(&mut self) {
        self.pending.clear();
    }
}

/// Hands out connections to one shared [`SimRobotDevice`].
#[derive(Default)]
pub struct SimRobotConnector {
    device: Arc<SimRobotDevice>,
}

impl SimRobotConnector {
    pub fn new(device: Arc<SimRobotDevice>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> Arc<SimRobotDevice> {
        self.device.clone()
    }
}

#[async_trait]
impl RobotConnector for SimRobotConnector {
    async fn connect(&self) -> Result<Box<dyn RobotTransport>, TransportError> {
        let mut state = self.device.state.lock().unwrap();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(TransportError::Connect {
                addr: "sim".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }
        state.connects += 1;
        // A fresh connection means the device forgot its plan.
        state.plan.clear();
        Ok(Box::new(SimRobotTransport {
            device: self.device.clone(),
            pending: VecDeque::new(),
            broken: false,
        }))
    }
}
