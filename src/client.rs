//! Minimal remote client for the control and frame channels.

use crate::protocol::{self, Request, Response};
use crate::transport::framing::{ControlFrame, FrameReader, MAX_CONTROL_FRAME, MAX_STREAM_FRAME};
use crate::{Result, ServerError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const READ_POLL: Duration = Duration::from_millis(20);
const CONNECT_RETRY: Duration = Duration::from_millis(20);

/// Request/reply client. A background reader answers heartbeats so an idle
/// client is not timed out by the server.
pub struct ControlClient {
    writer: Arc<Mutex<TcpStream>>,
    responses: Receiver<Response>,
    connected: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ControlClient {
    pub fn connect(addr: SocketAddr) -> Result<ControlClient> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_POLL))?;
        let writer = Arc::new(Mutex::new(stream.try_clone()?));

        let (responses_tx, responses) = crossbeam_channel::unbounded();
        let connected = Arc::new(AtomicBool::new(true));
        let stop_flag = Arc::new(AtomicBool::new(false));

        let thread = {
            let writer = writer.clone();
            let connected = connected.clone();
            let stop_flag = stop_flag.clone();
            std::thread::Builder::new()
                .name("tofd-client".into())
                .spawn(move || client_reader(stream, writer, responses_tx, connected, stop_flag))
                .map_err(|e| {
                    ServerError::ThreadSpawn(format!("Failed to spawn client reader: {}", e))
                })?
        };

        Ok(ControlClient {
            writer,
            responses,
            connected,
            stop_flag,
            thread: Some(thread),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send a request and wait for its response.
    pub fn request(&self, request: &Request, timeout: Duration) -> Result<Response> {
        // Stale responses from timed-out calls would pair with the wrong request.
        while self.responses.try_recv().is_ok() {}

        let payload = protocol::encode_request(request)?;
        ControlFrame::Message(payload).write_to(&mut *self.writer.lock())?;
        match self.responses.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => Err(ServerError::Timeout("response")),
            Err(RecvTimeoutError::Disconnected) => Err(ServerError::Disconnected),
        }
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        let _ = self.writer.lock().shutdown(std::net::Shutdown::Both);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn client_reader(
    mut stream: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    responses: Sender<Response>,
    connected: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
) {
    let mut reader = FrameReader::new(MAX_CONTROL_FRAME);
    while !stop_flag.load(Ordering::Relaxed) {
        let body = match reader.poll(&mut stream) {
            Ok(Some(body)) => body,
            Ok(None) => continue,
            Err(e) => {
                if !stop_flag.load(Ordering::Relaxed) {
                    log::debug!("Control connection closed: {}", e);
                }
                break;
            }
        };
        match ControlFrame::decode(body) {
            Ok(ControlFrame::Message(payload)) => match protocol::decode_response(&payload) {
                Ok(response) => {
                    let _ = responses.send(response);
                }
                Err(e) => log::warn!("Undecodable response: {}", e),
            },
            Ok(ControlFrame::Ping { .. }) => {
                if let Err(e) = ControlFrame::Pong.write_to(&mut *writer.lock()) {
                    log::warn!("Failed to answer ping: {}", e);
                    break;
                }
            }
            Ok(ControlFrame::Pong) => {}
            Err(e) => {
                log::warn!("Protocol error on control channel: {}", e);
                break;
            }
        }
    }
    connected.store(false, Ordering::Release);
}

/// Receiving end of the frame channel.
pub struct FrameReceiver {
    stream: TcpStream,
    reader: FrameReader,
}

impl FrameReceiver {
    /// Connect, retrying until `deadline` elapses.
    pub fn connect(addr: SocketAddr, deadline: Duration) -> Result<FrameReceiver> {
        let started = Instant::now();
        let stream = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(e) if started.elapsed() >= deadline => return Err(e.into()),
                Err(_) => std::thread::sleep(CONNECT_RETRY),
            }
        };
        stream.set_read_timeout(Some(READ_POLL))?;
        Ok(FrameReceiver {
            stream,
            reader: FrameReader::new(MAX_STREAM_FRAME),
        })
    }

    /// Next frame payload, raw or with a codec header.
    pub fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let started = Instant::now();
        loop {
            match self.reader.poll(&mut self.stream) {
                Ok(Some(payload)) => return Ok(payload),
                Ok(None) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(ServerError::Disconnected)
                }
                Err(e) => return Err(e.into()),
            }
            if started.elapsed() >= timeout {
                return Err(ServerError::Timeout("frame"));
            }
        }
    }
}
