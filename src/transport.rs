//! Child-process transport: spawns the helper process and speaks
//! length-prefixed JSON over its standard streams.
//!
//! Frame layout: 4-byte little-endian payload length, then exactly that many
//! bytes of UTF-8 JSON. Empty frames and frames above [`MAX_FRAME_LEN`] are
//! framing errors; a framing error means stream integrity is lost and the
//! reader stops. Stderr is drained on its own task and logged line by line.

use std::process::{ExitStatus, Stdio};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Inbound messages above this are rejected as framing errors.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Phase of the graceful-disconnect escalation ladder.
///
/// `Connecting` covers spawn until the key handshake completes; from there
/// the ladder runs `Connected → Eof → Terminate → Kill`, one step per timer
/// tick, and a child exit at any phase short-circuits to the drop step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Connected,
    Eof,
    Terminate,
    Kill,
}

/// Why an inbound byte sequence could not be delivered as a frame.
#[derive(Debug)]
pub enum FrameError {
    /// Declared payload length of zero.
    Empty,
    /// Declared payload length above [`MAX_FRAME_LEN`].
    Oversize(u32),
    /// Well-formed frame whose payload is not valid JSON.
    Json(String),
}

/// What the transport observed.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete inbound JSON message.
    Frame(Value),
    /// A framing or JSON decoding failure.
    FrameError(FrameError),
    /// The child exited; status reported verbatim when available.
    Finished(Option<ExitStatus>),
}

/// A live helper process plus its framed stdio channel.
pub struct Transport {
    child: Child,
    stdin: Option<ChildStdin>,
    frames: mpsc::UnboundedReceiver<Result<Value, FrameError>>,
    reader_done: bool,
    phase: Phase,
}

impl Transport {
    /// Spawn `program` (resolved via PATH) with piped stdio and start the
    /// stdout framer and stderr drain tasks.
    pub fn spawn(program: &str) -> std::io::Result<Self> {
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stdout")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stderr")
        })?;

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_frames(stdout, frame_tx));
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "proxy_stderr", "{}", line);
            }
        });

        debug!(program, pid = ?child.id(), "helper process spawned");
        Ok(Self {
            child,
            stdin,
            frames: frame_rx,
            reader_done: false,
            phase: Phase::Connecting,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Wait for the next inbound frame or the child's exit.
    ///
    /// Cancel safe: both underlying waits are, and no event is lost on
    /// cancellation.
    pub async fn next_event(&mut self) -> TransportEvent {
        loop {
            tokio::select! {
                frame = self.frames.recv(), if !self.reader_done => {
                    match frame {
                        Some(Ok(message)) => return TransportEvent::Frame(message),
                        Some(Err(e)) => return TransportEvent::FrameError(e),
                        // Reader hit EOF or lost integrity; from here the
                        // only event left is process exit.
                        None => self.reader_done = true,
                    }
                }
                status = self.child.wait() => {
                    return TransportEvent::Finished(status.ok());
                }
            }
        }
    }

    /// Frame and write one message to the child's stdin.
    pub async fn send_frame(&mut self, message: &Value) -> std::io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin already closed")
        })?;
        let frame = encode_frame(message)?;
        stdin.write_all(&frame).await?;
        stdin.flush().await
    }

    /// Escalation step 1: signal EOF by closing the write channel.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Escalation step 2: ask the child to exit (SIGTERM on unix).
    pub fn terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: plain signal send to a pid we own.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            return;
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
    }

    /// Escalation step 3: kill outright.
    pub fn kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Serialize `message` as one wire frame (header + payload).
pub(crate) fn encode_frame(message: &Value) -> std::io::Result<Vec<u8>> {
    let payload = serde_json::to_vec(message)?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Pop one complete frame off the front of `buf`.
///
/// `Ok(None)` means more bytes are needed; the buffer is left untouched.
/// A framing error also leaves the buffer untouched — there is no way to
/// resynchronize after one.
fn take_frame(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&buf[..HEADER_LEN]);
    let declared = u32::from_le_bytes(header);
    let len = declared as usize;
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversize(declared));
    }
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }
    let payload = buf[HEADER_LEN..HEADER_LEN + len].to_vec();
    buf.drain(..HEADER_LEN + len);
    Ok(Some(payload))
}

async fn read_frames(
    mut stdout: tokio::process::ChildStdout,
    tx: mpsc::UnboundedSender<Result<Value, FrameError>>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        loop {
            match take_frame(&mut buf) {
                Ok(Some(payload)) => {
                    let sent = match serde_json::from_slice::<Value>(&payload) {
                        Ok(message) => tx.send(Ok(message)),
                        Err(e) => tx.send(Err(FrameError::Json(e.to_string()))),
                    };
                    if sent.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            }
        }
        match stdout.read(&mut chunk).await {
            Ok(0) => {
                debug!("helper stdout reached EOF");
                return;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                warn!(err = %e, "failed to read from helper stdout");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame_of(payload: &[u8]) -> Vec<u8> {
        let mut frame = (payload.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn encode_header_matches_payload_length() {
        let frame = encode_frame(&json!({"action": "ping"})).unwrap();
        let declared = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(declared, frame.len() - 4);
        assert!(serde_json::from_slice::<Value>(&frame[4..]).is_ok());
    }

    #[test]
    fn partial_header_waits() {
        let mut buf = vec![0x05, 0x00];
        assert!(matches!(take_frame(&mut buf), Ok(None)));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn partial_payload_waits_without_consuming() {
        let mut buf = frame_of(b"{\"a\":1}");
        buf.truncate(buf.len() - 2);
        let before = buf.clone();
        assert!(matches!(take_frame(&mut buf), Ok(None)));
        assert_eq!(buf, before);
    }

    #[test]
    fn exact_frame_is_consumed() {
        let mut buf = frame_of(b"{\"a\":1}");
        let payload = take_frame(&mut buf).unwrap().unwrap();
        assert_eq!(payload, b"{\"a\":1}");
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames_split_cleanly() {
        let mut buf = frame_of(b"{\"a\":1}");
        buf.extend_from_slice(&frame_of(b"{\"b\":2}"));
        assert_eq!(take_frame(&mut buf).unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(take_frame(&mut buf).unwrap().unwrap(), b"{\"b\":2}");
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_length_frame_is_a_framing_error() {
        let mut buf = frame_of(b"");
        assert!(matches!(take_frame(&mut buf), Err(FrameError::Empty)));
    }

    #[test]
    fn oversize_frame_is_rejected_without_consumption() {
        let declared = (MAX_FRAME_LEN + 1) as u32;
        let mut buf = declared.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        let before = buf.clone();
        assert!(matches!(
            take_frame(&mut buf),
            Err(FrameError::Oversize(n)) if n == declared
        ));
        assert_eq!(buf, before);
    }
}
