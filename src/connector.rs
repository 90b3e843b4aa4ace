//! Protocol connector: key handshake, message envelopes, nonce discipline
//! and the graceful-disconnect escalation ladder.
//!
//! Every encrypted request registers exactly one expected reply nonce
//! (`increment` of the request nonce) in `allowed_nonces`; every accepted
//! encrypted reply removes exactly one. A reply under a nonce that is not in
//! the set is a replay or an injection and is fatal upstream.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info};

use crate::crypto::Cryptor;
use crate::error::Error;
use crate::secret::{Nonce, Protection, SecretBuffer};
use crate::transport::{FrameError, Phase, Transport, TransportEvent};

/// Oldest daemon protocol version the client accepts.
const MIN_KEEPASSXC_VERSION: (u64, u64, u64) = (2, 3, 0);

/// Delay between disconnect escalation steps.
const ESCALATION_STEP: Duration = Duration::from_millis(500);

/// What the connector distilled out of the transport.
#[derive(Debug)]
pub enum ConnectorEvent {
    /// Key handshake completed; the channel is ready for encrypted traffic.
    Connected,
    /// The helper process is gone and all secret material is released.
    Disconnected,
    /// Daemon push: the database was locked.
    Locked,
    /// Daemon push: the database was unlocked.
    Unlocked,
    /// Decrypted, validated reply for `action`.
    MessageReceived { action: String, message: Value },
    /// A reply for `action` failed a protocol or daemon-side check.
    MessageFailed {
        action: String,
        error: Error,
        message: String,
    },
    /// A failure not attributable to any action.
    Error {
        error: Error,
        message: String,
        fatal: bool,
    },
}

/// Spawn failure, carrying the human-readable cause for the error event.
pub struct ConnectFailure {
    pub error: Error,
    pub message: String,
}

pub struct Connector {
    cryptor: Box<dyn Cryptor>,
    transport: Transport,
    /// Random per-connection identifier sent as `clientID` on every frame.
    client_id: SecretBuffer,
    server_key: Option<SecretBuffer>,
    allowed_nonces: Vec<Nonce>,
    escalate_at: Option<Instant>,
}

impl Connector {
    /// Generate session keys and spawn the helper process.
    pub fn connect(program: &str, mut cryptor: Box<dyn Cryptor>) -> Result<Self, ConnectFailure> {
        if cryptor.create_keys().is_err() {
            return Err(ConnectFailure {
                error: Error::KeyGenerationFailed,
                message: "could not generate session keys".into(),
            });
        }
        let client_id = cryptor.generate_random_nonce(Protection::Readonly);

        let transport = Transport::spawn(program).map_err(|e| ConnectFailure {
            error: Error::UnknownError,
            message: format!("failed to spawn {program}: {e}"),
        })?;

        Ok(Self {
            cryptor,
            transport,
            client_id,
            server_key: None,
            allowed_nonces: Vec::new(),
            escalate_at: None,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.transport.phase() == Phase::Connected
    }

    pub fn cryptor(&self) -> &dyn Cryptor {
        self.cryptor.as_ref()
    }

    /// Send the unencrypted `change-public-keys` opener. Its reply is
    /// nonce-exempt, but the expected nonce is registered anyway and dies
    /// with the connection.
    pub async fn start_handshake(&mut self) -> Result<(), Error> {
        let mut nonce = self.cryptor.generate_random_nonce(Protection::Readable);
        let message = json!({
            "action": "change-public-keys",
            "publicKey": self.cryptor.public_key().to_base64(),
            "nonce": nonce.to_base64(),
            "clientID": self.client_id.to_base64(),
        });
        nonce.increment();
        nonce.make_readonly();
        self.allowed_nonces.push(nonce);

        self.transport
            .send_frame(&message)
            .await
            .map_err(|_| Error::UnknownError)
    }

    /// Seal `payload` and send it under `action`.
    pub async fn send_encrypted(
        &mut self,
        action: &str,
        mut payload: Value,
        trigger_unlock: bool,
    ) -> Result<(), Error> {
        let server_key = self
            .server_key
            .as_ref()
            .ok_or(Error::CannotEncryptMessage)?;

        let mut nonce = self.cryptor.generate_random_nonce(Protection::Readable);
        payload["action"] = Value::from(action);
        let plain = serde_json::to_vec(&payload).map_err(|_| Error::JsonParseError)?;
        let cipher = self.cryptor.encrypt(&plain, server_key, &nonce)?;

        let envelope = json!({
            "action": action,
            "message": BASE64.encode(cipher),
            "nonce": nonce.to_base64(),
            "clientID": self.client_id.to_base64(),
            "triggerUnlock": if trigger_unlock { "true" } else { "false" },
        });

        nonce.increment();
        nonce.make_readonly();
        self.allowed_nonces.push(nonce);

        self.transport
            .send_frame(&envelope)
            .await
            .map_err(|_| Error::UnknownError)
    }

    /// Advance the disconnect escalation ladder by one step. Called on user
    /// disconnect and again on every 500 ms timer tick until the process is
    /// gone. Returns the terminal event once the handle is dropped.
    pub fn disconnect(&mut self) -> Option<ConnectorEvent> {
        match self.transport.phase() {
            Phase::Connected => {
                debug!("disconnect: closing helper stdin");
                self.transport.close_stdin();
                self.transport.set_phase(Phase::Eof);
                self.arm_timer();
                None
            }
            Phase::Connecting | Phase::Eof => {
                debug!("disconnect: terminating helper");
                self.transport.terminate();
                self.transport.set_phase(Phase::Terminate);
                self.arm_timer();
                None
            }
            Phase::Terminate => {
                debug!("disconnect: killing helper");
                self.transport.kill();
                self.transport.set_phase(Phase::Kill);
                self.arm_timer();
                None
            }
            Phase::Kill => {
                debug!("disconnect: dropping helper process");
                self.cleanup();
                Some(ConnectorEvent::Disconnected)
            }
        }
    }

    /// Wait for the next protocol event.
    pub async fn next_event(&mut self) -> ConnectorEvent {
        loop {
            let deadline = self.escalate_at;
            tokio::select! {
                ev = self.transport.next_event() => match ev {
                    TransportEvent::Frame(message) => {
                        if let Some(out) = self.handle_frame(message) {
                            return out;
                        }
                    }
                    TransportEvent::FrameError(e) => return frame_error_event(e),
                    TransportEvent::Finished(status) => {
                        match status {
                            Some(status) => info!(%status, "helper process exited"),
                            None => info!("helper process exited (status unavailable)"),
                        }
                        self.cleanup();
                        return ConnectorEvent::Disconnected;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.escalate_at = None;
                    if let Some(out) = self.disconnect() {
                        return out;
                    }
                }
            }
        }
    }

    fn arm_timer(&mut self) {
        self.escalate_at = Some(Instant::now() + ESCALATION_STEP);
    }

    /// Zeroize every secret scoped to this connection.
    fn cleanup(&mut self) {
        self.escalate_at = None;
        self.cryptor.drop_keys();
        if let Some(mut key) = self.server_key.take() {
            key.clear();
        }
        self.client_id.clear();
        for nonce in &mut self.allowed_nonces {
            nonce.clear();
        }
        self.allowed_nonces.clear();
        self.transport.set_phase(Phase::Kill);
    }

    fn handle_frame(&mut self, message: Value) -> Option<ConnectorEvent> {
        let action = message
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if let Err((error, text)) = perform_checks(&message) {
            return Some(ConnectorEvent::MessageFailed {
                action,
                error,
                message: text,
            });
        }

        match action.as_str() {
            "change-public-keys" => Some(self.handle_key_change(&action, &message)),
            "database-locked" => Some(ConnectorEvent::Locked),
            "database-unlocked" => Some(ConnectorEvent::Unlocked),
            _ => self.handle_encrypted(action, &message),
        }
    }

    fn handle_key_change(&mut self, action: &str, message: &Value) -> ConnectorEvent {
        if self.server_key.is_some() {
            // The peer key is fixed for the connection lifetime; a second
            // key change is a protocol violation.
            return ConnectorEvent::MessageFailed {
                action: action.to_string(),
                error: Error::UnsupportedAction,
                message: "unexpected key change after handshake".into(),
            };
        }
        let Some(key) = message
            .get("publicKey")
            .and_then(Value::as_str)
            .and_then(|k| SecretBuffer::from_base64(k, Protection::Readonly).ok())
        else {
            return ConnectorEvent::MessageFailed {
                action: action.to_string(),
                error: Error::PublicKeyNotReceived,
                message: "handshake reply carried no public key".into(),
            };
        };
        self.server_key = Some(key);
        self.transport.set_phase(Phase::Connected);
        ConnectorEvent::Connected
    }

    fn handle_encrypted(&mut self, action: String, message: &Value) -> Option<ConnectorEvent> {
        let nonce = match message
            .get("nonce")
            .and_then(Value::as_str)
            .and_then(|n| SecretBuffer::from_base64(n, Protection::Readonly).ok())
        {
            Some(nonce) => nonce,
            None => {
                return Some(ConnectorEvent::MessageFailed {
                    action,
                    error: Error::ReceivedNonceInvalid,
                    message: "reply carried no nonce".into(),
                })
            }
        };
        if !self.remove_nonce(&nonce) {
            return Some(ConnectorEvent::MessageFailed {
                action,
                error: Error::ReceivedNonceInvalid,
                message: "reply nonce was not an expected reply nonce".into(),
            });
        }

        let Some(cipher) = message
            .get("message")
            .and_then(Value::as_str)
            .and_then(|m| BASE64.decode(m).ok())
        else {
            return Some(ConnectorEvent::MessageFailed {
                action,
                error: Error::CannotDecryptMessage,
                message: "reply carried no ciphertext".into(),
            });
        };

        let Some(server_key) = self.server_key.as_ref() else {
            return Some(ConnectorEvent::MessageFailed {
                action,
                error: Error::CannotDecryptMessage,
                message: "encrypted reply before key handshake".into(),
            });
        };
        let plain = match self.cryptor.decrypt(&cipher, server_key, &nonce) {
            Ok(plain) => plain,
            Err(_) => {
                return Some(ConnectorEvent::MessageFailed {
                    action,
                    error: Error::CannotDecryptMessage,
                    message: "authentication tag verification failed".into(),
                })
            }
        };

        let inner: Value = match serde_json::from_slice(&plain) {
            Ok(inner) => inner,
            Err(e) => {
                return Some(ConnectorEvent::MessageFailed {
                    action,
                    error: Error::JsonParseError,
                    message: e.to_string(),
                })
            }
        };

        if let Err((error, text)) = perform_checks(&inner) {
            return Some(ConnectorEvent::MessageFailed {
                action,
                error,
                message: text,
            });
        }

        Some(ConnectorEvent::MessageReceived {
            action,
            message: inner,
        })
    }

    /// Constant-time scan; removes the matching entry if present.
    fn remove_nonce(&mut self, nonce: &Nonce) -> bool {
        match self.allowed_nonces.iter().position(|n| n == nonce) {
            Some(idx) => {
                let mut removed = self.allowed_nonces.swap_remove(idx);
                removed.clear();
                true
            }
            None => false,
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Version gate and success gate, applied to envelopes and decrypted
/// payloads alike.
fn perform_checks(message: &Value) -> Result<(), (Error, String)> {
    if let Some(reported) = message.get("version").and_then(Value::as_str) {
        let min = semver::Version::new(
            MIN_KEEPASSXC_VERSION.0,
            MIN_KEEPASSXC_VERSION.1,
            MIN_KEEPASSXC_VERSION.2,
        );
        match semver::Version::parse(reported) {
            Ok(version) if version >= min => {}
            _ => return Err((Error::UnsupportedVersion, reported.to_string())),
        }
    }

    let success = match message.get("success") {
        Some(flag) => value_is_true(flag),
        // No explicit flag: any error marker means failure.
        None => message.get("errorCode").is_none() && message.get("error").is_none(),
    };
    if !success {
        let error = message
            .get("errorCode")
            .and_then(value_as_i64)
            .map(Error::from_code)
            .unwrap_or(Error::UnknownError);
        let text = message
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err((error, text));
    }
    Ok(())
}

/// The daemon stringifies booleans and error codes inconsistently across
/// versions; accept the reasonable encodings.
fn value_is_true(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s == "true",
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn frame_error_event(error: FrameError) -> ConnectorEvent {
    match error {
        FrameError::Empty => ConnectorEvent::Error {
            error: Error::EmptyMessageReceived,
            message: "received a zero-length frame".into(),
            fatal: true,
        },
        FrameError::Oversize(len) => ConnectorEvent::Error {
            error: Error::UnknownError,
            message: format!("frame of {len} bytes exceeds the 1 MiB limit"),
            fatal: true,
        },
        // The malformed frame was consumed whole; the stream is still
        // aligned, so the connection can survive this.
        FrameError::Json(detail) => ConnectorEvent::Error {
            error: Error::JsonParseError,
            message: detail,
            fatal: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn old_version_is_rejected() {
        let result = perform_checks(&json!({"version": "2.2.9", "success": "true"}));
        assert_eq!(result.unwrap_err().0, Error::UnsupportedVersion);
    }

    #[test]
    fn minimum_version_passes() {
        assert!(perform_checks(&json!({"version": "2.3.0", "success": "true"})).is_ok());
        assert!(perform_checks(&json!({"version": "2.7.6", "success": "true"})).is_ok());
    }

    #[test]
    fn unparseable_version_is_rejected() {
        let result = perform_checks(&json!({"version": "new and shiny"}));
        assert_eq!(result.unwrap_err().0, Error::UnsupportedVersion);
    }

    #[test]
    fn explicit_failure_carries_daemon_code() {
        let result = perform_checks(&json!({
            "success": "false",
            "errorCode": "6",
            "error": "denied",
        }));
        assert_eq!(result.unwrap_err(), (Error::ActionDenied, "denied".into()));
    }

    #[test]
    fn error_marker_without_success_flag_is_failure() {
        let result = perform_checks(&json!({"errorCode": 15}));
        assert_eq!(result.unwrap_err().0, Error::NoLoginsFound);
    }

    #[test]
    fn explicit_success_wins_over_error_marker() {
        assert!(perform_checks(&json!({"success": "true", "errorCode": 0})).is_ok());
    }

    #[test]
    fn plain_message_passes() {
        assert!(perform_checks(&json!({"hash": "00"})).is_ok());
    }

    #[test]
    fn boolean_encodings() {
        assert!(value_is_true(&json!(true)));
        assert!(value_is_true(&json!("true")));
        assert!(value_is_true(&json!(1)));
        assert!(!value_is_true(&json!("false")));
        assert!(!value_is_true(&json!(0)));
        assert!(!value_is_true(&json!(null)));
    }
}
