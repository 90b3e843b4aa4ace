//! Scriptable stand-in for `keepassxc-proxy` + KeePassXC, used by the
//! integration tests. Speaks the daemon side of the browser-integration
//! protocol over its own stdio: performs the key handshake, decrypts
//! requests with the same box construction the client uses, and replies
//! under the incremented request nonce.
//!
//! Behaviour is selected with `MOCK_KPXC_SCENARIO`:
//!   `happy` (default) — answer every action, report `MOCK_KPXC_HASH`.
//!   `switch`          — after the first successful open, push a lock/unlock
//!                       cycle and report `MOCK_KPXC_HASH2` from then on.
//!   `replay`          — send the first encrypted reply twice.
//!   `ignore-disconnect` — swallow stdin EOF and SIGTERM; only SIGKILL works.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use kpxc_client::crypto::{BoxCryptor, Cryptor};
use kpxc_client::secret::{Protection, SecretBuffer};

struct Daemon {
    cryptor: BoxCryptor,
    client_key: Option<SecretBuffer>,
    scenario: String,
    hash: String,
    second_hash: String,
    /// `switch` scenario: whether the lock/unlock cycle was already pushed.
    switched: bool,
    /// `replay` scenario: whether the duplicated reply went out.
    replayed: bool,
    stdout: tokio::io::Stdout,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let scenario =
        std::env::var("MOCK_KPXC_SCENARIO").unwrap_or_else(|_| "happy".into());
    let hash = std::env::var("MOCK_KPXC_HASH").unwrap_or_else(|_| "11".repeat(32));
    let second_hash = std::env::var("MOCK_KPXC_HASH2").unwrap_or_else(|_| "22".repeat(32));
    info!(scenario, "mock proxy starting");

    if scenario == "ignore-disconnect" {
        ignore_sigterm();
    }

    let mut daemon = Daemon {
        cryptor: BoxCryptor::new(),
        client_key: None,
        scenario: scenario.clone(),
        hash,
        second_hash,
        switched: false,
        replayed: false,
        stdout: tokio::io::stdout(),
    };

    let mut stdin = tokio::io::stdin();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        while let Some(frame) = take_frame(&mut buf)? {
            let message: Value = serde_json::from_slice(&frame).context("request not JSON")?;
            daemon.handle(message).await?;
        }
        match stdin.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }

    if scenario == "ignore-disconnect" {
        info!("ignoring EOF; waiting to be killed");
        std::future::pending::<()>().await;
    }
    Ok(())
}

#[cfg(unix)]
fn ignore_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async {
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        loop {
            term.recv().await;
            info!("ignoring SIGTERM");
        }
    });
}

#[cfg(not(unix))]
fn ignore_sigterm() {}

impl Daemon {
    async fn handle(&mut self, message: Value) -> Result<()> {
        let action = message
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if action == "change-public-keys" {
            return self.handle_handshake(&message).await;
        }
        self.handle_encrypted(&action, &message).await
    }

    async fn handle_handshake(&mut self, message: &Value) -> Result<()> {
        let key = message
            .get("publicKey")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("handshake without publicKey"))?;
        self.client_key = Some(
            SecretBuffer::from_base64(key, Protection::Readonly)
                .map_err(|e| anyhow!("bad client key: {e}"))?,
        );
        self.cryptor.create_keys().map_err(|e| anyhow!("{e}"))?;

        let reply = json!({
            "action": "change-public-keys",
            "version": "2.7.6",
            "publicKey": self.cryptor.public_key().to_base64(),
            "nonce": self.cryptor.generate_random_nonce(Protection::Readable).to_base64(),
            "success": "true",
        });
        self.send(&reply).await
    }

    async fn handle_encrypted(&mut self, action: &str, envelope: &Value) -> Result<()> {
        let client_key = self
            .client_key
            .clone()
            .ok_or_else(|| anyhow!("encrypted request before handshake"))?;
        let nonce_b64 = envelope
            .get("nonce")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("request without nonce"))?;
        let mut nonce = SecretBuffer::from_base64(nonce_b64, Protection::Readable)
            .map_err(|e| anyhow!("bad nonce: {e}"))?;
        let cipher = BASE64.decode(
            envelope
                .get("message")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("request without message"))?,
        )?;

        let plain = self
            .cryptor
            .decrypt(&cipher, &client_key, &nonce)
            .map_err(|e| anyhow!("decrypt failed: {e}"))?;
        let request: Value = serde_json::from_slice(&plain)?;
        debug!(action, "decrypted request");

        let reply = self.reply_for(action, &request);

        // Replies arrive under the incremented request nonce.
        nonce.increment();
        let reply_plain = serde_json::to_vec(&reply)?;
        let reply_cipher = self
            .cryptor
            .encrypt(&reply_plain, &client_key, &nonce)
            .map_err(|e| anyhow!("encrypt failed: {e}"))?;
        let reply_envelope = json!({
            "action": action,
            "message": BASE64.encode(reply_cipher),
            "nonce": nonce.to_base64(),
        });
        self.send(&reply_envelope).await?;

        if self.scenario == "replay" && !self.replayed {
            self.replayed = true;
            info!("replaying previous frame");
            self.send(&reply_envelope).await?;
        }

        // After the first open completes, simulate the user switching to a
        // different database.
        if self.scenario == "switch"
            && !self.switched
            && matches!(action, "associate" | "test-associate")
        {
            self.switched = true;
            self.send(&json!({"action": "database-locked"})).await?;
            self.send(&json!({"action": "database-unlocked"})).await?;
        }

        if action == "lock-database" {
            self.send(&json!({"action": "database-locked"})).await?;
        }
        Ok(())
    }

    fn reply_for(&self, action: &str, request: &Value) -> Value {
        let hash = if self.scenario == "switch" && self.switched {
            &self.second_hash
        } else {
            &self.hash
        };
        match action {
            "get-databasehash" => json!({
                "version": "2.7.6",
                "success": "true",
                "hash": hash,
            }),
            "associate" => json!({
                "version": "2.7.6",
                "success": "true",
                "id": "host-app",
                "hash": hash,
            }),
            "test-associate" => json!({
                "version": "2.7.6",
                "success": "true",
                "id": request.get("id").cloned().unwrap_or_default(),
                "hash": hash,
            }),
            "generate-password" => json!({
                "version": "2.7.6",
                "success": "true",
                "entries": [{"password": "generated-secret"}],
            }),
            "get-logins" => json!({
                "version": "2.7.6",
                "success": "true",
                "count": 1,
                "hash": hash,
                "entries": [{
                    "login": "alice",
                    "password": "hunter2",
                    "name": "Example",
                    "uuid": "0123456789abcdef0123456789abcdef",
                }],
            }),
            "set-login" => json!({
                "version": "2.7.6",
                "success": "true",
            }),
            "lock-database" => json!({
                "version": "2.7.6",
                "success": "true",
            }),
            _ => json!({
                "version": "2.7.6",
                "success": "false",
                "errorCode": "12",
                "error": "incorrect action",
            }),
        }
    }

    async fn send(&mut self, message: &Value) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.stdout
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await?;
        self.stdout.write_all(&payload).await?;
        self.stdout.flush().await?;
        Ok(())
    }
}

/// Pop one complete frame off the front of `buf`.
fn take_frame(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
    if len == 0 {
        return Err(anyhow!("zero-length frame"));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let payload = buf[4..4 + len].to_vec();
    buf.drain(..4 + len);
    Ok(Some(payload))
}
