//! The user-visible client: state machine, request sequencing and the
//! event stream.
//!
//! All protocol state lives on one spawned engine task; the [`Client`]
//! handle only carries channels into it. Actions are fire-and-forget — the
//! outcome of every request arrives on the event stream, never as a return
//! value.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use crate::connector::{Connector, ConnectorEvent};
use crate::crypto::BoxCryptor;
use crate::entry::{entries_from_reply, Entry};
use crate::error::Error;
use crate::registry::{DatabaseHash, DatabaseRegistry};
use crate::secret::{Protection, SecretBuffer};

/// Host-policy hook consulted before associating with a database.
pub type AllowDatabaseHook = Arc<dyn Fn(&DatabaseHash) -> bool + Send + Sync>;

/// Lifecycle state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Locked,
    Unlocked,
}

/// Behaviour switches. The default set allows new associations, asks the
/// daemon to prompt for unlock, and opens the database right after the
/// handshake.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub allow_new_database: bool,
    pub trigger_unlock: bool,
    pub open_on_connect: bool,
    pub allow_database_change: bool,
    pub disconnect_on_close: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            allow_new_database: true,
            trigger_unlock: true,
            open_on_connect: true,
            allow_database_change: false,
            disconnect_on_close: false,
        }
    }
}

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Helper program, resolved via PATH.
    pub program: String,
    pub options: ClientOptions,
    /// Veto hook over the reported database hash; `None` accepts all.
    pub allow_database: Option<AllowDatabaseHook>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            program: "keepassxc-proxy".into(),
            options: ClientOptions::default(),
            allow_database: None,
        }
    }
}

/// Everything the client reports back to the host application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    DatabaseOpened(DatabaseHash),
    DatabaseClosed,
    LoginsReceived(Vec<Entry>),
    LoginAdded,
    PasswordsGenerated(Vec<String>),
    StateChanged(ClientState),
    CurrentDatabaseChanged(Option<DatabaseHash>),
    ErrorOccured {
        error: Error,
        message: String,
        action: String,
        /// When set, the state machine is already back in `Disconnected`.
        unrecoverable: bool,
    },
}

enum Command {
    Connect,
    Disconnect,
    OpenDatabase,
    CloseDatabase,
    GeneratePassword,
    GetLogins {
        url: String,
        submit_url: Option<String>,
        http_auth: bool,
        search_all_databases: bool,
    },
    AddLogin {
        url: String,
        submit_url: Option<String>,
        entry: Entry,
    },
}

#[derive(Clone)]
struct Snapshot {
    state: ClientState,
    database: Option<DatabaseHash>,
}

/// Handle to a client engine. Dropping the last handle disconnects
/// gracefully and winds the engine down.
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
    snapshot: watch::Receiver<Snapshot>,
}

impl Client {
    /// Spawn the engine task. The registry decides which databases this
    /// client is already associated with.
    pub fn new(config: ClientConfig, registry: Box<dyn DatabaseRegistry>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(64);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot {
            state: ClientState::Disconnected,
            database: None,
        });

        let engine = Engine {
            config,
            registry,
            commands: command_rx,
            commands_closed: false,
            events: event_tx.clone(),
            snapshot: snapshot_tx,
            state: ClientState::Disconnected,
            current_hash: None,
            connector: None,
            pending_id_key: None,
        };
        tokio::spawn(engine.run());

        Self {
            commands: command_tx,
            events: event_tx,
            snapshot: snapshot_rx,
        }
    }

    /// Subscribe to the event stream. Every handle sees every event.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ClientState {
        self.snapshot.borrow().state
    }

    /// Hash of the currently identified database, once known.
    pub fn current_database(&self) -> Option<DatabaseHash> {
        self.snapshot.borrow().database
    }

    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn open_database(&self) {
        self.send(Command::OpenDatabase);
    }

    pub fn close_database(&self) {
        self.send(Command::CloseDatabase);
    }

    pub fn generate_password(&self) {
        self.send(Command::GeneratePassword);
    }

    pub fn get_logins(
        &self,
        url: impl Into<String>,
        submit_url: Option<String>,
        http_auth: bool,
        search_all_databases: bool,
    ) {
        self.send(Command::GetLogins {
            url: url.into(),
            submit_url,
            http_auth,
            search_all_databases,
        });
    }

    /// Add a login, or update the one named by `entry.uuid` when set.
    pub fn add_login(&self, url: impl Into<String>, submit_url: Option<String>, entry: Entry) {
        self.send(Command::AddLogin {
            url: url.into(),
            submit_url,
            entry,
        });
    }

    fn send(&self, command: Command) {
        // A closed channel means the engine is gone; nothing left to notify.
        let _ = self.commands.send(command);
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

enum Tick {
    Command(Option<Command>),
    Connector(ConnectorEvent),
}

struct Engine {
    config: ClientConfig,
    registry: Box<dyn DatabaseRegistry>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_closed: bool,
    events: broadcast::Sender<ClientEvent>,
    snapshot: watch::Sender<Snapshot>,
    state: ClientState,
    current_hash: Option<DatabaseHash>,
    connector: Option<Connector>,
    /// Identity key in flight between `associate` and its reply.
    pending_id_key: Option<SecretBuffer>,
}

impl Engine {
    async fn run(mut self) {
        loop {
            let tick = match (&mut self.connector, self.commands_closed) {
                (Some(connector), false) => tokio::select! {
                    command = self.commands.recv() => Tick::Command(command),
                    event = connector.next_event() => Tick::Connector(event),
                },
                (Some(connector), true) => Tick::Connector(connector.next_event().await),
                (None, false) => Tick::Command(self.commands.recv().await),
                (None, true) => break,
            };

            match tick {
                Tick::Command(Some(command)) => self.handle_command(command).await,
                Tick::Command(None) => {
                    // Every handle is gone: wind down gracefully.
                    self.commands_closed = true;
                    self.start_disconnect();
                }
                Tick::Connector(event) => self.handle_connector_event(event).await,
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.do_connect().await,
            Command::Disconnect => self.start_disconnect(),
            Command::OpenDatabase => self.do_open_database().await,
            Command::CloseDatabase => self.do_close_database().await,
            Command::GeneratePassword => self.do_generate_password().await,
            Command::GetLogins {
                url,
                submit_url,
                http_auth,
                search_all_databases,
            } => {
                self.do_get_logins(url, submit_url, http_auth, search_all_databases)
                    .await
            }
            Command::AddLogin {
                url,
                submit_url,
                entry,
            } => self.do_add_login(url, submit_url, entry).await,
        }
    }

    async fn do_connect(&mut self) {
        if self.connector.is_some() {
            self.emit_error(Error::AlreadyConnected, String::new(), "connect", false);
            return;
        }

        self.set_state(ClientState::Connecting);
        let mut connector =
            match Connector::connect(&self.config.program, Box::new(BoxCryptor::new())) {
                Ok(connector) => connector,
                Err(failure) => {
                    self.set_state(ClientState::Disconnected);
                    self.emit_error(failure.error, failure.message, "connect", true);
                    return;
                }
            };

        if let Err(error) = connector.start_handshake().await {
            self.set_state(ClientState::Disconnected);
            self.emit_error(error, "failed to send handshake".into(), "connect", true);
            return;
        }
        self.connector = Some(connector);
    }

    fn start_disconnect(&mut self) {
        let finished = match &mut self.connector {
            Some(connector) => connector.disconnect().is_some(),
            None => return,
        };
        if finished {
            self.finish_disconnect();
        }
    }

    async fn do_open_database(&mut self) {
        if !self.connected() {
            self.emit_error(
                Error::UnknownError,
                "not connected".into(),
                "get-databasehash",
                false,
            );
            return;
        }
        let trigger_unlock = self.config.options.trigger_unlock;
        self.send_encrypted("get-databasehash", json!({}), trigger_unlock)
            .await;
    }

    async fn do_close_database(&mut self) {
        if self.state != ClientState::Unlocked {
            let error = self.wrong_state_error();
            self.emit_error(error, String::new(), "lock-database", false);
            return;
        }
        self.send_encrypted("lock-database", json!({}), false).await;
    }

    async fn do_generate_password(&mut self) {
        if !self.connected() {
            self.emit_error(
                Error::UnknownError,
                "not connected".into(),
                "generate-password",
                false,
            );
            return;
        }
        self.send_encrypted("generate-password", json!({}), false)
            .await;
    }

    async fn do_get_logins(
        &mut self,
        url: String,
        submit_url: Option<String>,
        http_auth: bool,
        search_all_databases: bool,
    ) {
        if self.state != ClientState::Unlocked {
            let error = self.wrong_state_error();
            self.emit_error(error, String::new(), "get-logins", false);
            return;
        }
        let Some(keys) = self.association_keys() else {
            self.emit_error(
                Error::NoSavedDatabase,
                "no association for the current database".into(),
                "get-logins",
                false,
            );
            return;
        };

        let mut payload = json!({
            "url": url,
            "httpAuth": bool_str(http_auth),
            "searchAllDatabases": bool_str(search_all_databases),
            "keys": keys,
        });
        if let Some(submit_url) = submit_url {
            payload["submitUrl"] = Value::from(submit_url);
        }
        self.send_encrypted("get-logins", payload, false).await;
    }

    async fn do_add_login(&mut self, url: String, submit_url: Option<String>, entry: Entry) {
        if self.state != ClientState::Unlocked {
            let error = self.wrong_state_error();
            self.emit_error(error, String::new(), "set-login", false);
            return;
        }
        let mut payload = json!({
            "url": url,
            "login": entry.username,
            "password": entry.password,
        });
        if let Some(submit_url) = submit_url {
            payload["submitUrl"] = Value::from(submit_url);
        }
        if !entry.uuid.is_empty() {
            payload["uuid"] = Value::from(entry.uuid);
        }
        self.send_encrypted("set-login", payload, false).await;
    }

    // ── Connector events ─────────────────────────────────────────────────

    async fn handle_connector_event(&mut self, event: ConnectorEvent) {
        match event {
            ConnectorEvent::Connected => {
                self.emit(ClientEvent::Connected);
                self.set_state(ClientState::Locked);
                if self.config.options.open_on_connect {
                    self.do_open_database().await;
                }
            }
            ConnectorEvent::Disconnected => self.finish_disconnect(),
            ConnectorEvent::Locked => {
                if self.state == ClientState::Unlocked {
                    self.set_state(ClientState::Locked);
                    self.emit(ClientEvent::DatabaseClosed);
                    if self.config.options.disconnect_on_close {
                        self.start_disconnect();
                    }
                }
            }
            ConnectorEvent::Unlocked => {
                // Re-identify the database; it may have been switched while
                // we were locked out.
                if self.state == ClientState::Locked {
                    self.do_open_database().await;
                }
            }
            ConnectorEvent::MessageReceived { action, message } => {
                self.handle_message(&action, message).await;
            }
            ConnectorEvent::MessageFailed {
                action,
                error,
                message,
            } => self.handle_message_failure(&action, error, message).await,
            ConnectorEvent::Error {
                error,
                message,
                fatal,
            } => {
                if fatal {
                    self.fatal_teardown(error, message, "");
                } else {
                    self.emit_error(error, message, "", false);
                }
            }
        }
    }

    async fn handle_message(&mut self, action: &str, message: Value) {
        match action {
            "get-databasehash" => self.handle_database_hash(&message).await,
            "associate" => self.handle_associated(&message),
            "test-associate" => self.handle_test_associated(),
            "generate-password" => {
                self.emit(ClientEvent::PasswordsGenerated(passwords_from_reply(
                    &message,
                )));
            }
            "get-logins" => match entries_from_reply(&message) {
                Ok(entries) => self.emit(ClientEvent::LoginsReceived(entries)),
                Err(error) => {
                    self.fatal_teardown(error, "malformed entry list".into(), action);
                }
            },
            "set-login" => self.emit(ClientEvent::LoginAdded),
            // The daemon pushes database-locked after a lock-database
            // request; the push is what moves the state machine.
            "lock-database" => {}
            other => warn!(action = other, "reply for an action this client never sends"),
        }
    }

    async fn handle_message_failure(&mut self, action: &str, error: Error, message: String) {
        // A stale association is recoverable when we may register a new one.
        if action == "test-associate" && !error.is_fatal() && self.config.options.allow_new_database
        {
            debug!(code = error.code(), "test-associate failed, associating anew");
            self.start_associate().await;
            return;
        }
        if action == "associate" {
            self.pending_id_key = None;
        }

        if error.is_fatal() {
            self.fatal_teardown(error, message, action);
        } else {
            self.emit_error(error, message, action, false);
        }
    }

    // ── The open-database flow ───────────────────────────────────────────

    async fn handle_database_hash(&mut self, message: &Value) {
        let hash = match message
            .get("hash")
            .and_then(Value::as_str)
            .ok_or(Error::DatabaseHashNotReceived)
            .and_then(DatabaseHash::from_hex)
        {
            Ok(hash) => hash,
            Err(error) => {
                self.emit_error(error, String::new(), "get-databasehash", false);
                return;
            }
        };

        if let Some(current) = self.current_hash {
            if current != hash && !self.config.options.allow_database_change {
                self.fatal_teardown(
                    Error::DatabaseChanged,
                    format!("database changed to {hash}"),
                    "get-databasehash",
                );
                return;
            }
        }
        if let Some(allow) = &self.config.allow_database {
            if !allow(&hash) {
                self.fatal_teardown(
                    Error::DatabaseRejected,
                    format!("host application rejected database {hash}"),
                    "get-databasehash",
                );
                return;
            }
        }

        self.set_current_hash(Some(hash));

        if self.registry.has_database(&hash) {
            let name = self.registry.name(&hash).unwrap_or_default();
            let key = self
                .registry
                .client_id_key(&hash)
                .map(|k| k.to_base64())
                .unwrap_or_default();
            self.send_encrypted("test-associate", json!({"id": name, "key": key}), false)
                .await;
        } else if self.config.options.allow_new_database {
            self.start_associate().await;
        } else {
            self.emit_error(Error::NoSavedDatabase, String::new(), "associate", false);
        }
    }

    async fn start_associate(&mut self) {
        let Some(connector) = &self.connector else {
            return;
        };
        let id_key = connector
            .cryptor()
            .generate_random(32, Protection::Readonly);
        let payload = json!({
            "key": connector.cryptor().public_key().to_base64(),
            "idKey": id_key.to_base64(),
        });
        self.pending_id_key = Some(id_key);
        self.send_encrypted("associate", payload, false).await;
    }

    fn handle_associated(&mut self, message: &Value) {
        let Some(hash) = self.current_hash else {
            return;
        };
        let Some(id_key) = self.pending_id_key.take() else {
            self.emit_error(
                Error::AssociationFailed,
                "unsolicited associate reply".into(),
                "associate",
                false,
            );
            return;
        };
        let name = match message.get("id").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                self.emit_error(
                    Error::AssociationFailed,
                    "associate reply carried no id".into(),
                    "associate",
                    false,
                );
                return;
            }
        };

        self.registry.add_database(hash, name, id_key);
        self.set_unlocked(hash);
    }

    fn handle_test_associated(&mut self) {
        if let Some(hash) = self.current_hash {
            self.set_unlocked(hash);
        }
    }

    fn set_unlocked(&mut self, hash: DatabaseHash) {
        self.set_state(ClientState::Unlocked);
        self.emit(ClientEvent::DatabaseOpened(hash));
    }

    // ── Plumbing ─────────────────────────────────────────────────────────

    fn connected(&self) -> bool {
        self.connector.as_ref().is_some_and(|c| c.is_connected())
    }

    /// Error for a request made in a state that does not permit it.
    fn wrong_state_error(&self) -> Error {
        if self.connected() {
            Error::DatabaseNotOpen
        } else {
            Error::UnknownError
        }
    }

    /// `keys` list sent with `get-logins`: the association for the current
    /// database.
    fn association_keys(&self) -> Option<Value> {
        let hash = self.current_hash?;
        let name = self.registry.name(&hash)?;
        let key = self.registry.client_id_key(&hash)?;
        Some(json!([{"id": name, "key": key.to_base64()}]))
    }

    async fn send_encrypted(&mut self, action: &str, payload: Value, trigger_unlock: bool) {
        let Some(connector) = &mut self.connector else {
            self.emit_error(Error::UnknownError, "not connected".into(), action, false);
            return;
        };
        if let Err(error) = connector.send_encrypted(action, payload, trigger_unlock).await {
            self.emit_error(error, "failed to send request".into(), action, false);
        }
    }

    /// Fatal tier: report with `unrecoverable`, then escalate out of the
    /// connection. The state machine is `Disconnected` from the caller's
    /// perspective before the event is emitted.
    fn fatal_teardown(&mut self, error: Error, message: String, action: &str) {
        self.set_current_hash(None);
        self.set_state(ClientState::Disconnected);
        self.emit_error(error, message, action, true);
        self.start_disconnect();
    }

    /// Terminal cleanup once the connector reports the process gone.
    fn finish_disconnect(&mut self) {
        self.connector = None;
        self.pending_id_key = None;
        self.set_current_hash(None);
        self.set_state(ClientState::Disconnected);
        self.emit(ClientEvent::Disconnected);
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state != state {
            self.state = state;
            self.publish_snapshot();
            self.emit(ClientEvent::StateChanged(state));
        }
    }

    fn set_current_hash(&mut self, hash: Option<DatabaseHash>) {
        if self.current_hash != hash {
            self.current_hash = hash;
            self.publish_snapshot();
            self.emit(ClientEvent::CurrentDatabaseChanged(hash));
        }
    }

    fn publish_snapshot(&self) {
        let _ = self.snapshot.send(Snapshot {
            state: self.state,
            database: self.current_hash,
        });
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: Error, message: String, action: &str, unrecoverable: bool) {
        self.emit(ClientEvent::ErrorOccured {
            error,
            message,
            action: action.to_string(),
            unrecoverable,
        });
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// `generate-password` replies changed shape across daemon versions:
/// 2.3-era sends `entries: [{password}]`, newer daemons a bare `password`.
fn passwords_from_reply(message: &Value) -> Vec<String> {
    if let Some(entries) = message.get("entries").and_then(Value::as_array) {
        return entries
            .iter()
            .filter_map(|e| e.get("password").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
    }
    message
        .get("password")
        .and_then(Value::as_str)
        .map(|p| vec![p.to_string()])
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_the_default_flag_set() {
        let options = ClientOptions::default();
        assert!(options.allow_new_database);
        assert!(options.trigger_unlock);
        assert!(options.open_on_connect);
        assert!(!options.allow_database_change);
        assert!(!options.disconnect_on_close);
    }

    #[test]
    fn states_are_ordered() {
        assert!(ClientState::Disconnected < ClientState::Connecting);
        assert!(ClientState::Connecting < ClientState::Locked);
        assert!(ClientState::Locked < ClientState::Unlocked);
    }

    #[test]
    fn passwords_parse_both_reply_shapes() {
        let old = serde_json::json!({"entries": [{"password": "a"}, {"password": "b"}]});
        assert_eq!(passwords_from_reply(&old), vec!["a", "b"]);

        let new = serde_json::json!({"password": "c"});
        assert_eq!(passwords_from_reply(&new), vec!["c"]);

        assert!(passwords_from_reply(&serde_json::json!({})).is_empty());
    }
}
