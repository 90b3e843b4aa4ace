//! Login entries exchanged with the caller.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::Error;

/// One additional attribute stored on an entry (KeePassXC "string field").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraField {
    pub name: String,
    pub value: String,
}

/// A login entry, as returned by `get-logins` or passed to `set-login`.
/// An empty `uuid` on `set-login` adds a new entry; a non-empty one updates
/// the entry it names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    pub username: String,
    pub password: String,
    pub name: String,
    pub uuid: String,
    pub extra_fields: Vec<ExtraField>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEntry {
    #[serde(default)]
    login: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    uuid: String,
    /// List of single-pair objects: `[{"KPH: token": "abc"}, ...]`.
    #[serde(default)]
    string_fields: Vec<HashMap<String, String>>,
}

impl From<WireEntry> for Entry {
    fn from(wire: WireEntry) -> Self {
        let extra_fields = wire
            .string_fields
            .into_iter()
            .flat_map(|pairs| pairs.into_iter())
            .map(|(name, value)| ExtraField { name, value })
            .collect();
        Entry {
            username: wire.login,
            password: wire.password,
            name: wire.name,
            uuid: wire.uuid,
            extra_fields,
        }
    }
}

/// Decode the `entries` array of a `get-logins` reply.
pub(crate) fn entries_from_reply(message: &Value) -> Result<Vec<Entry>, Error> {
    let entries = match message.get("entries") {
        Some(entries) => entries.clone(),
        None => return Ok(Vec::new()),
    };
    let wire: Vec<WireEntry> =
        serde_json::from_value(entries).map_err(|_| Error::JsonParseError)?;
    Ok(wire.into_iter().map(Entry::from).collect())
}
