//! The single error taxonomy shared by the wire protocol and the client.
//!
//! Codes `0x0001..=0x000F` are reported by KeePassXC itself inside reply
//! messages (`errorCode` field). Codes `0x00010000` and above are generated
//! locally by this library. The numeric mapping is stable — it is part of
//! the public API and mirrors what the daemon sends.

/// Every error the client can surface, daemon-reported or locally generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("unknown error")]
    UnknownError,

    // ── Reported by KeePassXC ────────────────────────────────────────────
    #[error("database is not open")]
    DatabaseNotOpen,
    #[error("database hash not received")]
    DatabaseHashNotReceived,
    #[error("public key not received")]
    PublicKeyNotReceived,
    #[error("cannot decrypt message")]
    CannotDecryptMessage,
    #[error("timeout or cancelled by user")]
    Timeout,
    #[error("action denied by user")]
    ActionDenied,
    #[error("cannot encrypt message")]
    CannotEncryptMessage,
    #[error("association failed")]
    AssociationFailed,
    #[error("key change failed")]
    KeyChangeFailed,
    #[error("encryption key is not recognized")]
    EncryptionKeyUnrecognized,
    #[error("no saved database found")]
    NoSavedDatabase,
    #[error("incorrect action")]
    IncorrectAction,
    #[error("empty message received")]
    EmptyMessageReceived,
    #[error("no URL provided")]
    NoUrlProvided,
    #[error("no logins found")]
    NoLoginsFound,

    // ── Generated by this library ────────────────────────────────────────
    #[error("already connected to KeePassXC")]
    AlreadyConnected,
    #[error("failed to generate session keys")]
    KeyGenerationFailed,
    #[error("received nonce is not an expected reply nonce")]
    ReceivedNonceInvalid,
    #[error("failed to parse JSON message")]
    JsonParseError,
    #[error("KeePassXC version is not supported")]
    UnsupportedVersion,
    #[error("connected database has changed")]
    DatabaseChanged,
    #[error("database was rejected by the host application")]
    DatabaseRejected,
    #[error("action is not supported")]
    UnsupportedAction,
}

impl Error {
    /// Stable numeric code for this error (what the wire carries).
    pub fn code(self) -> i64 {
        match self {
            Error::UnknownError => -1,

            Error::DatabaseNotOpen => 0x0001,
            Error::DatabaseHashNotReceived => 0x0002,
            Error::PublicKeyNotReceived => 0x0003,
            Error::CannotDecryptMessage => 0x0004,
            Error::Timeout => 0x0005,
            Error::ActionDenied => 0x0006,
            Error::CannotEncryptMessage => 0x0007,
            Error::AssociationFailed => 0x0008,
            Error::KeyChangeFailed => 0x0009,
            Error::EncryptionKeyUnrecognized => 0x000A,
            Error::NoSavedDatabase => 0x000B,
            Error::IncorrectAction => 0x000C,
            Error::EmptyMessageReceived => 0x000D,
            Error::NoUrlProvided => 0x000E,
            Error::NoLoginsFound => 0x000F,

            Error::AlreadyConnected => 0x0001_0000,
            Error::KeyGenerationFailed => 0x0002_0000,
            Error::ReceivedNonceInvalid => 0x0003_0000,
            Error::JsonParseError => 0x0004_0000,
            Error::UnsupportedVersion => 0x0005_0000,
            Error::DatabaseChanged => 0x0006_0000,
            Error::DatabaseRejected => 0x0007_0000,
            Error::UnsupportedAction => 0x0008_0000,
        }
    }

    /// Map a daemon-supplied `errorCode` back to a typed error.
    ///
    /// Unrecognized codes collapse to [`Error::UnknownError`] rather than
    /// failing — the daemon may be newer than this library.
    pub fn from_code(code: i64) -> Self {
        match code {
            0x0001 => Error::DatabaseNotOpen,
            0x0002 => Error::DatabaseHashNotReceived,
            0x0003 => Error::PublicKeyNotReceived,
            0x0004 => Error::CannotDecryptMessage,
            0x0005 => Error::Timeout,
            0x0006 => Error::ActionDenied,
            0x0007 => Error::CannotEncryptMessage,
            0x0008 => Error::AssociationFailed,
            0x0009 => Error::KeyChangeFailed,
            0x000A => Error::EncryptionKeyUnrecognized,
            0x000B => Error::NoSavedDatabase,
            0x000C => Error::IncorrectAction,
            0x000D => Error::EmptyMessageReceived,
            0x000E => Error::NoUrlProvided,
            0x000F => Error::NoLoginsFound,

            0x0001_0000 => Error::AlreadyConnected,
            0x0002_0000 => Error::KeyGenerationFailed,
            0x0003_0000 => Error::ReceivedNonceInvalid,
            0x0004_0000 => Error::JsonParseError,
            0x0005_0000 => Error::UnsupportedVersion,
            0x0006_0000 => Error::DatabaseChanged,
            0x0007_0000 => Error::DatabaseRejected,
            0x0008_0000 => Error::UnsupportedAction,

            _ => Error::UnknownError,
        }
    }

    /// True for protocol-integrity failures that must tear the connection
    /// down (replay, crypto verification, undecodable encrypted payloads,
    /// unacceptable peer).
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Error::ReceivedNonceInvalid
                | Error::CannotDecryptMessage
                | Error::JsonParseError
                | Error::DatabaseChanged
                | Error::DatabaseRejected
                | Error::UnsupportedVersion
                | Error::UnsupportedAction
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips() {
        let all = [
            Error::DatabaseNotOpen,
            Error::DatabaseHashNotReceived,
            Error::PublicKeyNotReceived,
            Error::CannotDecryptMessage,
            Error::Timeout,
            Error::ActionDenied,
            Error::CannotEncryptMessage,
            Error::AssociationFailed,
            Error::KeyChangeFailed,
            Error::EncryptionKeyUnrecognized,
            Error::NoSavedDatabase,
            Error::IncorrectAction,
            Error::EmptyMessageReceived,
            Error::NoUrlProvided,
            Error::NoLoginsFound,
            Error::AlreadyConnected,
            Error::KeyGenerationFailed,
            Error::ReceivedNonceInvalid,
            Error::JsonParseError,
            Error::UnsupportedVersion,
            Error::DatabaseChanged,
            Error::DatabaseRejected,
            Error::UnsupportedAction,
        ];
        for e in all {
            assert_eq!(Error::from_code(e.code()), e);
        }
    }

    #[test]
    fn unknown_codes_collapse() {
        assert_eq!(Error::from_code(0x7777), Error::UnknownError);
        assert_eq!(Error::from_code(-1), Error::UnknownError);
    }

    #[test]
    fn replay_and_crypto_failures_are_fatal() {
        assert!(Error::ReceivedNonceInvalid.is_fatal());
        assert!(Error::CannotDecryptMessage.is_fatal());
        assert!(!Error::NoLoginsFound.is_fatal());
        assert!(!Error::Timeout.is_fatal());
    }
}
