use serde::{Deserialize, Serialize};
use std::fmt;

/// Relay-assigned identifier of one participant connection inside a call.
pub type Cid = u32;

/// Identifier of a rotated media key. Only ever increases for a given sender.
pub type KeyId = u32;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Stable identifier of a user, independent of any call.
    UserId
);
string_id!(
    /// Identifier of the chat room a call belongs to.
    ChatId
);
string_id!(
    /// Identifier of a call within its chat.
    CallId
);

/// Audio/video state bitmask as exchanged with the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AvFlags(u8);

impl AvFlags {
    pub const EMPTY: AvFlags = AvFlags(0);
    pub const AUDIO: u8 = 0x01;
    pub const VIDEO: u8 = 0x02;
    pub const ON_HOLD: u8 = 0x80;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn new(audio: bool, video: bool) -> Self {
        let mut bits = 0;
        if audio {
            bits |= Self::AUDIO;
        }
        if video {
            bits |= Self::VIDEO;
        }
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn audio(&self) -> bool {
        self.0 & Self::AUDIO != 0
    }

    pub const fn video(&self) -> bool {
        self.0 & Self::VIDEO != 0
    }

    pub const fn on_hold(&self) -> bool {
        self.0 & Self::ON_HOLD != 0
    }

    pub fn with_audio(self, on: bool) -> Self {
        self.set(Self::AUDIO, on)
    }

    pub fn with_video(self, on: bool) -> Self {
        self.set(Self::VIDEO, on)
    }

    pub fn with_on_hold(self, on: bool) -> Self {
        self.set(Self::ON_HOLD, on)
    }

    fn set(self, bit: u8, on: bool) -> Self {
        if on { Self(self.0 | bit) } else { Self(self.0 & !bit) }
    }
}

impl fmt::Display for AvFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.audio() { "A" } else { "-" },
            if self.video() { "V" } else { "-" },
            if self.on_hold() { "H" } else { "" }
        )
    }
}

/// Whether we are allowed to transmit audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SpeakerState {
    #[default]
    None,
    /// A speak request was sent and awaits a moderator decision.
    Pending,
    Active,
}

/// Why our participation in a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TermCode {
    /// The local user hung up.
    UserHangup,
    /// The relay connection could not be (re)established.
    SignalingFailure,
    /// Reconnection attempts were exhausted or explicitly aborted.
    RetriesExhausted,
    /// The relay closed the session with the given reason code.
    RelayShutdown(u32),
    /// The relay reported an error frame.
    Error(i32),
}

impl TermCode {
    pub fn is_user_initiated(&self) -> bool {
        matches!(self, Self::UserHangup)
    }
}
