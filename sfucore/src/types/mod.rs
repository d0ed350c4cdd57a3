pub mod call;
pub mod track;

pub use call::{AvFlags, CallId, ChatId, Cid, KeyId, SpeakerState, TermCode, UserId};
pub use track::{Direction, InitVector, TrackDescriptor, TrackKind};
