use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed json frame: {0}")]
    MalformedJson(String),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("frame has neither a command name nor an error code")]
    MissingCommandName,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{command}: missing required field '{field}'")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },
    #[error("{command}: field '{field}' has the wrong type, expected {expected}")]
    WrongType {
        command: &'static str,
        field: &'static str,
        expected: &'static str,
    },
    #[error("invalid hex value: {0}")]
    InvalidHex(String),
    #[error("invalid embedded sdp: {0}")]
    InvalidSdp(String),
}
