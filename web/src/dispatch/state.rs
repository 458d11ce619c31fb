use std::fmt;

/// Where a streaming route's response stands.
///
/// `Initial → Responded` is an early synchronous answer; `Initial →
/// Streaming → Closed` is the streaming path. Every other move is a
/// programming fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Initial,
    Responded,
    Streaming,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    RespondedTwice,
    StartedTwice,
    StartAfterRespond,
    RespondAfterStart,
    CloseBeforeStart,
    ForgotToStartOrRespond,
}

impl ResponseState {
    pub fn respond(self) -> Result<Self, DispatchError> {
        match self {
            ResponseState::Initial => Ok(ResponseState::Responded),
            ResponseState::Responded => Err(DispatchError::RespondedTwice),
            ResponseState::Streaming | ResponseState::Closed => {
                Err(DispatchError::RespondAfterStart)
            }
        }
    }

    pub fn start(self) -> Result<Self, DispatchError> {
        match self {
            ResponseState::Initial => Ok(ResponseState::Streaming),
            ResponseState::Responded => Err(DispatchError::StartAfterRespond),
            ResponseState::Streaming | ResponseState::Closed => Err(DispatchError::StartedTwice),
        }
    }

    /// Idempotent once closed.
    pub fn close(self) -> Result<Self, DispatchError> {
        match self {
            ResponseState::Streaming | ResponseState::Closed => Ok(ResponseState::Closed),
            ResponseState::Initial | ResponseState::Responded => {
                Err(DispatchError::CloseBeforeStart)
            }
        }
    }

    /// Check made when the handler returns.
    pub fn finish(self) -> Result<(), DispatchError> {
        match self {
            ResponseState::Initial => Err(DispatchError::ForgotToStartOrRespond),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DispatchError::RespondedTwice => "respond() called after a response was already sent",
            DispatchError::StartedTwice => "start() called on a stream that was already started",
            DispatchError::StartAfterRespond => "start() called after respond()",
            DispatchError::RespondAfterStart => "respond() called after the stream was started",
            DispatchError::CloseBeforeStart => "close() called before the stream was started",
            DispatchError::ForgotToStartOrRespond => {
                "handler returned without calling start() or respond()"
            }
        };
        write!(f, "Dispatch Error: {msg}")
    }
}

impl std::error::Error for DispatchError {}
