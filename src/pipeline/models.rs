use uuid::Uuid;

/// What the reading stage hands to the handling stage. `id` names the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgToHandle {
    Request { id: Uuid, text: String },
    /// The line could not be read as a request; the connection is closed
    /// after the error is answered.
    Invalid { id: Uuid, reason: String },
    /// The client finished sending; runs it started are still answered.
    Eof { id: Uuid },
    /// The client went away.
    Closed { id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgToRes {
    Line { id: Uuid, text: String },
    Close { id: Uuid },
}

impl MsgToRes {
    pub fn line(id: Uuid, text: impl Into<String>) -> Self {
        MsgToRes::Line {
            id,
            text: text.into(),
        }
    }
}
