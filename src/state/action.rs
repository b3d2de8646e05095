//! Action types for state machine I/O requests.

use crate::error::{ErrorFields, Result};
use crate::protocol::backend::{NoticeResponse, NotificationResponse, ParameterStatus, msg_type};

/// Action requested by a state machine.
///
/// The caller should perform the requested I/O and then call the
/// appropriate method to continue the state machine.
#[derive(Debug)]
pub enum Action {
    /// Read a PostgreSQL message from the server into the buffer set,
    /// then call `step()` again.
    ReadMessage,

    /// Send `buffer_set.write_buffer` to the server, then read a message.
    WriteAndReadMessage,

    /// An asynchronous message was received.
    ///
    /// The caller should handle the message, read the next message,
    /// then call `step()` again.
    HandleAsyncMessageAndReadMessage(AsyncMessage),

    /// The state machine has finished.
    Finished,
}

/// Asynchronous message from the server.
///
/// These can arrive at any time, including while no query is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncMessage {
    /// Notification from LISTEN/NOTIFY.
    Notification {
        /// PID of the notifying backend process
        pid: u32,
        /// Channel name
        channel: String,
        /// Notification payload
        payload: String,
    },

    /// Non-fatal notice/warning from server.
    Notice(ErrorFields),

    /// Server parameter value changed.
    ParameterChanged {
        /// Parameter name
        name: String,
        /// New value
        value: String,
    },
}

impl AsyncMessage {
    /// Parse an asynchronous message. The caller has already checked the
    /// type byte with [`RawMessage::is_async_type`](crate::protocol::RawMessage::is_async_type).
    pub fn parse(type_byte: u8, payload: &[u8]) -> Result<Self> {
        match type_byte {
            msg_type::NOTIFICATION_RESPONSE => {
                let n = NotificationResponse::parse(payload)?;
                Ok(AsyncMessage::Notification {
                    pid: n.pid,
                    channel: n.channel.to_string(),
                    payload: n.payload.to_string(),
                })
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(payload)?;
                Ok(AsyncMessage::ParameterChanged {
                    name: param.name.to_string(),
                    value: param.value.to_string(),
                })
            }
            _ => Ok(AsyncMessage::Notice(NoticeResponse::parse(payload)?.0)),
        }
    }
}
