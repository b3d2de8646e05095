//! Simple query protocol state machine.

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::handler::TextHandler;
use crate::protocol::backend::{
    CommandComplete, DataRow, ErrorResponse, RawMessage, ReadyForQuery, RowDescription, msg_type,
};
use crate::protocol::frontend::{write_copy_fail, write_query};
use crate::protocol::types::TransactionStatus;

use super::action::{Action, AsyncMessage};

/// Simple query state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    WaitingResponse,
    ProcessingRows,
    SkippingCopy,
    WaitingReady,
    Finished,
}

/// Simple query protocol state machine.
///
/// An ErrorResponse does not end the machine: the server still sends
/// ReadyForQuery, and the error is kept until then so the connection is
/// never left between a query and its completion. Read it with
/// [`take_error`](Self::take_error) once [`Action::Finished`] is returned.
pub struct SimpleQueryStateMachine<H> {
    state: State,
    handler: H,
    column_buffer: Vec<u8>,
    error: Option<Error>,
    transaction_status: TransactionStatus,
}

impl<H: TextHandler> SimpleQueryStateMachine<H> {
    /// Create a new simple query state machine.
    pub fn new(handler: H) -> Self {
        Self {
            state: State::Initial,
            handler,
            column_buffer: Vec::new(),
            error: None,
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// Get the transaction status from the final ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Take the first error reported during the query, if any.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Consume the state machine and return the handler.
    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Write the Query message.
    pub fn start(&mut self, buffer_set: &mut BufferSet, query: &str) -> Action {
        write_query(&mut buffer_set.write_buffer, query);
        self.state = State::WaitingResponse;
        Action::WriteAndReadMessage
    }

    /// Process the message held in `buffer_set`.
    pub fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;

        if RawMessage::is_async_type(type_byte) {
            let msg = AsyncMessage::parse(type_byte, &buffer_set.read_buffer)?;
            return Ok(Action::HandleAsyncMessageAndReadMessage(msg));
        }

        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(&buffer_set.read_buffer)?;
            self.record_error(error.into_error());
            // The rest of a multi-statement query is skipped by the server.
            self.state = State::WaitingReady;
            return Ok(Action::ReadMessage);
        }

        if type_byte == msg_type::READY_FOR_QUERY {
            let ready = ReadyForQuery::parse(&buffer_set.read_buffer)?;
            self.transaction_status = ready.transaction_status()?;
            self.state = State::Finished;
            return Ok(Action::Finished);
        }

        match self.state {
            State::WaitingResponse => self.handle_response(buffer_set),
            State::ProcessingRows => self.handle_rows(buffer_set),
            State::SkippingCopy => self.handle_copy_out(buffer_set),
            State::WaitingReady => Err(Error::Protocol(format!(
                "Expected ReadyForQuery, got '{}'",
                type_byte as char
            ))),
            State::Initial | State::Finished => {
                Err(Error::Protocol(format!("Unexpected state {:?}", self.state)))
            }
        }
    }

    fn record_error(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn handle_response(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;

        match type_byte {
            msg_type::ROW_DESCRIPTION => {
                self.column_buffer.clear();
                self.column_buffer.extend_from_slice(payload);
                let cols = RowDescription::parse(&self.column_buffer)?;
                self.handler.result_start(&cols)?;
                self.state = State::ProcessingRows;
                Ok(Action::ReadMessage)
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(payload)?;
                self.handler.result_end(complete)?;
                Ok(Action::ReadMessage)
            }
            msg_type::EMPTY_QUERY_RESPONSE => {
                self.handler.empty_query()?;
                Ok(Action::ReadMessage)
            }
            msg_type::COPY_IN_RESPONSE => {
                self.record_error(Error::Unsupported("COPY FROM STDIN".into()));
                write_copy_fail(&mut buffer_set.write_buffer, "COPY is not supported");
                self.state = State::WaitingReady;
                Ok(Action::WriteAndReadMessage)
            }
            msg_type::COPY_OUT_RESPONSE => {
                self.record_error(Error::Unsupported("COPY TO STDOUT".into()));
                self.state = State::SkippingCopy;
                Ok(Action::ReadMessage)
            }
            _ => Err(Error::Protocol(format!(
                "Unexpected message in query response: '{}'",
                type_byte as char
            ))),
        }
    }

    fn handle_rows(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;

        match type_byte {
            msg_type::DATA_ROW => {
                let cols = RowDescription::parse(&self.column_buffer)?;
                let row = DataRow::parse(payload)?;
                self.handler.row(&cols, row)?;
                Ok(Action::ReadMessage)
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(payload)?;
                self.handler.result_end(complete)?;
                // More commands may follow
                self.state = State::WaitingResponse;
                Ok(Action::ReadMessage)
            }
            _ => Err(Error::Protocol(format!(
                "Unexpected message in row processing: '{}'",
                type_byte as char
            ))),
        }
    }

    fn handle_copy_out(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        match buffer_set.type_byte {
            msg_type::COPY_DATA => Ok(Action::ReadMessage),
            msg_type::COPY_DONE | msg_type::COMMAND_COMPLETE => {
                self.state = State::WaitingResponse;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected message in COPY OUT: '{}'",
                other as char
            ))),
        }
    }
}
