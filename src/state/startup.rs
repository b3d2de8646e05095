//! Connection startup and authentication state machine.

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, RawMessage, ReadyForQuery, msg_type,
};
use crate::protocol::frontend::auth::{SCRAM_SHA_256, ScramSha256, md5_password};
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_startup,
};
use crate::protocol::types::TransactionStatus;

use super::action::{Action, AsyncMessage};

/// Connection state during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupState {
    Initial,
    WaitingAuth,
    SaslInProgress,
    WaitingAuthResult,
    WaitingReady,
    Ready,
    Failed,
}

/// Connection startup state machine.
pub struct StartupStateMachine {
    state: StartupState,
    user: String,
    password: Option<String>,
    startup_params: Vec<(String, String)>,
    backend_pid: Option<u32>,
    transaction_status: TransactionStatus,
    scram: Option<ScramSha256>,
}

impl StartupStateMachine {
    /// Create a new startup state machine.
    pub fn new(opts: &Opts) -> Self {
        let mut startup_params = vec![
            ("user".to_string(), opts.user.clone()),
            ("client_encoding".to_string(), "UTF8".to_string()),
        ];
        if let Some(db) = &opts.database {
            startup_params.push(("database".to_string(), db.clone()));
        }
        if let Some(app) = &opts.application_name {
            startup_params.push(("application_name".to_string(), app.clone()));
        }
        startup_params.extend(opts.params.iter().cloned());

        Self {
            state: StartupState::Initial,
            user: opts.user.clone(),
            password: opts.password.clone(),
            startup_params,
            backend_pid: None,
            transaction_status: TransactionStatus::Idle,
            scram: None,
        }
    }

    /// Get the current startup state.
    pub fn state(&self) -> StartupState {
        self.state
    }

    /// Backend process ID from BackendKeyData.
    pub fn backend_pid(&self) -> Option<u32> {
        self.backend_pid
    }

    /// Transaction status from the final ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Write the StartupMessage.
    pub fn start(&mut self, buffer_set: &mut BufferSet) -> Action {
        let params: Vec<(&str, &str)> = self
            .startup_params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        write_startup(&mut buffer_set.write_buffer, &params);
        self.state = StartupState::WaitingAuth;
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
            self.state = StartupState::Failed;
            return Err(error.into_error());
        }

        let result = match self.state {
            StartupState::WaitingAuth
            | StartupState::SaslInProgress
            | StartupState::WaitingAuthResult => self.handle_auth(buffer_set),
            StartupState::WaitingReady => self.handle_ready(buffer_set),
            _ => Err(Error::Protocol(format!(
                "Unexpected message in startup state {:?}",
                self.state
            ))),
        };
        if result.is_err() {
            self.state = StartupState::Failed;
        }
        result
    }

    fn password(&self) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| Error::Auth("Password required but not provided".into()))
    }

    fn handle_auth(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if buffer_set.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "Expected Authentication message, got '{}'",
                buffer_set.type_byte as char
            )));
        }

        let read_buffer = std::mem::take(&mut buffer_set.read_buffer);
        let action = self.handle_auth_message(
            AuthenticationMessage::parse(&read_buffer)?,
            &mut buffer_set.write_buffer,
        );
        buffer_set.read_buffer = read_buffer;
        action
    }

    fn handle_auth_message(
        &mut self,
        auth: AuthenticationMessage<'_>,
        out: &mut Vec<u8>,
    ) -> Result<Action> {
        match (self.state, auth) {
            (_, AuthenticationMessage::Ok) => {
                self.state = StartupState::WaitingReady;
                Ok(Action::ReadMessage)
            }
            (StartupState::WaitingAuth, AuthenticationMessage::CleartextPassword) => {
                write_password(out, self.password()?);
                self.state = StartupState::WaitingAuthResult;
                Ok(Action::WriteAndReadMessage)
            }
            (StartupState::WaitingAuth, AuthenticationMessage::Md5Password { salt }) => {
                let hashed = md5_password(&self.user, self.password()?, &salt);
                write_password(out, &hashed);
                self.state = StartupState::WaitingAuthResult;
                Ok(Action::WriteAndReadMessage)
            }
            (StartupState::WaitingAuth, AuthenticationMessage::Sasl { mechanisms }) => {
                if !mechanisms.contains(&SCRAM_SHA_256) {
                    return Err(Error::Auth(format!(
                        "No supported SASL mechanism. Server offers: {:?}",
                        mechanisms
                    )));
                }
                let scram = ScramSha256::new(self.password()?);
                write_sasl_initial_response(out, SCRAM_SHA_256, scram.client_first().as_bytes());
                self.scram = Some(scram);
                self.state = StartupState::SaslInProgress;
                Ok(Action::WriteAndReadMessage)
            }
            (StartupState::SaslInProgress, AuthenticationMessage::SaslContinue { data }) => {
                let scram = self
                    .scram
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;
                let server_first = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-first-message: {}", e)))?;
                let client_final = scram.client_final(server_first)?;
                write_sasl_response(out, client_final.as_bytes());
                Ok(Action::WriteAndReadMessage)
            }
            (StartupState::SaslInProgress, AuthenticationMessage::SaslFinal { data }) => {
                let scram = self
                    .scram
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;
                let server_final = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-final-message: {}", e)))?;
                scram.verify_server_final(server_final)?;
                self.state = StartupState::WaitingAuthResult;
                Ok(Action::ReadMessage)
            }
            (state, auth) => Err(Error::Unsupported(format!(
                "authentication request {:?} in state {:?}",
                auth, state
            ))),
        }
    }

    fn handle_ready(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let payload = &buffer_set.read_buffer;

        match buffer_set.type_byte {
            msg_type::BACKEND_KEY_DATA => {
                self.backend_pid = Some(BackendKeyData::parse(payload)?.process_id());
                Ok(Action::ReadMessage)
            }
            msg_type::NEGOTIATE_PROTOCOL_VERSION => Ok(Action::ReadMessage),
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(payload)?.transaction_status()?;
                self.state = StartupState::Ready;
                Ok(Action::Finished)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected message during startup: '{}'",
                other as char
            ))),
        }
    }
}
