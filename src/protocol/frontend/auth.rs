//! Authentication messages and password hashing.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::protocol::codec::MessageBuilder;

/// SASL mechanism name for SCRAM-SHA-256.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// GS2 header for "no channel binding".
const GS2_HEADER: &str = "n,,";

/// Write a PasswordMessage (cleartext or MD5 hashed password).
pub fn write_password(buf: &mut Vec<u8>, password: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(password);
    msg.finish();
}

/// Write a SASLInitialResponse message.
pub fn write_sasl_initial_response(buf: &mut Vec<u8>, mechanism: &str, initial_response: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(mechanism);
    msg.write_i32(initial_response.len() as i32);
    msg.write_bytes(initial_response);
    msg.finish();
}

/// Write a SASLResponse message.
pub fn write_sasl_response(buf: &mut Vec<u8>, response: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_bytes(response);
    msg.finish();
}

/// Compute MD5 password hash: `"md5" + md5(md5(password + username) + salt)`.
pub fn md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    use md5::Md5;

    let inner = Md5::new()
        .chain_update(password.as_bytes())
        .chain_update(username.as_bytes())
        .finalize();
    let outer = Md5::new()
        .chain_update(format!("{:x}", inner).as_bytes())
        .chain_update(salt)
        .finalize();

    format!("md5{:x}", outer)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| Error::Auth(format!("HMAC key: {e}")))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

#[derive(Debug)]
enum ScramState {
    /// client-first-message sent
    Started,
    /// client-final-message sent; keep what the server signature is checked against
    Proved {
        salted_password: [u8; 32],
        auth_message: String,
    },
}

/// SCRAM-SHA-256 exchange (RFC 7677) without channel binding.
///
/// PostgreSQL ignores the SCRAM user name and takes it from the startup
/// message, so the connection passes an empty one.
#[derive(Debug)]
pub struct ScramSha256 {
    user: String,
    password: String,
    nonce: String,
    state: ScramState,
}

impl ScramSha256 {
    /// Start an exchange with a fresh random nonce.
    pub fn new(password: &str) -> Self {
        use rand::Rng;

        let mut nonce = [0u8; 18];
        rand::rng().fill(&mut nonce);
        Self::with_nonce("", password, &BASE64.encode(nonce))
    }

    /// Start an exchange with a caller-chosen user name and nonce.
    pub fn with_nonce(user: &str, password: &str, nonce: &str) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
            nonce: nonce.to_string(),
            state: ScramState::Started,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.user, self.nonce)
    }

    /// The client-first-message.
    pub fn client_first(&self) -> String {
        format!("{}{}", GS2_HEADER, self.client_first_bare())
    }

    /// Consume the server-first-message and produce the client-final-message.
    pub fn client_final(&mut self, server_first: &str) -> Result<String> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_at_checked(2) {
                Some(("r=", v)) => nonce = Some(v),
                Some(("s=", v)) => salt = Some(v),
                Some(("i=", v)) => iterations = v.parse::<u32>().ok(),
                _ => {}
            }
        }
        let (Some(nonce), Some(salt), Some(iterations)) = (nonce, salt, iterations) else {
            return Err(Error::Auth(format!(
                "malformed server-first-message: {server_first}"
            )));
        };
        if !nonce.starts_with(&self.nonce) {
            return Err(Error::Auth("server nonce does not extend client nonce".into()));
        }
        let salt = BASE64
            .decode(salt)
            .map_err(|e| Error::Auth(format!("invalid salt: {e}")))?;

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(client_key);

        let without_proof = format!("c={},r={}", BASE64.encode(GS2_HEADER), nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );
        let signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;

        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.state = ScramState::Proved {
            salted_password,
            auth_message,
        };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }

    /// Check the server-final-message signature.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        let ScramState::Proved {
            salted_password,
            auth_message,
        } = &self.state
        else {
            return Err(Error::Auth("server-final-message before client-final".into()));
        };
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(Error::Auth(format!("server rejected SCRAM proof: {err}")));
        }
        let signature = server_final
            .strip_prefix("v=")
            .ok_or_else(|| Error::Auth("malformed server-final-message".into()))
            .and_then(|v| {
                BASE64
                    .decode(v)
                    .map_err(|e| Error::Auth(format!("invalid server signature: {e}")))
            })?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;
        if signature.as_slice() != expected.as_slice() {
            return Err(Error::Auth("server signature mismatch".into()));
        }
        Ok(())
    }
}
