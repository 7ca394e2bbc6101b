//! CRAM-MD5 challenge/response handling (RFC 2195).
//!
//! The server side is a small explicit state machine driven by the ingress
//! AUTH flow; the client side computes the response the observer sends when
//! authenticating against the downstream host. The challenge is the base64
//! text of 16 random bytes and the keyed digest is computed over that text.

use base64ct::{Base64, Encoding};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CramError {
    #[error("invalid response format: expected \"<user> <digest>\"")]
    MalformedResponse,
    #[error("invalid base64 encoding")]
    Base64,
    #[error("authentication exchange already completed")]
    Completed,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    SendChallenge,
    ValidateResponse,
    Done,
}

/// Server half of one authentication exchange. Each instance issues exactly
/// one challenge and validates exactly one response.
pub struct ServerExchange {
    username: String,
    secret: String,
    challenge: String,
    state: State,
}

impl ServerExchange {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        let mut nonce = [0u8; 16];
        rand::rng().fill_bytes(&mut nonce);

        Self {
            username: username.into(),
            secret: secret.into(),
            challenge: Base64::encode_string(&nonce),
            state: State::SendChallenge,
        }
    }

    /// Emits the challenge and advances to response validation.
    pub fn challenge(&mut self) -> Result<&str, CramError> {
        if self.state != State::SendChallenge {
            return Err(CramError::Completed);
        }
        self.state = State::ValidateResponse;
        Ok(&self.challenge)
    }

    /// Validates a decoded `<user> <digest>` response. Returns whether the
    /// digest is the HMAC-MD5 of the issued challenge under the shared
    /// secret and the user matches.
    pub fn validate(&mut self, response: &str) -> Result<bool, CramError> {
        if self.state != State::ValidateResponse {
            return Err(CramError::Completed);
        }
        self.state = State::Done;

        let (user, digest) = response
            .split_once(' ')
            .ok_or(CramError::MalformedResponse)?;
        if user != self.username {
            return Ok(false);
        }

        Ok(digest_matches(
            self.secret.as_bytes(),
            self.challenge.as_bytes(),
            digest,
        ))
    }
}

/// Computes the base64 line a client sends in reply to a 334 challenge.
pub fn client_respond(
    username: &str,
    secret: &str,
    wire_challenge: &str,
) -> Result<String, CramError> {
    let challenge = Base64::decode_vec(wire_challenge.trim()).map_err(|_| CramError::Base64)?;
    let digest = hmac_md5_hex(secret.as_bytes(), &challenge);
    Ok(Base64::encode_string(
        format!("{username} {digest}").as_bytes(),
    ))
}

pub(crate) fn hmac_md5_hex(secret: &[u8], message: &[u8]) -> String {
    let mut mac =
        Hmac::<Md5>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

fn digest_matches(secret: &[u8], message: &[u8], digest_hex: &str) -> bool {
    let Ok(tag) = hex::decode(digest_hex) else {
        return false;
    };
    let mut mac =
        Hmac::<Md5>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.verify_slice(&tag).is_ok()
}
