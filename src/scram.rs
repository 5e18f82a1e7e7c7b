//! Client side of SCRAM-SHA-256 (RFC 5802, RFC 7677).
//!
//! The exchange is modeled as a typestate: each step consumes the previous
//! one, so messages cannot be produced out of order. The username in the
//! client-first-message is left empty; Postgres takes the user from the
//! startup message.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac_array;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 24;
const CHANNEL_BINDING: &str = "biws"; // base64("n,,")

/// SCRAM exchange failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScramError {
    /// The server's messages did not follow the mechanism, e.g. the combined
    /// nonce does not start with the client nonce or an attribute failed to
    /// parse.
    MechanismViolated,
    /// The final server signature did not match the locally computed value.
    ServerVerificationFailed,
}

type HmacSha256 = Hmac<Sha256>;

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        HmacSha256::new_from_slice(key).expect("hmac-sha256 accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// The initial state: produces the client-first-message.
pub(crate) struct ScramClient {
    password: String,
    nonce: String,
}

impl ScramClient {
    /// Creates a client with a fresh random nonce.
    pub fn new(password: impl Into<String>) -> Self {
        let mut raw = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut raw);
        Self::with_nonce(password, BASE64.encode(raw))
    }

    /// Creates a client with the given nonce.
    pub fn with_nonce(password: impl Into<String>, nonce: impl Into<String>) -> Self {
        ScramClient {
            password: password.into(),
            nonce: nonce.into(),
        }
    }

    /// Produces the client-first-message and advances the exchange.
    pub fn client_first(self) -> (ScramServerFirst, String) {
        let bare = format!("n=,r={}", self.nonce);
        let message = format!("n,,{bare}");
        (
            ScramServerFirst {
                password: self.password,
                nonce: self.nonce,
                client_first_bare: bare,
            },
            message,
        )
    }
}

/// Awaiting the server-first-message.
pub(crate) struct ScramServerFirst {
    password: String,
    nonce: String,
    client_first_bare: String,
}

impl ScramServerFirst {
    /// Handles `r=<nonce>,s=<salt>,i=<iterations>`, producing the
    /// client-final-message.
    pub fn handle_server_first(
        self,
        server_first: &str,
    ) -> Result<(ScramServerFinal, String), ScramError> {
        let mut combined_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attribute in server_first.split(',') {
            match attribute.split_at_checked(2) {
                Some(("r=", value)) => combined_nonce = Some(value),
                Some(("s=", value)) => salt = Some(value),
                Some(("i=", value)) => iterations = Some(value),
                _ => {}
            }
        }
        let (Some(combined_nonce), Some(salt), Some(iterations)) =
            (combined_nonce, salt, iterations)
        else {
            return Err(ScramError::MechanismViolated);
        };

        if !combined_nonce.starts_with(&self.nonce) {
            return Err(ScramError::MechanismViolated);
        }
        let salt = BASE64
            .decode(salt)
            .map_err(|_| ScramError::MechanismViolated)?;
        let iterations: u32 = iterations
            .parse()
            .map_err(|_| ScramError::MechanismViolated)?;

        let salted_password =
            pbkdf2_hmac_array::<Sha256, 32>(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c={CHANNEL_BINDING},r={combined_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }

        let server_key = hmac(&salted_password, b"Server Key");
        let server_signature = hmac(&server_key, auth_message.as_bytes());

        let message = format!("{without_proof},p={}", BASE64.encode(proof));
        Ok((ScramServerFinal { server_signature }, message))
    }
}

/// Awaiting the server-final-message.
#[derive(Debug)]
pub(crate) struct ScramServerFinal {
    server_signature: [u8; 32],
}

impl ScramServerFinal {
    /// Verifies `v=<signature>` against the locally computed value.
    pub fn handle_server_final(self, server_final: &str) -> Result<(), ScramError> {
        let signature = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or(ScramError::MechanismViolated)?;
        let signature = BASE64
            .decode(signature)
            .map_err(|_| ScramError::MechanismViolated)?;

        if signature == self.server_signature {
            Ok(())
        } else {
            Err(ScramError::ServerVerificationFailed)
        }
    }
}
