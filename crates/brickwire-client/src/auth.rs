//! Secret-based authentication with the Brick Daemon.
//!
//! The daemon hands out a 4-byte server nonce. The client answers with its
//! own 4-byte nonce followed by `HMAC-SHA1(secret, server_nonce || client_nonce)`.

use std::time::Duration;

use brickwire_protocol::{BRICK_DAEMON_UID, function};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::{debug, warn};

use crate::correlator::{Correlator, Request};
use crate::error::{ClientError, ClientResult};
use crate::transport::PacketWriter;

type HmacSha1 = Hmac<Sha1>;

const NONCE_LENGTH: usize = 4;

/// Computes HMAC-SHA1 of `data` keyed with `secret`.
pub fn hmac_sha1(secret: &[u8], data: &[u8]) -> ClientResult<[u8; 20]> {
    let mut mac = HmacSha1::new_from_slice(secret)
        .map_err(|e| ClientError::AuthenticationFailed(e.to_string()))?;
    mac.update(data);

    let mut digest = [0u8; 20];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    Ok(digest)
}

/// Builds the payload of the authenticate request.
pub fn authentication_payload(
    secret: &str,
    server_nonce: &[u8],
    client_nonce: [u8; NONCE_LENGTH],
) -> ClientResult<Vec<u8>> {
    if !secret.is_ascii() {
        return Err(ClientError::AuthenticationFailed(
            "secret contains non-ASCII characters".to_string(),
        ));
    }

    let mut nonces = Vec::with_capacity(2 * NONCE_LENGTH);
    nonces.extend_from_slice(server_nonce);
    nonces.extend_from_slice(&client_nonce);
    let digest = hmac_sha1(secret.as_bytes(), &nonces)?;

    let mut payload = client_nonce.to_vec();
    payload.extend_from_slice(&digest);
    Ok(payload)
}

/// Runs the authentication handshake on an open connection.
///
/// Link failures while fetching the nonce are returned unchanged so the
/// caller can treat them like any other transport error. Everything else
/// is [`ClientError::AuthenticationFailed`].
pub async fn authenticate<W: PacketWriter>(
    correlator: &Correlator,
    writer: &W,
    secret: &str,
    timeout: Duration,
) -> ClientResult<()> {
    let nonce_request = Request::new(BRICK_DAEMON_UID, function::GET_AUTHENTICATION_NONCE)
        .expect_response_length(NONCE_LENGTH);
    let server_nonce = correlator
        .call(writer, nonce_request, timeout)
        .await
        .map_err(|e| {
            if e.is_transport() {
                e
            } else {
                ClientError::AuthenticationFailed(format!("could not get nonce: {e}"))
            }
        })?;

    let client_nonce: [u8; NONCE_LENGTH] = rand::random();
    let payload = authentication_payload(secret, &server_nonce, client_nonce)?;

    let request = Request::new(BRICK_DAEMON_UID, function::AUTHENTICATE)
        .with_payload(payload)
        .expect_response_length(0);

    match correlator.call(writer, request, timeout).await {
        Ok(_) => {
            debug!("authenticated");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "authentication rejected");
            Err(ClientError::AuthenticationFailed(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::Mutex;

    use brickwire_protocol::{ErrorCode, Packet};

    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn hmac_matches_rfc2202() {
        let digest = hmac_sha1(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(hex(&digest), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
    }

    #[test]
    fn payload_is_client_nonce_then_digest() {
        let payload = authentication_payload("secret", &[1, 2, 3, 4], [5, 6, 7, 8]).unwrap();
        assert_eq!(payload.len(), 24);
        assert_eq!(&payload[..4], &[5, 6, 7, 8]);

        let digest = hmac_sha1(b"secret", &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(&payload[4..], &digest);
    }

    #[test]
    fn non_ascii_secret_is_rejected() {
        let result = authentication_payload("gehëim", &[0; 4], [0; 4]);
        assert!(matches!(result, Err(ClientError::AuthenticationFailed(_))));
    }

    /// Plays the daemon side of the handshake from inside `send`.
    struct FakeDaemon<'a> {
        correlator: &'a Correlator,
        secret: &'static str,
        server_nonce: [u8; 4],
        sent: Mutex<Vec<Packet>>,
    }

    impl PacketWriter for FakeDaemon<'_> {
        fn send(&self, packet: &Packet) -> impl Future<Output = ClientResult<()>> + Send {
            self.sent.lock().unwrap().push(packet.clone());

            let reply = |payload: Vec<u8>| {
                Packet::new(
                    packet.uid(),
                    packet.function_id(),
                    packet.sequence_number(),
                    true,
                    payload,
                )
                .unwrap()
            };

            let response = match packet.function_id() {
                function::GET_AUTHENTICATION_NONCE => reply(self.server_nonce.to_vec()),
                function::AUTHENTICATE => {
                    let client_nonce: [u8; 4] = packet.payload[..4].try_into().unwrap();
                    let expected =
                        authentication_payload(self.secret, &self.server_nonce, client_nonce)
                            .unwrap();
                    if packet.payload.as_ref() == expected.as_slice() {
                        reply(Vec::new())
                    } else {
                        reply(Vec::new()).with_error_code(ErrorCode::InvalidParameter)
                    }
                }
                _ => reply(Vec::new()).with_error_code(ErrorCode::FunctionNotSupported),
            };
            self.correlator.route(response);
            std::future::ready(Ok(()))
        }
    }

    fn daemon(correlator: &Correlator) -> FakeDaemon<'_> {
        FakeDaemon {
            correlator,
            secret: "right",
            server_nonce: [9, 8, 7, 6],
            sent: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn handshake_with_correct_secret() {
        let correlator = Correlator::new();
        let daemon = daemon(&correlator);

        authenticate(&correlator, &daemon, "right", Duration::from_secs(1))
            .await
            .unwrap();

        let sent = daemon.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].uid(), BRICK_DAEMON_UID);
        assert_eq!(sent[1].function_id(), function::AUTHENTICATE);
        assert_eq!(sent[1].payload.len(), 24);
    }

    #[tokio::test]
    async fn handshake_with_wrong_secret_fails() {
        let correlator = Correlator::new();
        let daemon = daemon(&correlator);

        let result = authenticate(&correlator, &daemon, "wrong", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ClientError::AuthenticationFailed(_))));
    }
}
