//! An in-process Postgres backend for integration tests.
//!
//! Each opened channel gets its own server task speaking enough of the v3
//! protocol for the client under test: startup, the configured
//! authentication exchange, simple queries for transaction control, and the
//! extended protocol for a handful of recognized statements.

#![allow(dead_code)]

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac_array;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use pg_client::{
    BoxedTransport, ChannelOpener, ConnectionConfig, ConnectionFactory, Credential,
};

/// A factory whose every connection is served by a fresh mock backend.
pub fn factory(auth: AuthBehavior, credential: Credential) -> ConnectionFactory {
    ConnectionFactory::new(
        MockOpener::new(auth),
        ConnectionConfig::new("postgres").credential(credential),
    )
}

pub fn trust_factory() -> ConnectionFactory {
    factory(AuthBehavior::Trust, Credential::Trust)
}

pub const SCRAM_SALT_B64: &str = "QSXCR+Q6sek8bf92";
pub const SCRAM_ITERATIONS: u32 = 4096;
pub const SCRAM_SERVER_NONCE_SUFFIX: &str = "%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0";

/// How the mock backend authenticates clients.
#[derive(Debug, Clone)]
pub enum AuthBehavior {
    Trust,
    CleartextPassword(String),
    Md5Password(String),
    ScramSha256(String),
}

/// A channel opener that starts one mock backend per connection.
pub struct MockOpener {
    auth: AuthBehavior,
}

impl MockOpener {
    pub fn new(auth: AuthBehavior) -> Self {
        MockOpener { auth }
    }
}

impl ChannelOpener for MockOpener {
    fn open(&self) -> BoxFuture<'_, std::io::Result<BoxedTransport>> {
        let auth = self.auth.clone();
        Box::pin(async move {
            let (client, server) = tokio::io::duplex(1 << 16);
            tokio::spawn(async move {
                let _ = run_backend(server, auth).await;
            });
            Ok(Box::pin(client) as BoxedTransport)
        })
    }
}

type HmacSha256 = Hmac<Sha256>;

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("any key length works");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn read_cstring(body: &mut Bytes) -> Option<String> {
    let end = body.iter().position(|&b| b == 0)?;
    let raw = body.split_to(end + 1);
    String::from_utf8(raw[..end].to_vec()).ok()
}

async fn send(
    stream: &mut DuplexStream,
    code: u8,
    payload: impl FnOnce(&mut BytesMut),
) -> std::io::Result<()> {
    let mut body = BytesMut::new();
    payload(&mut body);

    let mut frame = BytesMut::with_capacity(body.len() + 5);
    frame.put_u8(code);
    frame.put_u32(body.len() as u32 + 4);
    frame.put_slice(&body);
    stream.write_all(&frame).await
}

async fn send_auth(stream: &mut DuplexStream, code: u32, extra: &[u8]) -> std::io::Result<()> {
    send(stream, b'R', |b| {
        b.put_u32(code);
        b.put_slice(extra);
    })
    .await
}

async fn send_ready(stream: &mut DuplexStream, status: u8) -> std::io::Result<()> {
    send(stream, b'Z', |b| b.put_u8(status)).await
}

async fn send_error(stream: &mut DuplexStream, code: &str, message: &str) -> std::io::Result<()> {
    send(stream, b'E', |b| {
        for (tag, value) in [(b'S', "ERROR"), (b'V', "ERROR"), (b'C', code), (b'M', message)] {
            b.put_u8(tag);
            b.put_slice(value.as_bytes());
            b.put_u8(0);
        }
        b.put_u8(0);
    })
    .await
}

async fn send_notice(stream: &mut DuplexStream, message: &str) -> std::io::Result<()> {
    send(stream, b'N', |b| {
        for (tag, value) in [(b'S', "NOTICE"), (b'C', "00000"), (b'M', message)] {
            b.put_u8(tag);
            b.put_slice(value.as_bytes());
            b.put_u8(0);
        }
        b.put_u8(0);
    })
    .await
}

async fn send_command_complete(stream: &mut DuplexStream, tag: &str) -> std::io::Result<()> {
    send(stream, b'C', |b| {
        b.put_slice(tag.as_bytes());
        b.put_u8(0);
    })
    .await
}

async fn send_parameter_status(
    stream: &mut DuplexStream,
    name: &str,
    value: &str,
) -> std::io::Result<()> {
    send(stream, b'S', |b| {
        b.put_slice(name.as_bytes());
        b.put_u8(0);
        b.put_slice(value.as_bytes());
        b.put_u8(0);
    })
    .await
}

async fn send_row_description(stream: &mut DuplexStream, columns: &[&str]) -> std::io::Result<()> {
    send(stream, b'T', |b| {
        b.put_u16(columns.len() as u16);
        for name in columns {
            b.put_slice(name.as_bytes());
            b.put_u8(0);
            b.put_u32(0); // table oid
            b.put_i16(0); // attribute number
            b.put_u32(25); // text
            b.put_i16(-1);
            b.put_i32(-1);
            b.put_u16(0); // text format
        }
    })
    .await
}

async fn send_data_row(
    stream: &mut DuplexStream,
    values: &[Option<&str>],
) -> std::io::Result<()> {
    send(stream, b'D', |b| {
        b.put_u16(values.len() as u16);
        for value in values {
            match value {
                Some(v) => {
                    b.put_u32(v.len() as u32);
                    b.put_slice(v.as_bytes());
                }
                None => b.put_i32(-1),
            }
        }
    })
    .await
}

/// Reads one tagged frontend message.
async fn read_message(stream: &mut DuplexStream) -> std::io::Result<(u8, Bytes)> {
    let code = stream.read_u8().await?;
    let len = stream.read_u32().await? as usize;
    let mut body = BytesMut::zeroed(len - 4);
    stream.read_exact(&mut body).await?;
    Ok((code, body.freeze()))
}

/// Reads the untagged startup message and returns its parameters.
async fn read_startup(stream: &mut DuplexStream) -> std::io::Result<HashMap<String, String>> {
    let len = stream.read_u32().await? as usize;
    let mut body = BytesMut::zeroed(len - 4);
    stream.read_exact(&mut body).await?;
    let mut body = body.freeze();

    let _protocol = body.get_u32();
    let mut params = HashMap::new();
    while let Some(key) = read_cstring(&mut body) {
        if key.is_empty() {
            break;
        }
        let Some(value) = read_cstring(&mut body) else {
            break;
        };
        params.insert(key, value);
    }
    Ok(params)
}

async fn run_backend(mut stream: DuplexStream, auth: AuthBehavior) -> std::io::Result<()> {
    let startup = read_startup(&mut stream).await?;
    let user = startup.get("user").cloned().unwrap_or_default();

    if !authenticate(&mut stream, &auth, &user).await? {
        return Ok(());
    }

    send_parameter_status(&mut stream, "server_version", "16.2").await?;
    send_parameter_status(&mut stream, "client_encoding", "UTF8").await?;
    send(&mut stream, b'K', |b| {
        b.put_u32(4242);
        b.put_u32(0x5EC4E7);
    })
    .await?;
    send_ready(&mut stream, b'I').await?;

    command_loop(&mut stream).await
}

async fn authenticate(
    stream: &mut DuplexStream,
    auth: &AuthBehavior,
    user: &str,
) -> std::io::Result<bool> {
    match auth {
        AuthBehavior::Trust => {
            send_auth(stream, 0, &[]).await?;
            Ok(true)
        }
        AuthBehavior::CleartextPassword(expected) => {
            send_auth(stream, 3, &[]).await?;
            let (code, mut body) = read_message(stream).await?;
            let supplied = (code == b'p').then(|| read_cstring(&mut body)).flatten();
            if supplied.as_deref() == Some(expected.as_str()) {
                send_auth(stream, 0, &[]).await?;
                Ok(true)
            } else {
                send_error(stream, "28P01", "password authentication failed").await?;
                Ok(false)
            }
        }
        AuthBehavior::Md5Password(_password) => {
            send_auth(stream, 5, &[0x01, 0x02, 0x03, 0x04]).await?;
            let (code, mut body) = read_message(stream).await?;
            let supplied = (code == b'p').then(|| read_cstring(&mut body)).flatten();
            // Accept any well-formed md5 response; hashing is covered by
            // unit tests.
            match supplied {
                Some(response) if response.starts_with("md5") && response.len() == 35 => {
                    send_auth(stream, 0, &[]).await?;
                    Ok(true)
                }
                _ => {
                    send_error(stream, "28P01", "password authentication failed").await?;
                    Ok(false)
                }
            }
        }
        AuthBehavior::ScramSha256(password) => scram_exchange(stream, password).await,
    }
}

async fn scram_exchange(stream: &mut DuplexStream, password: &str) -> std::io::Result<bool> {
    send_auth(stream, 10, b"SCRAM-SHA-256\0\0").await?;

    // SASLInitialResponse: mechanism, then length-prefixed client-first.
    let (code, mut body) = read_message(stream).await?;
    assert_eq!(b'p', code, "expected SASLInitialResponse");
    let mechanism = read_cstring(&mut body).expect("mechanism name");
    assert_eq!("SCRAM-SHA-256", mechanism);
    let len = body.get_u32() as usize;
    let client_first = String::from_utf8(body.split_to(len).to_vec()).expect("utf-8");

    let client_first_bare = client_first
        .strip_prefix("n,,")
        .expect("gs2 header")
        .to_string();
    let client_nonce = client_first_bare
        .split("r=")
        .nth(1)
        .expect("client nonce")
        .to_string();

    let combined_nonce = format!("{client_nonce}{SCRAM_SERVER_NONCE_SUFFIX}");
    let server_first =
        format!("r={combined_nonce},s={SCRAM_SALT_B64},i={SCRAM_ITERATIONS}");
    send_auth(stream, 11, server_first.as_bytes()).await?;

    // SASLResponse: the client-final message.
    let (code, body) = read_message(stream).await?;
    assert_eq!(b'p', code, "expected SASLResponse");
    let client_final = String::from_utf8(body.to_vec()).expect("utf-8");

    let without_proof = client_final
        .split(",p=")
        .next()
        .expect("client-final-without-proof")
        .to_string();
    assert_eq!(format!("c=biws,r={combined_nonce}"), without_proof);
    let proof = BASE64
        .decode(client_final.split(",p=").nth(1).expect("proof"))
        .expect("base64 proof");

    // Verify the proof the way the real server does.
    let salt = BASE64.decode(SCRAM_SALT_B64).expect("base64 salt");
    let salted_password =
        pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), &salt, SCRAM_ITERATIONS);
    let client_key = hmac(&salted_password, b"Client Key");
    let stored_key: [u8; 32] = Sha256::digest(client_key).into();
    let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
    let client_signature = hmac(&stored_key, auth_message.as_bytes());

    let recovered_key: Vec<u8> = proof
        .iter()
        .zip(client_signature.iter())
        .map(|(p, s)| p ^ s)
        .collect();
    let recovered_stored: [u8; 32] = Sha256::digest(&recovered_key).into();
    if recovered_stored != stored_key {
        send_error(stream, "28P01", "password authentication failed").await?;
        return Ok(false);
    }

    let server_key = hmac(&salted_password, b"Server Key");
    let server_signature = hmac(&server_key, auth_message.as_bytes());
    let server_final = format!("v={}", BASE64.encode(server_signature));
    send_auth(stream, 12, server_final.as_bytes()).await?;
    send_auth(stream, 0, &[]).await?;
    Ok(true)
}

/// Result behavior of one recognized statement.
enum StatementKind {
    /// `SELECT $1`: one row echoing the bound parameter.
    Echo,
    /// A statement whose execution fails server-side.
    FailsOnExecute,
    /// `SELECT * FROM weather`: the canonical three-row table.
    Weather,
    /// A row-less command with the given completion tag.
    Command(&'static str),
}

fn classify(text: &str) -> StatementKind {
    if text.contains("broken") {
        StatementKind::FailsOnExecute
    } else if text.contains("$1") {
        StatementKind::Echo
    } else if text == "SELECT * FROM weather" {
        StatementKind::Weather
    } else if text.starts_with("DELETE") {
        StatementKind::Command("DELETE 3")
    } else {
        StatementKind::Command("SELECT 0")
    }
}

async fn command_loop(stream: &mut DuplexStream) -> std::io::Result<()> {
    let mut tx_status = b'I';
    // name -> SQL text of prepared statements
    let mut statements: HashMap<String, String> = HashMap::new();
    let mut described: Option<String> = None;
    let mut portal: Option<(String, Option<String>)> = None; // (stmt text, first param)
    let mut skip_until_sync = false;

    loop {
        let Ok((code, mut body)) = read_message(stream).await else {
            return Ok(()); // client hung up
        };

        if skip_until_sync && code != b'S' && code != b'X' {
            continue;
        }

        match code {
            b'Q' => {
                let query = read_cstring(&mut body).unwrap_or_default();
                match query.as_str() {
                    "BEGIN" => {
                        send_command_complete(stream, "BEGIN").await?;
                        tx_status = b'T';
                    }
                    "COMMIT" => {
                        send_command_complete(stream, "COMMIT").await?;
                        tx_status = b'I';
                    }
                    "ROLLBACK" => {
                        send_command_complete(stream, "ROLLBACK").await?;
                        tx_status = b'I';
                    }
                    q if q.contains("broken") => {
                        send_error(stream, "22008", "date/time field value out of range").await?;
                        if tx_status == b'T' {
                            tx_status = b'E';
                        }
                    }
                    _ => {
                        send_command_complete(stream, "SELECT 0").await?;
                    }
                }
                send_ready(stream, tx_status).await?;
            }
            b'P' => {
                let name = read_cstring(&mut body).unwrap_or_default();
                let text = read_cstring(&mut body).unwrap_or_default();
                if text.contains("syntax error") {
                    send_error(stream, "42601", "syntax error at or near \"error\"").await?;
                    skip_until_sync = true;
                } else {
                    statements.insert(name.clone(), text);
                    described = Some(name);
                    send(stream, b'1', |_| {}).await?; // ParseComplete
                }
            }
            b'D' => {
                let Some(name) = described.take() else {
                    continue;
                };
                let text = statements.get(&name).cloned().unwrap_or_default();
                let params = text.matches("$1").count().min(1) as u16;
                send(stream, b't', |b| {
                    b.put_u16(params);
                    for _ in 0..params {
                        b.put_u32(25);
                    }
                })
                .await?;
                match classify(&text) {
                    StatementKind::Command(_) => send(stream, b'n', |_| {}).await?, // NoData
                    StatementKind::Echo => send_row_description(stream, &["?column?"]).await?,
                    _ => send_row_description(stream, &["city"]).await?,
                }
            }
            b'B' => {
                let _portal_name = read_cstring(&mut body).unwrap_or_default();
                let stmt_name = read_cstring(&mut body).unwrap_or_default();
                let formats = body.get_u16();
                for _ in 0..formats {
                    body.advance(2);
                }
                let nparams = body.get_u16();
                let mut first_param = None;
                for i in 0..nparams {
                    let len = body.get_i32();
                    if len >= 0 {
                        let raw = body.split_to(len as usize);
                        if i == 0 {
                            first_param = String::from_utf8(raw.to_vec()).ok();
                        }
                    }
                }
                let text = statements.get(&stmt_name).cloned().unwrap_or_default();
                portal = Some((text, first_param));
                send(stream, b'2', |_| {}).await?; // BindComplete
            }
            b'E' => {
                let Some((text, first_param)) = portal.take() else {
                    send_error(stream, "34000", "portal does not exist").await?;
                    skip_until_sync = true;
                    continue;
                };
                match classify(&text) {
                    StatementKind::Echo => {
                        send_data_row(stream, &[first_param.as_deref()]).await?;
                        send_command_complete(stream, "SELECT 1").await?;
                    }
                    StatementKind::Weather => {
                        for city in ["Hayward", "San Francisco", "Mariposa"] {
                            send_data_row(stream, &[Some(city)]).await?;
                        }
                        send_command_complete(stream, "SELECT 3").await?;
                    }
                    StatementKind::FailsOnExecute => {
                        send_error(stream, "22008", "date/time field value out of range")
                            .await?;
                        skip_until_sync = true;
                        if tx_status == b'T' {
                            tx_status = b'E';
                        }
                    }
                    StatementKind::Command(tag) => {
                        send_command_complete(stream, tag).await?;
                    }
                }
            }
            b'C' => {
                let kind = body.get_u8();
                let name = read_cstring(&mut body).unwrap_or_default();
                if kind == b'S' {
                    statements.remove(&name);
                }
                send(stream, b'3', |_| {}).await?; // CloseComplete
            }
            b'H' => {
                // Responses are written eagerly; Flush is a no-op here.
            }
            b'S' => {
                skip_until_sync = false;
                send_ready(stream, tx_status).await?;
            }
            b'X' => return Ok(()),
            _ => {
                send_error(stream, "08P01", "unexpected frontend message").await?;
                skip_until_sync = true;
            }
        }
    }
}
