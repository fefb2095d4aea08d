//! Report publishing to an ActiveMQ topic over STOMP 1.2.
//!
//! Framing is `async-stomp`'s client codec running over a stream we open
//! ourselves: plain TCP with username/password, or TLS with a client
//! certificate. The SEND frame asks for a receipt so delivery is confirmed
//! before the connection closes.

use async_stomp::client::ClientCodec;
use async_stomp::{FromServer, Message, ToServer};
use futures::{SinkExt, StreamExt};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::config::ActiveMqConfig;
use crate::error::TransportError;

type StompFramed<S> = Framed<S, ClientCodec>;

fn frame_name(frame: &FromServer) -> &'static str {
    match frame {
        FromServer::Connected { .. } => "CONNECTED",
        FromServer::Message { .. } => "MESSAGE",
        FromServer::Receipt { .. } => "RECEIPT",
        FromServer::Error { .. } => "ERROR",
    }
}

/// `message` header and body of an ERROR frame, joined.
fn broker_message(message: Option<String>, body: Option<Vec<u8>>) -> String {
    let detail = body
        .map(|body| String::from_utf8_lossy(&body).trim().to_string())
        .unwrap_or_default();
    match message {
        Some(message) if !detail.is_empty() => format!("{message}: {detail}"),
        Some(message) => message,
        None => detail,
    }
}

async fn send_frame<S>(framed: &mut StompFramed<S>, frame: ToServer) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed
        .send(Message::from(frame))
        .await
        .map_err(|e| TransportError::Protocol {
            message: e.to_string(),
        })
}

/// Next frame from the broker, turning ERROR frames into errors.
async fn next_frame<S>(framed: &mut StompFramed<S>) -> Result<FromServer, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(frame)) => match frame.content {
            FromServer::Error { message, body } => Err(TransportError::Broker {
                message: broker_message(message, body),
            }),
            other => Ok(other),
        },
        Some(Err(e)) => Err(TransportError::Protocol {
            message: e.to_string(),
        }),
        None => Err(TransportError::UnexpectedFrame {
            command: "connection closed".into(),
        }),
    }
}

/// Connect, send `body` to `destination` with a receipt, disconnect.
pub async fn publish_over<S>(
    stream: S,
    host: &str,
    login: Option<(&str, &str)>,
    destination: &str,
    body: Vec<u8>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, ClientCodec::new());

    let connect = ToServer::Connect {
        accept_version: "1.2".into(),
        host: host.to_string(),
        login: login.map(|(user, _)| user.to_string()),
        passcode: login.map(|(_, pass)| pass.to_string()),
        heartbeat: Some((0, 0)),
    };
    send_frame(&mut framed, connect).await?;
    match next_frame(&mut framed).await? {
        FromServer::Connected { version, .. } => debug!(version = %version, "Connected to broker"),
        other => {
            return Err(TransportError::UnexpectedFrame {
                command: frame_name(&other).to_string(),
            });
        }
    }

    let receipt = uuid::Uuid::new_v4().to_string();
    let send = ToServer::Send {
        destination: destination.to_string(),
        transaction: None,
        headers: Some(vec![
            ("content-type".into(), "application/json".into()),
            ("receipt".into(), receipt.clone()),
        ]),
        body: Some(body),
    };
    send_frame(&mut framed, send).await?;
    match next_frame(&mut framed).await? {
        FromServer::Receipt { receipt_id } if receipt_id == receipt => {}
        FromServer::Receipt { receipt_id } => {
            return Err(TransportError::UnexpectedFrame {
                command: format!("RECEIPT for {receipt_id}"),
            });
        }
        other => {
            return Err(TransportError::UnexpectedFrame {
                command: frame_name(&other).to_string(),
            });
        }
    }

    send_frame(&mut framed, ToServer::Disconnect { receipt: None }).await
}

enum Credentials {
    Certificate { cert: Vec<u8>, key: Vec<u8> },
    Password { username: String, password: String },
}

fn credentials(config: &ActiveMqConfig) -> Result<Credentials, TransportError> {
    match (&config.cert, &config.key, &config.username, &config.password) {
        (Some(cert), Some(key), _, _) => Ok(Credentials::Certificate {
            cert: std::fs::read(cert)?,
            key: std::fs::read(key)?,
        }),
        (_, _, Some(username), Some(password)) => Ok(Credentials::Password {
            username: username.clone(),
            password: password.clone(),
        }),
        _ => Err(TransportError::MissingCredentials),
    }
}

/// Publish the report file at `report` to the configured topic.
pub async fn send_report(config: &ActiveMqConfig, report: &Path) -> Result<(), TransportError> {
    if !report.is_file() {
        return Err(TransportError::MissingReport {
            path: report.to_path_buf(),
        });
    }
    let credentials = credentials(config)?;
    let body = tokio::fs::read(report).await?;

    info!(server = %config.server, port = config.port, topic = %config.topic, "Publishing report");
    let tcp = tokio::net::TcpStream::connect((config.server.as_str(), config.port))
        .await
        .map_err(|e| TransportError::Connection {
            server: config.server.clone(),
            port: config.port,
            message: e.to_string(),
        })?;

    match credentials {
        Credentials::Certificate { cert, key } => {
            let identity = native_tls::Identity::from_pkcs8(&cert, &key).map_err(|e| {
                TransportError::Tls {
                    message: format!("invalid client certificate or key: {e}"),
                }
            })?;
            let connector = native_tls::TlsConnector::builder()
                .identity(identity)
                .build()
                .map_err(|e| TransportError::Tls {
                    message: format!("TLS connector error: {e}"),
                })?;
            let tls = tokio_native_tls::TlsConnector::from(connector)
                .connect(&config.server, tcp)
                .await
                .map_err(|e| TransportError::Tls {
                    message: format!("TLS connect error: {e}"),
                })?;
            publish_over(tls, &config.server, None, &config.topic, body).await?;
        }
        Credentials::Password { username, password } => {
            publish_over(
                tcp,
                &config.server,
                Some((username.as_str(), password.as_str())),
                &config.topic,
                body,
            )
            .await?;
        }
    }

    info!("Report sent to message queue");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    /// One client frame as text, without its NUL terminator.
    async fn read_client_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> String {
        let mut raw = Vec::new();
        reader.read_until(0, &mut raw).await.unwrap();
        raw.pop();
        String::from_utf8(raw).unwrap()
    }

    fn header<'a>(frame: &'a str, key: &str) -> Option<&'a str> {
        frame
            .lines()
            .skip(1)
            .take_while(|line| !line.is_empty())
            .find_map(|line| line.strip_prefix(key)?.strip_prefix(':'))
    }

    fn body(frame: &str) -> &str {
        frame.split_once("\n\n").map(|(_, body)| body).unwrap_or("")
    }

    #[derive(Clone, Copy)]
    enum Reply {
        Receipt,
        WrongReceipt,
        Error,
        Garbage,
    }

    /// Minimal broker answering CONNECT and SEND on one side of a duplex pipe.
    async fn fake_broker(stream: tokio::io::DuplexStream, reply: Reply) -> Vec<String> {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut seen = Vec::new();

        seen.push(read_client_frame(&mut reader).await);
        write_half
            .write_all(b"CONNECTED\nversion:1.2\n\n\0")
            .await
            .unwrap();

        let send = read_client_frame(&mut reader).await;
        let receipt = header(&send, "receipt").unwrap_or_default().to_string();
        seen.push(send);
        let answer = match reply {
            Reply::Receipt => format!("RECEIPT\nreceipt-id:{receipt}\n\n\0"),
            Reply::WrongReceipt => "RECEIPT\nreceipt-id:someone-else\n\n\0".to_string(),
            Reply::Error => "ERROR\nmessage:not authorized\n\ntopic is read-only\0".to_string(),
            Reply::Garbage => "HELLO\n\n\0".to_string(),
        };
        write_half.write_all(answer.as_bytes()).await.unwrap();

        if matches!(reply, Reply::Receipt) {
            seen.push(read_client_frame(&mut reader).await);
        }
        seen
    }

    #[tokio::test]
    async fn test_publish_with_receipt() {
        let (client, server) = duplex(4096);
        let broker = tokio::spawn(fake_broker(server, Reply::Receipt));

        publish_over(
            client,
            "mq.example.org",
            Some(("user", "secret")),
            "/topic/vm.spec",
            b"{\"x\":1}".to_vec(),
        )
        .await
        .unwrap();

        let frames = broker.await.unwrap();
        assert!(frames[0].starts_with("CONNECT\n"));
        assert_eq!(header(&frames[0], "accept-version"), Some("1.2"));
        assert_eq!(header(&frames[0], "host"), Some("mq.example.org"));
        assert_eq!(header(&frames[0], "login"), Some("user"));
        assert_eq!(header(&frames[0], "passcode"), Some("secret"));

        assert!(frames[1].starts_with("SEND\n"));
        assert_eq!(header(&frames[1], "destination"), Some("/topic/vm.spec"));
        assert_eq!(header(&frames[1], "content-type"), Some("application/json"));
        assert!(header(&frames[1], "receipt").is_some());
        assert_eq!(body(&frames[1]), "{\"x\":1}");

        assert!(frames[2].starts_with("DISCONNECT\n"));
    }

    #[tokio::test]
    async fn test_certificate_login_sends_no_passcode() {
        let (client, server) = duplex(4096);
        let broker = tokio::spawn(fake_broker(server, Reply::Receipt));

        publish_over(client, "mq", None, "/topic/t", b"{}".to_vec())
            .await
            .unwrap();

        let frames = broker.await.unwrap();
        assert_eq!(header(&frames[0], "login"), None);
        assert_eq!(header(&frames[0], "passcode"), None);
    }

    #[tokio::test]
    async fn test_error_frame_becomes_broker_error() {
        let (client, server) = duplex(4096);
        let broker = tokio::spawn(fake_broker(server, Reply::Error));

        let err = publish_over(client, "mq", None, "/topic/t", b"{}".to_vec())
            .await
            .unwrap_err();
        match err {
            TransportError::Broker { message } => {
                assert_eq!(message, "not authorized: topic is read-only")
            }
            other => panic!("Expected Broker error, got: {other:?}"),
        }
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_receipt_is_rejected() {
        let (client, server) = duplex(4096);
        let broker = tokio::spawn(fake_broker(server, Reply::WrongReceipt));

        let err = publish_over(client, "mq", None, "/topic/t", b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::UnexpectedFrame { ref command } if command == "RECEIPT for someone-else"
        ));
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_frame_is_a_protocol_error() {
        let (client, server) = duplex(4096);
        let broker = tokio::spawn(fake_broker(server, Reply::Garbage));

        let err = publish_over(client, "mq", None, "/topic/t", b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol { .. }));
        broker.await.unwrap();
    }

    #[test]
    fn test_broker_message_joins_header_and_body() {
        assert_eq!(broker_message(Some("denied".into()), None), "denied");
        assert_eq!(
            broker_message(None, Some(b"  queue full \n".to_vec())),
            "queue full"
        );
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report.json");
        std::fs::write(&report, "{}").unwrap();
        let config = ActiveMqConfig {
            server: "localhost".into(),
            port: 61613,
            topic: "/topic/t".into(),
            username: Some("only-user".into()),
            ..Default::default()
        };
        assert!(matches!(
            send_report(&config, &report).await,
            Err(TransportError::MissingCredentials)
        ));
    }

    #[tokio::test]
    async fn test_missing_report() {
        let config = ActiveMqConfig::default();
        assert!(matches!(
            send_report(&config, Path::new("/nonexistent/report.json")).await,
            Err(TransportError::MissingReport { .. })
        ));
    }
}
