//! Client side of the name server protocol.
//!
//! # Rust Learning Note
//!
//! ## One connection, strict request/reply
//!
//! ```rust,ignore
//! let mut client = NameServerClient::connect("tcp://127.0.0.1:5555").await?;
//! client.register("svc-a", "tcp://10.0.0.1:9000").await?;
//! let address = client.lookup("svc-a").await?;
//! ```
//!
//! Every method takes `&mut self`: the borrow checker guarantees that only
//! one request is in flight on a connection at a time, which is exactly the
//! no-pipelining rule of the server.

use crate::protocol::{Request, Response, INVALID_REQUEST, NOT_FOUND, UNKNOWN_COMMAND};
use crate::transport::{Connection, TransportAddress};
use crate::types::Event;
use hsu_common::{Error, Result};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tracing::debug;

/// Line-oriented JSON stream shared by the client and the subscriber.
struct LineStream {
    reader: BufReader<ReadHalf<Box<dyn Connection>>>,
    writer: WriteHalf<Box<dyn Connection>>,
    line: Vec<u8>,
}

impl LineStream {
    async fn connect(address: &str) -> Result<Self> {
        let address = TransportAddress::parse(address)?;
        let conn = address.connect().await?;
        let (reader, writer) = tokio::io::split(conn);
        debug!(address = %address, "Connected to name server");
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            line: Vec::new(),
        })
    }

    /// Reads one line; `None` on clean end of stream.
    async fn read_line(&mut self) -> Result<Option<&[u8]>> {
        self.line.clear();
        let n = self.reader.read_until(b'\n', &mut self.line).await?;
        if n == 0 {
            return Ok(None);
        }
        let line = self.line.strip_suffix(b"\n").unwrap_or(&self.line);
        Ok(Some(line))
    }

    async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.writer.write_all(line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Async client for the request/reply channel.
pub struct NameServerClient {
    stream: LineStream,
}

impl NameServerClient {
    /// Connects to a server at e.g. `tcp://127.0.0.1:5555`.
    pub async fn connect(address: &str) -> Result<Self> {
        Ok(Self {
            stream: LineStream::connect(address).await?,
        })
    }

    /// Sends one request and waits for its reply.
    pub async fn send(&mut self, request: &Request) -> Result<Response> {
        self.send_raw(&request.encode()?).await
    }

    /// Sends a pre-encoded line (including the trailing newline) and waits for
    /// the reply. Useful for probing the server with malformed input.
    pub async fn send_raw(&mut self, line: &[u8]) -> Result<Response> {
        self.stream.write_line(line).await?;
        match self.stream.read_line().await? {
            Some(reply) => Response::decode(reply),
            None => Err(Error::transport("connection closed before reply")),
        }
    }

    /// Registers `name` at `address` (overwriting any existing entry).
    pub async fn register(&mut self, name: &str, address: &str) -> Result<()> {
        let response = self
            .send(&Request::Register {
                name: name.to_string(),
                address: address.to_string(),
            })
            .await?;
        expect_ok(response, name).map(|_| ())
    }

    /// Removes `name`. Fails with `Error::NotFound` if it was not registered.
    pub async fn unregister(&mut self, name: &str) -> Result<()> {
        let response = self
            .send(&Request::Unregister {
                name: name.to_string(),
            })
            .await?;
        expect_ok(response, name).map(|_| ())
    }

    /// Returns the address registered for `name`.
    pub async fn lookup(&mut self, name: &str) -> Result<String> {
        let response = self
            .send(&Request::Lookup {
                name: name.to_string(),
            })
            .await?;
        expect_ok(response, name)?
            .address
            .ok_or_else(|| Error::protocol("LOOKUP reply without address"))
    }

    /// Returns a name→address snapshot of the registry.
    pub async fn list(&mut self) -> Result<BTreeMap<String, String>> {
        let response = self.send(&Request::List).await?;
        Ok(expect_ok(response, "")?.items.unwrap_or_default())
    }

    pub async fn ping(&mut self) -> Result<()> {
        let response = self.send(&Request::Ping).await?;
        expect_ok(response, "").map(|_| ())
    }

    /// Asks the server to stop. The server replies before it tears down.
    pub async fn shutdown(&mut self) -> Result<()> {
        let response = self.send(&Request::Shutdown).await?;
        expect_ok(response, "").map(|_| ())
    }
}

/// Turns an error reply back into the matching [`Error`].
fn expect_ok(response: Response, name: &str) -> Result<Response> {
    if response.is_ok() {
        return Ok(response);
    }

    let code = response.error.unwrap_or_default();
    Err(match code.as_str() {
        NOT_FOUND => Error::not_found(name),
        INVALID_REQUEST => Error::validation(format!("server rejected request for '{}'", name)),
        UNKNOWN_COMMAND => Error::protocol("server did not understand the request"),
        other => Error::internal(format!("server error: {}", other)),
    })
}

/// Subscriber for the publish channel.
pub struct EventSubscriber {
    stream: LineStream,
}

impl EventSubscriber {
    /// Connects to a publish address, e.g. `tcp://127.0.0.1:5556`.
    pub async fn connect(address: &str) -> Result<Self> {
        Ok(Self {
            stream: LineStream::connect(address).await?,
        })
    }

    /// Waits for the next event; `None` once the server closes the channel.
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        match self.stream.read_line().await? {
            Some(line) => serde_json::from_slice(line)
                .map(Some)
                .map_err(|e| Error::protocol(format!("malformed event: {}", e))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_ok_maps_error_codes() {
        assert!(expect_ok(Response::ok(), "svc-a").is_ok());

        assert_eq!(
            expect_ok(Response::error(NOT_FOUND), "svc-a").unwrap_err(),
            Error::not_found("svc-a")
        );
        assert!(matches!(
            expect_ok(Response::error(INVALID_REQUEST), "svc-a"),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            expect_ok(Response::error(UNKNOWN_COMMAND), ""),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            expect_ok(Response::error("internal_error"), ""),
            Err(Error::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Bind then drop to get a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let err = NameServerClient::connect(&format!("tcp://127.0.0.1:{}", port))
            .await
            .err()
            .expect("connect should fail");
        assert!(err.is_transport());
    }
}
