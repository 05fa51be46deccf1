use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use bincode::{
    config::{BigEndian, Configuration, Fixint},
    decode_from_std_read, encode_into_std_write,
};
use log::{debug, trace};
use thiserror::Error;

use super::{Request, Response};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    /// The request never left the client; the server cannot have seen it.
    #[error("failed to connect to '{endpoint}': {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("request rejected with status {status}: {message}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("redirected to '{location}'")]
    Redirect { location: String },
    #[error("link expired: {url}")]
    LinkExpired { url: String },
}

/// Primitive request/response exchange supplied by the connection layer.
///
/// Implementations own connection establishment, pooling and anything below the message
/// level. A returned [`Response::Rejected`] must already be lifted into
/// [`TransportError::Status`] or [`TransportError::Redirect`] (see [`lift_rejection`]).
pub trait Transport: Send + Sync {
    fn send(&self, endpoint: &str, request: &Request) -> Result<Response, TransportError>;
}

/// Turns status-signal responses into transport errors so the retry engine can classify them.
pub fn lift_rejection(response: Response) -> Result<Response, TransportError> {
    match response {
        Response::Rejected {
            status,
            location: Some(location),
            ..
        } if (300..400).contains(&status) => Err(TransportError::Redirect { location }),
        Response::Rejected {
            status,
            retry_after_ms,
            message,
            ..
        } => Err(TransportError::Status {
            status,
            retry_after: retry_after_ms.map(Duration::from_millis),
            message,
        }),
        other => Ok(other),
    }
}

pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    config: Configuration<BigEndian, Fixint>,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        Self { stream, config }
    }

    pub fn write_request(&mut self, req: &Request) -> Result<(), TransportError> {
        encode_into_std_write(req, &mut self.stream, self.config)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn write_response(&mut self, resp: &Response) -> Result<(), TransportError> {
        encode_into_std_write(resp, &mut self.stream, self.config)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn read_response(&mut self) -> Result<Response, TransportError> {
        let resp: Response = decode_from_std_read(&mut self.stream, self.config)?;
        Ok(resp)
    }

    pub fn read_request(&mut self) -> Result<Request, TransportError> {
        let req: Request = decode_from_std_read(&mut self.stream, self.config)?;
        Ok(req)
    }
}

/// [`Transport`] over plain TCP with one cached connection per endpoint.
///
/// A connection that fails mid-exchange is dropped; the next call reconnects.
pub struct TcpTransport {
    connections: Mutex<HashMap<String, ProtocolTransport<TcpStream>>>,
    connect_timeout: Duration,
    io_timeout: Option<Duration>,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, io_timeout: Option<Duration>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            connect_timeout,
            io_timeout,
        }
    }

    fn connect(&self, endpoint: &str) -> Result<ProtocolTransport<TcpStream>, TransportError> {
        let connect_err = |source| TransportError::Connect {
            endpoint: endpoint.to_string(),
            source,
        };
        let addr = endpoint
            .to_socket_addrs()
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| {
                connect_err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "endpoint did not resolve",
                ))
            })?;

        debug!("connecting to {endpoint} ({addr})");
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(connect_err)?;
        stream.set_nodelay(true).map_err(connect_err)?;
        stream.set_read_timeout(self.io_timeout).map_err(connect_err)?;
        stream.set_write_timeout(self.io_timeout).map_err(connect_err)?;
        Ok(ProtocolTransport::new(stream))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Some(Duration::from_secs(60)))
    }
}

impl Transport for TcpTransport {
    fn send(&self, endpoint: &str, request: &Request) -> Result<Response, TransportError> {
        let cached = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint);
        let mut conn = match cached {
            Some(conn) => conn,
            None => self.connect(endpoint)?,
        };

        trace!("sending {} to {endpoint}", request.name());
        conn.write_request(request)?;
        let response = conn.read_response()?;

        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.to_string(), conn);

        lift_rejection(response)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek};

    use super::*;

    #[test]
    fn read_write_request() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        transport.write_request(&Request::Ping).unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();
        let req = transport.read_request().unwrap();
        assert_eq!(req, Request::Ping);
    }

    #[test]
    fn read_write_response() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        transport.write_response(&Response::Pong).unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();
        let resp = transport.read_response().unwrap();
        assert_eq!(resp, Response::Pong);
    }

    #[test]
    fn rejection_becomes_status_error() {
        let resp = Response::Rejected {
            status: 429,
            retry_after_ms: Some(1500),
            location: None,
            message: "slow down".to_string(),
        };

        match lift_rejection(resp) {
            Err(TransportError::Status {
                status,
                retry_after,
                ..
            }) => {
                assert_eq!(status, 429);
                assert_eq!(retry_after, Some(Duration::from_millis(1500)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejection_with_location_becomes_redirect() {
        let resp = Response::Rejected {
            status: 307,
            retry_after_ms: None,
            location: Some("127.0.0.1:9000".to_string()),
            message: String::new(),
        };

        assert!(matches!(
            lift_rejection(resp),
            Err(TransportError::Redirect { location }) if location == "127.0.0.1:9000"
        ));
    }

    #[test]
    fn regular_response_passes_through() {
        assert_eq!(lift_rejection(Response::Closed).unwrap(), Response::Closed);
    }

    #[test]
    fn unreachable_endpoint_is_connect_error() {
        let transport = TcpTransport::new(Duration::from_millis(200), None);
        let err = transport.send("127.0.0.1:1", &Request::Ping).unwrap_err();

        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
