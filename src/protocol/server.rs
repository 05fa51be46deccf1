use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::Arc,
};

use bincode::error::DecodeError;
use log::{debug, info, warn};

use crate::{thread::ThreadPool, warehouse::Warehouse};

use super::{ProtocolTransport, transport::TransportError};

const WORKERS: usize = 15;

/// Serves a [`Warehouse`] over TCP, one pooled worker per connection.
pub struct WarehouseServer {
    listener: TcpListener,
    warehouse: Arc<Warehouse>,
    pool: ThreadPool,
}

impl WarehouseServer {
    pub fn bind(address: impl ToSocketAddrs, warehouse: Arc<Warehouse>) -> io::Result<Self> {
        Self::with_workers(address, warehouse, WORKERS)
    }

    pub fn with_workers(
        address: impl ToSocketAddrs,
        warehouse: Arc<Warehouse>,
        workers: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(address)?;
        Ok(Self {
            listener,
            warehouse,
            pool: ThreadPool::new("warehouse", workers.max(1))?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the listener fails.
    pub fn listen(self) -> Result<(), TransportError> {
        info!("listening at {}", self.local_addr()?);

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let warehouse = Arc::clone(&self.warehouse);
                    let queued = self.pool.execute(move || {
                        if let Err(e) = handle_connection(stream, &warehouse) {
                            warn!("connection failed: {e}");
                        }
                    });
                    if let Err(e) = queued {
                        warn!("dropping connection: {e}");
                    }
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }
}

fn handle_connection(stream: TcpStream, warehouse: &Warehouse) -> Result<(), TransportError> {
    let peer = stream.peer_addr()?;
    debug!("accepted {peer}");
    let mut transport = ProtocolTransport::new(stream);

    loop {
        let req = match transport.read_request() {
            Ok(req) => req,
            Err(TransportError::Deserialize(DecodeError::Io { inner, .. }))
                if inner.kind() == io::ErrorKind::UnexpectedEof =>
            {
                debug!("{peer} disconnected");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        debug!("received {} from {peer}", req.name());

        let resp = warehouse.handle(req);
        transport.write_response(&resp)?;
    }
}
