use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bscomp_device::ConstructionError;

/// Connects to `host:port`, trying every resolved address once.
///
/// There is no retry: the last failure is mapped onto the construction error taxonomy.
///
/// Writes on the returned stream give up after `write_timeout`.
pub(crate) fn dial(
    host: &str,
    port: u16,
    timeout: Duration,
    write_timeout: Duration,
) -> Result<TcpStream, ConstructionError> {
    let endpoint = format!("{host}:{port}");

    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|_| ConstructionError::Unresolvable {
            endpoint: endpoint.clone(),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ConstructionError::Unresolvable { endpoint });
    }

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_write_timeout(Some(write_timeout))?;
                tracing::debug!(%endpoint, %addr, "rdma endpoint connected");
                return Ok(stream);
            }
            Err(err) => {
                tracing::debug!(%endpoint, %addr, "rdma connect attempt failed: {err}");
                last_err = Some(err);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected));
    Err(match err.kind() {
        io::ErrorKind::ConnectionRefused => ConstructionError::ConnectionRefused { endpoint },
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            ConstructionError::Timeout { endpoint }
        }
        _ => ConstructionError::Io(err),
    })
}
