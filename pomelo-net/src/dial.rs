use std::{io, net::SocketAddr, time::Duration};

use pomelo_proto::{Host, ServerAddr};
use tokio::{
    net::{self, TcpStream},
    time,
};

const PER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a TCP connection to `addr`.
///
/// IP addresses connect directly. Hostnames are resolved and the
/// candidates are attempted in resolver order, each bounded by a
/// per-attempt timeout, returning the first socket that answers.
///
/// # Errors
///
/// It returns the last connection error if every candidate fails, or a
/// resolver error if the hostname yields no addresses.
pub async fn dial(addr: &ServerAddr) -> io::Result<TcpStream> {
    match addr.host() {
        Host::Ip(ip) => TcpStream::connect(SocketAddr::new(*ip, addr.port())).await,
        Host::Dns(host) => {
            let candidates = net::lookup_host((&**host, addr.port())).await?;

            let mut last_err = None;
            for candidate in candidates {
                match time::timeout(PER_ATTEMPT_TIMEOUT, TcpStream::connect(candidate)).await {
                    Ok(Ok(socket)) => return Ok(socket),
                    Ok(Err(err)) => last_err = Some(err),
                    Err(_elapsed) => {
                        last_err = Some(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("connecting to {candidate} timed out"),
                        ));
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "hostname did not resolve to any address",
                )
            }))
        }
    }
}
