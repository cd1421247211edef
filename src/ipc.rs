//! Worker channel with connect and communication timeouts
//!
//! Two independent limits apply to every request: the channel must be established
//! within `ipc_connect_timeout`, and each read or write on it must make progress
//! within `ipc_comm_timeout`. Neither is retried here; the caller releases the
//! worker with a timeout outcome, which retires it.

use crate::error::PoolError;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

/// Delay between connect attempts while a fresh worker is still starting
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Connect to a worker socket, retrying until `timeout` elapses
pub async fn connect(
    path: &Path,
    timeout: Duration,
    comm_timeout: Duration,
    buffer_size: usize,
) -> Result<Channel, PoolError> {
    let attempt = async {
        loop {
            match UnixStream::connect(path).await {
                Ok(stream) => return Ok(stream),
                // Socket not bound yet, or no one accepting
                Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(PoolError::Io(e)),
            }
        }
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(stream)) => {
            debug!(socket = %path.display(), "Worker channel established");
            Ok(Channel::new(stream, comm_timeout, buffer_size))
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(PoolError::ConnectTimeout(timeout)),
    }
}

/// An established channel to one worker
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
    comm_timeout: Duration,
    buf: Vec<u8>,
}

impl Channel {
    pub fn new(stream: UnixStream, comm_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            stream,
            comm_timeout,
            buf: vec![0; buffer_size.max(1)],
        }
    }

    pub fn comm_timeout(&self) -> Duration {
        self.comm_timeout
    }

    /// Write all of `data`
    pub async fn send(&mut self, data: &[u8]) -> Result<(), PoolError> {
        match tokio::time::timeout(self.comm_timeout, self.stream.write_all(data)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PoolError::CommTimeout(self.comm_timeout)),
        }
    }

    /// Read the next chunk (at most the output buffer size); empty at end of stream
    pub async fn receive(&mut self) -> Result<&[u8], PoolError> {
        let n = match tokio::time::timeout(self.comm_timeout, self.stream.read(&mut self.buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(PoolError::CommTimeout(self.comm_timeout)),
        };
        Ok(&self.buf[..n])
    }

    /// Read until the worker closes its side; the timeout applies per read
    pub async fn receive_to_end(&mut self) -> Result<Vec<u8>, PoolError> {
        let mut out = Vec::new();
        loop {
            let chunk = self.receive().await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(chunk);
        }
    }

    /// Signal end of request input
    pub async fn finish_sending(&mut self) -> Result<(), PoolError> {
        match tokio::time::timeout(self.comm_timeout, self.stream.shutdown()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PoolError::CommTimeout(self.comm_timeout)),
        }
    }
}
