use std::io;

use tokio::net::TcpStream;

/// Result of probing an idle pooled socket.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// Nothing to read; the peer is still there.
    Healthy,
    /// Peer closed its end.
    Eof,
    /// Data arrived on a connection with no request in flight. The
    /// connection can no longer be trusted to match replies.
    UnexpectedData,
    Failed(io::Error),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

/// Non-blocking one-byte read against a socket that must be idle.
pub fn probe_idle_socket(stream: &TcpStream) -> ProbeOutcome {
    let mut buf = [0u8; 1];
    match stream.try_read(&mut buf) {
        Ok(0) => ProbeOutcome::Eof,
        Ok(_) => ProbeOutcome::UnexpectedData,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => ProbeOutcome::Healthy,
        Err(err) => ProbeOutcome::Failed(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn quiet_open_socket_is_healthy() {
        let (client, _server) = pair().await;
        assert!(probe_idle_socket(&client).is_healthy());
    }

    #[tokio::test]
    async fn closed_peer_is_eof() {
        let (client, server) = pair().await;
        drop(server);
        // give the FIN a moment to arrive
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(matches!(probe_idle_socket(&client), ProbeOutcome::Eof));
    }

    #[tokio::test]
    async fn buffered_bytes_poison_the_socket() {
        let (client, mut server) = pair().await;
        server.write_all(b"x").await.unwrap();
        server.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(matches!(
            probe_idle_socket(&client),
            ProbeOutcome::UnexpectedData
        ));
    }
}
