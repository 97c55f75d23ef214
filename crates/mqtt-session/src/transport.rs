use mqtt_session_protocol::{MqttError, Result, Transport};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TcpConfig {
    pub addr: SocketAddr,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_nodelay() -> bool {
    true
}

impl TcpConfig {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: default_connect_timeout(),
            nodelay: default_nodelay(),
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[derive(Debug)]
pub struct TcpTransport {
    config: TcpConfig,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    #[must_use]
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self::new(TcpConfig::new(addr))
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(MqttError::NotConnected)
    }
}

impl Transport for TcpTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(MqttError::AlreadyConnected);
        }

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(self.config.addr))
            .await
            .map_err(|_| MqttError::ConnectionError("Connection timeout".to_string()))??;
        stream.set_nodelay(self.config.nodelay)?;

        tracing::debug!(addr = %self.config.addr, "TCP connection established");
        self.stream = Some(stream);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream()?.read(buf).await?)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.stream()?.write_all(buf).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

/// Wraps a stream that is already connected, such as one half of a
/// `tokio::io::duplex` pair or a TLS stream set up by the caller.
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: Option<S>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    /// Gives back the stream unless it was closed.
    pub fn into_inner(self) -> Option<S> {
        self.stream
    }

    fn stream(&mut self) -> Result<&mut S> {
        self.stream.as_mut().ok_or(MqttError::NotConnected)
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            Ok(())
        } else {
            Err(MqttError::ConnectionError(
                "Stream transport cannot reconnect once closed".to_string(),
            ))
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream()?.read(buf).await?)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        stream.write_all(buf).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_tcp_config_defaults_from_json() {
        let config: TcpConfig = serde_json::from_str(r#"{"addr": "127.0.0.1:1883"}"#).unwrap();
        assert_eq!(config.addr, "127.0.0.1:1883".parse::<SocketAddr>().unwrap());
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert!(config.nodelay);
    }

    #[tokio::test]
    async fn test_tcp_transport_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let mut transport = TcpTransport::from_addr(addr);
        assert!(!transport.is_connected());
        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.connect().await, Err(MqttError::AlreadyConnected));

        transport.write(&[0xC0, 0x00, 0xD0, 0x00]).await.unwrap();
        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < buf.len() {
            read += transport.read(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(buf, [0xC0, 0x00, 0xD0, 0x00]);

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_transport_closed() {
        let (client, _server) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(client);
        transport.connect().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.connect().await.is_err());
        assert_eq!(transport.write(&[0]).await, Err(MqttError::NotConnected));
    }
}
