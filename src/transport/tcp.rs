//! TCP Transport
//!
//! One connection per call, bounded by connect and request timeouts.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_response, write_request, Endpoint, Request, Response, Transport};
use crate::error::{Error, Result};

/// Transport that reaches other members over TCP
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn exchange(&self, address: &str, request: &Request) -> Result<Response> {
        let stream = self.connect(address).await?;
        let (mut reader, mut writer) = stream.into_split();

        write_request(&mut writer, request).await?;
        read_response(&mut reader).await
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn call(&self, endpoint: &Endpoint, request: Request) -> Result<Response> {
        tracing::trace!("Sending {} to {}", request.type_name(), endpoint);

        match timeout(self.request_timeout, self.exchange(&endpoint.address, &request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(endpoint.address.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RequestHandler, TcpServer};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    struct EchoTail;

    #[async_trait::async_trait]
    impl RequestHandler for EchoTail {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::PushNotify { tx_id, .. } => Response::Ack { applied: tx_id },
                _ => Response::Committed { tx_id: 0 },
            }
        }
    }

    #[tokio::test]
    async fn test_call_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = Arc::new(TcpServer::new(address.clone(), Arc::new(EchoTail)));

        let serving = Arc::clone(&server);
        let handle = tokio::spawn(async move { serving.serve(listener).await });

        let transport = TcpTransport::new(Duration::from_secs(1), Duration::from_secs(2));
        let endpoint = Endpoint::new("replica-1", address);
        let response = transport
            .call(
                &endpoint,
                Request::PushNotify {
                    primary: "primary".into(),
                    tx_id: 42,
                },
            )
            .await
            .unwrap();
        assert!(matches!(response, Response::Ack { applied: 42 }));

        server.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpTransport::new(Duration::from_millis(500), Duration::from_secs(1));
        let err = transport
            .call(&Endpoint::new("gone", address), Request::Status)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
