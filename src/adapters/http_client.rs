use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// Upstream HTTP client using Hyper with Rustls.
///
/// TLS upstreams negotiate HTTP/2 or HTTP/1.1 via ALPN; plain `http://` upstreams
/// speak HTTP/1.1.
///
/// Requests arrive fully prepared by the forwarder (URI, Host, forwarding and trace
/// headers). This adapter only sends them and converts between body types.
#[derive(Clone)]
pub struct HyperHttpClient {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HyperHttpClient {
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_nodelay(true);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for HyperHttpClient {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        if req.uri().host().is_none() {
            return Err(HttpClientError::InvalidRequest(format!(
                "Outgoing URI has no host: {}",
                req.uri()
            )));
        }

        let (mut parts, body) = req.into_parts();
        // The inbound protocol version does not carry over; the pooled connection
        // decides what goes on the wire.
        parts.version = Version::default();
        let method = parts.method.clone();
        let uri = parts.uri.clone();

        tracing::debug!(%method, %uri, "sending upstream request");

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();
                // The body is re-framed by the inbound server.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                tracing::debug!(%method, %uri, error = %e, "upstream request failed");
                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method} {uri} failed: {e}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        assert!(HyperHttpClient::new().is_ok());
    }

    #[tokio::test]
    async fn test_rejects_relative_uri() {
        let client = HyperHttpClient::new().unwrap();
        let req = Request::builder()
            .uri("/relative")
            .body(AxumBody::empty())
            .unwrap();
        assert!(matches!(
            client.send_request(req).await,
            Err(HttpClientError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_inbound_http2_request_reaches_http1_upstream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().fallback(|| async { "catalog" });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = HyperHttpClient::new().unwrap();
        let req = Request::builder()
            .version(Version::HTTP_2)
            .uri(format!("http://{addr}/items"))
            .body(AxumBody::empty())
            .unwrap();
        let response = client.send_request(req).await.unwrap();
        assert_eq!(response.status(), hyper::StatusCode::OK);
        assert_eq!(response.version(), Version::HTTP_11);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_connection_error() {
        let client = HyperHttpClient::new().unwrap();
        let req = Request::builder()
            .uri("http://127.0.0.1:9/")
            .body(AxumBody::empty())
            .unwrap();
        assert!(matches!(
            client.send_request(req).await,
            Err(HttpClientError::ConnectionError(_))
        ));
    }
}
