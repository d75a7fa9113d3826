use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::TryFutureExt;
use http::Uri;
use http::header::HeaderValue;
use http::uri::Scheme;
use hyper::rt::{Read as HyperRead, ReadBufCursor, Write as HyperWrite};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use tower_service::Service;
use url::Url;

use crate::error::TransportErrorKind;
use crate::headers::basic_authorization;
use crate::transport::TransportFailure;

pub(super) type BoxConnectError = Box<dyn StdError + Send + Sync>;

/// A plain `http://` proxy and the credentials found in its URL.
#[derive(Clone, Debug)]
pub(super) struct ProxyEndpoint {
    pub(super) uri: Uri,
    pub(super) authorization: Option<HeaderValue>,
}

impl ProxyEndpoint {
    pub(super) fn from_url(url: &Url) -> Result<Self, TransportFailure> {
        match url.scheme() {
            "http" => {}
            other => {
                return Err(TransportFailure::new(
                    TransportErrorKind::UnsupportedProtocol,
                    format!("unsupported proxy scheme `{other}`"),
                ));
            }
        }

        let authorization = if url.username().is_empty() {
            None
        } else {
            let credentials = format!("{}:{}", url.username(), url.password().unwrap_or_default());
            let value = basic_authorization(&credentials).map_err(|error| {
                TransportFailure::new(TransportErrorKind::MalformedUrl, error.to_string())
            })?;
            Some(value)
        };

        let mut bare = url.clone();
        let _ = bare.set_username("");
        let _ = bare.set_password(None);
        let uri = bare.as_str().parse::<Uri>().map_err(|error| {
            TransportFailure::new(TransportErrorKind::MalformedUrl, error)
        })?;
        Ok(Self { uri, authorization })
    }
}

/// How a connection reaches its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Direct,
    /// `CONNECT` through the proxy, then TLS end to end.
    Tunnel,
    /// Plain HTTP handed to the proxy in absolute-form.
    Forward,
}

/// A dialed socket tagged with whether requests on it go to a proxy.
#[derive(Debug)]
pub(super) struct Routed<T> {
    io: T,
    forwarded: bool,
}

impl<T: HyperRead + Unpin> HyperRead for Routed<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl<T: HyperWrite + Unpin> HyperWrite for Routed<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl<T: Connection> Connection for Routed<T> {
    fn connected(&self) -> Connected {
        // hyper only writes absolute-form request targets on proxied connections.
        self.io.connected().proxy(self.forwarded)
    }
}

#[derive(Clone)]
struct Via {
    proxy: Uri,
    tunnel: Tunnel<HttpConnector>,
}

type Socket = <HttpConnector as Service<Uri>>::Response;
type Dialing = Pin<Box<dyn Future<Output = Result<Socket, BoxConnectError>> + Send>>;

/// TCP connector for one client profile, optionally routed through an
/// `http://` proxy.
#[derive(Clone)]
pub(super) struct ProxyConnector {
    direct: HttpConnector,
    via: Option<Via>,
}

impl ProxyConnector {
    pub(super) fn new(
        proxy: Option<ProxyEndpoint>,
        connect_timeout: Duration,
        keep_alive: bool,
    ) -> Self {
        let mut direct = HttpConnector::new();
        direct.enforce_http(false);
        direct.set_connect_timeout(Some(connect_timeout));
        if keep_alive {
            direct.set_keepalive(Some(Duration::from_secs(60)));
        }
        let via = proxy.map(|ProxyEndpoint { uri, authorization }| {
            let tunnel = Tunnel::new(uri.clone(), direct.clone());
            Via {
                tunnel: match authorization {
                    Some(value) => tunnel.with_auth(value),
                    None => tunnel,
                },
                proxy: uri,
            }
        });
        Self { direct, via }
    }

    fn route(&self, dst: &Uri) -> Route {
        match &self.via {
            None => Route::Direct,
            Some(_) if dst.scheme() == Some(&Scheme::HTTPS) => Route::Tunnel,
            Some(_) => Route::Forward,
        }
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = Routed<Socket>;
    type Error = BoxConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // The tunnel dials through a clone of `direct`, so this covers both.
        self.direct.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let route = self.route(&dst);
        let dialing: Dialing = match (route, &mut self.via) {
            (Route::Tunnel, Some(via)) => {
                Box::pin(via.tunnel.call(connect_target(&dst)).err_into())
            }
            (Route::Forward, Some(via)) => {
                Box::pin(self.direct.call(via.proxy.clone()).err_into())
            }
            _ => Box::pin(self.direct.call(dst).err_into()),
        };
        Box::pin(async move {
            Ok(Routed {
                io: dialing.await?,
                forwarded: route == Route::Forward,
            })
        })
    }
}

/// `CONNECT` names its target as `host:port`, so the port must be explicit.
fn connect_target(dst: &Uri) -> Uri {
    let (Some(host), None) = (dst.host(), dst.port_u16()) else {
        return dst.clone();
    };
    let port = if dst.scheme() == Some(&Scheme::HTTPS) { 443 } else { 80 };
    Uri::builder()
        .scheme(dst.scheme_str().unwrap_or("https"))
        .authority(format!("{host}:{port}"))
        .path_and_query("/")
        .build()
        .unwrap_or_else(|_| dst.clone())
}
