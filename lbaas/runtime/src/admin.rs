use bytes::Bytes;
use futures::future;
use http_body_util::Full;
use hyper::{
    header::{self, HeaderValue},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use prometheus_client::registry::Registry;
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use tracing::{debug, info, instrument, warn};

const OPENMETRICS: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Serves `/ready` and `/metrics` until the drain is signaled.
#[instrument(skip_all, fields(%addr))]
pub(crate) async fn serve(
    listener: TcpListener,
    addr: SocketAddr,
    ready: watch::Receiver<bool>,
    registry: Arc<Registry>,
    drain: drain::Watch,
) {
    info!("HTTP admin server listening");

    tokio::pin! {
        let shutdown = drain.signaled();
    }
    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "Failed to accept admin connection");
                        continue;
                    }
                };
                let ready = ready.clone();
                let registry = registry.clone();
                let svc = service_fn(move |req: Request<hyper::body::Incoming>| {
                    future::ok::<_, Infallible>(handle(&ready, &registry, &req))
                });
                tokio::spawn(async move {
                    if let Err(error) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        debug!(%peer, %error, "Admin connection failed");
                    }
                });
            }

            release = &mut shutdown => {
                drop(release);
                return;
            }
        }
    }
}

fn handle<B>(
    ready: &watch::Receiver<bool>,
    registry: &Registry,
    req: &Request<B>,
) -> Response<Full<Bytes>> {
    if !matches!(*req.method(), Method::GET | Method::HEAD) {
        return respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "");
    }

    match req.uri().path() {
        "/ready" => {
            if *ready.borrow() {
                respond(StatusCode::OK, "text/plain", "ready\n")
            } else {
                respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "not ready\n")
            }
        }
        "/metrics" => {
            let mut buf = String::new();
            match prometheus_client::encoding::text::encode(&mut buf, registry) {
                Ok(()) => respond(StatusCode::OK, OPENMETRICS, buf),
                Err(error) => {
                    warn!(%error, "Failed to encode metrics");
                    respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "")
                }
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", ""),
    }
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut rsp = Response::new(Full::new(body.into()));
    *rsp.status_mut() = status;
    rsp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    rsp
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use prometheus_client::metrics::counter::Counter;

    async fn get(ready: bool, registry: &Registry, path: &str) -> (StatusCode, String) {
        let (_tx, rx) = watch::channel(ready);
        let req = Request::get(path).body(()).unwrap();
        let rsp = handle(&rx, registry, &req);
        let status = rsp.status();
        let body = rsp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn readiness() {
        let registry = Registry::default();
        assert_eq!(
            get(false, &registry, "/ready").await,
            (StatusCode::INTERNAL_SERVER_ERROR, "not ready\n".to_string())
        );
        assert_eq!(
            get(true, &registry, "/ready").await,
            (StatusCode::OK, "ready\n".to_string())
        );
    }

    #[tokio::test]
    async fn metrics_are_encoded() {
        let mut registry = Registry::default();
        let counter = Counter::<u64>::default();
        registry.register("events", "Events handled", counter.clone());
        counter.inc();

        let (status, body) = get(true, &registry, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("events_total 1"), "{body}");
        assert!(body.ends_with("# EOF\n"), "{body}");
    }

    #[tokio::test]
    async fn unknown_paths_and_methods() {
        let registry = Registry::default();
        assert_eq!(get(true, &registry, "/").await.0, StatusCode::NOT_FOUND);

        let (_tx, rx) = watch::channel(true);
        let req = Request::post("/ready").body(()).unwrap();
        assert_eq!(
            handle(&rx, &registry, &req).status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
