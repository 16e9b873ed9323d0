use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use duplexify::push::plain::PlainHandshake;
use duplexify::{Client, Server};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;

async fn hello(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    tracing::trace!(path = %req.uri().path(), "processing request");
    let response = match req.uri().path() {
        "/hello" => Response::new(Full::new(Bytes::from_static(b"HELLO"))),
        "/echo" => {
            let body = req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();
            Response::new(Full::new(body))
        }
        _ => {
            let mut response = Response::new(Full::default());
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    };
    Ok(response)
}

async fn serve() -> (SocketAddr, tokio::sync::oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let server = Server::bind(
        "127.0.0.1:0".parse().unwrap(),
        PlainHandshake::new(&b"server"[..]).unwrap(),
        tower::service_fn(hello),
    )
    .await
    .unwrap();
    let addr = server.incoming().get_ref().local_addr().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move {
        server
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    (addr, tx, handle)
}

fn client() -> Client<PlainHandshake> {
    Client::new(PlainHandshake::new(&b"client"[..]).unwrap())
}

#[tokio::test]
async fn get_hello() {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, shutdown, handle) = serve().await;

    let response = client()
        .get(format!("http://{addr}/hello").parse().unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, "HELLO");

    shutdown.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn post_echo_and_not_found() {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, shutdown, handle) = serve().await;
    let client = client();

    let request = Request::post(format!("http://{addr}/echo"))
        .body(Full::new(Bytes::from_static(b"over a secret socket")))
        .unwrap();
    let response = client.request(request).await.unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, "over a secret socket");

    let response = client
        .get(format!("http://{addr}/missing").parse().unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    drop(response);

    shutdown.send(()).unwrap();
    handle.await.unwrap();
}
