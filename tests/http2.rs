mod support;

use polyglot_fetch::{Client, Method, Version};
use support::server;

#[tokio::test]
async fn h2c_scheme_speaks_http2() {
    let server = server::h2c(move |req| async move {
        assert_eq!(req.version(), http::Version::HTTP_2);
        http::Response::new(hyper::Body::from("over h2c"))
    });

    let res = polyglot_fetch::fetch(format!("http2://{}/", server.addr()))
        .send()
        .await
        .unwrap();

    assert_eq!(res.version(), Version::HTTP_2);
    assert_eq!(res.status(), polyglot_fetch::StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "over h2c");
}

#[tokio::test]
async fn status_204_over_h2c() {
    let server = server::h2c(move |_req| async move {
        http::Response::builder()
            .status(204)
            .body(hyper::Body::empty())
            .unwrap()
    });

    let res = polyglot_fetch::fetch(format!("http2://{}/status/204", server.addr()))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), polyglot_fetch::StatusCode::NO_CONTENT);
    assert!(res.ok());
    assert_eq!(res.version(), Version::HTTP_2);
}

#[tokio::test]
async fn post_body_round_trips_over_h2c() {
    let server = server::h2c(move |req| async move {
        let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
        http::Response::new(hyper::Body::from(body))
    });

    let payload = vec![7u8; 70_000]; // spans several DATA frames
    let echoed = Client::new()
        .fetch(format!("http2://{}/echo", server.addr()))
        .method(Method::POST)
        .body(payload.clone())
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();

    assert_eq!(echoed.len(), payload.len());
    assert_eq!(&echoed[..], &payload[..]);
}

#[tokio::test]
async fn sequential_requests_share_one_session() {
    let server = server::h2c(move |_req| async move {
        http::Response::new(hyper::Body::from("hi"))
    });

    let client = Client::new();
    let url = format!("http2://{}/seq", server.addr());

    for _ in 0..3 {
        client.fetch(&url).send().await.unwrap().text().await.unwrap();
    }

    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn concurrent_first_requests_share_one_session() {
    let server = server::h2c(move |_req| async move {
        http::Response::new(hyper::Body::from("hi"))
    });

    let client = Client::new();
    let url = format!("http2://{}/conc", server.addr());

    let (a, b, c) = tokio::join!(
        client.fetch(&url).send(),
        client.fetch(&url).send(),
        client.fetch(&url).send(),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn reset_closes_the_session() {
    let server = server::h2c(move |_req| async move {
        http::Response::new(hyper::Body::from("hi"))
    });

    let client = Client::new();
    let url = format!("http2://{}/reset", server.addr());

    client.fetch(&url).send().await.unwrap().text().await.unwrap();
    assert_eq!(server.connection_count(), 1);

    client.reset().await;

    client.fetch(&url).send().await.unwrap().text().await.unwrap();
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn distinct_clients_are_isolated() {
    let server = server::h2c(move |_req| async move {
        http::Response::new(hyper::Body::from("hi"))
    });

    let url = format!("http2://{}/iso", server.addr());

    Client::new().fetch(&url).send().await.unwrap();
    Client::new().fetch(&url).send().await.unwrap();

    // Each client keeps its own session cache.
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn idle_session_is_closed_and_reopened() {
    let server = server::h2c(move |_req| async move {
        http::Response::new(hyper::Body::from("hi"))
    });

    let client = Client::builder()
        .http2(
            polyglot_fetch::Http2Options::new()
                .idle_session_timeout(std::time::Duration::from_millis(150)),
        )
        .build()
        .unwrap();
    let url = format!("http2://{}/idle", server.addr());

    client.fetch(&url).send().await.unwrap().text().await.unwrap();
    assert_eq!(server.connection_count(), 1);

    // Wait past the idle timeout so the watchdog closes the session.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    client.fetch(&url).send().await.unwrap().text().await.unwrap();
    assert_eq!(server.connection_count(), 2);
}
