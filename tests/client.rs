mod support;

use polyglot_fetch::{Client, Method};
use support::server;

#[tokio::test]
async fn auto_headers() {
    let server = server::http(move |req| async move {
        assert_eq!(req.method(), "GET");

        assert_eq!(
            req.headers()["user-agent"],
            concat!("polyglot-fetch/", env!("CARGO_PKG_VERSION"))
        );
        assert_eq!(req.headers()["accept-encoding"], "gzip,deflate,br");
        assert!(req.headers().get("host").is_some());

        http::Response::default()
    });

    let url = format!("http://{}/auto", server.addr());
    let res = polyglot_fetch::fetch(&url).send().await.unwrap();

    assert_eq!(res.url().as_str(), &url);
    assert_eq!(res.status(), polyglot_fetch::StatusCode::OK);
    assert_eq!(res.version(), polyglot_fetch::Version::HTTP_11);
    assert!(res.ok());
}

#[tokio::test]
async fn custom_user_agent_fills_missing() {
    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["user-agent"], "probe/7");
        http::Response::default()
    });

    let client = Client::builder().user_agent("probe/7").build().unwrap();
    client
        .fetch(format!("http://{}/ua", server.addr()))
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn explicit_user_agent_wins_by_default() {
    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["user-agent"], "mine/1");
        http::Response::default()
    });

    let client = Client::builder().user_agent("probe/7").build().unwrap();
    client
        .fetch(format!("http://{}/ua", server.addr()))
        .header("user-agent", "mine/1")
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn overwrite_user_agent_replaces() {
    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["user-agent"], "probe/7");
        http::Response::default()
    });

    let client = Client::builder()
        .user_agent("probe/7")
        .overwrite_user_agent(true)
        .build()
        .unwrap();
    client
        .fetch(format!("http://{}/ua", server.addr()))
        .header("user-agent", "mine/1")
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn no_accept_encoding_without_compress() {
    let server = server::http(move |req| async move {
        assert!(req.headers().get("accept-encoding").is_none());
        http::Response::default()
    });

    polyglot_fetch::fetch(format!("http://{}/plain", server.addr()))
        .compress(false)
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn existing_accept_encoding_is_kept() {
    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["accept-encoding"], "identity");
        http::Response::default()
    });

    polyglot_fetch::fetch(format!("http://{}/plain", server.addr()))
        .header("accept-encoding", "identity")
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn post_buffer_body_round_trips() {
    let payload = b"exact bytes \x00\x01\x02 through the wire".to_vec();
    let expected = payload.clone();

    let server = server::http(move |req| {
        let expected = expected.clone();
        async move {
            assert_eq!(req.method(), "POST");
            // Binary buffers get no implicit content type.
            assert!(req.headers().get("content-type").is_none());
            assert_eq!(
                req.headers()["content-length"],
                expected.len().to_string().as_str()
            );
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
            http::Response::new(hyper::Body::from(body))
        }
    });

    let echoed = polyglot_fetch::fetch(format!("http://{}/echo", server.addr()))
        .method(Method::POST)
        .body(payload.clone())
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();

    assert_eq!(&echoed[..], &payload[..]);
}

#[tokio::test]
async fn text_body_gets_text_plain() {
    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["content-type"], "text/plain;charset=UTF-8");
        let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
        http::Response::new(hyper::Body::from(body))
    });

    let echoed = polyglot_fetch::fetch(format!("http://{}/echo", server.addr()))
        .method(Method::POST)
        .body("plain text payload")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert_eq!(echoed, "plain text payload");
}

#[tokio::test]
async fn json_body_gets_content_type() {
    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["content-type"], "application/json");
        let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
        http::Response::new(hyper::Body::from(body))
    });

    let echoed: serde_json::Value =
        polyglot_fetch::fetch(format!("http://{}/echo", server.addr()))
            .method(Method::POST)
            .json(&serde_json::json!({ "foo": "bar" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

    assert_eq!(echoed, serde_json::json!({ "foo": "bar" }));
}

#[tokio::test]
async fn form_body_gets_urlencoded_content_type() {
    let server = server::http(move |req| async move {
        assert_eq!(
            req.headers()["content-type"],
            "application/x-www-form-urlencoded;charset=UTF-8"
        );
        let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
        assert_eq!(&body[..], b"hello=world&sea=rustacean");
        http::Response::default()
    });

    polyglot_fetch::fetch(format!("http://{}/form", server.addr()))
        .method(Method::POST)
        .form(&[("hello", "world"), ("sea", "rustacean")])
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn stream_body_is_sent() {
    let server = server::http(move |req| async move {
        // Streams get no implicit content type.
        assert!(req.headers().get("content-type").is_none());
        let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
        assert_eq!(&body[..], b"hello world");
        http::Response::default()
    });

    let chunks: Vec<Result<_, std::io::Error>> = vec![Ok("hello"), Ok(" "), Ok("world")];
    let body = polyglot_fetch::Body::wrap_stream(futures_util::stream::iter(chunks));

    polyglot_fetch::fetch(format!("http://{}/stream", server.addr()))
        .method(Method::POST)
        .body(body)
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn status_204_has_empty_body() {
    let server = server::http(move |_req| async move {
        http::Response::builder()
            .status(204)
            .body(hyper::Body::empty())
            .unwrap()
    });

    let res = polyglot_fetch::fetch(format!("http://{}/status/204", server.addr()))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), polyglot_fetch::StatusCode::NO_CONTENT);
    assert!(res.ok());
    assert_eq!(res.version(), polyglot_fetch::Version::HTTP_11);
    assert!(res.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn keep_alive_reuses_the_connection() {
    let server = server::http(move |_req| async move {
        http::Response::new(hyper::Body::from("hi"))
    });

    let client = Client::new();
    let url = format!("http://{}/keep", server.addr());

    for _ in 0..3 {
        let text = client.fetch(&url).send().await.unwrap().text().await.unwrap();
        assert_eq!(text, "hi");
    }

    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn keep_alive_disabled_opens_fresh_connections() {
    let server = server::http(move |_req| async move {
        http::Response::new(hyper::Body::from("hi"))
    });

    let client = Client::builder()
        .http1(polyglot_fetch::Http1Options::new().keep_alive(false))
        .build()
        .unwrap();
    let url = format!("http://{}/fresh", server.addr());

    for _ in 0..2 {
        client.fetch(&url).send().await.unwrap().text().await.unwrap();
    }

    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn reset_closes_pooled_connections() {
    let server = server::http(move |_req| async move {
        http::Response::new(hyper::Body::from("hi"))
    });

    let client = Client::new();
    let url = format!("http://{}/reset", server.addr());

    client.fetch(&url).send().await.unwrap().text().await.unwrap();
    assert_eq!(server.connection_count(), 1);

    client.reset().await;
    // Reset is idempotent.
    client.reset().await;

    client.fetch(&url).send().await.unwrap().text().await.unwrap();
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn error_for_status() {
    let server = server::http(move |_req| async move {
        http::Response::builder()
            .status(418)
            .body(hyper::Body::empty())
            .unwrap()
    });

    let err = polyglot_fetch::fetch(format!("http://{}/teapot", server.addr()))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap_err();

    assert!(err.is_status());
    assert_eq!(
        err.status(),
        Some(polyglot_fetch::StatusCode::IM_A_TEAPOT)
    );
}

#[tokio::test]
async fn response_streaming_chunks() {
    let server = server::http(move |_req| async move {
        http::Response::new(hyper::Body::from("streamed body"))
    });

    let mut res = polyglot_fetch::fetch(format!("http://{}/chunks", server.addr()))
        .send()
        .await
        .unwrap();

    let mut collected = Vec::new();
    while let Some(chunk) = res.chunk().await.unwrap() {
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(&collected[..], b"streamed body");
}
