use std::{
    convert::Infallible,
    future::Future,
    net,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc as std_mpsc, Arc,
    },
    thread,
    time::Duration,
};

use tokio::{runtime, sync::oneshot};

pub struct Server {
    addr: net::SocketAddr,
    panic_rx: std_mpsc::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    connections: Arc<AtomicUsize>,
}

impl Server {
    pub fn addr(&self) -> net::SocketAddr {
        self.addr
    }

    /// How many TCP connections the server has accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if !::std::thread::panicking() {
            self.panic_rx
                .recv_timeout(Duration::from_secs(3))
                .expect("test server should not panic");
        }
    }
}

/// Spawns an HTTP/1.1 server on its own runtime thread.
pub fn http<F, Fut>(func: F) -> Server
where
    F: Fn(http::Request<hyper::Body>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = http::Response<hyper::Body>> + Send + 'static,
{
    serve(func, false)
}

/// Spawns a prior-knowledge (cleartext) HTTP/2 server on its own runtime
/// thread.
pub fn h2c<F, Fut>(func: F) -> Server
where
    F: Fn(http::Request<hyper::Body>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = http::Response<hyper::Body>> + Send + 'static,
{
    serve(func, true)
}

fn serve<F, Fut>(func: F, http2_only: bool) -> Server
where
    F: Fn(http::Request<hyper::Body>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = http::Response<hyper::Body>> + Send + 'static,
{
    // Spawn new runtime in thread to prevent reactor execution context
    // conflict.
    let test_name = thread::current().name().unwrap_or("<unknown>").to_string();
    thread::spawn(move || {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("new rt");

        let connections = Arc::new(AtomicUsize::new(0));
        let conn_counter = connections.clone();

        let srv = rt.block_on(async move {
            let builder = hyper::Server::bind(&([127, 0, 0, 1], 0).into());
            let builder = if http2_only {
                builder.http2_only(true)
            } else {
                builder
            };
            builder.serve(hyper::service::make_service_fn(move |_| {
                conn_counter.fetch_add(1, Ordering::SeqCst);
                let func = func.clone();
                async move {
                    Ok::<_, Infallible>(hyper::service::service_fn(move |req| {
                        let fut = func(req);
                        async move { Ok::<_, Infallible>(fut.await) }
                    }))
                }
            }))
        });

        let addr = srv.local_addr();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (panic_tx, panic_rx) = std_mpsc::channel();
        let tname = format!("test({test_name})-support-server");
        thread::Builder::new()
            .name(tname)
            .spawn(move || {
                rt.block_on(async move {
                    let _ = srv
                        .with_graceful_shutdown(async move {
                            let _ = shutdown_rx.await;
                        })
                        .await;
                    let _ = panic_tx.send(());
                });
            })
            .expect("thread spawn");

        Server {
            addr,
            panic_rx,
            shutdown_tx: Some(shutdown_tx),
            connections,
        }
    })
    .join()
    .unwrap()
}
