use std::net::SocketAddr;

use rstest::fixture;
use tempfile::TempDir;
use tokio::{net::TcpListener, task::JoinHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{
    config::CorsOrigin,
    get_layer,
    store::{model::NewPrediction, Store},
    web_api::{get_api_router, rate_limit::RateLimiter},
};

pub const ADMIN_KEY: &str = "s3cret";

#[ctor::ctor]
fn init() {
    let log_level = std::env::var("LOG").unwrap_or("error".to_owned());
    let filter = EnvFilter::new(format!("prediction_board={log_level}"))
        .add_directive(format!("tower_http::trace={log_level}").parse().unwrap());
    _ = tracing_subscriber::registry()
        .with(filter)
        .with(get_layer(tracing_subscriber::fmt::layer()).with_test_writer())
        .try_init();
}

/// Fresh database in a temporary directory, dropped with the returned guard
pub fn temp_store() -> (Store, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("predictions.db");
    let store = Store::connect(path.to_str().unwrap(), 4).unwrap();
    (store, dir)
}

pub fn new_prediction(name: &str, percent: f64) -> NewPrediction {
    NewPrediction {
        name: name.to_owned(),
        percent,
        will_go: false,
        emoji: String::new(),
        title: String::new(),
        message: String::new(),
        special: false,
    }
}

pub struct TestServer {
    base: String,
    pub client: reqwest::Client,
    pub store: Store,
    _dir: TempDir,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn_server(admin_key: Option<&str>, limiter: RateLimiter) -> TestServer {
    let (store, dir) = temp_store();
    let router = get_api_router(
        store.clone(),
        admin_key.map(str::to_owned),
        &CorsOrigin::Any,
        limiter,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        store,
        _dir: dir,
        handle,
    }
}

#[fixture]
pub async fn server() -> TestServer {
    spawn_server(None, RateLimiter::default()).await
}

#[fixture]
pub async fn guarded_server() -> TestServer {
    spawn_server(Some(ADMIN_KEY), RateLimiter::default()).await
}
