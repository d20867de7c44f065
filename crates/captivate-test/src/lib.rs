//! Helpers for testing the feedback service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - [`MockRemote`] stands in for the remote application. Script its replies before handing it
//!    to a session, and use its counters to assert how often the session actually asked.
//!
//!  - When using [`ImageServer`], make sure that the server is held until all requests to it have
//!    been made. It stops serving when dropped. To avoid this, assign it to a variable:
//!    `let server = ImageServer::new();`.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use serde_json::Value;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use captivate_service::caching::OptionSet;
use captivate_service::remote::{LayerState, PlayState, Remote, RemoteError};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `captivate_service` crate and mutes
///    all other logs (such as reqwest or hyper).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("captivate_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Encodes a `width`×`height` PNG filled with `rgba`.
pub fn png_bytes(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

/// Like [`png_bytes`], but base64 encoded the way button images are passed around.
pub fn png_fixture(width: u32, height: u32, rgba: [u8; 4]) -> String {
    STANDARD.encode(png_bytes(width, height, rgba))
}

/// Decodes base64 PNG data, panicking if it is not a valid image.
pub fn decode_png(data: &str) -> image::RgbaImage {
    let bytes = STANDARD.decode(data).unwrap();
    image::load_from_memory(&bytes).unwrap().to_rgba8()
}

/// A recorded call to [`Remote::query_feedback_state`].
#[derive(Clone, Debug, PartialEq)]
pub struct StateQuery {
    pub actor_id: String,
    pub feedback_id: String,
    pub options: OptionSet,
}

/// A scripted, in-memory stand-in for the remote application.
///
/// Feedbacks without a scripted reply answer with an empty record.
#[derive(Debug, Default)]
pub struct MockRemote {
    replies: Mutex<HashMap<String, Result<String, RemoteError>>>,
    queries: Mutex<Vec<StateQuery>>,
    play_states: Mutex<HashMap<String, LayerState>>,
    play_state_queries: AtomicUsize,
    image_set: Mutex<BTreeMap<String, String>>,
    image_set_error: Mutex<Option<RemoteError>>,
    delay: Mutex<Option<Duration>>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    fn full_id(actor_id: &str, feedback_id: &str) -> String {
        format!("{actor_id}~{feedback_id}")
    }

    /// Answers queries for the feedback with `state`.
    pub fn set_state(&self, actor_id: &str, feedback_id: &str, state: Value) {
        self.set_reply(actor_id, feedback_id, state.to_string());
    }

    /// Answers queries for the feedback with the raw `reply` text.
    pub fn set_reply(&self, actor_id: &str, feedback_id: &str, reply: impl Into<String>) {
        self.replies
            .lock()
            .insert(Self::full_id(actor_id, feedback_id), Ok(reply.into()));
    }

    /// Fails queries for the feedback with `error`.
    pub fn fail(&self, actor_id: &str, feedback_id: &str, error: RemoteError) {
        self.replies
            .lock()
            .insert(Self::full_id(actor_id, feedback_id), Err(error));
    }

    pub fn set_play_state(&self, layer: &str, play_state: PlayState) {
        self.play_states
            .lock()
            .insert(layer.to_owned(), LayerState { play_state });
    }

    /// Adds an image to the image set served to connecting sessions.
    pub fn add_image(&self, name: &str, data: impl Into<String>) {
        self.image_set.lock().insert(name.to_owned(), data.into());
    }

    /// Fails requests for the image set with `error`.
    pub fn fail_image_set(&self, error: RemoteError) {
        *self.image_set_error.lock() = Some(error);
    }

    /// Delays every state query by `delay`, measured on the tokio clock.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// All state queries received so far, in order.
    pub fn queries(&self) -> Vec<StateQuery> {
        self.queries.lock().clone()
    }

    /// How often the given feedback was queried.
    pub fn query_count(&self, actor_id: &str, feedback_id: &str) -> usize {
        self.queries
            .lock()
            .iter()
            .filter(|query| query.actor_id == actor_id && query.feedback_id == feedback_id)
            .count()
    }

    pub fn total_queries(&self) -> usize {
        self.queries.lock().len()
    }

    pub fn play_state_queries(&self) -> usize {
        self.play_state_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Remote for MockRemote {
    async fn query_feedback_state(
        &self,
        actor_id: &str,
        feedback_id: &str,
        options: &OptionSet,
    ) -> Result<String, RemoteError> {
        self.queries.lock().push(StateQuery {
            actor_id: actor_id.to_owned(),
            feedback_id: feedback_id.to_owned(),
            options: options.clone(),
        });

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.replies
            .lock()
            .get(&Self::full_id(actor_id, feedback_id))
            .cloned()
            .unwrap_or_else(|| Ok(String::new()))
    }

    async fn get_play_states(
        &self,
        _namespace: &str,
    ) -> Result<HashMap<String, LayerState>, RemoteError> {
        self.play_state_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.play_states.lock().clone())
    }

    async fn get_image_set(&self, _group: &str) -> Result<BTreeMap<String, String>, RemoteError> {
        if let Some(error) = self.image_set_error.lock().clone() {
            return Err(error);
        }
        Ok(self.image_set.lock().clone())
    }
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type SharedImages = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// An HTTP server for button images that counts how often each of them was requested.
///
/// Images are served under `/images/<name>`. Unknown names answer with `404`.
pub struct ImageServer {
    server: Server,
    images: SharedImages,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl ImageServer {
    pub fn new() -> Self {
        let images = SharedImages::default();
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let handler = {
            let images = Arc::clone(&images);
            let hits = Arc::clone(&hits);
            move |extract::Path(name): extract::Path<String>| {
                let images = Arc::clone(&images);
                let hits = Arc::clone(&hits);
                async move {
                    *hits.lock().entry(name.clone()).or_default() += 1;

                    let image = images.lock().get(&name).cloned();
                    match image {
                        Some(bytes) => {
                            (StatusCode::OK, [(header::CONTENT_TYPE, "image/png")], bytes)
                                .into_response()
                        }
                        None => StatusCode::NOT_FOUND.into_response(),
                    }
                }
            }
        };

        let router = Router::new().route("/images/:name", get(handler));
        let server = Server::with_router(router);

        Self {
            server,
            images,
            hits,
        }
    }

    /// Serves `bytes` under `/images/<name>`.
    pub fn add(&self, name: &str, bytes: Vec<u8>) {
        self.images.lock().insert(name.to_owned(), bytes);
    }

    /// The URL of the image called `name`.
    pub fn url(&self, name: &str) -> String {
        self.server.url(&format!("images/{name}"))
    }

    /// How often the image called `name` was requested.
    pub fn hits(&self, name: &str) -> usize {
        self.hits.lock().get(name).copied().unwrap_or_default()
    }

    /// The number of requests served so far, for any image.
    pub fn accesses(&self) -> usize {
        self.hits.lock().values().sum()
    }
}

impl Default for ImageServer {
    fn default() -> Self {
        Self::new()
    }
}
