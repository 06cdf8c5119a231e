//! Disposable NATS server with JetStream for integration tests.

use async_nats::jetstream;
use async_nats::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

const CLIENT_PORT: u16 = 4222;
const IMAGE_TAG: &str = "latest";

/// A NATS container started with `-js` plus a connected client.
///
/// Dropping the value stops and removes the container.
pub struct TestNats {
    _container: ContainerAsync<Nats>,
    client: Client,
    url: String,
}

impl TestNats {
    pub async fn new() -> Self {
        let container = Nats::default()
            .with_tag(IMAGE_TAG)
            .with_cmd(["-js"])
            .start()
            .await
            .expect("NATS container did not start");
        let port = container
            .get_host_port_ipv4(CLIENT_PORT)
            .await
            .expect("NATS client port is not mapped");

        let url = format!("nats://127.0.0.1:{port}");
        let client = connect(&url).await;
        tracing::info!(%url, "JetStream test server up");

        Self {
            _container: container,
            client,
            url,
        }
    }

    /// Shared client of this server.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Open a separate connection, e.g. to act as a second process.
    pub async fn connect(&self) -> Client {
        connect(&self.url).await
    }

    pub fn jetstream(&self) -> jetstream::Context {
        jetstream::new(self.client())
    }

    pub fn connection_string(&self) -> &str {
        &self.url
    }

    /// Messages currently stored in `stream`.
    pub async fn stream_messages(&self, stream: &str) -> u64 {
        let mut stream = self
            .jetstream()
            .get_stream(stream)
            .await
            .expect("stream lookup failed");
        stream.info().await.expect("stream info failed").state.messages
    }
}

async fn connect(url: &str) -> Client {
    async_nats::connect(url)
        .await
        .unwrap_or_else(|e| panic!("cannot connect to {url}: {e}"))
}
