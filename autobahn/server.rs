//! Echo server for the Autobahn fuzzing client
//!
//! Run with: cargo run --release --bin autobahn-server
//!
//! Then point `wstest -m fuzzingclient` at ws://127.0.0.1:9001.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::TcpListener;

use sockudo_ws_engine::error::Result;
use sockudo_ws_engine::{Config, Engine, Handlers, Session, transport};

#[tokio::main]
async fn main() -> Result<()> {
    let addr: SocketAddr = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 9001)));

    #[allow(unused_mut)]
    let mut config = Config::builder().require_masked_frames(true);
    #[cfg(feature = "permessage-deflate")]
    {
        config = config.compression(sockudo_ws_engine::DeflateConfig::default());
    }

    let engine = Engine::builder()
        .config(config.build())
        .handlers(
            Handlers::new()
                .on_text(|session: &Session, text: String| {
                    let _ = session.send_text(&text);
                })
                .on_binary(|session: &Session, data: Bytes| {
                    let _ = session.send_binary(data);
                }),
        )
        .build();

    let listener = TcpListener::bind(addr).await?;
    println!("WebSocket server listening on ws://{}", addr);
    println!("Ready for Autobahn test suite");

    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true).ok();

        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = transport::serve_connection(&engine, stream).await {
                tracing::debug!(%peer, %err, "connection ended with error");
            }
        });
    }
}
