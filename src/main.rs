//! Gridlink Server
//!
//! Authoritative server binary. Serves a file-backed world when
//! `GRIDLINK_STORAGE_DIR` is set, otherwise an in-memory demo world.

use std::sync::Arc;
use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gridlink::{
    VERSION,
    core::{Point, Rect},
    map::{
        ChunkStorage, DependencyRef, Entity, FileStorage, Map, MapConfig, MemoryStorage, Tile,
        TileKind,
        tiles::{Button, Conveyor, Gate, Teleporter},
    },
    network::{GameServer, ServerConfig, WebSocketServer},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    info!("Gridlink Server v{}", VERSION);
    let config = ServerConfig::from_env();

    match config.storage_dir.clone() {
        Some(dir) => {
            let storage = FileStorage::open(&dir)
                .await
                .with_context(|| format!("Failed to open storage at {}", dir.display()))?;
            info!("Storage: {}", dir.display());
            serve(Arc::new(storage), config).await
        }
        None => {
            warn!("GRIDLINK_STORAGE_DIR not set, serving an in-memory world");
            serve(Arc::new(MemoryStorage::new()), config).await
        }
    }
}

async fn serve<S: ChunkStorage>(storage: Arc<S>, config: ServerConfig) -> anyhow::Result<()> {
    let map = Arc::new(Map::open(storage, MapConfig::default()).await?);
    if map.default_spawn_area().await.is_none() {
        build_demo_world(&map).await;
    }

    let server = Arc::new(GameServer::new(config, Arc::clone(&map)));
    let front = WebSocketServer::new(Arc::clone(&server));

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            signal_server.shutdown();
        }
    });

    front.run().await?;

    map.save_changes().await.context("Final save failed")?;
    info!("Saved at version {}", map.current_version());
    Ok(())
}

/// A walled 16x16 room exercising every tile kind.
async fn build_demo_world<S: ChunkStorage>(map: &Map<S>) {
    info!("=== Building Demo World ===");
    let room = Rect::from_size(Point::new(0, 0), 16, 16);
    for position in room.points() {
        let edge = position.x == 0 || position.y == 0 || position.x == 15 || position.y == 15;
        let kind = if edge { TileKind::Wall } else { TileKind::Path };
        map.place_template(position, Tile::new(kind), 0).await;
    }

    // Button opens the gate in the wall of the inner room
    map.place_template(Point::new(4, 4), Tile::new(TileKind::Button(Button::default())), 0).await;
    let gate = Gate::new(vec![DependencyRef::Absolute { at: Point::new(4, 4) }]);
    map.place_template(Point::new(8, 4), Tile::new(TileKind::Gate(gate)), 0).await;

    let floor = Tile::new(TileKind::Path);
    map.place_template(Point::new(3, 6), floor.compose(Entity::Crate), 0).await;
    map.place_template(Point::new(6, 6), floor.compose(Entity::Crate), 0).await;
    for x in 10..14 {
        map.place_template(Point::new(x, 10), floor.compose(Entity::Coin { value: 5 }), 0).await;
    }

    for y in 8..12 {
        let belt = TileKind::Conveyor(Conveyor::new(Point::RIGHT));
        map.place_template(Point::new(2, y), Tile::new(belt), 0).await;
    }
    let teleporter = Teleporter { destination: Point::new(13, 13) };
    map.place_template(Point::new(2, 13), Tile::new(TileKind::Teleporter(teleporter)), 0).await;

    map.set_spawn_area(0, Rect::from_size(Point::new(1, 1), 6, 2)).await;
    info!("Demo world ready at version {}", map.current_version());
}
