//! Tracker ingress - newline-framed TCP endpoint
//!
//! Devices identify with `ID:<uid>[,<uid>...]` and then stream
//! `POS:<lat>,<lon>[,<speed>[,<course>]]` lines. Identification binds the
//! session and marks the device online; every position refreshes the
//! online state and fans the report out. Closing the socket, however it
//! happens, runs the disconnect path.

use crate::connection_manager::{Channel, ChannelId, ConnectionManager};
use crate::models::{DeviceStatus, Position};
use chrono::Utc;
use serde_json::Map;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const PROTOCOL: &str = "text";

/// TCP listener feeding the connection manager
pub struct TrackerIngress {
    port: u16,
    connections: Arc<ConnectionManager>,
    next_channel: AtomicU64,
    next_position: Arc<AtomicI64>,
}

impl TrackerIngress {
    pub fn new(port: u16, connections: Arc<ConnectionManager>) -> Self {
        Self {
            port,
            connections,
            next_channel: AtomicU64::new(1),
            next_position: Arc::new(AtomicI64::new(1)),
        }
    }

    pub async fn run(&self) -> crate::Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("Tracker ingress listening on {}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let channel = Channel {
                        id: ChannelId(self.next_channel.fetch_add(1, Ordering::SeqCst)),
                        remote_addr: peer_addr,
                    };
                    tracing::info!(channel = channel.id.0, remote = %peer_addr, "Tracker connected");

                    let connections = Arc::clone(&self.connections);
                    let position_ids = Arc::clone(&self.next_position);
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, channel, &connections, &position_ids).await
                        {
                            tracing::warn!(remote = %peer_addr, error = %e, "Tracker connection error");
                        }
                        connections.device_disconnected(channel).await;
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept tracker connection");
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    channel: Channel,
    connections: &Arc<ConnectionManager>,
    position_ids: &Arc<AtomicI64>,
) -> crate::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            tracing::debug!(channel = channel.id.0, "Tracker closed the connection");
            return Ok(());
        }

        let data = line.trim();
        if data.is_empty() {
            continue;
        }

        if let Some(ids) = data.strip_prefix("ID:") {
            let unique_ids: Vec<&str> = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .collect();
            match connections
                .bind(PROTOCOL, channel.id, channel.remote_addr, &unique_ids)
                .await
            {
                Some(session) => {
                    connections
                        .update_status(session.device_id(), DeviceStatus::Online, Some(Utc::now()))
                        .await;
                }
                // Unknown or disabled device: drop the connection
                None => return Ok(()),
            }
        } else if let Some(body) = data.strip_prefix("POS:") {
            let Some(session) = connections
                .bind(PROTOCOL, channel.id, channel.remote_addr, &[])
                .await
            else {
                tracing::warn!(channel = channel.id.0, "Position before identification");
                continue;
            };
            let Some(position) = parse_position(
                body,
                session.device_id(),
                position_ids.fetch_add(1, Ordering::SeqCst),
            ) else {
                tracing::debug!(channel = channel.id.0, data = %data, "Unparseable position");
                continue;
            };
            connections
                .update_status(
                    session.device_id(),
                    DeviceStatus::Online,
                    Some(position.fix_time),
                )
                .await;
            connections.update_position(&position).await;
        } else {
            tracing::debug!(channel = channel.id.0, data = %data, "Unrecognized frame");
        }
    }
}

fn parse_position(body: &str, device_id: i64, id: i64) -> Option<Position> {
    let mut parts = body.split(',').map(str::trim);
    let latitude: f64 = parts.next()?.parse().ok()?;
    let longitude: f64 = parts.next()?.parse().ok()?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return None;
    }
    let speed: f64 = match parts.next() {
        Some(raw) => raw.parse().ok()?,
        None => 0.0,
    };
    let course: f64 = match parts.next() {
        Some(raw) => raw.parse().ok()?,
        None => 0.0,
    };

    Some(Position {
        id,
        device_id,
        fix_time: Utc::now(),
        latitude,
        longitude,
        altitude: 0.0,
        speed,
        course,
        valid: true,
        attributes: Map::new(),
    })
}
