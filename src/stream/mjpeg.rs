//! MJPEG client bookkeeping
//!
//! Tracks connected HTTP clients and their delivery rate. Frames themselves
//! come from the [`FrameRing`](super::ring::FrameRing); this only records who
//! is watching.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

/// Client ID type (UUID string)
pub type ClientId = String;

/// Rolling one-second send rate
#[derive(Debug, Clone)]
pub struct FpsCalculator {
    frame_times: VecDeque<Instant>,
    window: Duration,
}

impl FpsCalculator {
    pub fn new() -> Self {
        Self {
            frame_times: VecDeque::with_capacity(120),
            window: Duration::from_secs(1),
        }
    }

    pub fn record_frame(&mut self) {
        let now = Instant::now();
        self.frame_times.push_back(now);
        self.expire(now);
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.frame_times.front() {
            if now.duration_since(oldest) > self.window {
                self.frame_times.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn current_fps(&self) -> u32 {
        let now = Instant::now();
        self.frame_times
            .iter()
            .filter(|t| now.duration_since(**t) <= self.window)
            .count() as u32
    }
}

impl Default for FpsCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// One connected client
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: ClientId,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub frames_sent: u64,
    /// Gaps reported by the ring reader
    pub frames_skipped: u64,
    pub fps: FpsCalculator,
}

impl ClientSession {
    pub fn new(id: ClientId) -> Self {
        let now = Instant::now();
        Self {
            id,
            connected_at: now,
            last_activity: now,
            frames_sent: 0,
            frames_skipped: 0,
            fps: FpsCalculator::new(),
        }
    }

    pub fn connected_duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Per-client statistics for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub id: String,
    pub fps: u32,
    pub frames_sent: u64,
    pub frames_skipped: u64,
    pub connected_secs: u64,
}

/// Connected MJPEG clients
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientSession>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn register(&self, id: ClientId) {
        let session = ClientSession::new(id.clone());
        let total = {
            let mut clients = self.clients.write();
            clients.insert(id.clone(), session);
            clients.len()
        };
        info!("Client {} connected (total: {})", id, total);
    }

    pub fn unregister(&self, id: &str) {
        if let Some(session) = self.clients.write().remove(id) {
            let secs = session.connected_duration().as_secs_f32();
            let avg_fps = if secs > 0.1 {
                session.frames_sent as f32 / secs
            } else {
                0.0
            };
            info!(
                "Client {} disconnected after {:.1}s ({} frames, {:.1} avg FPS)",
                id, secs, session.frames_sent, avg_fps
            );
        }
    }

    pub fn record_sent(&self, id: &str) {
        if let Some(session) = self.clients.write().get_mut(id) {
            session.last_activity = Instant::now();
            session.frames_sent += 1;
            session.fps.record_frame();
        }
    }

    pub fn record_skipped(&self, id: &str, skipped: u64) {
        if let Some(session) = self.clients.write().get_mut(id) {
            session.frames_skipped += skipped;
        }
    }

    pub fn stats(&self) -> Vec<ClientStats> {
        let mut stats: Vec<_> = self
            .clients
            .read()
            .values()
            .map(|session| ClientStats {
                id: session.id.clone(),
                fps: session.fps.current_fps(),
                frames_sent: session.frames_sent,
                frames_skipped: session.frames_skipped,
                connected_secs: session.connected_duration().as_secs(),
            })
            .collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }
}

/// Registers a client for as long as it lives
///
/// Dropped when the response body stream ends, including on abrupt
/// disconnects.
pub struct ClientGuard {
    id: ClientId,
    registry: Arc<ClientRegistry>,
}

impl ClientGuard {
    pub fn new(id: ClientId, registry: Arc<ClientRegistry>) -> Self {
        registry.register(id.clone());
        Self { id, registry }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn record_sent(&self) {
        self.registry.record_sent(&self.id);
    }

    pub fn record_skipped(&self, skipped: u64) {
        self.registry.record_skipped(&self.id, skipped);
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_lifecycle() {
        let registry = Arc::new(ClientRegistry::new());
        {
            let guard = ClientGuard::new("a".to_string(), registry.clone());
            let _other = ClientGuard::new("b".to_string(), registry.clone());
            assert_eq!(registry.count(), 2);
            guard.record_sent();
            guard.record_sent();
            guard.record_skipped(3);

            let stats = registry.stats();
            assert_eq!(stats[0].id, "a");
            assert_eq!(stats[0].frames_sent, 2);
            assert_eq!(stats[0].frames_skipped, 3);
            assert_eq!(stats[0].fps, 2);
        }
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_fps_calculator() {
        let mut calc = FpsCalculator::new();
        assert_eq!(calc.current_fps(), 0);
        calc.record_frame();
        calc.record_frame();
        calc.record_frame();
        assert_eq!(calc.current_fps(), 3);
    }
}
