use std::time::{Duration, Instant};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Hard ceiling for adaptive rate updates, shared by the bulk persona's
/// runtime adjustment and the worker's `/update-profile` endpoint.
pub const MAX_ADAPTIVE_DOWNLOAD_MBPS: f64 = 1000.0;

const FAST_TICK_THRESHOLD_MBPS: f64 = 25.0;
const HIGH_THROUGHPUT_MBPS: f64 = 100.0;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize, PartialOrd, Ord,
)]
#[value(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Persona {
    Gamer,
    VideoCall,
    Streamer,
    Bulk,
}

impl Persona {
    pub const ALL: [Self; 4] = [Self::Gamer, Self::VideoCall, Self::Streamer, Self::Bulk];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gamer => "gamer",
            Self::VideoCall => "video-call",
            Self::Streamer => "streamer",
            Self::Bulk => "bulk",
        }
    }

    /// Canonical worker port. Clients never hard-code these; they discover
    /// them through the main server's lookup endpoint.
    pub const fn port(self) -> u16 {
        match self {
            Self::Streamer => 8001,
            Self::Gamer => 8002,
            Self::VideoCall => 8003,
            Self::Bulk => 8004,
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "gamer" => Some(Self::Gamer),
            "video-call" | "video_call" => Some(Self::VideoCall),
            "streamer" => Some(Self::Streamer),
            "bulk" => Some(Self::Bulk),
            _ => None,
        }
    }

    /// Persona prefix of a session id (`<persona>_<epoch_ms>`).
    pub fn from_session_id(id: &str) -> Option<Self> {
        id.rsplit_once('_')
            .and_then(|(persona, _ts)| Self::from_key(persona))
    }
}

impl std::fmt::Display for Persona {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BurstPattern {
    /// Emit at the profile rate continuously.
    Constant,
    /// Periodic square wave: fill-buffer-then-idle streaming, or the bulk
    /// persona's burst/background-sync cycle.
    TwoPhase {
        active_rate_mbps: f64,
        active_duration_ms: u64,
        idle_rate_mbps: f64,
        idle_duration_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BurstPhase {
    Active,
    Idle,
}

#[derive(Debug, Clone, Copy)]
pub struct BurstState {
    pub phase: BurstPhase,
    pub phase_start: Instant,
    pub cycle_count: u64,
}

impl BurstState {
    pub fn new(now: Instant) -> Self {
        Self {
            phase: BurstPhase::Active,
            phase_start: now,
            cycle_count: 0,
        }
    }
}

impl BurstPattern {
    /// Effective download rate for this tick. Phase flips are computed from
    /// wall-clock time elapsed in the current phase; the cycle counter bumps
    /// on each active→idle transition.
    pub fn effective_rate(&self, base_rate_mbps: f64, state: &mut BurstState, now: Instant) -> f64 {
        match *self {
            Self::Constant => base_rate_mbps,
            Self::TwoPhase {
                active_rate_mbps,
                active_duration_ms,
                idle_rate_mbps,
                idle_duration_ms,
            } => {
                let elapsed = now.duration_since(state.phase_start);
                match state.phase {
                    BurstPhase::Active => {
                        if elapsed >= Duration::from_millis(active_duration_ms) {
                            state.phase = BurstPhase::Idle;
                            state.phase_start = now;
                            state.cycle_count = state.cycle_count.saturating_add(1);
                            idle_rate_mbps
                        } else {
                            active_rate_mbps
                        }
                    }
                    BurstPhase::Idle => {
                        if elapsed >= Duration::from_millis(idle_duration_ms) {
                            state.phase = BurstPhase::Active;
                            state.phase_start = now;
                            active_rate_mbps
                        } else {
                            idle_rate_mbps
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub persona: Persona,
    pub name: String,
    pub description: String,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub burst: BurstPattern,
    /// Split shaping output across four logical sub-streams. Off by
    /// default; only useful when a single WebSocket send path chokes.
    pub multistream: bool,
}

impl UserProfile {
    pub fn for_persona(persona: Persona) -> Self {
        match persona {
            Persona::Gamer => Self {
                persona,
                name: "Gamer".to_owned(),
                description: "Competitive gaming with low latency needs".to_owned(),
                download_mbps: 1.5,
                upload_mbps: 0.75,
                burst: BurstPattern::Constant,
                multistream: false,
            },
            Persona::VideoCall => Self {
                persona,
                name: "Video Call".to_owned(),
                description: "HD video conferencing, bidirectional".to_owned(),
                download_mbps: 2.5,
                upload_mbps: 2.5,
                burst: BurstPattern::Constant,
                multistream: false,
            },
            Persona::Streamer => Self {
                persona,
                name: "Streamer".to_owned(),
                description: "HD streaming with fill-buffer-then-idle cycles (5 Mb/s average)"
                    .to_owned(),
                download_mbps: 25.0,
                upload_mbps: 0.1,
                burst: BurstPattern::TwoPhase {
                    active_rate_mbps: 25.0,
                    active_duration_ms: 1000,
                    idle_rate_mbps: 0.0,
                    idle_duration_ms: 4000,
                },
                multistream: false,
            },
            Persona::Bulk => Self {
                persona,
                name: "Bulk Downloader".to_owned(),
                description: "High-speed background downloads (1 Gb/s)".to_owned(),
                download_mbps: 1000.0,
                upload_mbps: 0.1,
                burst: BurstPattern::Constant,
                multistream: false,
            },
        }
    }

    /// Scheduler tick: 100 ms for high-rate personas, 250 ms otherwise.
    pub fn update_interval(&self) -> Duration {
        if self.download_mbps >= FAST_TICK_THRESHOLD_MBPS {
            Duration::from_millis(100)
        } else {
            Duration::from_millis(250)
        }
    }

    /// Duration cap, just larger than the client's 30 s test window so a
    /// runaway session cannot outlive the test.
    pub fn max_session_duration(&self) -> Duration {
        if self.download_mbps >= HIGH_THROUGHPUT_MBPS {
            Duration::from_secs(45)
        } else {
            Duration::from_secs(60)
        }
    }
}

/// Partial profile adjustment, applied at tick boundaries only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub description: Option<String>,
    pub multistream: Option<bool>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.download_mbps.is_none()
            && self.upload_mbps.is_none()
            && self.description.is_none()
            && self.multistream.is_none()
    }

    pub fn apply(&self, profile: &mut UserProfile) {
        if let Some(download) = self.download_mbps {
            profile.download_mbps = download.clamp(0.0, MAX_ADAPTIVE_DOWNLOAD_MBPS);
        }
        if let Some(upload) = self.upload_mbps {
            profile.upload_mbps = upload.clamp(0.0, MAX_ADAPTIVE_DOWNLOAD_MBPS);
        }
        if let Some(description) = self.description.as_ref() {
            profile.description = description.clone();
        }
        if let Some(multistream) = self.multistream {
            profile.multistream = multistream;
        }
    }
}
