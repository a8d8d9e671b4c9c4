//! # DevTerm Agent Library
//!
//! The agent runs on a device and lets an operator drive a shell on it
//! through a remote backend.
//!
//! ## Overview
//!
//! - **Sessions**: one PTY-backed shell per backend connection, spawned,
//!   fed, resized and stopped by protocol messages ([`session`]).
//! - **Routing**: decoding backend messages and answering them ([`router`]).
//! - **Recording**: every session's output, with its echo mode, persisted
//!   and sealed when the session ends ([`recording`]).
//! - **Playback**: sealed recordings streamed back over WebSocket or to the
//!   CLI ([`playback`]).
//! - **Connection supervision**: connecting, reconnecting with backoff and
//!   waiting for a local dependency before connecting ([`network`]).
//!
//! ## Architecture
//!
//! ```text
//!            backend (WebSocket)
//!                   │
//!        ┌──────────▼───────────┐      ┌───────────────────┐
//!        │ ConnectionSupervisor │◄─────│  DependencyProbe  │
//!        └──────────┬───────────┘      └───────────────────┘
//!                   │ one per connection
//!        ┌──────────▼───────────┐
//!        │    MessageRouter     │
//!        └──────────┬───────────┘
//!        ┌──────────▼───────────┐      ┌───────────────────┐
//!        │   SessionRegistry    │─────►│  SessionRecorder  │──► RecordingStore
//!        └──────────┬───────────┘      └───────────────────┘          │
//!                   │                                                  ▼
//!              PtySession                                      PlaybackServer
//! ```
//!
//! [`orchestrator::AgentOrchestrator`] wires these together from a
//! [`config::Config`].

pub mod config;
pub mod network;
pub mod orchestrator;
pub mod playback;
pub mod recording;
pub mod router;
pub mod session;
