//! A client-side orchestrator for a fleet of remote audio-processing worker
//! nodes.
//!
//! [`orchestrator::Orchestrator`] is the entry point: it owns a
//! [`node::NodePool`], a [`player::PlayerPool`], an [`events::EventBus`], and
//! a [`persistence::Storage`] backend, and exposes the search-then-play
//! pipeline on top of them. Everything else in this crate is a component it
//! composes.

pub mod config;
pub mod events;
pub mod handshake;
pub mod node;
pub mod orchestrator;
pub mod persistence;
pub mod player;
pub mod rest;
pub mod track;
