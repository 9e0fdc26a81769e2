//! # Accord - Agent Commerce Negotiation Protocol
//!
//! A protocol for autonomous purchase negotiation between software agents.
//!
//! ## Architecture
//!
//! - **Scout**: Buyer agent - submits intent, ranks offers, drives the
//!   mandate-gated checkout
//! - **Beacon**: Seller agent - registers capabilities and responds to
//!   sessions with offers
//! - **Broker**: Neutral session core - matches sellers, collects offers
//!   inside a bounded window, settles exactly one commit per session
//! - **Identity**: Ed25519 keypairs with canonical request signing and a
//!   replay window
//! - **Mandates**: Intent -> Cart -> Payment authorization chain, each link
//!   signed and cross-referenced

pub mod auth;
pub mod broker;
pub mod client;
pub mod config;
pub mod constraint;
pub mod database;
pub mod error;
pub mod identity;
pub mod intent;
pub mod matcher;
pub mod mandate;
pub mod model;
pub mod repository;
pub mod session;
pub mod storage;

pub use auth::RequestAuthenticator;
pub use broker::{BrokerConfig, SessionBroker};
pub use client::{BrokerClient, HttpBrokerClient};
pub use config::AppConfig;
pub use constraint::{Constraint, ConstraintField, ConstraintKind, ConstraintOp, ConstraintValue};
pub use error::{AccordError, Result};
pub use identity::KeyIdentity;
pub use model::{AgentRecord, AgentType, BrokerSessionStatus, Offer, Transaction};
pub use session::{Scout, ScoutConfig, ScoutState, SessionEvent};
pub use storage::{FileStorage, MemoryStorage, StorageAdapter};

pub type AgentId = uuid::Uuid;
pub type SessionId = uuid::Uuid;
pub type OfferId = uuid::Uuid;
