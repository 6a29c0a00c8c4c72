//! # Netplay Server Library
//!
//! Server side of the online mode: consoles POST small binary records over
//! HTTP and poll for the state of their race, the server matches waiting
//! entries into races and drives each race through qualifying, the final and
//! archival.
//!
//! ## Module Organization
//!
//! ### Pool Module (`pool`)
//! The waiting room. Entries registered by consoles sit here, refreshed by
//! their polls, until matchmaking promotes them into a race or a 20 second
//! idle timeout drops them.
//!
//! ### Race Module (`race`)
//! One race session: the forward-only Init → Qualifying → Final → Finished
//! state machine, qualifying ranking and the final standings.
//!
//! ### Registry Module (`registry`)
//! The shared state behind the handlers: the pool, all live races,
//! matchmaking and the periodic sweep that expels stragglers or substitutes
//! default results when a finalist disappears.
//!
//! ### Handlers Module (`handlers`)
//! Decodes request bodies, drives the registry and frames checksummed
//! response payloads for the three CGI endpoints.
//!
//! ### Events Module (`events`)
//! Fire-and-forget side effects. State transitions emit events onto a
//! channel; a sink task persists races and pushes notifications so the
//! request path never waits on disk.
//!
//! ### Network Module (`network`)
//! Minimal HTTP/1.1 front end over a TCP accept loop, one task per
//! connection.
//!
//! ### Storage Module (`storage`)
//! File-backed implementations of the persistence collaborators.

pub mod events;
pub mod handlers;
pub mod network;
pub mod pool;
pub mod race;
pub mod registry;
pub mod storage;
