//! buildorc — core library
//!
//! A crash-tolerant, append-only run-state store, a dependency-DAG job
//! scheduler with named concurrency pools and process supervision, and a
//! live reporter that rolls job status up into a published run document.

pub mod cachedir; // component A
pub mod config; // ambient: .buildrc.toml discovery
pub mod expiry; // component H
pub mod jobstore; // component B
pub mod outcome; // component D
pub mod reporter; // component G
pub mod scheduler; // component E
pub mod schema;
pub mod signals; // component F
pub mod supervisor; // component C
pub mod timefmt;
pub mod validate; // component I
