//! Parcel tracking client core
//!
//! Data access for a package-tracking client backed by a remote document
//! store:
//! - Domain model (Package, User, status lifecycle)
//! - Package repository with online checks, timeouts and write-through caching
//! - User repository with registration, login and session handling
//! - SQLite local cache (WAL mode) holding the last known copy of each record
//! - Background reconciler that pushes dirty cache entries
//! - Remote store and auth abstractions with HTTP and in-memory backends

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod hasher;
pub mod http_remote;
pub mod memory;
pub mod model;
pub mod package_repository;
pub mod remote;
pub mod session;
pub mod sync;
pub mod user_repository;

pub use cache::{CacheError, CacheStats, Cacheable, Cached, LocalCache};
pub use config::ClientConfig;
pub use connectivity::{Connectivity, StaticConnectivity, TcpProbe};
pub use error::{RepositoryError, Result};
pub use hasher::{HashError, PasswordHasher};
pub use http_remote::HttpRemoteStore;
pub use memory::{MemoryAuthClient, MemoryRemoteStore, RemoteOp};
pub use model::{NewUser, Package, PackageStatus, Priority, TrackingNumber, User};
pub use package_repository::PackageRepository;
pub use remote::{Account, AuthClient, Document, Fields, RemoteError, RemoteStore};
pub use session::{FileSessionStore, MemorySessionStore, Session, SessionError, SessionStore};
pub use sync::{ReconcileReport, Reconciler};
pub use user_repository::UserRepository;
