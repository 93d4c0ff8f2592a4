//! Cluster access for the ingress manager
//!
//! Two collaborators sit behind traits so the controller core can be driven
//! by real clusters and by in-memory fakes alike:
//!
//! - [`ResourceCache`]: read-only, eventually-consistent lookups of Services
//!   and Ingresses, backed by kube-runtime reflector stores.
//! - [`ResourceClient`]: the Ingress create/delete calls against the API server.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{KubeResourceClient, ResourceClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeResourceClient::new(kube::Client::try_default().await?);
//! client.delete_ingress("default", "web").await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use cache::StoreCache;
pub use client::KubeResourceClient;
pub use cluster_trait::{ResourceCache, ResourceClient};
pub use error::ClusterError;
#[cfg(feature = "test-util")]
pub use mock::{MockCluster, MockFailure, MockOp};
