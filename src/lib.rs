//! Pkvault - Multi-recipient password distribution engine.
//!
//! Pkvault encrypts a password once and makes it independently decryptable
//! by every member of a team, without any shared secret. Each recipient
//! holds their own private key, in process memory or on a hardware token,
//! and decrypts their copy without involving anyone else.
//!
//! # Features
//!
//! - **Envelope Encryption**: One fresh payload key per distribution,
//!   wrapped per recipient via X25519 + ChaCha20-Poly1305
//! - **Hardware Tokens**: Private keys behind a card transport; key
//!   material never enters host memory
//! - **Escrow**: Threshold secret sharing so any K of N escrow holders can
//!   recover a password after key loss
//! - **Generation**: Passwords sampled from regex-shaped rules with the
//!   operating system CSPRNG
//! - **Trust Chain**: Certificates verified against a trust bundle before
//!   anything is encrypted to them
//! - **Atomic Store**: One JSON document per entry, written via rename, no
//!   torn states
//!
//! # Quick Start
//!
//! ```no_run
//! use pkvault::{Config, Distributor, DistributeOptions, Target};
//! use pkvault::providers::software::SoftwareKey;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> pkvault::Result<()> {
//!     let config = Config::new("alice")
//!         .with_group("dba", ["alice", "bob"])
//!         .with_rule("default", "[a-zA-Z0-9]{24}");
//!
//!     let key = Arc::new(SoftwareKey::load("./private", "alice").await?);
//!     let distributor = Distributor::new(config, key.clone()).await?;
//!
//!     // Generate and distribute a password to the dba group.
//!     let password = distributor
//!         .distribute_generated(
//!             "prod-db",
//!             &Target::Group("dba".to_string()),
//!             None,
//!             &DistributeOptions::default(),
//!         )
//!         .await?;
//!     println!("distributed: {}", &*password);
//!
//!     // Any group member retrieves it with their own key.
//!     let retrieved = distributor.retrieve("prod-db", &*key).await?;
//!     assert_eq!(*retrieved, *password);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Key Providers
//!
//! | Provider | Key location | Notes |
//! |----------|--------------|-------|
//! | [`SoftwareKey`](providers::software::SoftwareKey) | Process memory | Zeroed on drop |
//! | [`HardwareKey`](providers::hardware::HardwareKey) | Card slot | Exclusive sessions, block or fail-fast |
//! | [`MockToken`](providers::mock::MockToken) | In memory | Test transport, `mock` feature (default) |

pub mod certstore;
pub mod config;
pub mod connector;
pub mod distributor;
pub mod envelope;
pub mod error;
pub mod escrow;
pub mod generator;
pub mod identity;
pub mod provider;
pub mod providers;
pub mod store;
pub mod validation;

pub use certstore::CertificateStore;
pub use config::{CardWait, Config};
pub use distributor::{DistributeOptions, Distributor, Target};
pub use envelope::{CryptoEngine, EnvelopeBlob};
pub use error::{PkvaultError, Result};
pub use escrow::{EscrowEngine, EscrowShare};
pub use generator::Generator;
pub use identity::{Certificate, Recipient, TrustAnchor, TrustBundle};
pub use provider::{KeyProvider, PayloadKey, WrappedKey};
pub use store::{PasswordStore, StoredEntry};
