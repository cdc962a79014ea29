//! # stackpilot-aws – signed control-plane calls
//!
//! Turns a logical API call into a correctly signed, retried and classified
//! HTTP exchange with AWS.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  CloudControlClient (cloudcontrol.rs)            │
//! │  StsClient          (sts.rs)                     │
//! ├──────────────────────────────────────────────────┤
//! │  AwsClient  (client.rs)  + paginate (pagination) │
//! │  ├── dispatch_json  (JSON 1.0)                   │
//! │  ├── query_request  (Query + XML)                │
//! │  └── retry loop: classify · backoff · re-sign    │
//! ├──────────────────────────────────────────────────┤
//! │  SigV4Signer  (signing.rs)                       │
//! │  CachingCredentialResolver (credentials.rs)      │
//! │  HttpTransport (transport.rs)                    │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod config;
pub mod credentials;
pub mod signing;
pub mod transport;
pub mod client;
pub mod pagination;

pub mod cloudcontrol;
pub mod sts;

pub use client::{ApiRequest, AwsClient, DispatchReport};
pub use config::{AwsRegion, ClientConfig, RetryConfig};
pub use credentials::{AwsCredentials, CachingCredentialResolver, CredentialProvider};
pub use error::{AwsError, AwsResult, ErrorKind};
pub use signing::{SigV4Signer, SignedRequest, UnsignedRequest};
pub use transport::{AwsResponse, HttpTransport, ReqwestTransport, ScriptedTransport};
