//! Smart Home API gateway.
//!
//! A Backend-for-Frontend reverse proxy: inbound requests are matched against
//! an ordered list of path-prefix rules and forwarded, headers and body
//! intact, to one of a fixed set of upstream services.
//!
//! | Path | Upstream |
//! |------|----------|
//! | `/api/v1/sensors/*` | smart-home app |
//! | `/api/v1/devices/*` | device service |
//! | `/api/v1/telemetry/*` | telemetry service |
//! | `/*` | smart-home app |
//!
//! `/health`, `/gateway/status` and `/gateway/services` are answered by the
//! gateway itself.

pub mod config;
pub mod error;
pub mod health;
pub mod observability;
pub mod proxy;

pub use config::Config;
pub use error::{GatewayError, ProxyErrorKind};
pub use proxy::Gateway;
