//! # purchase-runtime
//!
//! Network implementations for the license-shop purchase flow.
//!
//! ## Clients
//!
//! - **HttpPaymentGateway**: native-QR payment API (create / query / cancel)
//! - **HttpLicenseBackend**: license proxy in front of the issuing backend
//!
//! ## Usage
//!
//! ```rust,ignore
//! use purchase_runtime::{HttpLicenseBackend, HttpPaymentGateway};
//!
//! let gateway = Arc::new(HttpPaymentGateway::from_env()?);
//! let issuer = Arc::new(LicenseIssuer::new(Arc::new(HttpLicenseBackend::from_env()?)));
//! let controller = SessionController::new(gateway, issuer);
//! ```

pub mod gateway;
pub mod license;

pub use gateway::{GatewayConfig, HttpPaymentGateway};
pub use license::{HttpLicenseBackend, LicenseClientConfig};

// Re-export core types for convenience
pub use purchase_core::{
    IssuedLicense, LicenseIssuer, OrderContext, PaymentIntent, SessionController, SessionOutcome,
    SessionState, Tier,
};
