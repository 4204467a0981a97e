//! # purchase-core
//!
//! Payment session lifecycle and license issuance for license-shop.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     SessionController                         │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌────────────────┐  │
//! │  │ OrderContext │──│  PaymentGateway  │──│ LicenseIssuer  │  │
//! │  │  (pricing)   │  │    (Strategy)    │  │ (+ fallback)   │  │
//! │  └──────────────┘  └──────────────────┘  └────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The controller never talks HTTP itself: `PaymentGateway` and
//! `LicenseBackend` are implemented by `purchase-runtime` and by test fakes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use purchase_core::{LicenseIssuer, OrderContext, SessionController, Tier};
//!
//! let issuer = Arc::new(LicenseIssuer::new(backend));
//! let controller = SessionController::new(gateway, issuer);
//!
//! let intent = controller.initiate(OrderContext::priced(Tier::Premium, 3)?).await?;
//! render_qr(&intent.redeemable_payload);
//!
//! match controller.wait_for_outcome().await {
//!     SessionOutcome::Succeeded { license } => show(license.code()),
//!     other => offer_retry(other),
//! }
//! ```

pub mod error;
pub mod gateway;
pub mod license;
pub mod order;
pub mod pricing;
pub mod session;

pub use error::{ErrorKind, GatewayError, IssuanceError, PricingError, SessionError};
pub use gateway::{CreateIntentRequest, PaymentGateway};
pub use license::{
    IssuedLicense, LicenseBackend, LicenseIssuer, LicenseOrigin, LicenseRecord, LicenseRequest,
    LicenseResponse,
};
pub use order::{OrderContext, PaymentIntent, PaymentStatus, Tier};
pub use session::{
    SessionConfig, SessionController, SessionOutcome, SessionSnapshot, SessionState,
};
